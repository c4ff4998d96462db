use std::{env, net::SocketAddr, time::Duration};

use thiserror::Error;

pub const DEFAULT_BIND_ADDR: &str = "0.0.0.0";
pub const DEFAULT_MOUNT_PATH: &str = "/auth.v1.AuthService/";
pub const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("PORT is required and must not be empty")]
    MissingPort,
    #[error("PORT must be a valid u16")]
    InvalidPort,
    #[error("SHUTDOWN_TIMEOUT_SECS must be a whole number of seconds")]
    InvalidShutdownTimeout,
    #[error("bind address must not be empty")]
    EmptyAddress,
    #[error("invalid bind address or port")]
    InvalidSocket,
    #[error("mount path must start and end with '/'")]
    InvalidMountPath,
    #[error("allowed origin is not a valid header value")]
    InvalidOrigin,
}

/// Immutable settings for one [`crate::server::IngressServer`].
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind_addr: String,
    pub bind_port: u16,
    pub mount_path: String,
    pub public_url: Option<String>,
    pub client_url: Option<String>,
    pub shutdown_timeout: Duration,
}

impl ServerConfig {
    pub fn new(bind_addr: impl Into<String>, bind_port: u16) -> Self {
        Self {
            bind_addr: bind_addr.into(),
            bind_port,
            mount_path: DEFAULT_MOUNT_PATH.to_string(),
            public_url: None,
            client_url: None,
            shutdown_timeout: DEFAULT_SHUTDOWN_TIMEOUT,
        }
    }

    pub fn with_mount_path(mut self, mount_path: impl Into<String>) -> Self {
        self.mount_path = mount_path.into();
        self
    }

    pub fn with_origins(mut self, public_url: Option<String>, client_url: Option<String>) -> Self {
        self.public_url = public_url;
        self.client_url = client_url;
        self
    }

    pub fn with_shutdown_timeout(mut self, shutdown_timeout: Duration) -> Self {
        self.shutdown_timeout = shutdown_timeout;
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.bind_addr.trim().is_empty() {
            return Err(ConfigError::EmptyAddress);
        }

        let _ = self.bind_socket()?;

        let path = self.mount_path.as_str();
        if path.len() < 2 || !path.starts_with('/') || !path.ends_with('/') {
            return Err(ConfigError::InvalidMountPath);
        }

        Ok(())
    }

    pub fn bind_socket(&self) -> Result<SocketAddr, ConfigError> {
        format!("{}:{}", self.bind_addr, self.bind_port)
            .parse::<SocketAddr>()
            .map_err(|_| ConfigError::InvalidSocket)
    }
}

/// Process settings read once at startup.
///
/// This is the loader that sits in front of the server; nothing inside the
/// ingress pipeline reads the environment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    pub public_url: Option<String>,
    pub client_url: Option<String>,
    pub backend_url: Option<String>,
    pub backend_local_url: Option<String>,
    pub port: u16,
    pub shutdown_timeout: Duration,
}

impl Settings {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let read = |key: &str| {
            lookup(key)
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
        };

        let port = read("PORT")
            .ok_or(ConfigError::MissingPort)?
            .parse::<u16>()
            .map_err(|_| ConfigError::InvalidPort)?;

        let shutdown_timeout = read("SHUTDOWN_TIMEOUT_SECS")
            .map(|value| {
                value
                    .parse::<u64>()
                    .map(Duration::from_secs)
                    .map_err(|_| ConfigError::InvalidShutdownTimeout)
            })
            .transpose()?
            .unwrap_or(DEFAULT_SHUTDOWN_TIMEOUT);

        Ok(Self {
            public_url: read("PUBLIC_URL"),
            client_url: read("CLIENT_URL"),
            backend_url: read("ERDTREE_URL"),
            backend_local_url: read("ERDTREE_LOCAL_URL"),
            port,
            shutdown_timeout,
        })
    }

    pub fn allowed_origin(&self) -> Option<&str> {
        self.public_url.as_deref().or(self.client_url.as_deref())
    }

    pub fn backend_url(&self) -> Option<&str> {
        self.backend_url
            .as_deref()
            .or(self.backend_local_url.as_deref())
    }

    pub fn server_config(&self) -> ServerConfig {
        ServerConfig::new(DEFAULT_BIND_ADDR, self.port)
            .with_origins(self.public_url.clone(), self.client_url.clone())
            .with_shutdown_timeout(self.shutdown_timeout)
    }
}
