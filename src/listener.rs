//! Accept loop plumbing between the TCP socket and `axum::serve`.
//!
//! axum's own listener retries every accept error forever. [`ReportingListener`]
//! retries only per-connection and resource-exhaustion errors; anything else
//! is reported once through a channel and the loop parks until the server
//! task drops it.

use std::{future::Future, io, net::SocketAddr, time::Duration};

use tokio::{
    net::{TcpListener, TcpStream},
    sync::oneshot,
};
use tracing::{debug, error, warn};

/// Back-off applied when the process runs out of file descriptors.
const EXHAUSTED_BACKOFF: Duration = Duration::from_secs(1);

/// Source of inbound connections.
pub trait Accept: Send + 'static {
    fn try_accept(&mut self) -> impl Future<Output = io::Result<(TcpStream, SocketAddr)>> + Send;

    fn local_addr(&self) -> io::Result<SocketAddr>;
}

impl Accept for TcpListener {
    async fn try_accept(&mut self) -> io::Result<(TcpStream, SocketAddr)> {
        TcpListener::accept(self).await
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        TcpListener::local_addr(self)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AcceptFailure {
    /// Only the pending connection is affected.
    Connection,
    /// EMFILE / ENFILE: slots free up as connections close.
    Exhausted,
    Fatal,
}

fn classify(err: &io::Error) -> AcceptFailure {
    match err.kind() {
        io::ErrorKind::ConnectionRefused
        | io::ErrorKind::ConnectionAborted
        | io::ErrorKind::ConnectionReset
        | io::ErrorKind::Interrupted
        | io::ErrorKind::WouldBlock => AcceptFailure::Connection,
        _ if is_fd_exhaustion(err) => AcceptFailure::Exhausted,
        _ => AcceptFailure::Fatal,
    }
}

#[cfg(unix)]
fn is_fd_exhaustion(err: &io::Error) -> bool {
    // ENFILE = 23, EMFILE = 24 on Linux and the BSDs.
    matches!(err.raw_os_error(), Some(23 | 24))
}

#[cfg(not(unix))]
fn is_fd_exhaustion(_err: &io::Error) -> bool {
    false
}

pub struct ReportingListener<A> {
    inner: A,
    fatal_tx: Option<oneshot::Sender<io::Error>>,
}

impl<A: Accept> ReportingListener<A> {
    pub fn new(inner: A, fatal_tx: oneshot::Sender<io::Error>) -> Self {
        Self {
            inner,
            fatal_tx: Some(fatal_tx),
        }
    }
}

impl<A: Accept> axum::serve::Listener for ReportingListener<A> {
    type Io = TcpStream;
    type Addr = SocketAddr;

    async fn accept(&mut self) -> (Self::Io, Self::Addr) {
        loop {
            let err = match self.inner.try_accept().await {
                Ok(conn) => return conn,
                Err(err) => err,
            };

            match classify(&err) {
                AcceptFailure::Connection => {
                    debug!(error = %err, "connection failed during accept");
                }
                AcceptFailure::Exhausted => {
                    warn!(error = %err, "out of file descriptors, pausing accept");
                    tokio::time::sleep(EXHAUSTED_BACKOFF).await;
                }
                AcceptFailure::Fatal => {
                    error!(error = %err, "accept loop failed");
                    if let Some(fatal_tx) = self.fatal_tx.take() {
                        let _ = fatal_tx.send(err);
                    }
                    std::future::pending::<()>().await;
                }
            }
        }
    }

    fn local_addr(&self) -> io::Result<Self::Addr> {
        self.inner.local_addr()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connection_errors_are_retried() {
        for kind in [
            io::ErrorKind::ConnectionAborted,
            io::ErrorKind::ConnectionReset,
            io::ErrorKind::ConnectionRefused,
        ] {
            assert_eq!(classify(&io::Error::from(kind)), AcceptFailure::Connection);
        }
    }

    #[cfg(unix)]
    #[test]
    fn descriptor_exhaustion_backs_off() {
        assert_eq!(
            classify(&io::Error::from_raw_os_error(24)),
            AcceptFailure::Exhausted
        );
        assert_eq!(
            classify(&io::Error::from_raw_os_error(23)),
            AcceptFailure::Exhausted
        );
    }

    #[test]
    fn other_errors_are_fatal() {
        let err = io::Error::new(io::ErrorKind::PermissionDenied, "socket revoked");
        assert_eq!(classify(&err), AcceptFailure::Fatal);
    }
}
