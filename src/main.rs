use std::sync::Arc;

use auth_ingress::{
    config::Settings,
    errors::{CancelReason, ServerError},
    logging,
    rpc::{PassThrough, UnimplementedService},
    server::IngressServer,
};
use tracing::{error, info};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    logging::init_logging();

    let settings = Settings::from_env()?;
    let config = settings.server_config();

    info!(
        bind_addr = %config.bind_addr,
        bind_port = config.bind_port,
        allow_origin = settings.allowed_origin().unwrap_or_default(),
        backend_url = settings.backend_url().unwrap_or_default(),
        "server starting"
    );

    let server = IngressServer::new(
        config,
        Arc::new(UnimplementedService),
        Arc::new(PassThrough),
    )
    .await?;

    let outcome = server.run(shutdown_signal()).await;
    server.stop().await;

    match outcome {
        Ok(()) | Err(ServerError::Cancelled(_)) => {
            info!("shutdown complete");
            Ok(())
        }
        Err(err) => {
            error!(error = %err, "server terminated");
            Err(err.into())
        }
    }
}

async fn shutdown_signal() -> CancelReason {
    match tokio::signal::ctrl_c().await {
        Ok(()) => CancelReason::Interrupted,
        Err(err) => CancelReason::Requested(format!("failed to listen for ctrl-c: {err}")),
    }
}
