//! Listener lifecycle
//!
//! `Constructed → Running → Stopped`. [`IngressServer::run`] starts the accept
//! loop on its own task and waits on either the caller's cancellation future
//! or the loop's outcome. Cancellation only ends the wait: the socket stays
//! open until [`IngressServer::stop`] drains it within the shutdown timeout.

use std::{
    future::{Future, IntoFuture},
    net::SocketAddr,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Duration,
};

use tokio::{
    net::TcpListener,
    sync::{oneshot, watch},
    task::JoinHandle,
};
use tracing::{debug, error, info};

use crate::{
    build_app,
    config::ServerConfig,
    errors::{CancelReason, ServerError},
    http::cors::CorsPolicy,
    listener::{Accept, ReportingListener},
    rpc::{Interceptor, RpcService},
    IngressState,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecyclePhase {
    Constructed,
    Running,
    Stopped,
}

enum Phase<A> {
    Constructed(A),
    Running(JoinHandle<()>),
    Stopped,
}

pub struct IngressServer<A = TcpListener> {
    state: IngressState,
    local_addr: SocketAddr,
    phase: Mutex<Phase<A>>,
    shutdown_tx: watch::Sender<bool>,
    shutdown_timeout: Duration,
}

impl IngressServer {
    /// Validates `config` and binds the listening socket.
    pub async fn new(
        config: ServerConfig,
        service: Arc<dyn RpcService>,
        interceptor: Arc<dyn Interceptor>,
    ) -> Result<Self, ServerError> {
        config.validate()?;
        let cors = CorsPolicy::new(config.public_url.as_deref(), config.client_url.as_deref())?;
        let bind_socket = config.bind_socket()?;

        let listener = TcpListener::bind(bind_socket)
            .await
            .map_err(ServerError::Bind)?;

        let state = IngressState::new(config.mount_path.as_str(), cors, service, interceptor);
        let server = Self::with_acceptor(state, listener, config.shutdown_timeout)?;

        info!(
            address = %server.local_addr,
            mount_path = %config.mount_path,
            allow_origin = ?server.state.cors.allow_origin(),
            shutdown_timeout_ms = config.shutdown_timeout.as_millis(),
            "listener bound"
        );

        Ok(server)
    }
}

impl<A: Accept> IngressServer<A> {
    /// Builds a server around an already bound connection source.
    pub fn with_acceptor(
        state: IngressState,
        acceptor: A,
        shutdown_timeout: Duration,
    ) -> Result<Self, ServerError> {
        let local_addr = acceptor.local_addr().map_err(ServerError::Bind)?;
        let (shutdown_tx, _) = watch::channel(false);

        Ok(Self {
            state,
            local_addr,
            phase: Mutex::new(Phase::Constructed(acceptor)),
            shutdown_tx,
            shutdown_timeout,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn phase(&self) -> LifecyclePhase {
        match &*self.lock_phase() {
            Phase::Constructed(_) => LifecyclePhase::Constructed,
            Phase::Running(_) => LifecyclePhase::Running,
            Phase::Stopped => LifecyclePhase::Stopped,
        }
    }

    /// Serves until `cancel` resolves or the accept loop ends.
    ///
    /// Returns `Ok(())` when the loop ended through [`IngressServer::stop`]
    /// and `ServerError::Serve` when accepting failed for good. When `cancel`
    /// wins, the listener keeps serving and the caller must still call `stop`.
    pub async fn run<F>(&self, cancel: F) -> Result<(), ServerError>
    where
        F: Future<Output = CancelReason>,
    {
        let outcome_rx = self.start()?;

        tokio::select! {
            biased;
            reason = cancel => {
                info!(%reason, "run cancelled, listener stays open until stop");
                Err(ServerError::Cancelled(reason))
            }
            outcome = outcome_rx => match outcome {
                Ok(Ok(())) => {
                    info!("accept loop finished");
                    Ok(())
                }
                Ok(Err(err)) => Err(ServerError::Serve(err)),
                Err(_) => Err(ServerError::ServeAborted),
            },
        }
    }

    fn start(&self) -> Result<oneshot::Receiver<std::io::Result<()>>, ServerError> {
        let mut phase = self.lock_phase();
        let acceptor = match std::mem::replace(&mut *phase, Phase::Stopped) {
            Phase::Constructed(acceptor) => acceptor,
            other => {
                *phase = other;
                return Err(ServerError::NotRunnable);
            }
        };

        let app = build_app(self.state.clone());
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let (outcome_tx, outcome_rx) = oneshot::channel();
        let (fatal_tx, fatal_rx) = oneshot::channel();
        let listener = ReportingListener::new(acceptor, fatal_tx);

        info!(address = %self.local_addr, "accepting connections");
        let task = tokio::spawn(async move {
            let serve = axum::serve(listener, app.into_make_service())
                .with_graceful_shutdown(async move {
                    let _ = shutdown_rx.wait_for(|stopping| *stopping).await;
                })
                .into_future();

            // `fatal_rx` errors out once serve drops the listener; that branch
            // is then disabled and the drain continues.
            let outcome = tokio::select! {
                outcome = serve => outcome,
                Ok(err) = fatal_rx => Err(err),
            };
            let _ = outcome_tx.send(outcome);
        });

        *phase = Phase::Running(task);
        Ok(outcome_rx)
    }

    /// Stops accepting and waits for in-flight requests, at most for the
    /// configured shutdown timeout. Failures are logged, not returned.
    pub async fn stop(&self) {
        let previous = std::mem::replace(&mut *self.lock_phase(), Phase::Stopped);
        self.shutdown_tx.send_replace(true);

        let mut task = match previous {
            Phase::Running(task) => task,
            Phase::Constructed(acceptor) => {
                drop(acceptor);
                info!(address = %self.local_addr, "listener released before serving");
                return;
            }
            Phase::Stopped => {
                debug!("stop called on a stopped server");
                return;
            }
        };

        match tokio::time::timeout(self.shutdown_timeout, &mut task).await {
            Ok(Ok(())) => info!(address = %self.local_addr, "server shut down gracefully"),
            Ok(Err(err)) => error!(error = %err, "failed to shutdown HTTP server"),
            Err(_) => {
                task.abort();
                error!(
                    timeout_ms = self.shutdown_timeout.as_millis(),
                    "failed to shutdown HTTP server: drain deadline exceeded, abandoning in-flight requests"
                );
            }
        }
    }

    fn lock_phase(&self) -> MutexGuard<'_, Phase<A>> {
        self.phase.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
