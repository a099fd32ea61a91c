//! Server setup and lifecycle management

use crate::api::{create_router, AppState};
use crate::config::DaemonConfig;
use crate::error::{DaemonError, DaemonResult};
use crate::http;
use crate::scheduler::Poller;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::{broadcast, watch};
use tracing::{debug, error, info, warn};
use vigil_monitor::MonitorEngine;
use vigil_types::MonitorEvent;

/// Vigil daemon server
pub struct Server {
    config: DaemonConfig,
    engine: Arc<MonitorEngine>,
}

impl Server {
    /// Create a new server with the given configuration
    pub fn new(config: DaemonConfig) -> DaemonResult<Self> {
        let collaborators = http::collaborators(&config.collaborators)?;
        let engine = Arc::new(MonitorEngine::new(config.monitor_config(), collaborators));
        Ok(Self { config, engine })
    }

    pub fn engine(&self) -> &Arc<MonitorEngine> {
        &self.engine
    }

    /// Run the server until a shutdown signal arrives
    pub async fn run(self) -> DaemonResult<()> {
        let addr = self.config.server.listen_addr;

        let state = AppState::new(self.engine.clone());
        let app = create_router(state, self.config.server.enable_cors);

        let listener = TcpListener::bind(addr).await?;
        info!(addr = %addr, profile = ?self.config.profile, "Vigil daemon listening");

        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let poller = Poller::new(self.config.scheduler.clone(), self.engine.clone());
        let poller_handle = tokio::spawn(poller.run(shutdown_rx));
        let events_handle = tokio::spawn(log_events(self.engine.subscribe()));

        let served = axum::serve(listener, app)
            .with_graceful_shutdown(shutdown_signal())
            .await
            .map_err(|e| DaemonError::Server(e.to_string()));

        info!("Vigil daemon shutting down");

        let _ = shutdown_tx.send(true);
        if let Err(e) = poller_handle.await {
            warn!(error = %e, "Poller task ended abnormally");
        }
        self.engine.shutdown();
        events_handle.abort();

        served
    }
}

/// Forward engine events to the log.
async fn log_events(mut events: broadcast::Receiver<MonitorEvent>) {
    loop {
        match events.recv().await {
            Ok(event) => match serde_json::to_string(&event) {
                Ok(json) => debug!(event = %json, "Monitor event"),
                Err(e) => warn!(error = %e, "Unserializable monitor event"),
            },
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!(skipped, "Event log lagged behind");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

/// Graceful shutdown signal handler
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install signal handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, initiating graceful shutdown");
        }
        _ = terminate => {
            info!("Received terminate signal, initiating graceful shutdown");
        }
    }
}
