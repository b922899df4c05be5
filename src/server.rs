use axum::{
    Router,
    routing::{get, post},
};
use std::future::IntoFuture;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::agent::LocalDispatcherClient;
use crate::config::DispatcherConfig;
use crate::dispatcher::Dispatcher;
use crate::error::ConfigError;
use crate::handlers::{
    alive_handler, generate_handler, generate_stream_handler, health_handler, metrics_handler,
    ready_handler, reflection_handler, startup_handler, work_handler,
};
use crate::health::{HealthState, health_checker};
use crate::queue::ModelQueueRegistry;
use crate::state::AppState;
use crate::worker::WorkHandler;

pub struct DispatcherServer {
    state: Arc<AppState>,
    health_interval: Duration,
}

impl DispatcherServer {
    pub fn new(config: &DispatcherConfig) -> Result<Self, ConfigError> {
        let registry = Arc::new(ModelQueueRegistry::new(
            &config.supported_models,
            config.backlog_size,
        )?);
        let abort = CancellationToken::new();
        // aborting also stops new work
        let shutdown = abort.child_token();

        let state = Arc::new(AppState {
            dispatcher: Dispatcher::new(registry.clone(), config.default_generate_stream_timeout),
            work_handler: Arc::new(WorkHandler::new(registry.clone())),
            health: Arc::new(HealthState::new()),
            registry,
            shutdown,
            abort,
        });

        Ok(Self {
            state,
            health_interval: config.health_check_interval,
        })
    }

    pub fn state(&self) -> &Arc<AppState> {
        &self.state
    }

    pub fn router(&self) -> Router {
        Router::new()
            .route("/v1/generate", post(generate_handler))
            .route("/v1/generate_stream", post(generate_stream_handler))
            .route("/v1/work", get(work_handler))
            .route("/health", get(health_handler))
            .route("/health/ready", get(ready_handler))
            .route("/health/live", get(alive_handler))
            .route("/health/startup", get(startup_handler))
            .route("/metrics", get(metrics_handler))
            .route("/reflection", get(reflection_handler))
            .with_state(self.state.clone())
    }

    /// Client for agents living in this process; skips the network.
    pub fn local_client(&self) -> LocalDispatcherClient {
        LocalDispatcherClient::new(
            self.state.work_handler.clone(),
            self.state.shutdown.clone(),
            self.state.abort.clone(),
        )
    }

    /// Serves until `stop` is called.
    pub async fn run(&self, listener: TcpListener) -> std::io::Result<()> {
        let addr = listener.local_addr()?;
        info!(%addr, models = ?self.state.registry.models(), "dispatcher listening");

        let checker = tokio::spawn(health_checker(
            self.state.registry.clone(),
            self.state.health.clone(),
            self.health_interval,
            self.state.shutdown.clone(),
        ));

        let serve = axum::serve(listener, self.router())
            .with_graceful_shutdown(self.state.shutdown.clone().cancelled_owned());
        let result = tokio::select! {
            served = serve.into_future() => served,
            _ = self.state.abort.cancelled() => {
                warn!("dispatcher force-stopped");
                Ok(())
            }
        };

        checker.abort();
        info!("dispatcher stopped");
        result
    }

    /// Graceful: stop accepting connections and release idle agents, let
    /// in-flight exchanges finish. Otherwise cancel everything now.
    pub fn stop(&self, graceful: bool) {
        if graceful {
            info!("graceful shutdown requested");
            self.state.shutdown.cancel();
        } else {
            warn!("forced shutdown requested");
            self.state.abort.cancel();
        }
        self.state.health.set_ready(false);
    }
}
