use std::sync::Arc;

use axum::routing::{get, post};
use axum::Router;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tracing::info;

use delve_core::config::GatewayConfig;
use delve_core::traits::StateStore;

use crate::host::RunHost;
use crate::routes;
use crate::state::AppState;

/// HTTP + SSE gateway server built on axum.
pub struct GatewayServer {
    config: GatewayConfig,
    host: Arc<RunHost>,
    store: Arc<dyn StateStore>,
}

impl GatewayServer {
    pub fn new(config: GatewayConfig, host: Arc<RunHost>) -> Self {
        let store = host.store().clone();
        Self {
            config,
            host,
            store,
        }
    }

    /// The gateway's routes, ready to serve.
    pub fn router(&self) -> Router {
        let state = Arc::new(AppState {
            config: self.config.clone(),
            host: self.host.clone(),
            store: self.store.clone(),
        });

        Router::new()
            .route("/api/health", get(routes::health))
            .route("/api/runs", get(routes::list_runs))
            .route(
                "/api/runs/{id}",
                get(routes::get_run).delete(routes::delete_run),
            )
            .route("/api/runs/{id}/stream", post(routes::stream_run))
            .route("/api/runs/{id}/cancel", post(routes::cancel_run))
            .layer(CorsLayer::permissive())
            .with_state(state)
    }

    /// Run the gateway server until the cancellation token is triggered.
    ///
    /// Live runs are cancelled on shutdown so their streams end `aborted`
    /// and their checkpoints stay resumable.
    pub async fn run(&self, shutdown: CancellationToken) -> anyhow::Result<()> {
        let app = self.router();

        let listener = TcpListener::bind(&self.config.bind).await?;
        info!(bind = %self.config.bind, "Gateway listening");

        let host = self.host.clone();
        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                shutdown.cancelled().await;
                host.cancel_all();
            })
            .await?;

        info!("Gateway shut down");
        Ok(())
    }
}
