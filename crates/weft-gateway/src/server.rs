use std::sync::Arc;

use axum::routing::{delete, get, post};
use axum::Router;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

use weft_core::config::GatewayConfig;
use weft_engine::ExecutionEngine;

use crate::routes;
use crate::state::AppState;

/// HTTP gateway server built on axum.
pub struct GatewayServer {
    config: GatewayConfig,
    engine: Arc<ExecutionEngine>,
}

impl GatewayServer {
    pub fn new(config: GatewayConfig, engine: Arc<ExecutionEngine>) -> Self {
        Self { config, engine }
    }

    /// Run the gateway until the cancellation token is triggered.
    pub async fn run(&self, shutdown: CancellationToken) -> anyhow::Result<()> {
        let state = Arc::new(AppState {
            config: self.config.clone(),
            engine: self.engine.clone(),
        });

        let app = Self::router(state);

        let listener = TcpListener::bind(&self.config.bind).await?;
        info!(bind = %self.config.bind, "Gateway listening");

        axum::serve(listener, app)
            .with_graceful_shutdown(async move { shutdown.cancelled().await })
            .await?;

        info!("Gateway shut down");
        Ok(())
    }

    pub fn router(state: Arc<AppState>) -> Router {
        Router::new()
            // Workflow management
            .route(
                "/api/workflows",
                get(routes::list_workflows).post(routes::create_workflow),
            )
            .route(
                "/api/workflows/{id}",
                get(routes::get_workflow).delete(routes::delete_workflow),
            )
            // Execution control
            .route("/api/workflows/{id}/execute", post(routes::execute_workflow))
            .route("/api/workflows/{id}/status", get(routes::workflow_status))
            .route("/api/executions", get(routes::list_executions))
            .route("/api/executions/{id}", get(routes::get_execution))
            .route("/api/executions/{id}/cancel", post(routes::cancel_execution))
            // Task-level status/cancel (reconciliation poll targets)
            .route("/api/tasks/{id}", get(routes::get_task))
            .route("/api/tasks/{id}/cancel", post(routes::cancel_task))
            // Callback fan-in from executor servers
            .route("/api/callback", post(routes::handle_callback))
            // Data plane hooks
            .route(
                "/api/data/{uuid}",
                get(routes::get_data).delete(routes::delete_data),
            )
            .route("/api/data/{uuid}/retire", post(routes::retire_data))
            // Fleet membership
            .route(
                "/api/servers",
                get(routes::list_servers).post(routes::register_server),
            )
            .route("/api/servers/{address}", delete(routes::unregister_server))
            // Health
            .route("/api/health", get(routes::health))
            .layer(TraceLayer::new_for_http())
            .layer(CorsLayer::permissive())
            .with_state(state)
    }
}
