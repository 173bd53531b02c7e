use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::routing::{get, post};
use axum::Router;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::handlers::{self, AppState};

#[derive(Clone, Debug)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub request_timeout: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8790,
            request_timeout: Duration::from_secs(60),
        }
    }
}

impl ServerConfig {
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Ok(host) = std::env::var("CORRAL_HOST") {
            config.host = host;
        }
        if let Ok(port) = std::env::var("CORRAL_PORT") {
            if let Ok(port) = port.parse() {
                config.port = port;
            }
        }
        config
    }
}

pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(handlers::health))
        .route("/metrics", get(handlers::metrics))
        .route("/sandbox", post(handlers::create_sandbox))
        .route(
            "/sandbox/{id}",
            get(handlers::get_sandbox).delete(handlers::deactivate_sandbox),
        )
        .route("/sandbox/{id}/usage", get(handlers::get_usage))
        .route("/sandbox/{id}/usage_log", get(handlers::list_usage_log))
        .route(
            "/sandbox/{id}/sessions",
            get(handlers::list_sessions).post(handlers::create_session),
        )
        .route(
            "/sessions/{id}",
            get(handlers::get_session).delete(handlers::end_session),
        )
        .route("/sandbox/{id}/tools/execute", post(handlers::execute_tool))
        .route(
            "/sandbox/{id}/workflows/{workflow_id}/execute",
            post(handlers::execute_workflow),
        )
        .route("/workflows/runs/{correlation_id}", get(handlers::get_workflow_run))
        .route("/replay/{correlation_id}", get(handlers::get_replay))
        .route("/ws", get(handlers::ws_connect))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .layer(TimeoutLayer::new(Duration::from_secs(60)))
        .with_state(state)
}

pub struct Server {
    config: ServerConfig,
    state: Arc<AppState>,
}

impl Server {
    pub fn new(config: ServerConfig, state: Arc<AppState>) -> Self {
        Self { config, state }
    }

    /// Bind and serve. Returns the bound address (useful with port 0)
    /// and the serving task, which runs until `shutdown` is cancelled.
    pub async fn start(
        self,
        shutdown: CancellationToken,
    ) -> std::io::Result<(SocketAddr, tokio::task::JoinHandle<()>)> {
        let addr = format!("{}:{}", self.config.host, self.config.port);
        let listener = tokio::net::TcpListener::bind(&addr).await?;
        let local_addr = listener.local_addr()?;
        info!(addr = %local_addr, "server listening");

        let router = build_router(self.state);
        let handle = tokio::spawn(async move {
            let serve = axum::serve(listener, router)
                .with_graceful_shutdown(async move { shutdown.cancelled().await });
            if let Err(e) = serve.await {
                tracing::error!(error = %e, "server exited with error");
            }
        });

        Ok((local_addr, handle))
    }
}
