//! HTTP server for the Prometheus metrics endpoint.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::Router;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{Html, IntoResponse, Response};
use axum::routing::get;
use prometheus_client::encoding::text::encode;
use prometheus_client::registry::Registry;
use tokio::sync::watch;
use tower_http::cors::CorsLayer;
use tracing::{error, info};

use crate::executor::{Executor, ScrapeOutcome};
use crate::sink::MetricSink;

/// Content type of the exposition.
pub const OPENMETRICS_CONTENT_TYPE: &str =
    "application/openmetrics-text; version=1.0.0; charset=utf-8";

/// Application state shared across handlers.
#[derive(Clone)]
struct AppState {
    executor: Arc<Executor>,
    registry: Arc<Registry>,
    metrics_path: Arc<str>,
}

/// Create the HTTP router.
fn create_router(executor: Arc<Executor>, registry: Arc<Registry>, metrics_path: &str) -> Router {
    let state = AppState {
        executor,
        registry,
        metrics_path: Arc::from(metrics_path),
    };

    let mut router = Router::new()
        .route(metrics_path, get(metrics_handler))
        .route("/health", get(health_handler))
        .route("/ready", get(ready_handler));

    if metrics_path != "/" {
        router = router.route("/", get(index_handler));
    }

    router.layer(CorsLayer::permissive()).with_state(state)
}

/// Handler for the metrics endpoint: one scrape per request.
async fn metrics_handler(State(state): State<AppState>) -> Response {
    let mut sink = MetricSink::new();
    state.executor.scrape(&mut sink).await;

    let mut body = sink.render();
    if let Err(e) = encode(&mut body, &state.registry) {
        error!(error = %e, "Failed to encode exporter metrics");
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            "failed to encode metrics\n",
        )
            .into_response();
    }

    (
        StatusCode::OK,
        [("content-type", OPENMETRICS_CONTENT_TYPE)],
        body,
    )
        .into_response()
}

/// Landing page pointing at the metrics path.
async fn index_handler(State(state): State<AppState>) -> Html<String> {
    Html(format!(
        "<html>\n\
         <head><title>NSQ Exporter</title></head>\n\
         <body>\n\
         <h1>NSQ Exporter</h1>\n\
         <p><a href=\"{path}\">Metrics</a></p>\n\
         </body>\n\
         </html>\n",
        path = state.metrics_path
    ))
}

/// Handler for the /health endpoint.
async fn health_handler() -> Response {
    (StatusCode::OK, "healthy\n").into_response()
}

/// Handler for the /ready endpoint.
async fn ready_handler(State(state): State<AppState>) -> Response {
    match state.executor.last_outcome() {
        Some(ScrapeOutcome::Success) => (StatusCode::OK, "ready\n").into_response(),
        Some(ScrapeOutcome::Error) => (
            StatusCode::SERVICE_UNAVAILABLE,
            "not ready - last scrape failed\n",
        )
            .into_response(),
        None => (
            StatusCode::SERVICE_UNAVAILABLE,
            "not ready - no scrape yet\n",
        )
            .into_response(),
    }
}

/// HTTP server configuration.
pub struct HttpServer {
    executor: Arc<Executor>,
    registry: Arc<Registry>,
    listen_addr: SocketAddr,
    metrics_path: String,
}

impl HttpServer {
    /// Create a new HTTP server.
    pub fn new(
        executor: Arc<Executor>,
        registry: Arc<Registry>,
        listen_addr: SocketAddr,
        metrics_path: String,
    ) -> Self {
        Self {
            executor,
            registry,
            listen_addr,
            metrics_path,
        }
    }

    /// Run the HTTP server until the shutdown signal is received.
    pub async fn run(self, shutdown: watch::Receiver<bool>) -> anyhow::Result<()> {
        let listener = tokio::net::TcpListener::bind(self.listen_addr)
            .await
            .map_err(|e| anyhow::anyhow!("Failed to bind to {}: {}", self.listen_addr, e))?;

        self.serve(listener, shutdown).await
    }

    /// Serve on an already bound listener until the shutdown signal is
    /// received.
    pub async fn serve(
        self,
        listener: tokio::net::TcpListener,
        mut shutdown: watch::Receiver<bool>,
    ) -> anyhow::Result<()> {
        let router = create_router(self.executor, self.registry, &self.metrics_path);
        let addr = listener.local_addr()?;

        info!(
            addr = %addr,
            path = %self.metrics_path,
            "HTTP server listening"
        );

        // Run server with graceful shutdown
        axum::serve(listener, router)
            .with_graceful_shutdown(async move {
                // Wait for shutdown signal
                loop {
                    if shutdown.changed().await.is_err() {
                        break;
                    }
                    if *shutdown.borrow() {
                        break;
                    }
                }
                info!("HTTP server shutting down");
            })
            .await
            .map_err(|e| anyhow::anyhow!("HTTP server error: {}", e))?;

        info!("HTTP server stopped");
        Ok(())
    }
}
