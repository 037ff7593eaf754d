//! HTTP server setup and configuration.
//!
//! # Responsibilities
//! - Create Axum Router with a catch-all proxy handler
//! - Wire up middleware (timeout, request ID, tracing)
//! - Serve on a bound listener until the shutdown signal fires

use axum::{
    body::Body,
    extract::State,
    http::Request,
    response::{IntoResponse, Response},
    routing::any,
    Router,
};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tower_http::{timeout::TimeoutLayer, trace::TraceLayer};

use crate::config::{ConfigError, ProxyConfig};
use crate::http::request::{propagate_request_id_layer, set_request_id_layer, RequestIdExt};
use crate::http::service::ProxyService;
use crate::observability::metrics;

/// Application state injected into handlers.
#[derive(Clone)]
pub struct AppState {
    pub service: Arc<ProxyService>,
}

/// HTTP server for the proxy.
pub struct HttpServer {
    router: Router,
    config: ProxyConfig,
}

impl HttpServer {
    /// Create a new HTTP server with the given configuration.
    pub fn new(config: ProxyConfig) -> Result<Self, ConfigError> {
        let service = ProxyService::from_config(&config)?;
        Ok(Self::with_service(config, service))
    }

    /// Create a server around an already built service.
    pub fn with_service(config: ProxyConfig, service: ProxyService) -> Self {
        let state = AppState {
            service: Arc::new(service),
        };
        let router = Self::build_router(&config, state);
        Self { router, config }
    }

    /// Build the Axum router with all middleware layers.
    #[allow(deprecated)]
    fn build_router(config: &ProxyConfig, state: AppState) -> Router {
        Router::new()
            .route("/{*path}", any(proxy_handler))
            .route("/", any(proxy_handler))
            .with_state(state)
            .layer(TimeoutLayer::new(Duration::from_secs(config.timeouts.request_secs)))
            .layer(propagate_request_id_layer())
            .layer(TraceLayer::new_for_http())
            .layer(set_request_id_layer())
    }

    /// Run the server until `shutdown` fires, then drain open connections.
    pub async fn run(self, listener: TcpListener, mut shutdown: broadcast::Receiver<()>) -> Result<(), std::io::Error> {
        let addr = listener.local_addr()?;
        tracing::info!(
            address = %addr,
            upstream = %self.config.upstream.base_url,
            "HTTP server starting"
        );

        axum::serve(listener, self.router)
            .with_graceful_shutdown(async move {
                let _ = shutdown.recv().await;
                tracing::info!("Shutdown signal received; draining connections");
            })
            .await?;

        // Dropping the router drops the service and its upstream pool.
        tracing::info!("HTTP server stopped");
        Ok(())
    }

    /// Get a reference to the config.
    pub fn config(&self) -> &ProxyConfig {
        &self.config
    }
}

/// Forward any method on any path.
async fn proxy_handler(State(state): State<AppState>, request: Request<Body>) -> Response {
    let start_time = Instant::now();
    let request_id = request.request_id().to_string();
    let method = request.method().to_string();

    match state.service.handle(request).await {
        Ok(response) => {
            metrics::record_request(&method, response.status().as_u16(), start_time);
            response
        }
        Err(e) => {
            tracing::warn!(request_id = %request_id, method = %method, error = %e, "Proxy request failed");
            metrics::record_request(&method, e.status().as_u16(), start_time);
            e.into_response()
        }
    }
}
