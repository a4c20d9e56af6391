//! HTTP server hosting the gated application.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::http::StatusCode;
use axum::routing::get;
use axum::{Json, Router};
use serde::Serialize;
use tokio::net::TcpListener;
use tracing::{error, info};

use super::layer::RateLimitLayer;
use crate::error::Result;
use crate::ratelimit::RateLimiter;

#[derive(Debug, Serialize)]
struct Health {
    status: &'static str,
    store: &'static str,
    timestamp: String,
}

#[derive(Debug, Serialize)]
struct NotFound {
    message: &'static str,
}

/// HTTP server placing every application route behind the rate limiter.
pub struct GateServer {
    /// Address to bind to
    addr: SocketAddr,
    /// The rate limiter instance
    limiter: Arc<RateLimiter>,
    /// Application routes served behind the gate
    routes: Router,
    trust_proxy_headers: bool,
}

impl GateServer {
    /// Create a server with no application routes mounted.
    pub fn new(addr: SocketAddr, limiter: Arc<RateLimiter>) -> Self {
        Self {
            addr,
            limiter,
            routes: Router::new(),
            trust_proxy_headers: false,
        }
    }

    /// Mount the application's router behind the gate.
    pub fn with_routes(mut self, routes: Router) -> Self {
        self.routes = routes;
        self
    }

    /// See [`RateLimitLayer::trust_proxy_headers`].
    pub fn trust_proxy_headers(mut self, trust: bool) -> Self {
        self.trust_proxy_headers = trust;
        self
    }

    /// Build the full router.
    ///
    /// `/health` is answered without touching the limiter; everything else,
    /// unmatched paths included, is gated.
    pub fn router(&self) -> Router {
        let store = self.limiter.store_name();
        let gate =
            RateLimitLayer::new(self.limiter.clone()).trust_proxy_headers(self.trust_proxy_headers);

        let gated = self.routes.clone().fallback(not_found).layer(gate);

        Router::new()
            .route("/health", get(move || health(store)))
            .merge(gated)
    }

    /// Start the server with graceful shutdown.
    ///
    /// The server will shut down when the provided signal resolves.
    pub async fn serve_with_shutdown<F>(self, signal: F) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let app = self.router();
        let listener = TcpListener::bind(self.addr).await?;

        info!(
            addr = %self.addr,
            store = self.limiter.store_name(),
            "Starting HTTP server with graceful shutdown"
        );

        axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>())
            .with_graceful_shutdown(signal)
            .await
            .map_err(|e| {
                error!(error = %e, "HTTP server failed");
                e.into()
            })
    }
}

async fn health(store: &'static str) -> Json<Health> {
    Json(Health {
        status: "ok",
        store,
        timestamp: chrono::Utc::now().to_rfc3339(),
    })
}

async fn not_found() -> (StatusCode, Json<NotFound>) {
    (StatusCode::NOT_FOUND, Json(NotFound { message: "Not found" }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratelimit::{MemoryStore, RouteRules, Rule};
    use std::time::Duration;

    fn limiter() -> Arc<RateLimiter> {
        let rules = RouteRules::new(Rule::new("default", 10, Duration::from_secs(60)));
        Arc::new(RateLimiter::new(Arc::new(MemoryStore::new()), rules))
    }

    #[test]
    fn test_server_creation() {
        let addr: SocketAddr = "127.0.0.1:8080".parse().unwrap();
        let server = GateServer::new(addr, limiter())
            .with_routes(Router::new().route("/api/posts", get(|| async { "posts" })))
            .trust_proxy_headers(true);

        let _router = server.router();
    }

    #[tokio::test]
    async fn test_health_reports_store() {
        let Json(health) = health("memory").await;

        assert_eq!(health.status, "ok");
        assert_eq!(health.store, "memory");
        assert!(chrono::DateTime::parse_from_rfc3339(&health.timestamp).is_ok());
    }
}
