//! HTTP server hosting the admission-controlled application.

use std::net::SocketAddr;

use axum::extract::State;
use axum::middleware::from_fn_with_state;
use axum::routing::get;
use axum::{Json, Router};
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tower::ServiceBuilder;
use tracing::{error, info};

use super::middleware::{admission_middleware, AdmissionControl};
use crate::error::{FloodgateError, Result};
use crate::ratelimit::StatsSnapshot;

/// HTTP server wrapping an application router in admission control.
///
/// `/health` and `/metrics` are added alongside the application routes.
/// They sit behind the same middleware but are on its default bypass list.
pub struct HttpServer {
    /// Address to bind to
    addr: SocketAddr,
    router: Router,
}

impl HttpServer {
    pub fn new(addr: SocketAddr, control: AdmissionControl, app: Router) -> Self {
        let operational = Router::new()
            .route("/health", get(health))
            .route("/metrics", get(metrics))
            .with_state(control.clone());

        let router = operational.merge(app).layer(
            ServiceBuilder::new().layer(from_fn_with_state(control, admission_middleware)),
        );

        Self { addr, router }
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// The fully layered router.
    pub fn into_router(self) -> Router {
        self.router
    }

    /// Serve until `signal` resolves, then drain in-flight requests.
    pub async fn serve_with_shutdown<F>(self, signal: F) -> Result<()>
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        let listener = TcpListener::bind(self.addr).await?;
        info!(addr = %listener.local_addr()?, "Starting HTTP server with admission control");

        axum::serve(
            listener,
            self.router
                .into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(signal)
        .await
        .map_err(|e| {
            error!(error = %e, "HTTP server failed");
            FloodgateError::Server(e.to_string())
        })
    }
}

async fn health(State(control): State<AdmissionControl>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "store": control.limiter().store().name(),
    }))
}

async fn metrics(State(control): State<AdmissionControl>) -> Json<StatsSnapshot> {
    Json(control.limiter().stats().snapshot())
}
