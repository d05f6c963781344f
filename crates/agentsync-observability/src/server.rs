//! HTTP server exposing the Prometheus text-format `/metrics` endpoint and
//! a `GetHealth`-backed `/health` endpoint (spec.md §4.12, §6).

use crate::error::{Error, Result};
use crate::health::HealthCheck;
use crate::metrics::MetricsHub;
use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use std::sync::Arc;
use tokio::net::TcpListener;

struct ServerState {
    metrics: Arc<MetricsHub>,
    health: Arc<HealthCheck>,
}

/// Starts the metrics/health HTTP server and returns the bound address plus
/// a future that serves requests until dropped/aborted.
pub async fn serve(
    port: u16,
    metrics_path: &str,
    metrics: Arc<MetricsHub>,
    health: Arc<HealthCheck>,
) -> Result<(
    std::net::SocketAddr,
    impl std::future::Future<Output = Result<()>>,
)> {
    let state = Arc::new(ServerState { metrics, health });

    let app = Router::new()
        .route(metrics_path, get(metrics_handler))
        .route("/health", get(health_handler))
        .with_state(state);

    let addr = format!("0.0.0.0:{port}");
    let listener = TcpListener::bind(&addr)
        .await
        .map_err(|e| Error::Server(format!("failed to bind to {addr}: {e}")))?;
    let local_addr = listener
        .local_addr()
        .map_err(|e| Error::Server(e.to_string()))?;

    tracing::info!(addr = %local_addr, "observability server listening");

    let server_future = async move {
        axum::serve(listener, app)
            .await
            .map_err(|e| Error::Server(e.to_string()))
    };

    Ok((local_addr, server_future))
}

async fn metrics_handler(State(state): State<Arc<ServerState>>) -> Response {
    match state.metrics.export() {
        Ok(body) => (StatusCode::OK, body).into_response(),
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
    }
}

async fn health_handler(State(state): State<Arc<ServerState>>) -> Response {
    let report = state.health.report();
    let status = match report.overall {
        crate::health::ComponentStatus::Healthy => StatusCode::OK,
        crate::health::ComponentStatus::Warning => StatusCode::OK,
        crate::health::ComponentStatus::Critical | crate::health::ComponentStatus::Down => {
            StatusCode::SERVICE_UNAVAILABLE
        }
    };
    (status, Json(report)).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::health::ComponentStatus;

    #[tokio::test]
    async fn metrics_and_health_endpoints_respond() {
        let metrics = Arc::new(MetricsHub::new().unwrap());
        let health = Arc::new(HealthCheck::new());
        health.record("redis", ComponentStatus::Healthy, 1.0, 0.0, None);

        let (addr, fut) = serve(0, "/metrics", metrics.clone(), health).await.unwrap();
        let handle = tokio::spawn(fut);

        let client = reqwest::Client::new();
        let metrics_resp = client
            .get(format!("http://{addr}/metrics"))
            .send()
            .await
            .unwrap();
        assert_eq!(metrics_resp.status(), 200);

        let health_resp = client
            .get(format!("http://{addr}/health"))
            .send()
            .await
            .unwrap();
        assert_eq!(health_resp.status(), 200);

        handle.abort();
    }
}
