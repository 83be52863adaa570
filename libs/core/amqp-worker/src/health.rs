//! Health check handlers for AMQP workers.
//!
//! - Liveness probes (`/health`, `/healthz`)
//! - Readiness probes (`/ready`, `/readyz`), ready only while connected
//! - Prometheus metrics (`/metrics`)

use axum::{
    extract::State,
    http::{header, StatusCode},
    response::IntoResponse,
    Json,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::watch;

use crate::connection::ConnectionState;
use crate::metrics;

/// Shared state for health endpoints.
#[derive(Clone)]
pub struct HealthState {
    pub app_name: String,
    pub app_version: String,
    /// Published by the connection manager
    pub connection: watch::Receiver<ConnectionState>,
}

impl HealthState {
    pub fn new(
        app_name: impl Into<String>,
        app_version: impl Into<String>,
        connection: watch::Receiver<ConnectionState>,
    ) -> Self {
        Self {
            app_name: app_name.into(),
            app_version: app_version.into(),
            connection,
        }
    }
}

/// Health response for liveness probes.
#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub name: String,
    pub version: String,
}

/// Liveness probe handler.
///
/// Always returns OK if the server is running.
pub async fn health_handler(State(state): State<HealthState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
        name: state.app_name,
        version: state.app_version,
    })
}

/// Readiness probe handler.
///
/// Ready only while the broker session is established.
pub async fn ready_handler(
    State(state): State<HealthState>,
) -> Result<(StatusCode, Json<Value>), (StatusCode, Json<Value>)> {
    let connection = *state.connection.borrow();

    if connection == ConnectionState::Connected {
        Ok((
            StatusCode::OK,
            Json(json!({
                "status": "ready",
                "checks": {
                    "rabbitmq": connection.to_string()
                }
            })),
        ))
    } else {
        Err((
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({
                "status": "not_ready",
                "checks": {
                    "rabbitmq": connection.to_string()
                }
            })),
        ))
    }
}

/// Prometheus metrics endpoint handler.
pub async fn metrics_handler() -> impl IntoResponse {
    match metrics::prometheus_handle() {
        Some(handle) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
            handle.render(),
        )
            .into_response(),
        None => (
            StatusCode::SERVICE_UNAVAILABLE,
            [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
            "Metrics not initialized. Call metrics::init_metrics() at startup.".to_string(),
        )
            .into_response(),
    }
}

/// Create a standard health router.
pub fn health_router(state: HealthState) -> axum::Router {
    use axum::routing::get;

    axum::Router::new()
        .route("/health", get(health_handler))
        .route("/healthz", get(health_handler))
        .route("/ready", get(ready_handler))
        .route("/readyz", get(ready_handler))
        .route("/metrics", get(metrics_handler))
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use tower::ServiceExt;

    async fn get(router: axum::Router, uri: &str) -> (StatusCode, Value) {
        let response = router
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, serde_json::from_slice(&bytes).unwrap_or(Value::Null))
    }

    #[tokio::test]
    async fn test_liveness_is_always_ok() {
        let (_tx, rx) = watch::channel(ConnectionState::Disconnected);
        let router = health_router(HealthState::new("metrics-worker", "0.1.0", rx));

        let (status, body) = get(router, "/healthz").await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "healthy");
        assert_eq!(body["name"], "metrics-worker");
    }

    #[tokio::test]
    async fn test_readiness_follows_connection_state() {
        let (tx, rx) = watch::channel(ConnectionState::Connecting);
        let router = health_router(HealthState::new("metrics-worker", "0.1.0", rx));

        let (status, body) = get(router.clone(), "/readyz").await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body["checks"]["rabbitmq"], "connecting");

        tx.send_replace(ConnectionState::Connected);
        let (status, body) = get(router, "/ready").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ready");
    }

    #[test]
    fn test_health_response_serialization() {
        let response = HealthResponse {
            status: "healthy".to_string(),
            name: "metrics-worker".to_string(),
            version: "1.0.0".to_string(),
        };

        let json = serde_json::to_string(&response).unwrap();
        assert!(json.contains("\"status\":\"healthy\""));
    }
}
