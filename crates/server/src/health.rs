//! Liveness and readiness endpoints.

use std::sync::Arc;

use axum::{
    Json,
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use circuit_breaker::CircuitState;
use serde_json::json;

use crate::ProxyState;

/// `GET /health/live`: unconditionally alive while the process serves.
pub(crate) async fn live() -> Json<serde_json::Value> {
    Json(json!({ "status": "alive" }))
}

/// `GET /health/ready`: ready unless the backend circuit is OPEN.
pub(crate) async fn ready(State(state): State<Arc<ProxyState>>) -> Response {
    let phase = state.breaker.state();
    let ready = matches!(phase, CircuitState::Closed | CircuitState::HalfOpen);

    let body = json!({
        "status": if ready { "ready" } else { "not_ready" },
        "checks": {
            "circuit_breaker": {
                "state": phase,
                "failure_count": state.breaker.failure_count(),
            },
        },
    });

    let status = if ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (status, Json(body)).into_response()
}
