//! Circuit breaker metrics endpoint.

use std::sync::Arc;

use axum::{
    Json,
    extract::State,
    http::{HeaderValue, Method, header},
    response::{IntoResponse, Response},
};

use crate::{ProxyState, error};

/// `GET /v1/circuit-breaker/metrics`: a consistent point-in-time snapshot
/// with permissive CORS. Any other method on the route gets the JSON 404.
pub(crate) async fn circuit_breaker_metrics(
    State(state): State<Arc<ProxyState>>,
    method: Method,
) -> Response {
    if method != Method::GET {
        return error::not_found().await;
    }

    let snapshot = state.breaker.get_metrics();

    let mut response = Json(snapshot).into_response();
    let headers = response.headers_mut();
    headers.insert(header::ACCESS_CONTROL_ALLOW_ORIGIN, HeaderValue::from_static("*"));
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_METHODS,
        HeaderValue::from_static("GET, OPTIONS"),
    );
    headers.insert(header::ACCESS_CONTROL_ALLOW_HEADERS, HeaderValue::from_static("*"));

    response
}
