//! Request validation applied before any handler runs.
//!
//! Rejections here are client errors and never touch a circuit breaker.

use axum::{
    extract::Request,
    middleware::Next,
    response::Response,
};
use llm::LlmError;

use crate::error::ApiError;

/// Reject header injection attempts and path traversal before routing.
pub(crate) async fn validate_request(request: Request, next: Next) -> Result<Response, ApiError> {
    for (name, value) in request.headers() {
        if value.as_bytes().iter().any(|&byte| byte == b'\r' || byte == b'\n') {
            return Err(LlmError::Validation(format!("header '{name}' contains CR/LF")).into());
        }
    }

    let path = request.uri().path();
    if path.split('/').any(|segment| segment == "..") {
        return Err(LlmError::Validation("path contains '..' segments".to_string()).into());
    }

    Ok(next.run(request).await)
}
