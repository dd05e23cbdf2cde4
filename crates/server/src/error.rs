//! Error responses in the Anthropic wire shape.

use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use llm::LlmError;
use llm::protocol::anthropic::ErrorBody;

/// Wrapper turning core errors into wire responses.
pub(crate) struct ApiError(pub(crate) LlmError);

impl From<LlmError> for ApiError {
    fn from(error: LlmError) -> Self {
        Self(error)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.0.status_code();
        let body = ErrorBody::new(self.0.error_type(), self.0.client_message());

        (status, Json(body)).into_response()
    }
}

/// JSON 404 for unknown routes and disallowed methods.
pub(crate) async fn not_found() -> Response {
    (
        StatusCode::NOT_FOUND,
        Json(ErrorBody::new("not_found_error", "Not found")),
    )
        .into_response()
}
