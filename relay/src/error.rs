//! Relay-side error kinds (§7: validation / external-system / protocol).

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;

#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    /// The identity verifier capability was not configured at startup.
    /// Per §4.11, auth-gated endpoints must fail closed rather than admit.
    #[error("identity verification is not configured")]
    IdentityUnavailable,

    #[error("missing or invalid bearer token")]
    Unauthorized,

    #[error("validation error: {0}")]
    Validation(String),
}

impl IntoResponse for RelayError {
    fn into_response(self) -> Response {
        let (status, message) = match &self {
            RelayError::IdentityUnavailable => {
                (StatusCode::SERVICE_UNAVAILABLE, self.to_string())
            }
            RelayError::Unauthorized => (StatusCode::UNAUTHORIZED, self.to_string()),
            RelayError::Validation(_) => (StatusCode::BAD_REQUEST, self.to_string()),
        };
        (status, axum::Json(json!({ "error": message }))).into_response()
    }
}
