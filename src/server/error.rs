//! Canonical error envelope.
//!
//! Every failure leaves the service as `{"error": {"kind", "message",
//! "details"?}}`. Internal errors are logged with their cause and
//! surfaced generically.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use tracing::error;

use crate::core::EngineError;

/// Wrapper giving `EngineError` an HTTP rendering.
pub struct ApiError(pub EngineError);

impl From<EngineError> for ApiError {
    fn from(err: EngineError) -> Self {
        Self(err)
    }
}

pub type ApiResult<T> = Result<T, ApiError>;

fn status_for(err: &EngineError) -> StatusCode {
    match err {
        EngineError::SessionMissing(_) | EngineError::PreviewMissing => StatusCode::NOT_FOUND,
        EngineError::SchemaViolation(_)
        | EngineError::ExpressionInvalid(_)
        | EngineError::EntropyMissing(_)
        | EngineError::EntropyExhausted { .. } => StatusCode::BAD_REQUEST,
        EngineError::LockRequired
        | EngineError::LockHeld { .. }
        | EngineError::LockOwnerMismatch
        | EngineError::PreviewStale
        | EngineError::Conflict(_) => StatusCode::CONFLICT,
        EngineError::Unavailable(_) => StatusCode::NOT_IMPLEMENTED,
        EngineError::Internal(_)
        | EngineError::Io(_)
        | EngineError::Serialization(_)
        | EngineError::Database(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = status_for(&self.0);
        let kind = self.0.kind();

        let (message, details) = match &self.0 {
            EngineError::LockHeld { owner } => (
                self.0.to_string(),
                Some(json!({ "owner": owner })),
            ),
            EngineError::EntropyExhausted { needed, have } => (
                self.0.to_string(),
                Some(json!({ "needed": needed, "have": have })),
            ),
            err if kind == "Internal" => {
                // Log the real cause, return a generic message.
                error!(error = %err, "internal error");
                ("internal error".to_string(), None)
            }
            err => (err.to_string(), None),
        };

        let mut body = json!({ "error": { "kind": kind, "message": message } });
        if let Some(details) = details {
            body["error"]["details"] = details;
        }
        (status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        assert_eq!(
            status_for(&EngineError::SessionMissing("session 'x'".into())),
            StatusCode::NOT_FOUND
        );
        assert_eq!(status_for(&EngineError::PreviewStale), StatusCode::CONFLICT);
        assert_eq!(
            status_for(&EngineError::EntropyExhausted { needed: 5, have: 1 }),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            status_for(&EngineError::Unavailable("diff".into())),
            StatusCode::NOT_IMPLEMENTED
        );
        assert_eq!(
            status_for(&EngineError::internal("x")),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }
}
