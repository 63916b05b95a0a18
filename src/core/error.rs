//! Error types for the turn engine.
//!
//! One unified error enum covers the whole service taxonomy so the HTTP
//! layer can emit a canonical `{error: {kind, message, details}}` envelope
//! from any failure.

use thiserror::Error;

/// Unified error type for engine and storage operations.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Session slug (or one of its owned artifacts) not found.
    #[error("{0} not found")]
    SessionMissing(String),

    /// Payload or resulting state fails the declared state schema.
    #[error("schema violation: {0}")]
    SchemaViolation(String),

    /// A write required the session lock and the caller did not hold it.
    #[error("session lock required")]
    LockRequired,

    /// Claim rejected because another owner holds an unexpired lease.
    #[error("lock held by '{owner}'")]
    LockHeld { owner: String },

    /// Release attempted by a non-owner.
    #[error("lock owned by another actor")]
    LockOwnerMismatch,

    /// Preview id not found (never created, committed, or collected).
    #[error("preview not found or expired")]
    PreviewMissing,

    /// Base turn or base hash no longer matches the live state.
    #[error("state changed; preview is stale")]
    PreviewStale,

    /// A referenced entropy index is absent from the stream.
    #[error("entropy index {0} missing")]
    EntropyMissing(u64),

    /// The stream is shorter than the requested reservation.
    #[error("not enough entropy (need index {needed}, have {have})")]
    EntropyExhausted { needed: u64, have: u64 },

    /// Malformed dice expression.
    #[error("invalid dice expression '{0}'")]
    ExpressionInvalid(String),

    /// Optimistic-concurrency failure outside the preview protocol.
    #[error("conflict: {0}")]
    Conflict(String),

    /// Feature intentionally disabled.
    #[error("feature unavailable: {0}")]
    Unavailable(String),

    /// Broken invariant; surfaced generically, logged with detail.
    #[error("internal error: {0}")]
    Internal(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

impl EngineError {
    /// Stable kind tag used in the wire-level error envelope.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::SessionMissing(_) => "SessionMissing",
            Self::SchemaViolation(_) => "SchemaViolation",
            Self::LockRequired => "LockRequired",
            Self::LockHeld { .. } => "LockHeld",
            Self::LockOwnerMismatch => "LockOwnerMismatch",
            Self::PreviewMissing => "PreviewMissing",
            Self::PreviewStale => "PreviewStale",
            Self::EntropyMissing(_) => "EntropyMissing",
            Self::EntropyExhausted { .. } => "EntropyExhausted",
            Self::ExpressionInvalid(_) => "ExpressionInvalid",
            Self::Conflict(_) => "Conflict",
            Self::Unavailable(_) => "Unavailable",
            Self::Internal(_) | Self::Io(_) | Self::Serialization(_) | Self::Database(_) => {
                "Internal"
            }
        }
    }

    /// Create an internal error with the given message.
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Create a schema violation with the given message.
    pub fn schema(msg: impl Into<String>) -> Self {
        Self::SchemaViolation(msg.into())
    }

    /// Create a conflict with the given message.
    pub fn conflict(msg: impl Into<String>) -> Self {
        Self::Conflict(msg.into())
    }
}

/// Result type alias for engine operations.
pub type EngineResult<T> = Result<T, EngineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = EngineError::SessionMissing("session 'ghost'".into());
        assert_eq!(err.to_string(), "session 'ghost' not found");

        let err = EngineError::EntropyExhausted { needed: 12, have: 8 };
        assert_eq!(
            err.to_string(),
            "not enough entropy (need index 12, have 8)"
        );
    }

    #[test]
    fn test_kind_tags() {
        assert_eq!(
            EngineError::LockHeld { owner: "alice".into() }.kind(),
            "LockHeld"
        );
        assert_eq!(EngineError::PreviewStale.kind(), "PreviewStale");
        assert_eq!(EngineError::internal("boom").kind(), "Internal");
    }

    #[test]
    fn test_io_maps_to_internal_kind() {
        let io = std::io::Error::new(std::io::ErrorKind::Other, "disk gone");
        let err: EngineError = io.into();
        assert_eq!(err.kind(), "Internal");
    }
}
