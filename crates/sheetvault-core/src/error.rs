use chrono::{DateTime, Utc};
use thiserror::Error;

/// Errors shared by every sheetvault component.
///
/// `LockConflict` and `ChecksumMismatch` are expected, caller-recoverable
/// outcomes and must never be folded into a generic variant.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum VaultError {
    #[error("Object {object_key} is locked by {locked_by} until {expires_at}")]
    LockConflict {
        object_key: String,
        locked_by: String,
        expires_at: DateTime<Utc>,
    },

    #[error("Edit session not found: {0}")]
    SessionNotFound(String),

    #[error("Edit session expired: {0}")]
    SessionExpired(String),

    #[error("Edit session {session_id} is no longer active ({status})")]
    SessionNotActive { session_id: String, status: String },

    #[error("Checksum mismatch: expected {expected}, found {}", actual.as_deref().unwrap_or("<missing>"))]
    ChecksumMismatch {
        expected: String,
        actual: Option<String>,
    },

    #[error("Upstream unavailable: {0}")]
    UpstreamUnavailable(String),

    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Validation failed: {0}")]
    ValidationFailed(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl VaultError {
    /// Whether the retry executor may re-run the failed operation.
    pub fn is_retryable(&self) -> bool {
        matches!(self, VaultError::UpstreamUnavailable(_))
    }

    /// Classify a non-success HTTP status returned by a remote system.
    pub fn from_http_status(status: u16, context: impl Into<String>) -> Self {
        let context = context.into();
        match status {
            404 | 410 => VaultError::NotFound(context),
            403 => VaultError::PermissionDenied(context),
            401 | 408 | 423 | 429 => VaultError::UpstreamUnavailable(context),
            500..=599 => VaultError::UpstreamUnavailable(context),
            _ => VaultError::ValidationFailed(context),
        }
    }
}

impl From<serde_json::Error> for VaultError {
    fn from(err: serde_json::Error) -> Self {
        VaultError::Serialization(err.to_string())
    }
}
