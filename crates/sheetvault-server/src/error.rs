//! Error types for the HTTP surface.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use chrono::{DateTime, Utc};
use serde::Serialize;
use sheetvault_core::VaultError;

/// Application-level errors.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error(transparent)]
    Vault(#[from] VaultError),

    #[error("{0} is not configured on this server")]
    NotConfigured(&'static str),
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ErrorBody {
    error: String,
    code: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    locked_by: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    expires_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    expected: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    actual: Option<String>,
}

impl ApiError {
    fn status_and_code(&self) -> (StatusCode, &'static str) {
        match self {
            ApiError::NotConfigured(_) => (StatusCode::SERVICE_UNAVAILABLE, "NOT_CONFIGURED"),
            ApiError::Vault(err) => match err {
                VaultError::LockConflict { .. } => (StatusCode::LOCKED, "LOCK_CONFLICT"),
                VaultError::ChecksumMismatch { .. } => (StatusCode::CONFLICT, "CHECKSUM_MISMATCH"),
                VaultError::SessionNotActive { .. } => (StatusCode::CONFLICT, "SESSION_NOT_ACTIVE"),
                VaultError::SessionExpired(_) => (StatusCode::GONE, "SESSION_EXPIRED"),
                VaultError::SessionNotFound(_) => (StatusCode::NOT_FOUND, "SESSION_NOT_FOUND"),
                VaultError::NotFound(_) => (StatusCode::NOT_FOUND, "NOT_FOUND"),
                VaultError::PermissionDenied(_) => (StatusCode::FORBIDDEN, "PERMISSION_DENIED"),
                VaultError::ValidationFailed(_) => (StatusCode::BAD_REQUEST, "VALIDATION_FAILED"),
                VaultError::UpstreamUnavailable(_) => {
                    (StatusCode::BAD_GATEWAY, "UPSTREAM_UNAVAILABLE")
                }
                VaultError::Serialization(_) => (StatusCode::BAD_GATEWAY, "SERIALIZATION_ERROR"),
                VaultError::Internal(_) => (StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR"),
            },
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code) = self.status_and_code();

        let mut body = ErrorBody {
            error: self.to_string(),
            code,
            locked_by: None,
            expires_at: None,
            expected: None,
            actual: None,
        };
        match self {
            ApiError::Vault(VaultError::LockConflict {
                locked_by,
                expires_at,
                ..
            }) => {
                body.locked_by = Some(locked_by);
                body.expires_at = Some(expires_at);
            }
            ApiError::Vault(VaultError::ChecksumMismatch { expected, actual }) => {
                body.expected = Some(expected);
                body.actual = actual;
            }
            _ => {}
        }

        (status, axum::Json(body)).into_response()
    }
}

pub type Result<T> = std::result::Result<T, ApiError>;
