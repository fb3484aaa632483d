//! HTTP handlers.
//!
//! Implements:
//! - /sessions, /locks - edit locks and checksum-guarded write-back
//! - /backup/* - replication passes, conflict resolution, reports
//! - /bridge/* - working copies on the editing surface
//! - /webhooks/graph - Graph validation handshake and change notifications
//! - GET /health - Health check endpoint

use axum::body::Bytes;
use axum::extract::{Path, Query, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use base64::Engine;
use serde::{Deserialize, Serialize};
use sheetvault_core::{
    CompletedSession, Completion, ConflictPolicy, EditSession, ExportFormat, FileSyncRecord,
    LayoutOperation, LockCheck, PassReport, ReconcileOutcome, StartedSession, SyncLogEntry,
    VaultError, WorkingCopy,
};
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::state::AppState;
use crate::webhook::{Admission, NotificationBatch};

const DEFAULT_LOG_LIMIT: usize = 100;

/// Health check response.
#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthResponse {
    pub healthy: bool,
    pub version: &'static str,
    pub backup_enabled: bool,
    pub bridge_enabled: bool,
}

/// GET /health - Health check endpoint.
pub async fn health_handler(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        healthy: true,
        version: env!("CARGO_PKG_VERSION"),
        backup_enabled: state.backup.is_some(),
        bridge_enabled: state.bridge.is_some(),
    })
}

// =========================================================================
// Edit sessions
// =========================================================================

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartSessionRequest {
    pub object_key: String,
    pub editor_id: String,
    #[serde(default)]
    pub document_id: Option<String>,
}

/// Where the edited bytes come from.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ContentRef {
    /// Base64 (standard alphabet) content in the request itself
    Inline(String),
    /// Key of an object previously uploaded to primary
    StagedKey(String),
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompleteSessionRequest {
    pub editor_id: String,
    pub new_checksum: String,
    pub new_content_ref: ContentRef,
    #[serde(default)]
    pub content_type: Option<String>,
    #[serde(default)]
    pub confirmed: bool,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LockQuery {
    pub object_key: String,
    pub requester_id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryQuery {
    pub object_key: String,
}

/// POST /sessions
pub async fn start_session_handler(
    State(state): State<AppState>,
    Json(req): Json<StartSessionRequest>,
) -> Result<Json<StartedSession>> {
    state.keys.document_key(&req.object_key)?;
    let started = state
        .sessions
        .start_session(&req.object_key, &req.editor_id, req.document_id)
        .await?;
    Ok(Json(started))
}

/// GET /sessions/{id}
pub async fn get_session_handler(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> Result<Json<EditSession>> {
    Ok(Json(state.sessions.get_session(&session_id).await?))
}

/// GET /sessions?objectKey=
pub async fn session_history_handler(
    State(state): State<AppState>,
    Query(query): Query<HistoryQuery>,
) -> Result<Json<Vec<EditSession>>> {
    Ok(Json(state.sessions.history(&query.object_key).await?))
}

/// GET /locks?objectKey=&requesterId=
pub async fn check_lock_handler(
    State(state): State<AppState>,
    Query(query): Query<LockQuery>,
) -> Result<Json<LockCheck>> {
    Ok(Json(
        state
            .sessions
            .check_lock(&query.object_key, &query.requester_id)
            .await?,
    ))
}

/// POST /sessions/{id}/complete
pub async fn complete_session_handler(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
    Json(req): Json<CompleteSessionRequest>,
) -> Result<Json<CompletedSession>> {
    let (completion, staged_key) = resolve_completion(&state, session_id, req).await?;
    let completed = state.sessions.complete_session(completion).await?;
    discard_staged(&state, staged_key, &completed).await;
    Ok(Json(completed))
}

/// POST /sessions/{id}/force-complete
pub async fn force_complete_session_handler(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
    Json(req): Json<CompleteSessionRequest>,
) -> Result<Json<CompletedSession>> {
    let confirmed = req.confirmed;
    let (completion, staged_key) = resolve_completion(&state, session_id, req).await?;
    let completed = state
        .sessions
        .force_complete_session(completion, confirmed)
        .await?;
    discard_staged(&state, staged_key, &completed).await;
    Ok(Json(completed))
}

async fn resolve_completion(
    state: &AppState,
    session_id: String,
    req: CompleteSessionRequest,
) -> Result<(Completion, Option<String>)> {
    let (content, staged_key) = match req.new_content_ref {
        ContentRef::Inline(encoded) => {
            let bytes = base64::engine::general_purpose::STANDARD
                .decode(encoded.as_bytes())
                .map_err(|e| {
                    VaultError::ValidationFailed(format!("inline content is not base64: {}", e))
                })?;
            (Bytes::from(bytes), None)
        }
        ContentRef::StagedKey(key) => {
            state.keys.staged_key(&key)?;
            let bytes = state.primary.get(&key).await.map_err(|e| match e {
                VaultError::NotFound(_) => {
                    VaultError::ValidationFailed(format!("staged content {} does not exist", key))
                }
                other => other,
            })?;
            (bytes, Some(key))
        }
    };

    Ok((
        Completion {
            session_id,
            editor_id: req.editor_id,
            new_checksum: req.new_checksum,
            content,
            content_type: req.content_type,
        },
        staged_key,
    ))
}

/// Remove the staged upload once its bytes are safely in place.
async fn discard_staged(state: &AppState, staged_key: Option<String>, done: &CompletedSession) {
    let Some(key) = staged_key else {
        return;
    };
    if key == done.object_key {
        return;
    }
    match state.primary.delete(&key).await {
        Ok(()) => debug!(staged_key = %key, "Removed staged content"),
        Err(e) => warn!(staged_key = %key, error = %e, "Failed to remove staged content"),
    }
}

// =========================================================================
// Backup replication
// =========================================================================

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResolveConflictRequest {
    pub primary_key: String,
    pub policy: ConflictPolicy,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BidirectionalRequest {
    #[serde(default)]
    pub policy: Option<ConflictPolicy>,
}

#[derive(Debug, Deserialize)]
pub struct LogQuery {
    #[serde(default)]
    pub limit: Option<usize>,
}

/// POST /backup/migrate
pub async fn migrate_handler(State(state): State<AppState>) -> Result<Json<PassReport>> {
    let report = state.backup()?.migrate().await?;
    info!(?report, "Migration pass finished");
    Ok(Json(report))
}

/// POST /backup/sync
pub async fn sync_handler(State(state): State<AppState>) -> Result<Json<PassReport>> {
    Ok(Json(state.backup()?.sync_backup_pass().await?))
}

/// POST /backup/sync/bidirectional
pub async fn sync_bidirectional_handler(
    State(state): State<AppState>,
    body: Bytes,
) -> Result<Json<PassReport>> {
    let req: BidirectionalRequest = parse_optional_body(&body)?;
    warn!("Bidirectional sync requested; this mode is deprecated");
    #[allow(deprecated)]
    let report = state.backup()?.sync_bidirectional_pass(req.policy).await?;
    Ok(Json(report))
}

/// POST /backup/conflicts/resolve
pub async fn resolve_conflict_handler(
    State(state): State<AppState>,
    Json(req): Json<ResolveConflictRequest>,
) -> Result<Json<FileSyncRecord>> {
    Ok(Json(
        state
            .backup()?
            .resolve_conflict(&req.primary_key, req.policy)
            .await?,
    ))
}

/// GET /backup/records
pub async fn records_handler(State(state): State<AppState>) -> Result<Json<Vec<FileSyncRecord>>> {
    Ok(Json(state.backup()?.records().await?))
}

/// GET /backup/log?limit=
pub async fn log_handler(
    State(state): State<AppState>,
    Query(query): Query<LogQuery>,
) -> Result<Json<Vec<SyncLogEntry>>> {
    let limit = query.limit.unwrap_or(DEFAULT_LOG_LIMIT);
    Ok(Json(state.backup()?.recent_log(limit).await?))
}

// =========================================================================
// Editing bridge
// =========================================================================

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StageRequest {
    pub object_key: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReconcileRequest {
    #[serde(default)]
    pub format: Option<ExportFormat>,
}

/// POST /bridge/stage
pub async fn stage_handler(
    State(state): State<AppState>,
    Json(req): Json<StageRequest>,
) -> Result<(StatusCode, Json<WorkingCopy>)> {
    state.keys.document_key(&req.object_key)?;
    let copy = state.bridge()?.stage(&req.object_key).await?;
    Ok((StatusCode::CREATED, Json(copy)))
}

/// GET /bridge
pub async fn list_copies_handler(State(state): State<AppState>) -> Result<Json<Vec<WorkingCopy>>> {
    Ok(Json(state.bridge()?.list().await))
}

/// GET /bridge/{id}
pub async fn get_copy_handler(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<WorkingCopy>> {
    Ok(Json(state.bridge()?.get(&id).await?))
}

/// POST /bridge/{id}/fork
pub async fn fork_handler(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<WorkingCopy>> {
    Ok(Json(state.bridge()?.fork(&id).await?))
}

/// POST /bridge/{id}/open
pub async fn open_handler(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<WorkingCopy>> {
    Ok(Json(state.bridge()?.open_session(&id).await?))
}

/// POST /bridge/{id}/layout
pub async fn layout_handler(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(operation): Json<LayoutOperation>,
) -> Result<Json<WorkingCopy>> {
    Ok(Json(state.bridge()?.apply_layout(&id, &operation).await?))
}

/// POST /bridge/{id}/close
pub async fn close_handler(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<WorkingCopy>> {
    Ok(Json(state.bridge()?.close_session(&id).await?))
}

/// POST /bridge/{id}/reconcile - artifact bytes when a format is given,
/// otherwise the written-back working copy.
pub async fn reconcile_handler(
    State(state): State<AppState>,
    Path(id): Path<String>,
    body: Bytes,
) -> Result<Response> {
    let req: ReconcileRequest = parse_optional_body(&body)?;
    let outcome = state.bridge()?.reconcile_now(&id, req.format).await?;
    Ok(match outcome {
        ReconcileOutcome::Artifact { format, data, copy } => {
            debug!(working_copy = %copy.id, bytes = data.len(), "Returning exported artifact");
            ([(header::CONTENT_TYPE, format.content_type())], data).into_response()
        }
        ReconcileOutcome::WrittenBack(copy) => Json(copy).into_response(),
    })
}

/// Empty bodies mean "all defaults".
fn parse_optional_body<T: serde::de::DeserializeOwned + Default>(body: &[u8]) -> Result<T> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(T::default());
    }
    serde_json::from_slice(body)
        .map_err(|e| VaultError::ValidationFailed(format!("invalid request body: {}", e)).into())
}

// =========================================================================
// Webhooks
// =========================================================================

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WebhookQuery {
    #[serde(default)]
    pub validation_token: Option<String>,
}

/// GET|POST /webhooks/graph
///
/// Subscription validation echoes the token as text/plain. Notifications are
/// acknowledged with 202 whatever happens to them afterwards.
pub async fn graph_webhook_handler(
    State(state): State<AppState>,
    Query(query): Query<WebhookQuery>,
    body: Bytes,
) -> Response {
    if let Some(token) = query.validation_token {
        debug!("Answering Graph subscription validation");
        return (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "text/plain")],
            token,
        )
            .into_response();
    }

    match serde_json::from_slice::<NotificationBatch>(&body) {
        Ok(batch) => {
            let mut queued = 0usize;
            for notification in &batch.value {
                if state.webhooks.admit(notification).await == Admission::Queued {
                    queued += 1;
                }
            }
            debug!(received = batch.value.len(), queued, "Graph notifications accepted");
        }
        Err(e) => warn!(error = %e, "Ignoring malformed Graph notification payload"),
    }

    StatusCode::ACCEPTED.into_response()
}
