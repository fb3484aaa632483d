//! Working copies of primary objects hosted on a third-party editing surface.
//!
//! Each copy moves through
//! `staged -> sessionOpen -> layoutApplied* -> sessionClosed -> reconciled -> cleanedUp`.
//! `failed` can be entered from any non-terminal state and is always
//! followed by a best-effort remote delete.

use std::collections::HashMap;
use std::sync::Arc;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info, instrument, warn};

use crate::checksum::checksum;
use crate::clock::{Clock, SystemClock};
use crate::error::VaultError;
use crate::retry::RetryExecutor;
use crate::store::{file_name, ObjectStore, XLSX_CONTENT_TYPE};
use crate::surface::{EditingSurface, ExportFormat, LayoutOperation, RemoteChangeType};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum WorkingCopyState {
    Staged,
    SessionOpen,
    LayoutApplied,
    SessionClosed,
    Reconciled,
    CleanedUp,
    Failed,
}

impl WorkingCopyState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, WorkingCopyState::CleanedUp | WorkingCopyState::Failed)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkingCopy {
    pub id: String,
    pub object_key: String,
    pub remote_item_id: String,
    pub remote_name: String,
    pub state: WorkingCopyState,
    pub remote_session_id: Option<String>,
    pub layouts_applied: u32,
    /// Primary checksum at staging time; write-back requires primary to still match
    pub staged_checksum: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub last_error: Option<String>,
}

/// Result of [`ExternalEditingBridge::reconcile_now`].
#[derive(Debug, Clone)]
pub enum ReconcileOutcome {
    /// Rendered artifact pulled from the surface
    Artifact {
        format: ExportFormat,
        data: Bytes,
        copy: WorkingCopy,
    },
    /// Edited content written back to primary
    WrittenBack(WorkingCopy),
}

impl ReconcileOutcome {
    pub fn copy(&self) -> &WorkingCopy {
        match self {
            ReconcileOutcome::Artifact { copy, .. } => copy,
            ReconcileOutcome::WrittenBack(copy) => copy,
        }
    }
}

/// Remote-safe file name: ASCII alphanumerics and `._-` survive, anything
/// else becomes `_`.
pub fn sanitize_name(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                c
            } else {
                '_'
            }
        })
        .collect();
    if cleaned.is_empty() {
        "workbook".to_string()
    } else {
        cleaned
    }
}

fn remote_name(object_key: &str, now: DateTime<Utc>) -> String {
    let token = uuid::Uuid::new_v4().simple().to_string();
    format!(
        "{}_{}_{}",
        now.format("%Y%m%d_%H%M%S"),
        &token[..8],
        sanitize_name(file_name(object_key))
    )
}

type CopyHandle = Arc<Mutex<WorkingCopy>>;

pub struct ExternalEditingBridge {
    primary: Arc<dyn ObjectStore>,
    surface: Arc<dyn EditingSurface>,
    retry: RetryExecutor,
    clock: Arc<dyn Clock>,
    copies: DashMap<String, CopyHandle>,
    /// remote item id -> working copy id
    by_remote: DashMap<String, String>,
}

impl ExternalEditingBridge {
    pub fn new(
        primary: Arc<dyn ObjectStore>,
        surface: Arc<dyn EditingSurface>,
        retry: RetryExecutor,
    ) -> Self {
        Self {
            primary,
            surface,
            retry,
            clock: Arc::new(SystemClock),
            copies: DashMap::new(),
            by_remote: DashMap::new(),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    fn handle(&self, id: &str) -> Result<CopyHandle, VaultError> {
        self.copies
            .get(id)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| VaultError::NotFound(format!("working copy {}", id)))
    }

    fn register(&self, copy: WorkingCopy) -> WorkingCopy {
        self.by_remote
            .insert(copy.remote_item_id.clone(), copy.id.clone());
        self.copies
            .insert(copy.id.clone(), Arc::new(Mutex::new(copy.clone())));
        copy
    }

    fn new_copy(
        &self,
        object_key: &str,
        remote_item_id: String,
        remote_name: String,
        staged_checksum: String,
    ) -> WorkingCopy {
        let now = self.clock.now();
        WorkingCopy {
            id: uuid::Uuid::new_v4().to_string(),
            object_key: object_key.to_string(),
            remote_item_id,
            remote_name,
            state: WorkingCopyState::Staged,
            remote_session_id: None,
            layouts_applied: 0,
            staged_checksum,
            created_at: now,
            updated_at: now,
            last_error: None,
        }
    }

    /// Copy a primary object into the surface's temp area.
    #[instrument(skip(self), level = "debug")]
    pub async fn stage(&self, object_key: &str) -> Result<WorkingCopy, VaultError> {
        let content = self
            .retry
            .retry("primary.get", || self.primary.get(object_key))
            .await?;
        let staged_checksum = checksum(&content);
        let name = remote_name(object_key, self.clock.now());

        let item = self
            .retry
            .retry("surface.upload", || {
                self.surface.upload_temp(&name, content.clone())
            })
            .await?;

        let copy = self.register(self.new_copy(object_key, item.id, item.name, staged_checksum));
        info!(
            working_copy = %copy.id,
            object_key,
            remote_item = %copy.remote_item_id,
            surface = self.surface.surface_name(),
            "Staged working copy"
        );
        Ok(copy)
    }

    /// Duplicate a working copy remotely; the result is a fresh staged copy
    /// of the same object.
    #[instrument(skip(self), level = "debug")]
    pub async fn fork(&self, id: &str) -> Result<WorkingCopy, VaultError> {
        let handle = self.handle(id)?;
        let mut source = handle.lock().await;
        ensure_live(&source)?;

        // Not retried: every attempt would start another remote copy, and the
        // surface already bounds its own completion polling.
        let name = remote_name(&source.object_key, self.clock.now());
        let copied = self
            .surface
            .copy_item(&source.remote_item_id, &name)
            .await;

        match copied {
            Ok(item) => {
                let fork = self.new_copy(
                    &source.object_key,
                    item.id,
                    item.name,
                    source.staged_checksum.clone(),
                );
                info!(source = %source.id, fork = %fork.id, "Forked working copy");
                Ok(self.register(fork))
            }
            Err(e) => {
                self.record_error(&mut source, &e);
                Err(e)
            }
        }
    }

    #[instrument(skip(self), level = "debug")]
    pub async fn open_session(&self, id: &str) -> Result<WorkingCopy, VaultError> {
        let handle = self.handle(id)?;
        let mut copy = handle.lock().await;
        expect_state(&copy, &[WorkingCopyState::Staged], "open a session")?;

        match self
            .retry
            .retry("surface.open", || self.surface.open_session(&copy.remote_item_id))
            .await
        {
            Ok(session_id) => {
                copy.remote_session_id = Some(session_id);
                self.transition(&mut copy, WorkingCopyState::SessionOpen);
                Ok(copy.clone())
            }
            Err(e) => Err(self.fail(&mut copy, e).await),
        }
    }

    #[instrument(skip(self, operation), level = "debug")]
    pub async fn apply_layout(
        &self,
        id: &str,
        operation: &LayoutOperation,
    ) -> Result<WorkingCopy, VaultError> {
        let handle = self.handle(id)?;
        let mut copy = handle.lock().await;
        expect_state(
            &copy,
            &[WorkingCopyState::SessionOpen, WorkingCopyState::LayoutApplied],
            "apply a layout",
        )?;
        let session_id = copy
            .remote_session_id
            .clone()
            .ok_or_else(|| VaultError::Internal(format!("copy {} has no session id", copy.id)))?;

        match self
            .retry
            .retry("surface.layout", || {
                self.surface
                    .apply_layout(&copy.remote_item_id, &session_id, operation)
            })
            .await
        {
            Ok(()) => {
                copy.layouts_applied += 1;
                self.transition(&mut copy, WorkingCopyState::LayoutApplied);
                Ok(copy.clone())
            }
            // A rejected layout request leaves the workbook as it was.
            Err(e @ VaultError::ValidationFailed(_)) => {
                self.record_error(&mut copy, &e);
                Err(e)
            }
            Err(e) => Err(self.fail(&mut copy, e).await),
        }
    }

    #[instrument(skip(self), level = "debug")]
    pub async fn close_session(&self, id: &str) -> Result<WorkingCopy, VaultError> {
        let handle = self.handle(id)?;
        let mut copy = handle.lock().await;
        expect_state(
            &copy,
            &[WorkingCopyState::SessionOpen, WorkingCopyState::LayoutApplied],
            "close the session",
        )?;
        let session_id = copy
            .remote_session_id
            .clone()
            .ok_or_else(|| VaultError::Internal(format!("copy {} has no session id", copy.id)))?;

        match self
            .retry
            .retry("surface.close", || {
                self.surface.close_session(&copy.remote_item_id, &session_id)
            })
            .await
        {
            Ok(()) => {
                copy.remote_session_id = None;
                self.transition(&mut copy, WorkingCopyState::SessionClosed);
                Ok(copy.clone())
            }
            Err(e) => Err(self.fail(&mut copy, e).await),
        }
    }

    /// Finish a working copy now: export it when `format` is given,
    /// otherwise write the edited workbook back to primary. The remote copy
    /// is deleted afterwards either way.
    #[instrument(skip(self), level = "debug")]
    pub async fn reconcile_now(
        &self,
        id: &str,
        format: Option<ExportFormat>,
    ) -> Result<ReconcileOutcome, VaultError> {
        let handle = self.handle(id)?;
        let mut copy = handle.lock().await;
        expect_state(
            &copy,
            &[WorkingCopyState::Staged, WorkingCopyState::SessionClosed],
            "reconcile",
        )?;

        match format {
            Some(format) => {
                let exported = self
                    .retry
                    .retry("surface.export", || {
                        self.surface.export(&copy.remote_item_id, format)
                    })
                    .await;
                match exported {
                    Ok(data) => {
                        self.transition(&mut copy, WorkingCopyState::Reconciled);
                        self.cleanup(&mut copy).await;
                        Ok(ReconcileOutcome::Artifact {
                            format,
                            data,
                            copy: copy.clone(),
                        })
                    }
                    Err(e) => Err(self.fail(&mut copy, e).await),
                }
            }
            None => {
                let edited = match self.download(&copy).await {
                    Ok(data) => data,
                    Err(e) => return Err(self.fail(&mut copy, e).await),
                };
                self.write_back(&mut copy, edited).await?;
                Ok(ReconcileOutcome::WrittenBack(copy.clone()))
            }
        }
    }

    /// Apply a push notification about a remote item. Unknown items and
    /// copies that already reached a terminal state are ignored, so replays
    /// are harmless.
    #[instrument(skip(self), level = "debug")]
    pub async fn reconcile_remote_change(
        &self,
        remote_item_id: &str,
        change: RemoteChangeType,
    ) -> Result<Option<WorkingCopy>, VaultError> {
        let id = match self.by_remote.get(remote_item_id) {
            Some(entry) => entry.value().clone(),
            None => {
                debug!(remote_item_id, "Notification for unknown remote item ignored");
                return Ok(None);
            }
        };
        let handle = self.handle(&id)?;
        let mut copy = handle.lock().await;

        if copy.state.is_terminal() {
            debug!(working_copy = %copy.id, state = ?copy.state, "Notification for finished copy ignored");
            return Ok(None);
        }

        match change {
            RemoteChangeType::Updated => match copy.state {
                WorkingCopyState::Staged | WorkingCopyState::SessionClosed => {
                    let edited = match self.download(&copy).await {
                        Ok(data) => data,
                        Err(e) => {
                            self.record_error(&mut copy, &e);
                            return Err(e);
                        }
                    };
                    // The surface also reports our own upload as an update.
                    if checksum(&edited) == copy.staged_checksum {
                        debug!(working_copy = %copy.id, state = ?copy.state, "Remote content unchanged, copy stays as it is");
                        return Ok(None);
                    }
                    self.write_back(&mut copy, edited).await?;
                    Ok(Some(copy.clone()))
                }
                _ => {
                    debug!(working_copy = %copy.id, state = ?copy.state, "Session still open, waiting for close");
                    Ok(None)
                }
            },
            RemoteChangeType::Deleted => {
                warn!(working_copy = %copy.id, "Remote copy deleted externally");
                copy.last_error = Some("remote item deleted".to_string());
                self.transition(&mut copy, WorkingCopyState::Failed);
                self.by_remote.remove(&copy.remote_item_id);
                Ok(Some(copy.clone()))
            }
            RemoteChangeType::Created => Ok(None),
        }
    }

    pub async fn get(&self, id: &str) -> Result<WorkingCopy, VaultError> {
        let handle = self.handle(id)?;
        let copy = handle.lock().await;
        Ok(copy.clone())
    }

    pub async fn list(&self) -> Vec<WorkingCopy> {
        let handles: Vec<CopyHandle> = self
            .copies
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        let mut copies = Vec::with_capacity(handles.len());
        for handle in handles {
            copies.push(handle.lock().await.clone());
        }
        copies.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        copies
    }

    async fn download(&self, copy: &WorkingCopy) -> Result<Bytes, VaultError> {
        self.retry
            .retry("surface.download", || self.surface.download(&copy.remote_item_id))
            .await
    }

    /// Store the edited workbook in primary, provided primary still holds
    /// what was staged.
    async fn write_back(&self, copy: &mut WorkingCopy, edited: Bytes) -> Result<(), VaultError> {
        let current = match self
            .retry
            .retry("primary.get", || self.primary.get(&copy.object_key))
            .await
        {
            Ok(data) => Some(checksum(&data)),
            Err(VaultError::NotFound(_)) => None,
            Err(e) => return Err(self.fail(copy, e).await),
        };
        if current.as_deref() != Some(copy.staged_checksum.as_str()) {
            let err = VaultError::ChecksumMismatch {
                expected: copy.staged_checksum.clone(),
                actual: current,
            };
            warn!(working_copy = %copy.id, object_key = %copy.object_key, "Primary changed since staging, refusing write-back");
            return Err(self.fail(copy, err).await);
        }

        let edited_checksum = checksum(&edited);
        if edited_checksum == copy.staged_checksum {
            debug!(working_copy = %copy.id, "Working copy unchanged, nothing to write back");
        } else {
            let metadata = HashMap::from([
                ("sha256".to_string(), edited_checksum.clone()),
                ("working-copy".to_string(), copy.id.clone()),
            ]);
            let written = self
                .retry
                .retry("primary.put", || {
                    self.primary.put(
                        &copy.object_key,
                        edited.clone(),
                        XLSX_CONTENT_TYPE,
                        Some(&metadata),
                    )
                })
                .await;
            if let Err(e) = written {
                return Err(self.fail(copy, e).await);
            }
            info!(
                working_copy = %copy.id,
                object_key = %copy.object_key,
                checksum = %edited_checksum,
                "Wrote working copy back to primary"
            );
        }

        self.transition(copy, WorkingCopyState::Reconciled);
        self.cleanup(copy).await;
        Ok(())
    }

    fn transition(&self, copy: &mut WorkingCopy, to: WorkingCopyState) {
        debug!(working_copy = %copy.id, from = ?copy.state, to = ?to, "Working copy transition");
        copy.state = to;
        copy.updated_at = self.clock.now();
    }

    fn record_error(&self, copy: &mut WorkingCopy, err: &VaultError) {
        copy.last_error = Some(err.to_string());
        copy.updated_at = self.clock.now();
    }

    /// Mark the copy failed and delete the remote item. Returns `err` so
    /// callers can propagate it.
    async fn fail(&self, copy: &mut WorkingCopy, err: VaultError) -> VaultError {
        warn!(working_copy = %copy.id, state = ?copy.state, error = %err, "Working copy failed");
        self.record_error(copy, &err);
        self.transition(copy, WorkingCopyState::Failed);
        self.cleanup(copy).await;
        err
    }

    async fn cleanup(&self, copy: &mut WorkingCopy) {
        if let Err(e) = self.surface.delete(&copy.remote_item_id).await {
            warn!(
                working_copy = %copy.id,
                remote_item = %copy.remote_item_id,
                error = %e,
                "Remote cleanup failed"
            );
        }
        self.by_remote.remove(&copy.remote_item_id);
        if copy.state == WorkingCopyState::Reconciled {
            self.transition(copy, WorkingCopyState::CleanedUp);
        }
    }
}

fn ensure_live(copy: &WorkingCopy) -> Result<(), VaultError> {
    if copy.state.is_terminal() || copy.state == WorkingCopyState::Reconciled {
        return Err(VaultError::ValidationFailed(format!(
            "working copy {} is {:?}",
            copy.id, copy.state
        )));
    }
    Ok(())
}

fn expect_state(
    copy: &WorkingCopy,
    allowed: &[WorkingCopyState],
    action: &str,
) -> Result<(), VaultError> {
    if allowed.contains(&copy.state) {
        Ok(())
    } else {
        Err(VaultError::ValidationFailed(format!(
            "cannot {} on working copy {} in state {:?}",
            action, copy.id, copy.state
        )))
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use serde_json::json;

    use super::*;
    use crate::memory::{MemoryEditingSurface, MemoryObjectStore};
    use crate::retry::RetryPolicy;

    fn setup() -> (
        ExternalEditingBridge,
        Arc<MemoryObjectStore>,
        Arc<MemoryEditingSurface>,
    ) {
        let primary = Arc::new(MemoryObjectStore::new("primary"));
        let surface = Arc::new(MemoryEditingSurface::new());
        let bridge = ExternalEditingBridge::new(
            primary.clone(),
            surface.clone(),
            RetryExecutor::new(RetryPolicy::new(2, Duration::from_millis(1))),
        );
        (bridge, primary, surface)
    }

    fn layout() -> LayoutOperation {
        LayoutOperation {
            worksheet: "Sheet1".to_string(),
            address: "A1:D1".to_string(),
            format: json!({"columnWidth": 120}),
        }
    }

    #[test]
    fn test_sanitize_name() {
        assert_eq!(sanitize_name("Q3 report (final).xlsx"), "Q3_report__final_.xlsx");
        assert_eq!(sanitize_name("plan-2024_v1.xlsx"), "plan-2024_v1.xlsx");
        assert_eq!(sanitize_name("résumé.xlsx"), "r_sum_.xlsx");
        assert_eq!(sanitize_name(""), "workbook");
    }

    #[test]
    fn test_remote_name_scheme() {
        let now = DateTime::parse_from_rfc3339("2024-03-05T07:08:09Z")
            .unwrap()
            .with_timezone(&Utc);
        let name = remote_name("doc/My Sheet.xlsx", now);
        assert!(name.starts_with("20240305_070809_"));
        assert!(name.ends_with("_My_Sheet.xlsx"));
        let token = &name["20240305_070809_".len().."20240305_070809_".len() + 8];
        assert!(token.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[tokio::test]
    async fn test_full_lifecycle_writes_back_and_cleans_up() {
        let (bridge, primary, surface) = setup();
        primary.insert("doc/a.xlsx", b"original".to_vec());

        let staged = bridge.stage("doc/a.xlsx").await.unwrap();
        assert_eq!(staged.state, WorkingCopyState::Staged);
        assert_eq!(staged.staged_checksum, checksum(b"original"));
        assert!(surface.contains(&staged.remote_item_id));

        let opened = bridge.open_session(&staged.id).await.unwrap();
        assert_eq!(opened.state, WorkingCopyState::SessionOpen);
        assert!(opened.remote_session_id.is_some());

        bridge.apply_layout(&staged.id, &layout()).await.unwrap();
        let laid_out = bridge.apply_layout(&staged.id, &layout()).await.unwrap();
        assert_eq!(laid_out.layouts_applied, 2);
        assert_eq!(surface.applied_layouts().len(), 2);

        let closed = bridge.close_session(&staged.id).await.unwrap();
        assert_eq!(closed.state, WorkingCopyState::SessionClosed);

        surface.edit(&staged.remote_item_id, b"formatted".to_vec());
        let outcome = bridge.reconcile_now(&staged.id, None).await.unwrap();
        assert_eq!(outcome.copy().state, WorkingCopyState::CleanedUp);
        assert_eq!(
            primary.get("doc/a.xlsx").await.unwrap(),
            Bytes::from_static(b"formatted")
        );
        assert!(!surface.contains(&staged.remote_item_id));
    }

    #[tokio::test]
    async fn test_export_returns_artifact_without_touching_primary() {
        let (bridge, primary, surface) = setup();
        primary.insert("doc/a.xlsx", b"original".to_vec());
        let staged = bridge.stage("doc/a.xlsx").await.unwrap();

        let outcome = bridge
            .reconcile_now(&staged.id, Some(ExportFormat::Pdf))
            .await
            .unwrap();
        match outcome {
            ReconcileOutcome::Artifact { format, data, copy } => {
                assert_eq!(format, ExportFormat::Pdf);
                assert!(data.starts_with(b"%PDF-"));
                assert_eq!(copy.state, WorkingCopyState::CleanedUp);
            }
            other => panic!("expected artifact, got {:?}", other),
        }
        assert_eq!(primary.put_count(), 0);
        assert_eq!(surface.item_count(), 0);
    }

    #[tokio::test]
    async fn test_write_back_refuses_when_primary_changed() {
        let (bridge, primary, surface) = setup();
        primary.insert("doc/a.xlsx", b"original".to_vec());
        let staged = bridge.stage("doc/a.xlsx").await.unwrap();

        primary.insert("doc/a.xlsx", b"edited through a session".to_vec());
        surface.edit(&staged.remote_item_id, b"remote edit".to_vec());

        let err = bridge.reconcile_now(&staged.id, None).await.unwrap_err();
        assert!(matches!(err, VaultError::ChecksumMismatch { .. }));
        assert_eq!(
            primary.get("doc/a.xlsx").await.unwrap(),
            Bytes::from_static(b"edited through a session")
        );

        let copy = bridge.get(&staged.id).await.unwrap();
        assert_eq!(copy.state, WorkingCopyState::Failed);
        assert!(copy.last_error.is_some());
        assert!(!surface.contains(&staged.remote_item_id));
    }

    #[tokio::test]
    async fn test_invalid_transitions_are_rejected() {
        let (bridge, primary, _surface) = setup();
        primary.insert("doc/a.xlsx", b"original".to_vec());
        let staged = bridge.stage("doc/a.xlsx").await.unwrap();

        assert!(matches!(
            bridge.close_session(&staged.id).await,
            Err(VaultError::ValidationFailed(_))
        ));
        assert!(matches!(
            bridge.apply_layout(&staged.id, &layout()).await,
            Err(VaultError::ValidationFailed(_))
        ));

        bridge.open_session(&staged.id).await.unwrap();
        assert!(matches!(
            bridge.reconcile_now(&staged.id, None).await,
            Err(VaultError::ValidationFailed(_))
        ));
        assert_eq!(
            bridge.get(&staged.id).await.unwrap().state,
            WorkingCopyState::SessionOpen
        );
    }

    #[tokio::test]
    async fn test_surface_failure_marks_failed_and_cleans_up() {
        let (bridge, primary, surface) = setup();
        primary.insert("doc/a.xlsx", b"original".to_vec());
        let staged = bridge.stage("doc/a.xlsx").await.unwrap();

        surface.fail_on("open");
        let err = bridge.open_session(&staged.id).await.unwrap_err();
        assert!(err.is_retryable());

        let copy = bridge.get(&staged.id).await.unwrap();
        assert_eq!(copy.state, WorkingCopyState::Failed);
        assert_eq!(surface.delete_count(), 1);
        assert!(!surface.contains(&staged.remote_item_id));
    }

    #[tokio::test]
    async fn test_cleanup_failure_is_not_escalated() {
        let (bridge, primary, surface) = setup();
        primary.insert("doc/a.xlsx", b"original".to_vec());
        let staged = bridge.stage("doc/a.xlsx").await.unwrap();

        surface.fail_on("delete");
        let outcome = bridge.reconcile_now(&staged.id, None).await.unwrap();
        assert_eq!(outcome.copy().state, WorkingCopyState::CleanedUp);
    }

    #[tokio::test]
    async fn test_fork_creates_independent_staged_copy() {
        let (bridge, primary, surface) = setup();
        primary.insert("doc/a.xlsx", b"original".to_vec());
        let staged = bridge.stage("doc/a.xlsx").await.unwrap();

        let fork = bridge.fork(&staged.id).await.unwrap();
        assert_ne!(fork.id, staged.id);
        assert_ne!(fork.remote_item_id, staged.remote_item_id);
        assert_eq!(fork.state, WorkingCopyState::Staged);
        assert_eq!(fork.staged_checksum, staged.staged_checksum);
        assert_eq!(surface.item_count(), 2);
        assert_eq!(bridge.list().await.len(), 2);
    }

    #[tokio::test]
    async fn test_remote_change_notifications_are_idempotent() {
        let (bridge, primary, surface) = setup();
        primary.insert("doc/a.xlsx", b"original".to_vec());
        let staged = bridge.stage("doc/a.xlsx").await.unwrap();
        surface.edit(&staged.remote_item_id, b"edited remotely".to_vec());

        let first = bridge
            .reconcile_remote_change(&staged.remote_item_id, RemoteChangeType::Updated)
            .await
            .unwrap();
        assert_eq!(first.unwrap().state, WorkingCopyState::CleanedUp);
        assert_eq!(primary.put_count(), 1);

        let replay = bridge
            .reconcile_remote_change(&staged.remote_item_id, RemoteChangeType::Updated)
            .await
            .unwrap();
        assert!(replay.is_none());
        assert_eq!(primary.put_count(), 1);

        let unknown = bridge
            .reconcile_remote_change("no-such-item", RemoteChangeType::Updated)
            .await
            .unwrap();
        assert!(unknown.is_none());
    }

    #[tokio::test]
    async fn test_unchanged_remote_update_leaves_copy_staged() {
        let (bridge, primary, surface) = setup();
        primary.insert("doc/a.xlsx", b"original".to_vec());
        let staged = bridge.stage("doc/a.xlsx").await.unwrap();

        let outcome = bridge
            .reconcile_remote_change(&staged.remote_item_id, RemoteChangeType::Updated)
            .await
            .unwrap();
        assert!(outcome.is_none());

        let copy = bridge.get(&staged.id).await.unwrap();
        assert_eq!(copy.state, WorkingCopyState::Staged);
        assert_eq!(copy.updated_at, staged.updated_at);
        assert!(surface.contains(&staged.remote_item_id));
        assert_eq!(surface.delete_count(), 0);
        assert_eq!(primary.put_count(), 0);

        let opened = bridge.open_session(&staged.id).await.unwrap();
        assert_eq!(opened.state, WorkingCopyState::SessionOpen);
    }

    #[tokio::test]
    async fn test_unchanged_closed_copy_waits_for_real_edit() {
        let (bridge, primary, surface) = setup();
        primary.insert("doc/a.xlsx", b"original".to_vec());
        let staged = bridge.stage("doc/a.xlsx").await.unwrap();
        bridge.open_session(&staged.id).await.unwrap();
        bridge.close_session(&staged.id).await.unwrap();

        assert!(bridge
            .reconcile_remote_change(&staged.remote_item_id, RemoteChangeType::Updated)
            .await
            .unwrap()
            .is_none());
        assert_eq!(
            bridge.get(&staged.id).await.unwrap().state,
            WorkingCopyState::SessionClosed
        );

        surface.edit(&staged.remote_item_id, b"persisted edit".to_vec());
        let copy = bridge
            .reconcile_remote_change(&staged.remote_item_id, RemoteChangeType::Updated)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(copy.state, WorkingCopyState::CleanedUp);
        assert_eq!(
            primary.get("doc/a.xlsx").await.unwrap(),
            Bytes::from_static(b"persisted edit")
        );
    }

    #[tokio::test]
    async fn test_failed_fork_sends_one_copy_request() {
        let (bridge, primary, surface) = setup();
        primary.insert("doc/a.xlsx", b"original".to_vec());
        let staged = bridge.stage("doc/a.xlsx").await.unwrap();

        surface.fail_on("copy");
        let err = bridge.fork(&staged.id).await.unwrap_err();
        assert!(matches!(err, VaultError::UpstreamUnavailable(_)));
        assert_eq!(surface.copy_count(), 1);
        assert_eq!(surface.item_count(), 1);

        let source = bridge.get(&staged.id).await.unwrap();
        assert_eq!(source.state, WorkingCopyState::Staged);
        assert!(source.last_error.is_some());
    }

    #[tokio::test]
    async fn test_remote_delete_marks_copy_failed() {
        let (bridge, primary, _surface) = setup();
        primary.insert("doc/a.xlsx", b"original".to_vec());
        let staged = bridge.stage("doc/a.xlsx").await.unwrap();

        let copy = bridge
            .reconcile_remote_change(&staged.remote_item_id, RemoteChangeType::Deleted)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(copy.state, WorkingCopyState::Failed);
        assert!(matches!(
            bridge.open_session(&staged.id).await,
            Err(VaultError::ValidationFailed(_))
        ));
    }

    #[tokio::test]
    async fn test_stage_missing_object_is_not_found() {
        let (bridge, _primary, surface) = setup();
        assert!(matches!(
            bridge.stage("doc/missing.xlsx").await,
            Err(VaultError::NotFound(_))
        ));
        assert_eq!(surface.item_count(), 0);
    }
}
