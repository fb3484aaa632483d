//! Edit-lock lifecycle over an object key.
//!
//! The lock table lives behind [`SessionStore`]; content lives in the primary
//! [`ObjectStore`]. Expiry is evaluated against the clock on every read, so a
//! session past `expires_at` never blocks anyone even if no sweep ever ran.

use std::collections::HashMap;
use std::sync::Arc;

use bytes::Bytes;
use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use tracing::{debug, info, instrument, warn};

use crate::checksum::{checksum, is_checksum};
use crate::clock::{Clock, SystemClock};
use crate::error::VaultError;
use crate::retry::RetryExecutor;
use crate::session::{AcquireOutcome, EditSession, SessionFinish, SessionStatus, SessionStore};
use crate::store::{ObjectStore, XLSX_CONTENT_TYPE};

/// Returned by [`EditSessionManager::start_session`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StartedSession {
    pub session_id: String,
    pub checksum: String,
    pub expires_at: DateTime<Utc>,
    /// True when the editor already held the lock and got it back unchanged
    pub resumed: bool,
}

/// Read-only view of the lock state for one key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LockCheck {
    pub can_proceed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub locked_by: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub warning: Option<String>,
}

/// Write-back request for an active session.
#[derive(Debug, Clone)]
pub struct Completion {
    pub session_id: String,
    pub editor_id: String,
    pub new_checksum: String,
    pub content: Bytes,
    pub content_type: Option<String>,
}

/// Outcome of a (force-)completion.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CompletedSession {
    pub session_id: String,
    pub object_key: String,
    pub status: SessionStatus,
    pub winning_checksum: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub superseded_checksum: Option<String>,
}

pub struct EditSessionManager {
    sessions: Arc<dyn SessionStore>,
    primary: Arc<dyn ObjectStore>,
    retry: RetryExecutor,
    ttl: Duration,
    clock: Arc<dyn Clock>,
}

impl EditSessionManager {
    pub fn new(
        sessions: Arc<dyn SessionStore>,
        primary: Arc<dyn ObjectStore>,
        retry: RetryExecutor,
        ttl: Duration,
    ) -> Self {
        Self {
            sessions,
            primary,
            retry,
            ttl,
            clock: Arc::new(SystemClock),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Take the edit lock on `object_key` for `editor_id`.
    ///
    /// If the same editor already holds a live session, that session is
    /// returned with `resumed = true` instead of creating a second lock.
    #[instrument(skip(self), level = "debug")]
    pub async fn start_session(
        &self,
        object_key: &str,
        editor_id: &str,
        document_id: Option<String>,
    ) -> Result<StartedSession, VaultError> {
        if object_key.is_empty() || editor_id.is_empty() {
            return Err(VaultError::ValidationFailed(
                "objectKey and editorId are required".to_string(),
            ));
        }

        let now = self.clock.now();
        if let Some(holder) = self.sessions.find_live(object_key, now).await? {
            return Self::resume_or_conflict(holder, editor_id);
        }

        let content = self
            .retry
            .retry("primary.get", || self.primary.get(object_key))
            .await?;
        let original_checksum = checksum(&content);

        let now = self.clock.now();
        let candidate = EditSession::new(
            object_key,
            editor_id,
            original_checksum,
            document_id,
            now,
            self.ttl,
        );

        match self.sessions.try_acquire(candidate, now).await? {
            AcquireOutcome::Acquired(session) => {
                info!(
                    session_id = %session.id,
                    object_key,
                    editor_id,
                    checksum = %session.original_checksum,
                    expires_at = %session.expires_at,
                    "Edit session started"
                );
                Ok(StartedSession {
                    session_id: session.id,
                    checksum: session.original_checksum,
                    expires_at: session.expires_at,
                    resumed: false,
                })
            }
            AcquireOutcome::Held(holder) => {
                debug!(object_key, holder = %holder.editor_id, "Lost acquisition race");
                Self::resume_or_conflict(holder, editor_id)
            }
        }
    }

    fn resume_or_conflict(
        holder: EditSession,
        editor_id: &str,
    ) -> Result<StartedSession, VaultError> {
        if holder.editor_id == editor_id {
            debug!(session_id = %holder.id, editor_id, "Resuming existing edit session");
            return Ok(StartedSession {
                session_id: holder.id,
                checksum: holder.original_checksum,
                expires_at: holder.expires_at,
                resumed: true,
            });
        }

        Err(VaultError::LockConflict {
            object_key: holder.object_key,
            locked_by: holder.editor_id,
            expires_at: holder.expires_at,
        })
    }

    /// Whether `requester_id` may start editing `object_key` right now.
    #[instrument(skip(self), level = "debug")]
    pub async fn check_lock(
        &self,
        object_key: &str,
        requester_id: &str,
    ) -> Result<LockCheck, VaultError> {
        let now = self.clock.now();
        let check = match self.sessions.find_live(object_key, now).await? {
            None => LockCheck {
                can_proceed: true,
                locked_by: None,
                session_id: None,
                expires_at: None,
                warning: None,
            },
            Some(holder) if holder.editor_id == requester_id => LockCheck {
                can_proceed: true,
                locked_by: Some(holder.editor_id),
                session_id: Some(holder.id),
                expires_at: Some(holder.expires_at),
                warning: Some(
                    "You already hold an active edit session on this object; starting again resumes it"
                        .to_string(),
                ),
            },
            Some(holder) => LockCheck {
                can_proceed: false,
                locked_by: Some(holder.editor_id),
                session_id: Some(holder.id),
                expires_at: Some(holder.expires_at),
                warning: None,
            },
        };
        Ok(check)
    }

    /// Session as observed now (lazy expiry applied).
    pub async fn get_session(&self, session_id: &str) -> Result<EditSession, VaultError> {
        let session = self
            .sessions
            .get(session_id)
            .await?
            .ok_or_else(|| VaultError::SessionNotFound(session_id.to_string()))?;
        Ok(session.as_of(self.clock.now()))
    }

    /// All sessions recorded for a key.
    pub async fn history(&self, object_key: &str) -> Result<Vec<EditSession>, VaultError> {
        let now = self.clock.now();
        Ok(self
            .sessions
            .history(object_key)
            .await?
            .iter()
            .map(|s| s.as_of(now))
            .collect())
    }

    /// Write back `completion.content` if primary still matches the checksum
    /// recorded when the lock was taken.
    #[instrument(skip(self, completion), level = "debug", fields(session_id = %completion.session_id))]
    pub async fn complete_session(
        &self,
        completion: Completion,
    ) -> Result<CompletedSession, VaultError> {
        let session = self.load_for_write(&completion).await?;
        let session = self.sessions.claim(&session, self.clock.now()).await?;

        let current = match self.current_checksum(&session.object_key).await {
            Ok(current) => current,
            Err(e) => return Err(self.abandon(&session, e).await),
        };
        if current.as_deref() != Some(session.original_checksum.as_str()) {
            warn!(
                session_id = %session.id,
                object_key = %session.object_key,
                expected = %session.original_checksum,
                actual = current.as_deref().unwrap_or("<missing>"),
                "Edit conflict detected on completion"
            );
            let conflict = VaultError::ChecksumMismatch {
                expected: session.original_checksum.clone(),
                actual: current,
            };
            return Err(self.abandon(&session, conflict).await);
        }

        if let Err(e) = self.write_back(&session, &completion).await {
            return Err(self.abandon(&session, e).await);
        }

        let finished = self
            .sessions
            .finish(
                &session,
                SessionFinish {
                    status: SessionStatus::Completed,
                    final_checksum: Some(completion.new_checksum.clone()),
                    superseded_checksum: None,
                    finished_at: self.clock.now(),
                },
                self.clock.now(),
            )
            .await?;

        info!(
            session_id = %finished.id,
            object_key = %finished.object_key,
            checksum = %completion.new_checksum,
            "Edit session completed"
        );

        Ok(CompletedSession {
            session_id: finished.id,
            object_key: finished.object_key,
            status: finished.status,
            winning_checksum: completion.new_checksum,
            superseded_checksum: None,
        })
    }

    /// Last-writer-wins write-back. Ownership and expiry are still enforced;
    /// the conflict check is not.
    #[instrument(skip(self, completion), level = "debug", fields(session_id = %completion.session_id))]
    pub async fn force_complete_session(
        &self,
        completion: Completion,
        confirmed: bool,
    ) -> Result<CompletedSession, VaultError> {
        if !confirmed {
            return Err(VaultError::ValidationFailed(
                "force-complete requires confirmed=true".to_string(),
            ));
        }

        let session = self.load_for_write(&completion).await?;
        let session = self.sessions.claim(&session, self.clock.now()).await?;

        let superseded = match self.current_checksum(&session.object_key).await {
            Ok(superseded) => superseded,
            Err(e) => return Err(self.abandon(&session, e).await),
        };

        if let Err(e) = self.write_back(&session, &completion).await {
            return Err(self.abandon(&session, e).await);
        }

        let finished = self
            .sessions
            .finish(
                &session,
                SessionFinish {
                    status: SessionStatus::ForceCompleted,
                    final_checksum: Some(completion.new_checksum.clone()),
                    superseded_checksum: superseded.clone(),
                    finished_at: self.clock.now(),
                },
                self.clock.now(),
            )
            .await?;

        warn!(
            session_id = %finished.id,
            object_key = %finished.object_key,
            original_checksum = %finished.original_checksum,
            superseded_checksum = superseded.as_deref().unwrap_or("<missing>"),
            winning_checksum = %completion.new_checksum,
            "Edit session force-completed"
        );

        Ok(CompletedSession {
            session_id: finished.id,
            object_key: finished.object_key,
            status: finished.status,
            winning_checksum: completion.new_checksum,
            superseded_checksum: superseded,
        })
    }

    /// Shared preconditions of both completion paths.
    async fn load_for_write(&self, completion: &Completion) -> Result<EditSession, VaultError> {
        let session = self
            .sessions
            .get(&completion.session_id)
            .await?
            .ok_or_else(|| VaultError::SessionNotFound(completion.session_id.clone()))?;

        let now = self.clock.now();
        match session.effective_status(now) {
            SessionStatus::Active => {}
            SessionStatus::Expired => {
                if session.status == SessionStatus::Active {
                    if let Err(e) = self
                        .sessions
                        .finish(&session, SessionFinish::expired(now), now)
                        .await
                    {
                        debug!(session_id = %session.id, error = %e, "Could not record expiry");
                    }
                }
                return Err(VaultError::SessionExpired(session.id));
            }
            status => {
                return Err(VaultError::SessionNotActive {
                    session_id: session.id,
                    status: status.to_string(),
                });
            }
        }

        if session.editor_id != completion.editor_id {
            return Err(VaultError::PermissionDenied(format!(
                "session {} belongs to another editor",
                session.id
            )));
        }

        if !is_checksum(&completion.new_checksum) {
            return Err(VaultError::ValidationFailed(
                "newChecksum must be 64 lowercase hex characters".to_string(),
            ));
        }

        let actual = checksum(&completion.content);
        if actual != completion.new_checksum {
            return Err(VaultError::ValidationFailed(format!(
                "content hashes to {}, not the declared {}",
                actual, completion.new_checksum
            )));
        }

        Ok(session)
    }

    /// Give back a `Committing` claim after nothing was written, so the editor
    /// can retry or force-complete. Returns `cause` for the caller to surface.
    async fn abandon(&self, session: &EditSession, cause: VaultError) -> VaultError {
        if let Err(e) = self.sessions.release(session).await {
            warn!(session_id = %session.id, error = %e, "Could not release completion claim");
        }
        cause
    }

    /// Checksum of what primary holds now; `None` if the object is gone.
    async fn current_checksum(&self, object_key: &str) -> Result<Option<String>, VaultError> {
        match self
            .retry
            .retry("primary.get", || self.primary.get(object_key))
            .await
        {
            Ok(content) => Ok(Some(checksum(&content))),
            Err(VaultError::NotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn write_back(
        &self,
        session: &EditSession,
        completion: &Completion,
    ) -> Result<(), VaultError> {
        let metadata = HashMap::from([
            ("sha256".to_string(), completion.new_checksum.clone()),
            ("edit-session".to_string(), session.id.clone()),
            ("editor".to_string(), session.editor_id.clone()),
        ]);
        let content_type = completion
            .content_type
            .as_deref()
            .unwrap_or(XLSX_CONTENT_TYPE);

        self.retry
            .retry("primary.put", || {
                self.primary.put(
                    &session.object_key,
                    completion.content.clone(),
                    content_type,
                    Some(&metadata),
                )
            })
            .await
    }
}
