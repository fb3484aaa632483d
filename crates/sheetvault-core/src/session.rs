use std::fmt;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::error::VaultError;

/// Lifecycle of an edit session.
///
/// `Active -> Committing -> Completed | ForceCompleted`, with `Committing ->
/// Active` when a write-back is abandoned and `Active -> Expired` on expiry.
/// Only the holder of the `Committing` claim may write to primary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SessionStatus {
    Active,
    Committing,
    Completed,
    ForceCompleted,
    Expired,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::Active => "active",
            SessionStatus::Committing => "committing",
            SessionStatus::Completed => "completed",
            SessionStatus::ForceCompleted => "forceCompleted",
            SessionStatus::Expired => "expired",
        }
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A time-bounded claim of exclusive edit intent over one object key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EditSession {
    pub id: String,
    pub object_key: String,
    pub editor_id: String,
    /// Checksum of the primary content when the lock was taken
    pub original_checksum: String,
    pub status: SessionStatus,
    pub locked_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    /// Optional link to a logical document in the catalog
    #[serde(default)]
    pub document_id: Option<String>,
    #[serde(default)]
    pub finished_at: Option<DateTime<Utc>>,
    /// Checksum written back on completion
    #[serde(default)]
    pub final_checksum: Option<String>,
    /// Primary checksum overwritten by a force-completion
    #[serde(default)]
    pub superseded_checksum: Option<String>,
}

impl EditSession {
    pub fn new(
        object_key: &str,
        editor_id: &str,
        original_checksum: String,
        document_id: Option<String>,
        now: DateTime<Utc>,
        ttl: Duration,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            object_key: object_key.to_string(),
            editor_id: editor_id.to_string(),
            original_checksum,
            status: SessionStatus::Active,
            locked_at: now,
            expires_at: now + ttl,
            document_id,
            finished_at: None,
            final_checksum: None,
            superseded_checksum: None,
        }
    }

    /// Still holding its lock: active or committing, and not past its expiry.
    pub fn is_live(&self, now: DateTime<Utc>) -> bool {
        self.holds_lock() && self.expires_at > now
    }

    fn holds_lock(&self) -> bool {
        matches!(
            self.status,
            SessionStatus::Active | SessionStatus::Committing
        )
    }

    /// Status as observed at `now`; a stale `Active` row reads as `Expired`.
    /// A `Committing` row keeps its status until the write-back settles.
    pub fn effective_status(&self, now: DateTime<Utc>) -> SessionStatus {
        if self.status == SessionStatus::Active && self.expires_at <= now {
            SessionStatus::Expired
        } else {
            self.status
        }
    }

    /// Copy with lazy expiry applied.
    pub fn as_of(&self, now: DateTime<Utc>) -> Self {
        let mut view = self.clone();
        view.status = self.effective_status(now);
        view
    }
}

/// Terminal transition requested for a session.
#[derive(Debug, Clone)]
pub struct SessionFinish {
    pub status: SessionStatus,
    pub final_checksum: Option<String>,
    pub superseded_checksum: Option<String>,
    pub finished_at: DateTime<Utc>,
}

impl SessionFinish {
    pub fn expired(at: DateTime<Utc>) -> Self {
        Self {
            status: SessionStatus::Expired,
            final_checksum: None,
            superseded_checksum: None,
            finished_at: at,
        }
    }
}

/// Result of an atomic acquisition attempt.
#[derive(Debug, Clone)]
pub enum AcquireOutcome {
    /// The candidate is now the live session for its key.
    Acquired(EditSession),
    /// Another live session already holds the key.
    Held(EditSession),
}

/// Every session recorded for one object key. This is the lock table row
/// that backends swap atomically.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionLedger {
    pub object_key: String,
    pub sessions: Vec<EditSession>,
}

impl SessionLedger {
    pub fn new(object_key: &str) -> Self {
        Self {
            object_key: object_key.to_string(),
            sessions: Vec::new(),
        }
    }

    pub fn find(&self, session_id: &str) -> Option<&EditSession> {
        self.sessions.iter().find(|s| s.id == session_id)
    }

    pub fn live(&self, now: DateTime<Utc>) -> Option<&EditSession> {
        self.sessions.iter().find(|s| s.is_live(now))
    }

    /// Record `candidate` unless a live session exists. Stale active rows are
    /// rewritten to `Expired` on the way.
    pub fn try_acquire(&mut self, candidate: EditSession, now: DateTime<Utc>) -> AcquireOutcome {
        if let Some(holder) = self.live(now) {
            return AcquireOutcome::Held(holder.clone());
        }

        for stale in self.sessions.iter_mut().filter(|s| s.holds_lock()) {
            stale.status = SessionStatus::Expired;
            stale.finished_at = Some(now);
        }

        self.sessions.push(candidate.clone());
        AcquireOutcome::Acquired(candidate)
    }

    fn find_mut(&mut self, session_id: &str) -> Result<&mut EditSession, VaultError> {
        self.sessions
            .iter_mut()
            .find(|s| s.id == session_id)
            .ok_or_else(|| VaultError::SessionNotFound(session_id.to_string()))
    }

    /// Claim the right to write back: `Active` and unexpired at `now` becomes
    /// `Committing`. A second claimant sees `SessionNotActive`.
    pub fn claim(&mut self, session_id: &str, now: DateTime<Utc>) -> Result<EditSession, VaultError> {
        let session = self.find_mut(session_id)?;
        if session.status != SessionStatus::Active {
            return Err(not_active(session));
        }
        if session.expires_at <= now {
            return Err(VaultError::SessionExpired(session_id.to_string()));
        }
        session.status = SessionStatus::Committing;
        Ok(session.clone())
    }

    /// Hand a claim back without writing: `Committing` becomes `Active`.
    pub fn release(&mut self, session_id: &str) -> Result<EditSession, VaultError> {
        let session = self.find_mut(session_id)?;
        if session.status != SessionStatus::Committing {
            return Err(not_active(session));
        }
        session.status = SessionStatus::Active;
        Ok(session.clone())
    }

    /// Apply a terminal transition. Completion settles a `Committing` claim;
    /// expiry applies to an `Active` row only.
    pub fn finish(
        &mut self,
        session_id: &str,
        finish: &SessionFinish,
        _now: DateTime<Utc>,
    ) -> Result<EditSession, VaultError> {
        let session = self.find_mut(session_id)?;

        let required = match finish.status {
            SessionStatus::Expired => SessionStatus::Active,
            _ => SessionStatus::Committing,
        };
        if session.status != required {
            return Err(not_active(session));
        }

        session.status = finish.status;
        session.finished_at = Some(finish.finished_at);
        session.final_checksum = finish.final_checksum.clone();
        session.superseded_checksum = finish.superseded_checksum.clone();
        Ok(session.clone())
    }
}

fn not_active(session: &EditSession) -> VaultError {
    VaultError::SessionNotActive {
        session_id: session.id.clone(),
        status: session.status.to_string(),
    }
}

/// Persistence for edit sessions. `try_acquire`, `claim`, `release` and
/// `finish` must be atomic with respect to concurrent callers on the same
/// object key.
#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn try_acquire(
        &self,
        candidate: EditSession,
        now: DateTime<Utc>,
    ) -> Result<AcquireOutcome, VaultError>;

    async fn find_live(
        &self,
        object_key: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<EditSession>, VaultError>;

    async fn get(&self, session_id: &str) -> Result<Option<EditSession>, VaultError>;

    async fn claim(
        &self,
        session: &EditSession,
        now: DateTime<Utc>,
    ) -> Result<EditSession, VaultError>;

    async fn release(&self, session: &EditSession) -> Result<EditSession, VaultError>;

    async fn finish(
        &self,
        session: &EditSession,
        finish: SessionFinish,
        now: DateTime<Utc>,
    ) -> Result<EditSession, VaultError>;

    /// Full history for a key, oldest first.
    async fn history(&self, object_key: &str) -> Result<Vec<EditSession>, VaultError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session(editor: &str, now: DateTime<Utc>) -> EditSession {
        EditSession::new("doc/a.xlsx", editor, "c0".to_string(), None, now, Duration::minutes(30))
    }

    #[test]
    fn test_acquire_blocks_second_editor() {
        let now = Utc::now();
        let mut ledger = SessionLedger::new("doc/a.xlsx");

        assert!(matches!(
            ledger.try_acquire(session("u1", now), now),
            AcquireOutcome::Acquired(_)
        ));
        match ledger.try_acquire(session("u2", now), now) {
            AcquireOutcome::Held(holder) => assert_eq!(holder.editor_id, "u1"),
            other => panic!("expected Held, got {:?}", other),
        }
        assert_eq!(ledger.sessions.len(), 1);
    }

    #[test]
    fn test_acquire_after_expiry_rewrites_stale_row() {
        let now = Utc::now();
        let mut ledger = SessionLedger::new("doc/a.xlsx");
        ledger.try_acquire(session("u1", now), now);

        let later = now + Duration::minutes(31);
        assert!(matches!(
            ledger.try_acquire(session("u2", later), later),
            AcquireOutcome::Acquired(_)
        ));
        assert_eq!(ledger.sessions[0].status, SessionStatus::Expired);
        assert_eq!(ledger.sessions[1].status, SessionStatus::Active);
        assert_eq!(ledger.live(later).map(|s| s.editor_id.as_str()), Some("u2"));
    }

    #[test]
    fn test_finish_is_monotonic() {
        let now = Utc::now();
        let mut ledger = SessionLedger::new("doc/a.xlsx");
        let s = session("u1", now);
        ledger.try_acquire(s.clone(), now);

        let done = SessionFinish {
            status: SessionStatus::Completed,
            final_checksum: Some("c1".to_string()),
            superseded_checksum: None,
            finished_at: now,
        };
        // Completion settles a claim, never a bare active row.
        assert!(matches!(
            ledger.finish(&s.id, &done, now).unwrap_err(),
            VaultError::SessionNotActive { .. }
        ));
        ledger.claim(&s.id, now).unwrap();
        let finished = ledger.finish(&s.id, &done, now).unwrap();
        assert_eq!(finished.status, SessionStatus::Completed);

        let err = ledger.finish(&s.id, &done, now).unwrap_err();
        assert!(matches!(err, VaultError::SessionNotActive { .. }));
        let err = ledger
            .finish(&s.id, &SessionFinish::expired(now), now)
            .unwrap_err();
        assert!(matches!(err, VaultError::SessionNotActive { .. }));
    }

    #[test]
    fn test_claim_is_exclusive_and_releasable() {
        let now = Utc::now();
        let mut ledger = SessionLedger::new("doc/a.xlsx");
        let s = session("u1", now);
        ledger.try_acquire(s.clone(), now);

        let claimed = ledger.claim(&s.id, now).unwrap();
        assert_eq!(claimed.status, SessionStatus::Committing);
        match ledger.claim(&s.id, now).unwrap_err() {
            VaultError::SessionNotActive { status, .. } => assert_eq!(status, "committing"),
            other => panic!("expected SessionNotActive, got {:?}", other),
        }

        // Still holds the lock while committing.
        assert!(matches!(
            ledger.try_acquire(session("u2", now), now),
            AcquireOutcome::Held(_)
        ));

        assert_eq!(ledger.release(&s.id).unwrap().status, SessionStatus::Active);
        assert!(ledger.release(&s.id).is_err());
        assert!(ledger.claim(&s.id, now).is_ok());
    }

    #[test]
    fn test_claim_rejects_expired_session() {
        let now = Utc::now();
        let mut ledger = SessionLedger::new("doc/a.xlsx");
        let s = session("u1", now);
        ledger.try_acquire(s.clone(), now);

        let later = now + Duration::hours(1);
        assert_eq!(
            ledger.claim(&s.id, later).unwrap_err(),
            VaultError::SessionExpired(s.id.clone())
        );
        assert_eq!(s.effective_status(later), SessionStatus::Expired);
        assert_eq!(s.as_of(now).status, SessionStatus::Active);
    }
}
