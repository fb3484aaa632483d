use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use sheetvault_core::session::{AcquireOutcome, SessionLedger};
use sheetvault_core::{EditSession, SessionFinish, SessionStore, VaultError};
use tracing::{debug, instrument};

use crate::bucket::R2Bucket;

/// Lock table on R2.
///
/// Storage layout in R2:
/// ```text
/// {control_prefix}sessions/
///   {urlencoded object key}.json   # SessionLedger for that key (CAS by ETag)
///   by-id/{session_id}             # object key owning the session
/// ```
#[derive(Clone)]
pub struct R2SessionStore {
    bucket: R2Bucket,
    control_prefix: String,
}

impl R2SessionStore {
    pub fn new(bucket: R2Bucket, control_prefix: &str) -> Self {
        Self {
            bucket,
            control_prefix: control_prefix.to_string(),
        }
    }

    fn ledger_key(&self, object_key: &str) -> String {
        format!(
            "{}sessions/{}.json",
            self.control_prefix,
            urlencoding::encode(object_key)
        )
    }

    fn pointer_key(&self, session_id: &str) -> String {
        format!("{}sessions/by-id/{}", self.control_prefix, session_id)
    }

    async fn load_ledger(&self, object_key: &str) -> Result<Option<SessionLedger>, VaultError> {
        self.bucket.read_json(&self.ledger_key(object_key)).await
    }
}

#[async_trait]
impl SessionStore for R2SessionStore {
    #[instrument(skip(self, candidate), level = "debug", fields(object_key = %candidate.object_key))]
    async fn try_acquire(
        &self,
        candidate: EditSession,
        now: DateTime<Utc>,
    ) -> Result<AcquireOutcome, VaultError> {
        let object_key = candidate.object_key.clone();
        let outcome = self
            .bucket
            .cas_update(
                &self.ledger_key(&object_key),
                || SessionLedger::new(&object_key),
                |ledger: &mut SessionLedger| Ok(ledger.try_acquire(candidate.clone(), now)),
            )
            .await?;

        if let AcquireOutcome::Acquired(session) = &outcome {
            self.bucket
                .put_object(
                    &self.pointer_key(&session.id),
                    Bytes::from(object_key.clone()),
                    "text/plain",
                    None,
                )
                .await?;
            debug!(session_id = %session.id, "Recorded session pointer");
        }
        Ok(outcome)
    }

    #[instrument(skip(self), level = "debug")]
    async fn find_live(
        &self,
        object_key: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<EditSession>, VaultError> {
        Ok(self
            .load_ledger(object_key)
            .await?
            .and_then(|ledger| ledger.live(now).cloned()))
    }

    #[instrument(skip(self), level = "debug")]
    async fn get(&self, session_id: &str) -> Result<Option<EditSession>, VaultError> {
        let object_key = match self.bucket.get_object(&self.pointer_key(session_id)).await? {
            Some((data, _)) => String::from_utf8(data.to_vec()).map_err(|e| {
                VaultError::Serialization(format!("Corrupt session pointer {}: {}", session_id, e))
            })?,
            None => return Ok(None),
        };

        Ok(self
            .load_ledger(&object_key)
            .await?
            .and_then(|ledger| ledger.find(session_id).cloned()))
    }

    #[instrument(skip(self, session), level = "debug", fields(session_id = %session.id))]
    async fn claim(
        &self,
        session: &EditSession,
        now: DateTime<Utc>,
    ) -> Result<EditSession, VaultError> {
        self.bucket
            .cas_update(
                &self.ledger_key(&session.object_key),
                || SessionLedger::new(&session.object_key),
                |ledger: &mut SessionLedger| ledger.claim(&session.id, now),
            )
            .await
    }

    #[instrument(skip(self, session), level = "debug", fields(session_id = %session.id))]
    async fn release(&self, session: &EditSession) -> Result<EditSession, VaultError> {
        self.bucket
            .cas_update(
                &self.ledger_key(&session.object_key),
                || SessionLedger::new(&session.object_key),
                |ledger: &mut SessionLedger| ledger.release(&session.id),
            )
            .await
    }

    #[instrument(skip(self, session, finish), level = "debug", fields(session_id = %session.id, status = %finish.status))]
    async fn finish(
        &self,
        session: &EditSession,
        finish: SessionFinish,
        now: DateTime<Utc>,
    ) -> Result<EditSession, VaultError> {
        self.bucket
            .cas_update(
                &self.ledger_key(&session.object_key),
                || SessionLedger::new(&session.object_key),
                |ledger: &mut SessionLedger| ledger.finish(&session.id, &finish, now),
            )
            .await
    }

    #[instrument(skip(self), level = "debug")]
    async fn history(&self, object_key: &str) -> Result<Vec<EditSession>, VaultError> {
        Ok(self
            .load_ledger(object_key)
            .await?
            .map(|ledger| ledger.sessions)
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use chrono::Duration;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use super::*;
    use crate::bucket::tests::bucket_at;

    #[test]
    fn test_key_layout() {
        let store = R2SessionStore::new(bucket_at("http://localhost:1"), "_sheetvault/");
        assert_eq!(
            store.ledger_key("reports/Q3 plan.xlsx"),
            "_sheetvault/sessions/reports%2FQ3%20plan.xlsx.json"
        );
        assert_eq!(
            store.pointer_key("0b6f"),
            "_sheetvault/sessions/by-id/0b6f"
        );
    }

    #[tokio::test]
    async fn test_acquire_reports_existing_holder_without_writing() {
        let server = MockServer::start().await;
        let now = Utc::now();
        let holder = EditSession::new(
            "book.xlsx",
            "alice",
            "c0".to_string(),
            None,
            now,
            Duration::minutes(30),
        );
        let mut ledger = SessionLedger::new("book.xlsx");
        ledger.sessions.push(holder.clone());

        Mock::given(method("GET"))
            .and(path("/vault/_sheetvault/sessions/book.xlsx.json"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("ETag", "\"v1\"")
                    .set_body_bytes(serde_json::to_vec(&ledger).unwrap()),
            )
            .mount(&server)
            .await;

        let store = R2SessionStore::new(bucket_at(&server.uri()), "_sheetvault/");
        let candidate = EditSession::new(
            "book.xlsx",
            "bob",
            "c0".to_string(),
            None,
            now,
            Duration::minutes(30),
        );
        match store.try_acquire(candidate, now).await.unwrap() {
            AcquireOutcome::Held(found) => assert_eq!(found.editor_id, "alice"),
            AcquireOutcome::Acquired(_) => panic!("second editor must not acquire"),
        }

        let requests = server.received_requests().await.unwrap();
        assert!(requests.iter().all(|r| r.method.as_str() == "GET"));
    }
}
