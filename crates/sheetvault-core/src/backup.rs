//! One-way replication from primary storage to the backup mirror.
//!
//! Content is deduplicated by checksum: an object whose bytes already exist
//! in the backup under another name gets a record pointing at that copy
//! instead of a second upload.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use dashmap::DashSet;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};

use crate::checksum::checksum;
use crate::error::VaultError;
use crate::retry::RetryExecutor;
use crate::store::{file_name, ObjectInfo, ObjectStore, XLSX_CONTENT_TYPE};
use crate::sync::{
    FileSyncRecord, LogStatus, SyncLedger, SyncLogEntry, SyncOperation, SyncStatus,
};

/// Which primary keys take part in replication.
#[derive(Debug, Clone, Default)]
pub struct SyncScope {
    pub prefix: String,
    /// Keys under these prefixes are never replicated (control data)
    pub exclude_prefixes: Vec<String>,
}

impl SyncScope {
    pub fn includes(&self, key: &str) -> bool {
        key.starts_with(&self.prefix)
            && !key.ends_with('/')
            && !self
                .exclude_prefixes
                .iter()
                .any(|excluded| !excluded.is_empty() && key.starts_with(excluded.as_str()))
    }
}

/// Explicit winner selection for double-sided changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictPolicy {
    PreferPrimary,
    PreferBackup,
    PreferNewest,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Side {
    Primary,
    Backup,
}

impl ConflictPolicy {
    fn winner(&self, primary: Option<&ObjectInfo>, backup: Option<&ObjectInfo>) -> Side {
        match (self, primary, backup) {
            (_, None, Some(_)) => Side::Backup,
            (_, _, None) => Side::Primary,
            (ConflictPolicy::PreferPrimary, _, _) => Side::Primary,
            (ConflictPolicy::PreferBackup, _, _) => Side::Backup,
            (ConflictPolicy::PreferNewest, Some(p), Some(b)) => {
                if b.last_modified > p.last_modified {
                    Side::Backup
                } else {
                    Side::Primary
                }
            }
        }
    }
}

/// Counters for one replication pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PassReport {
    pub examined: usize,
    pub uploaded: usize,
    pub pulled: usize,
    pub skipped: usize,
    pub failed: usize,
    pub conflicts: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ItemOutcome {
    Uploaded,
    Pulled,
    Skipped,
    Conflict,
}

pub struct BackupSynchronizer {
    primary: Arc<dyn ObjectStore>,
    backup: Arc<dyn ObjectStore>,
    ledger: Arc<dyn SyncLedger>,
    retry: RetryExecutor,
    concurrency: usize,
    scope: SyncScope,
}

impl BackupSynchronizer {
    pub fn new(
        primary: Arc<dyn ObjectStore>,
        backup: Arc<dyn ObjectStore>,
        ledger: Arc<dyn SyncLedger>,
        retry: RetryExecutor,
    ) -> Self {
        Self {
            primary,
            backup,
            ledger,
            retry,
            concurrency: 4,
            scope: SyncScope::default(),
        }
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    pub fn with_scope(mut self, scope: SyncScope) -> Self {
        self.scope = scope;
        self
    }

    /// Bulk copy of every in-scope primary object not already backed up.
    #[instrument(skip(self), level = "debug")]
    pub async fn migrate(&self) -> Result<PassReport, VaultError> {
        let objects = self.scoped_primary_objects().await?;
        let keys: Vec<String> = objects.iter().map(|o| o.key.clone()).collect();
        let claimed = DashSet::new();

        let results = self
            .retry
            .process_batch(objects, self.concurrency, |object| {
                self.migrate_one(object, &claimed)
            })
            .await;

        let report = self.tally(SyncOperation::Migrate, &keys, results).await;
        info!(
            examined = report.examined,
            uploaded = report.uploaded,
            skipped = report.skipped,
            failed = report.failed,
            "Backup migration finished"
        );
        Ok(report)
    }

    async fn migrate_one(
        &self,
        object: ObjectInfo,
        claimed: &DashSet<String>,
    ) -> Result<ItemOutcome, VaultError> {
        let filename = file_name(&object.key).to_string();
        let content = self
            .retry
            .retry("primary.get", || self.primary.get(&object.key))
            .await?;
        let sum = checksum(&content);

        let own = self.ledger.get_record(&object.key).await?;
        if let Some(own) = &own {
            if own.sync_status == SyncStatus::Synced && own.checksum == sum {
                self.log(
                    SyncOperation::Skip,
                    &filename,
                    LogStatus::Skipped,
                    "already backed up",
                )
                .await;
                return Ok(ItemOutcome::Skipped);
            }
        }

        if let Some(existing) = self.ledger.find_synced_by_checksum(&sum).await? {
            self.alias_to(&existing, own, &object, &sum, content.len() as u64)
                .await?;
            self.log(
                SyncOperation::Skip,
                &filename,
                LogStatus::Skipped,
                format!("content already backed up as {}", existing.primary_key),
            )
            .await;
            return Ok(ItemOutcome::Skipped);
        }

        if !claimed.insert(sum.clone()) {
            self.log(
                SyncOperation::Skip,
                &filename,
                LogStatus::Skipped,
                "identical content is being uploaded in this pass",
            )
            .await;
            return Ok(ItemOutcome::Skipped);
        }

        self.push(&object, content, sum, SyncOperation::Migrate).await?;
        Ok(ItemOutcome::Uploaded)
    }

    /// Record `object` as synced against the backup copy already held by
    /// `existing`.
    async fn alias_to(
        &self,
        existing: &FileSyncRecord,
        own: Option<FileSyncRecord>,
        object: &ObjectInfo,
        sum: &str,
        size_bytes: u64,
    ) -> Result<(), VaultError> {
        let mut alias =
            own.unwrap_or_else(|| FileSyncRecord::pending(&object.key, file_name(&object.key)));
        alias.backup_id = existing.backup_id.clone();
        alias.checksum = sum.to_string();
        alias.size_bytes = size_bytes;
        alias.sync_status = SyncStatus::Synced;
        alias.primary_modified_at = Some(object.last_modified);
        alias.backup_modified_at = existing.backup_modified_at;
        alias.last_synced_at = Some(Utc::now());
        alias.last_error = None;
        self.ledger.upsert_record(alias).await
    }

    /// One-way mirror pass: push objects that are new or changed since the
    /// last successful sync. Never pulls from backup.
    #[instrument(skip(self), level = "debug")]
    pub async fn sync_backup_pass(&self) -> Result<PassReport, VaultError> {
        let objects = self.scoped_primary_objects().await?;
        let keys: Vec<String> = objects.iter().map(|o| o.key.clone()).collect();

        let results = self
            .retry
            .process_batch(objects, self.concurrency, |object| self.push_if_due(object))
            .await;

        let report = self.tally(SyncOperation::Push, &keys, results).await;
        info!(
            examined = report.examined,
            uploaded = report.uploaded,
            skipped = report.skipped,
            failed = report.failed,
            conflicts = report.conflicts,
            "Backup sync pass finished"
        );
        Ok(report)
    }

    async fn push_if_due(&self, object: ObjectInfo) -> Result<ItemOutcome, VaultError> {
        let filename = file_name(&object.key).to_string();
        let record = self.ledger.get_record(&object.key).await?;

        if let Some(record) = &record {
            if record.sync_status == SyncStatus::Conflict {
                self.log(
                    SyncOperation::Skip,
                    &filename,
                    LogStatus::Conflict,
                    "conflict awaiting explicit resolution",
                )
                .await;
                return Ok(ItemOutcome::Conflict);
            }
            if record.sync_status == SyncStatus::Synced && !Self::primary_changed(record, &object)
            {
                return Ok(ItemOutcome::Skipped);
            }
        }

        let content = self
            .retry
            .retry("primary.get", || self.primary.get(&object.key))
            .await?;
        let sum = checksum(&content);

        match record {
            Some(mut record) if record.sync_status == SyncStatus::Synced && record.checksum == sum => {
                debug!(key = %object.key, "Timestamp moved but content unchanged");
                record.primary_modified_at = Some(object.last_modified);
                record.last_synced_at = Some(Utc::now());
                self.ledger.upsert_record(record).await?;
                return Ok(ItemOutcome::Skipped);
            }
            None => {
                if let Some(existing) = self.ledger.find_synced_by_checksum(&sum).await? {
                    self.alias_to(&existing, None, &object, &sum, content.len() as u64)
                        .await?;
                    self.log(
                        SyncOperation::Skip,
                        &filename,
                        LogStatus::Skipped,
                        format!("content already backed up as {}", existing.primary_key),
                    )
                    .await;
                    return Ok(ItemOutcome::Skipped);
                }
            }
            Some(_) => {}
        }

        self.push(&object, content, sum, SyncOperation::Push).await?;
        Ok(ItemOutcome::Uploaded)
    }

    fn primary_changed(record: &FileSyncRecord, object: &ObjectInfo) -> bool {
        let since_sync = record
            .last_synced_at
            .map_or(true, |synced| object.last_modified > synced);
        let since_seen = record
            .primary_modified_at
            .map_or(true, |seen| object.last_modified > seen);
        since_sync || since_seen
    }

    /// Two-sided pass kept for old deployments. Backup-only changes are
    /// pulled into primary; changes on both sides become `conflict` unless a
    /// policy is supplied.
    #[deprecated(note = "use sync_backup_pass; backup is a one-way mirror")]
    #[instrument(skip(self), level = "debug")]
    pub async fn sync_bidirectional_pass(
        &self,
        policy: Option<ConflictPolicy>,
    ) -> Result<PassReport, VaultError> {
        let primary_objects = self.scoped_primary_objects().await?;
        let backup_objects: HashMap<String, ObjectInfo> = self
            .retry
            .retry("backup.list", || self.backup.list(""))
            .await?
            .into_iter()
            .map(|o| (o.key.clone(), o))
            .collect();
        let records: HashMap<String, FileSyncRecord> = self
            .ledger
            .list_records()
            .await?
            .into_iter()
            .map(|r| (r.primary_key.clone(), r))
            .collect();

        let primary_by_key: HashMap<String, ObjectInfo> = primary_objects
            .into_iter()
            .map(|o| (o.key.clone(), o))
            .collect();
        let mut keys: Vec<String> = primary_by_key
            .keys()
            .chain(records.keys())
            .cloned()
            .collect::<HashSet<_>>()
            .into_iter()
            .collect();
        keys.sort();

        let results = self
            .retry
            .process_batch(keys.clone(), self.concurrency, |key| {
                let primary = primary_by_key.get(&key).cloned();
                let record = records.get(&key).cloned();
                let backup = record
                    .as_ref()
                    .and_then(|r| r.backup_id.as_deref())
                    .or(Some(key.as_str()))
                    .and_then(|id| backup_objects.get(id).cloned());
                async move { self.reconcile_pair(&key, primary, backup, record, policy).await }
            })
            .await;

        Ok(self.tally(SyncOperation::Push, &keys, results).await)
    }

    async fn reconcile_pair(
        &self,
        key: &str,
        primary: Option<ObjectInfo>,
        backup: Option<ObjectInfo>,
        record: Option<FileSyncRecord>,
        policy: Option<ConflictPolicy>,
    ) -> Result<ItemOutcome, VaultError> {
        let mut record = match (record, &primary) {
            (None, Some(object)) => {
                let content = self
                    .retry
                    .retry("primary.get", || self.primary.get(key))
                    .await?;
                let sum = checksum(&content);
                self.push(object, content, sum, SyncOperation::Push).await?;
                return Ok(ItemOutcome::Uploaded);
            }
            (None, None) => return Ok(ItemOutcome::Skipped),
            (Some(record), _) => record,
        };

        if record.sync_status == SyncStatus::Conflict {
            return Ok(ItemOutcome::Conflict);
        }

        let primary_changed = match &primary {
            Some(p) => Self::primary_changed(&record, p),
            None => false,
        };
        let backup_changed = match &backup {
            Some(b) => self.backup_changed(&mut record, b).await?,
            None => false,
        };

        match (primary_changed, backup_changed) {
            (true, true) => match policy {
                Some(policy) => self.apply_policy(record, primary, backup, policy).await,
                None => {
                    self.mark_conflict(record).await?;
                    Ok(ItemOutcome::Conflict)
                }
            },
            (true, false) => {
                let object = primary.ok_or_else(|| VaultError::NotFound(key.to_string()))?;
                let content = self
                    .retry
                    .retry("primary.get", || self.primary.get(key))
                    .await?;
                let sum = checksum(&content);
                if sum == record.checksum {
                    return Ok(ItemOutcome::Skipped);
                }
                self.push(&object, content, sum, SyncOperation::Push).await?;
                Ok(ItemOutcome::Uploaded)
            }
            (false, true) => {
                self.pull(record, SyncOperation::Pull).await?;
                Ok(ItemOutcome::Pulled)
            }
            (false, false) => Ok(ItemOutcome::Skipped),
        }
    }

    /// Whether the backup copy moved on since `record` was written. With no
    /// recorded timestamp the content decides, and the timestamp is filled in.
    async fn backup_changed(
        &self,
        record: &mut FileSyncRecord,
        backup: &ObjectInfo,
    ) -> Result<bool, VaultError> {
        if let Some(seen) = record.backup_modified_at {
            return Ok(backup.last_modified > seen);
        }
        let content = self
            .retry
            .retry("backup.get", || self.backup.get(&backup.key))
            .await?;
        if checksum(&content) != record.checksum {
            return Ok(true);
        }
        debug!(key = %record.primary_key, "Backup timestamp unknown but content unchanged");
        record.backup_modified_at = Some(backup.last_modified);
        self.ledger.upsert_record(record.clone()).await?;
        Ok(false)
    }

    async fn mark_conflict(&self, mut record: FileSyncRecord) -> Result<(), VaultError> {
        warn!(key = %record.primary_key, "Both sides changed since last sync, marking conflict");
        record.sync_status = SyncStatus::Conflict;
        let filename = record.filename.clone();
        self.ledger.upsert_record(record).await?;
        self.log(
            SyncOperation::Conflict,
            &filename,
            LogStatus::Conflict,
            "primary and backup both changed since last sync",
        )
        .await;
        Ok(())
    }

    /// Settle a `conflict` record by copying the side chosen by `policy`.
    #[instrument(skip(self), level = "debug")]
    pub async fn resolve_conflict(
        &self,
        primary_key: &str,
        policy: ConflictPolicy,
    ) -> Result<FileSyncRecord, VaultError> {
        let record = self
            .ledger
            .get_record(primary_key)
            .await?
            .ok_or_else(|| VaultError::NotFound(format!("no sync record for {}", primary_key)))?;

        if record.sync_status != SyncStatus::Conflict {
            return Err(VaultError::ValidationFailed(format!(
                "{} is not in conflict",
                primary_key
            )));
        }

        let primary = self
            .retry
            .retry("primary.head", || self.primary.head(primary_key))
            .await?;
        let backup_key = record
            .backup_id
            .clone()
            .unwrap_or_else(|| primary_key.to_string());
        let backup = self
            .retry
            .retry("backup.head", || self.backup.head(&backup_key))
            .await?;

        self.apply_policy(record, primary, backup, policy).await?;
        self.ledger
            .get_record(primary_key)
            .await?
            .ok_or_else(|| VaultError::Internal(format!("record for {} vanished", primary_key)))
    }

    async fn apply_policy(
        &self,
        record: FileSyncRecord,
        primary: Option<ObjectInfo>,
        backup: Option<ObjectInfo>,
        policy: ConflictPolicy,
    ) -> Result<ItemOutcome, VaultError> {
        match policy.winner(primary.as_ref(), backup.as_ref()) {
            Side::Primary => {
                let object = primary
                    .ok_or_else(|| VaultError::NotFound(record.primary_key.clone()))?;
                let content = self
                    .retry
                    .retry("primary.get", || self.primary.get(&object.key))
                    .await?;
                let sum = checksum(&content);
                self.push(&object, content, sum, SyncOperation::Resolve).await?;
                Ok(ItemOutcome::Uploaded)
            }
            Side::Backup => {
                self.pull(record, SyncOperation::Resolve).await?;
                Ok(ItemOutcome::Pulled)
            }
        }
    }

    /// Upload `content` for `object` and record it as synced.
    async fn push(
        &self,
        object: &ObjectInfo,
        content: Bytes,
        sum: String,
        operation: SyncOperation,
    ) -> Result<FileSyncRecord, VaultError> {
        let filename = file_name(&object.key).to_string();
        let backup_key = object.key.clone();
        self.detach_aliases(&backup_key).await?;

        let metadata = HashMap::from([
            ("sha256".to_string(), sum.clone()),
            ("primary-key".to_string(), object.key.clone()),
        ]);
        let size = content.len() as u64;
        self.retry
            .retry("backup.put", || {
                self.backup
                    .put(&backup_key, content.clone(), XLSX_CONTENT_TYPE, Some(&metadata))
            })
            .await?;

        let backup_modified_at = self.backup_timestamp(&backup_key).await;
        let record = FileSyncRecord {
            filename: filename.clone(),
            primary_key: object.key.clone(),
            backup_id: Some(backup_key),
            checksum: sum,
            size_bytes: size,
            sync_status: SyncStatus::Synced,
            primary_modified_at: Some(object.last_modified),
            backup_modified_at,
            last_synced_at: Some(Utc::now()),
            last_error: None,
        };
        self.ledger.upsert_record(record.clone()).await?;
        self.log(
            operation,
            &filename,
            LogStatus::Ok,
            format!("uploaded {} bytes ({})", size, record.checksum),
        )
        .await;
        Ok(record)
    }

    /// Copy backup content into primary and record it as synced.
    async fn pull(
        &self,
        record: FileSyncRecord,
        operation: SyncOperation,
    ) -> Result<FileSyncRecord, VaultError> {
        let backup_key = record
            .backup_id
            .clone()
            .unwrap_or_else(|| record.primary_key.clone());
        let content = self
            .retry
            .retry("backup.get", || self.backup.get(&backup_key))
            .await?;
        let sum = checksum(&content);
        let size = content.len() as u64;
        let metadata = HashMap::from([("sha256".to_string(), sum.clone())]);

        self.retry
            .retry("primary.put", || {
                self.primary.put(
                    &record.primary_key,
                    content.clone(),
                    XLSX_CONTENT_TYPE,
                    Some(&metadata),
                )
            })
            .await?;

        let primary_modified_at = self
            .primary
            .head(&record.primary_key)
            .await
            .ok()
            .flatten()
            .map(|info| info.last_modified);
        let backup_modified_at = self.backup_timestamp(&backup_key).await;

        let updated = FileSyncRecord {
            checksum: sum,
            size_bytes: size,
            sync_status: SyncStatus::Synced,
            primary_modified_at,
            backup_modified_at,
            last_synced_at: Some(Utc::now()),
            last_error: None,
            ..record
        };
        self.ledger.upsert_record(updated.clone()).await?;
        self.log(
            operation,
            &updated.filename,
            LogStatus::Ok,
            format!("pulled {} bytes from backup", size),
        )
        .await;
        Ok(updated)
    }

    /// Before overwriting `backup_key`, give records that share it (content
    /// dedup aliases) their own copy so their content stays recoverable.
    async fn detach_aliases(&self, backup_key: &str) -> Result<(), VaultError> {
        let aliases: Vec<FileSyncRecord> = self
            .ledger
            .list_records()
            .await?
            .into_iter()
            .filter(|r| r.backup_id.as_deref() == Some(backup_key) && r.primary_key != backup_key)
            .collect();
        if aliases.is_empty() {
            return Ok(());
        }

        let shared = match self
            .retry
            .retry("backup.get", || self.backup.get(backup_key))
            .await
        {
            Ok(content) => content,
            Err(VaultError::NotFound(_)) => return Ok(()),
            Err(e) => return Err(e),
        };

        for mut alias in aliases {
            debug!(alias = %alias.primary_key, shared = backup_key, "Detaching dedup alias");
            self.retry
                .retry("backup.put", || {
                    self.backup.put(
                        &alias.primary_key,
                        shared.clone(),
                        XLSX_CONTENT_TYPE,
                        None,
                    )
                })
                .await?;
            alias.backup_id = Some(alias.primary_key.clone());
            alias.backup_modified_at = self.backup_timestamp(&alias.primary_key).await;
            self.ledger.upsert_record(alias).await?;
        }
        Ok(())
    }

    async fn backup_timestamp(&self, backup_key: &str) -> Option<DateTime<Utc>> {
        match self.backup.head(backup_key).await {
            Ok(info) => info.map(|i| i.last_modified),
            Err(e) => {
                warn!(backup_key, error = %e, "Could not read backup timestamp");
                None
            }
        }
    }

    async fn scoped_primary_objects(&self) -> Result<Vec<ObjectInfo>, VaultError> {
        let objects = self
            .retry
            .retry("primary.list", || self.primary.list(&self.scope.prefix))
            .await?;
        Ok(objects
            .into_iter()
            .filter(|o| self.scope.includes(&o.key))
            .collect())
    }

    async fn tally(
        &self,
        operation: SyncOperation,
        keys: &[String],
        results: Vec<Result<ItemOutcome, VaultError>>,
    ) -> PassReport {
        let mut report = PassReport {
            examined: keys.len(),
            ..Default::default()
        };

        for (key, result) in keys.iter().zip(results) {
            match result {
                Ok(ItemOutcome::Uploaded) => report.uploaded += 1,
                Ok(ItemOutcome::Pulled) => report.pulled += 1,
                Ok(ItemOutcome::Skipped) => report.skipped += 1,
                Ok(ItemOutcome::Conflict) => report.conflicts += 1,
                Err(e) => {
                    report.failed += 1;
                    self.record_failure(operation, key, &e).await;
                }
            }
        }
        report
    }

    /// Mark a record as errored without touching its confirmed checksum.
    async fn record_failure(&self, operation: SyncOperation, key: &str, err: &VaultError) {
        warn!(key, error = %err, "Backup replication failed");
        let filename = file_name(key).to_string();

        let mut record = match self.ledger.get_record(key).await {
            Ok(Some(record)) => record,
            Ok(None) => FileSyncRecord::pending(key, &filename),
            Err(e) => {
                warn!(key, error = %e, "Could not load sync record");
                FileSyncRecord::pending(key, &filename)
            }
        };
        if record.sync_status != SyncStatus::Conflict {
            record.sync_status = SyncStatus::Error;
        }
        record.last_error = Some(err.to_string());
        if let Err(e) = self.ledger.upsert_record(record).await {
            warn!(key, error = %e, "Could not persist sync error");
        }

        self.log(operation, &filename, LogStatus::Error, err.to_string())
            .await;
    }

    async fn log(
        &self,
        operation: SyncOperation,
        filename: &str,
        status: LogStatus,
        message: impl Into<String>,
    ) {
        let entry = SyncLogEntry::new(operation, filename, status, message);
        if let Err(e) = self.ledger.append_log(entry).await {
            warn!(filename, error = %e, "Could not append sync log entry");
        }
    }

    pub async fn records(&self) -> Result<Vec<FileSyncRecord>, VaultError> {
        self.ledger.list_records().await
    }

    pub async fn recent_log(&self, limit: usize) -> Result<Vec<SyncLogEntry>, VaultError> {
        self.ledger.recent_log(limit).await
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use async_trait::async_trait;
    use chrono::Duration as ChronoDuration;

    use super::*;
    use crate::memory::{MemoryObjectStore, MemorySyncLedger};
    use crate::retry::RetryPolicy;

    struct Fixture {
        sync: BackupSynchronizer,
        primary: Arc<MemoryObjectStore>,
        backup: Arc<MemoryObjectStore>,
        ledger: Arc<MemorySyncLedger>,
    }

    fn setup_with_backup(backup: Arc<dyn ObjectStore>) -> (BackupSynchronizer, Arc<MemoryObjectStore>, Arc<MemorySyncLedger>) {
        let primary = Arc::new(MemoryObjectStore::new("primary"));
        let ledger = Arc::new(MemorySyncLedger::new());
        let sync = BackupSynchronizer::new(
            primary.clone(),
            backup,
            ledger.clone(),
            RetryExecutor::new(RetryPolicy::new(2, Duration::from_millis(1))),
        )
        .with_concurrency(8)
        .with_scope(SyncScope {
            prefix: String::new(),
            exclude_prefixes: vec!["_sheetvault/".to_string()],
        });
        (sync, primary, ledger)
    }

    fn setup() -> Fixture {
        let backup = Arc::new(MemoryObjectStore::new("backup"));
        let (sync, primary, ledger) = setup_with_backup(backup.clone());
        Fixture {
            sync,
            primary,
            backup,
            ledger,
        }
    }

    #[tokio::test]
    async fn test_migrate_dedups_identical_content() {
        let f = setup();
        for i in 0..90 {
            f.primary
                .insert(&format!("doc/file-{:03}.xlsx", i), format!("content {}", i).into_bytes());
        }
        for i in 0..10 {
            f.primary.insert(
                &format!("copies/dup-{:03}.xlsx", i),
                format!("content {}", i).into_bytes(),
            );
        }

        let report = f.sync.migrate().await.unwrap();
        assert_eq!(report.examined, 100);
        assert!(f.backup.put_count() <= 90);
        assert_eq!(report.uploaded, f.backup.put_count());
        assert_eq!(report.uploaded + report.skipped, 100);
        assert_eq!(report.failed, 0);
    }

    #[tokio::test]
    async fn test_migrate_twice_uploads_nothing_new() {
        let f = setup();
        f.primary.insert("doc/a.xlsx", b"a".to_vec());
        f.primary.insert("doc/b.xlsx", b"b".to_vec());
        f.primary.insert("_sheetvault/sync/records.json", b"{}".to_vec());

        let first = f.sync.migrate().await.unwrap();
        assert_eq!(first.examined, 2);
        assert_eq!(first.uploaded, 2);

        let second = f.sync.migrate().await.unwrap();
        assert_eq!(second.uploaded, 0);
        assert_eq!(second.skipped, 2);
        assert_eq!(f.backup.put_count(), 2);

        let log = f.sync.recent_log(10).await.unwrap();
        assert_eq!(log.len(), 4);
    }

    #[tokio::test]
    async fn test_sync_pass_pushes_new_and_changed_only() {
        let f = setup();
        let t0 = Utc::now() - ChronoDuration::hours(2);
        f.primary.insert_at("doc/a.xlsx", b"a1".to_vec(), t0);
        f.primary.insert_at("doc/b.xlsx", b"b1".to_vec(), t0);

        let first = f.sync.sync_backup_pass().await.unwrap();
        assert_eq!(first.uploaded, 2);

        let idle = f.sync.sync_backup_pass().await.unwrap();
        assert_eq!(idle.uploaded, 0);
        assert_eq!(idle.skipped, 2);

        f.primary.insert("doc/a.xlsx", b"a2".to_vec());
        let changed = f.sync.sync_backup_pass().await.unwrap();
        assert_eq!(changed.uploaded, 1);
        assert_eq!(
            f.backup.get("doc/a.xlsx").await.unwrap(),
            Bytes::from_static(b"a2")
        );

        // Touched but identical content: no upload.
        f.primary.insert("doc/b.xlsx", b"b1".to_vec());
        let touched = f.sync.sync_backup_pass().await.unwrap();
        assert_eq!(touched.uploaded, 0);
        assert_eq!(f.backup.put_count(), 3);
    }

    #[tokio::test]
    async fn test_sync_pass_never_overwrites_conflict_rows() {
        let f = setup();
        f.primary.insert("doc/a.xlsx", b"a1".to_vec());
        f.sync.sync_backup_pass().await.unwrap();

        let mut record = f.ledger.get_record("doc/a.xlsx").await.unwrap().unwrap();
        record.sync_status = SyncStatus::Conflict;
        f.ledger.upsert_record(record).await.unwrap();

        f.primary.insert("doc/a.xlsx", b"a2".to_vec());
        let report = f.sync.sync_backup_pass().await.unwrap();
        assert_eq!(report.conflicts, 1);
        assert_eq!(report.uploaded, 0);
        assert_eq!(
            f.backup.get("doc/a.xlsx").await.unwrap(),
            Bytes::from_static(b"a1")
        );
    }

    #[tokio::test]
    #[allow(deprecated)]
    async fn test_bidirectional_marks_double_sided_change_as_conflict() {
        let f = setup();
        let t0 = Utc::now() - ChronoDuration::hours(2);
        f.primary.insert_at("doc/a.xlsx", b"a1".to_vec(), t0);
        f.sync.sync_backup_pass().await.unwrap();

        let later = Utc::now() + ChronoDuration::hours(1);
        f.primary.insert_at("doc/a.xlsx", b"primary edit".to_vec(), later);
        f.backup.insert_at("doc/a.xlsx", b"backup edit".to_vec(), later);

        let report = f.sync.sync_bidirectional_pass(None).await.unwrap();
        assert_eq!(report.conflicts, 1);
        let record = f.ledger.get_record("doc/a.xlsx").await.unwrap().unwrap();
        assert_eq!(record.sync_status, SyncStatus::Conflict);
        assert_eq!(record.checksum, checksum(b"a1"));
        assert_eq!(
            f.primary.get("doc/a.xlsx").await.unwrap(),
            Bytes::from_static(b"primary edit")
        );

        let resolved = f
            .sync
            .resolve_conflict("doc/a.xlsx", ConflictPolicy::PreferBackup)
            .await
            .unwrap();
        assert_eq!(resolved.sync_status, SyncStatus::Synced);
        assert_eq!(resolved.checksum, checksum(b"backup edit"));
        assert_eq!(
            f.primary.get("doc/a.xlsx").await.unwrap(),
            Bytes::from_static(b"backup edit")
        );
    }

    #[tokio::test]
    #[allow(deprecated)]
    async fn test_bidirectional_pulls_backup_only_change() {
        let f = setup();
        let t0 = Utc::now() - ChronoDuration::hours(2);
        f.primary.insert_at("doc/a.xlsx", b"a1".to_vec(), t0);
        f.sync.sync_backup_pass().await.unwrap();

        f.backup.insert_at(
            "doc/a.xlsx",
            b"restored".to_vec(),
            Utc::now() + ChronoDuration::hours(1),
        );
        let report = f.sync.sync_bidirectional_pass(None).await.unwrap();
        assert_eq!(report.pulled, 1);
        assert_eq!(
            f.primary.get("doc/a.xlsx").await.unwrap(),
            Bytes::from_static(b"restored")
        );
    }

    #[tokio::test]
    #[allow(deprecated)]
    async fn test_unknown_backup_timestamp_falls_back_to_content() {
        let f = setup();
        let t0 = Utc::now() - ChronoDuration::hours(2);
        f.primary.insert_at("doc/a.xlsx", b"a1".to_vec(), t0);
        f.sync.sync_backup_pass().await.unwrap();
        let mut record = f.ledger.get_record("doc/a.xlsx").await.unwrap().unwrap();
        record.backup_modified_at = None;
        f.ledger.upsert_record(record).await.unwrap();
        let primary_puts = f.primary.put_count();

        let report = f.sync.sync_bidirectional_pass(None).await.unwrap();
        assert_eq!(report.pulled, 0);
        assert_eq!(report.conflicts, 0);
        assert_eq!(f.primary.put_count(), primary_puts);
        let record = f.ledger.get_record("doc/a.xlsx").await.unwrap().unwrap();
        assert_eq!(record.sync_status, SyncStatus::Synced);
        assert!(record.backup_modified_at.is_some());

        let mut record = record;
        record.backup_modified_at = None;
        f.ledger.upsert_record(record).await.unwrap();
        f.primary.insert_at(
            "doc/a.xlsx",
            b"primary edit".to_vec(),
            Utc::now() + ChronoDuration::hours(1),
        );
        let report = f.sync.sync_bidirectional_pass(None).await.unwrap();
        assert_eq!(report.conflicts, 0);
        assert_eq!(report.uploaded, 1);
        assert_eq!(
            f.backup.get("doc/a.xlsx").await.unwrap(),
            Bytes::from_static(b"primary edit")
        );
    }

    #[tokio::test]
    async fn test_repushing_original_keeps_alias_content() {
        let f = setup();
        f.primary.insert("doc/a.xlsx", b"same".to_vec());
        f.sync.migrate().await.unwrap();
        f.primary.insert("doc/b.xlsx", b"same".to_vec());
        f.sync.migrate().await.unwrap();
        assert_eq!(f.backup.put_count(), 1);

        f.primary.insert("doc/a.xlsx", b"changed".to_vec());
        f.sync.migrate().await.unwrap();

        let alias = f.ledger.get_record("doc/b.xlsx").await.unwrap().unwrap();
        let alias_key = alias.backup_id.unwrap();
        assert_eq!(alias_key, "doc/b.xlsx");
        assert_eq!(
            f.backup.get(&alias_key).await.unwrap(),
            Bytes::from_static(b"same")
        );
        assert_eq!(
            f.backup.get("doc/a.xlsx").await.unwrap(),
            Bytes::from_static(b"changed")
        );
    }

    /// Backup store that refuses writes for keys containing "denied".
    struct PickyBackup(MemoryObjectStore);

    #[async_trait]
    impl ObjectStore for PickyBackup {
        fn backend_name(&self) -> &'static str {
            "picky"
        }
        async fn get(&self, key: &str) -> Result<Bytes, VaultError> {
            self.0.get(key).await
        }
        async fn put(
            &self,
            key: &str,
            data: Bytes,
            content_type: &str,
            metadata: Option<&HashMap<String, String>>,
        ) -> Result<(), VaultError> {
            if key.contains("denied") {
                return Err(VaultError::PermissionDenied(key.to_string()));
            }
            self.0.put(key, data, content_type, metadata).await
        }
        async fn delete(&self, key: &str) -> Result<(), VaultError> {
            self.0.delete(key).await
        }
        async fn presign(&self, key: &str, ttl: Duration) -> Result<String, VaultError> {
            self.0.presign(key, ttl).await
        }
        async fn head(&self, key: &str) -> Result<Option<ObjectInfo>, VaultError> {
            self.0.head(key).await
        }
        async fn list(&self, prefix: &str) -> Result<Vec<ObjectInfo>, VaultError> {
            self.0.list(prefix).await
        }
    }

    #[tokio::test]
    async fn test_one_failure_does_not_abort_the_pass() {
        let (sync, primary, ledger) =
            setup_with_backup(Arc::new(PickyBackup(MemoryObjectStore::new("backup"))));
        primary.insert("doc/a.xlsx", b"a".to_vec());
        primary.insert("doc/denied.xlsx", b"d".to_vec());
        primary.insert("doc/c.xlsx", b"c".to_vec());

        let report = sync.sync_backup_pass().await.unwrap();
        assert_eq!(report.uploaded, 2);
        assert_eq!(report.failed, 1);

        let failed = ledger.get_record("doc/denied.xlsx").await.unwrap().unwrap();
        assert_eq!(failed.sync_status, SyncStatus::Error);
        assert!(failed.last_error.is_some());
        assert!(failed.backup_id.is_none());
    }

    #[test]
    fn test_scope_excludes_control_prefix() {
        let scope = SyncScope {
            prefix: "doc/".to_string(),
            exclude_prefixes: vec!["doc/_tmp/".to_string()],
        };
        assert!(scope.includes("doc/a.xlsx"));
        assert!(!scope.includes("doc/_tmp/a.xlsx"));
        assert!(!scope.includes("other/a.xlsx"));
        assert!(!scope.includes("doc/folder/"));
    }
}
