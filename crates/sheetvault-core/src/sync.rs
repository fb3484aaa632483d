use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::VaultError;

/// Replication state of one primary object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncStatus {
    Pending,
    Synced,
    Error,
    Conflict,
}

/// Per-object replication record.
///
/// `checksum` always describes the content last confirmed on both sides.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileSyncRecord {
    pub filename: String,
    pub primary_key: String,
    /// Backup-side identifier (null until first replication)
    pub backup_id: Option<String>,
    pub checksum: String,
    pub size_bytes: u64,
    pub sync_status: SyncStatus,
    pub primary_modified_at: Option<DateTime<Utc>>,
    pub backup_modified_at: Option<DateTime<Utc>>,
    pub last_synced_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_error: Option<String>,
}

impl FileSyncRecord {
    pub fn pending(primary_key: &str, filename: &str) -> Self {
        Self {
            filename: filename.to_string(),
            primary_key: primary_key.to_string(),
            backup_id: None,
            checksum: String::new(),
            size_bytes: 0,
            sync_status: SyncStatus::Pending,
            primary_modified_at: None,
            backup_modified_at: None,
            last_synced_at: None,
            last_error: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncOperation {
    Migrate,
    Push,
    Pull,
    Skip,
    Conflict,
    Resolve,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogStatus {
    Ok,
    Skipped,
    Error,
    Conflict,
}

/// Write-once audit line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncLogEntry {
    pub operation: SyncOperation,
    pub filename: String,
    pub status: LogStatus,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

impl SyncLogEntry {
    pub fn new(
        operation: SyncOperation,
        filename: &str,
        status: LogStatus,
        message: impl Into<String>,
    ) -> Self {
        Self {
            operation,
            filename: filename.to_string(),
            status,
            message: message.into(),
            timestamp: Utc::now(),
        }
    }
}

/// Sync records keyed by primary key. Backends persist it as one document.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncRecordTable {
    pub records: BTreeMap<String, FileSyncRecord>,
}

impl SyncRecordTable {
    /// A synced record whose content hash is `checksum`, if any.
    pub fn find_synced_by_checksum(&self, checksum: &str) -> Option<&FileSyncRecord> {
        self.records
            .values()
            .find(|r| r.sync_status == SyncStatus::Synced && r.checksum == checksum)
    }

    pub fn upsert(&mut self, record: FileSyncRecord) {
        self.records.insert(record.primary_key.clone(), record);
    }
}

/// Persistence for replication records and the append-only log.
#[async_trait]
pub trait SyncLedger: Send + Sync {
    async fn get_record(&self, primary_key: &str) -> Result<Option<FileSyncRecord>, VaultError>;

    async fn find_synced_by_checksum(
        &self,
        checksum: &str,
    ) -> Result<Option<FileSyncRecord>, VaultError>;

    async fn upsert_record(&self, record: FileSyncRecord) -> Result<(), VaultError>;

    async fn list_records(&self) -> Result<Vec<FileSyncRecord>, VaultError>;

    async fn append_log(&self, entry: SyncLogEntry) -> Result<(), VaultError>;

    /// Most recent entries, newest last.
    async fn recent_log(&self, limit: usize) -> Result<Vec<SyncLogEntry>, VaultError>;
}
