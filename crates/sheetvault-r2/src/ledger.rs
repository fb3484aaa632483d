use async_trait::async_trait;
use sheetvault_core::sync::SyncRecordTable;
use sheetvault_core::{FileSyncRecord, SyncLedger, SyncLogEntry, VaultError};
use tracing::{debug, instrument, warn};

use crate::bucket::R2Bucket;

/// Lines per log segment. A full segment is closed and never rewritten.
const SEGMENT_LINES: usize = 10_000;

/// Replication records and sync log on R2.
///
/// Storage layout in R2:
/// ```text
/// {control_prefix}sync/
///   records.json           # SyncRecordTable (CAS by ETag)
///   log/0000000000.jsonl   # SyncLogEntry per line, appended via CAS
///   log/0000000001.jsonl   # started once the previous segment is full
/// ```
#[derive(Clone)]
pub struct R2SyncLedger {
    bucket: R2Bucket,
    control_prefix: String,
    segment_lines: usize,
}

impl R2SyncLedger {
    pub fn new(bucket: R2Bucket, control_prefix: &str) -> Self {
        Self {
            bucket,
            control_prefix: control_prefix.to_string(),
            segment_lines: SEGMENT_LINES,
        }
    }

    fn records_key(&self) -> String {
        format!("{}sync/records.json", self.control_prefix)
    }

    fn log_prefix(&self) -> String {
        format!("{}sync/log/", self.control_prefix)
    }

    fn segment_key(&self, segment: u64) -> String {
        format!("{}{:010}.jsonl", self.log_prefix(), segment)
    }

    /// Segment numbers present in the bucket, ascending.
    async fn segments(&self) -> Result<Vec<u64>, VaultError> {
        let prefix = self.log_prefix();
        let mut segments: Vec<u64> = self
            .bucket
            .list_objects(&prefix)
            .await?
            .iter()
            .filter_map(|info| {
                info.key
                    .strip_prefix(&prefix)?
                    .strip_suffix(".jsonl")?
                    .parse()
                    .ok()
            })
            .collect();
        segments.sort_unstable();
        Ok(segments)
    }

    async fn table(&self) -> Result<SyncRecordTable, VaultError> {
        Ok(self
            .bucket
            .read_json(&self.records_key())
            .await?
            .unwrap_or_default())
    }
}

/// Parse JSONL log content, skipping lines that do not decode.
fn parse_log(content: &[u8]) -> Vec<SyncLogEntry> {
    content
        .split(|b| *b == b'\n')
        .filter(|line| !line.iter().all(u8::is_ascii_whitespace))
        .filter_map(|line| match serde_json::from_slice(line) {
            Ok(entry) => Some(entry),
            Err(e) => {
                warn!(error = %e, "Skipping unreadable sync log line");
                None
            }
        })
        .collect()
}

#[async_trait]
impl SyncLedger for R2SyncLedger {
    #[instrument(skip(self), level = "debug")]
    async fn get_record(&self, primary_key: &str) -> Result<Option<FileSyncRecord>, VaultError> {
        Ok(self.table().await?.records.remove(primary_key))
    }

    #[instrument(skip(self), level = "debug")]
    async fn find_synced_by_checksum(
        &self,
        checksum: &str,
    ) -> Result<Option<FileSyncRecord>, VaultError> {
        Ok(self
            .table()
            .await?
            .find_synced_by_checksum(checksum)
            .cloned())
    }

    #[instrument(skip(self, record), level = "debug", fields(primary_key = %record.primary_key))]
    async fn upsert_record(&self, record: FileSyncRecord) -> Result<(), VaultError> {
        self.bucket
            .cas_update(
                &self.records_key(),
                SyncRecordTable::default,
                |table: &mut SyncRecordTable| {
                    table.upsert(record.clone());
                    Ok(())
                },
            )
            .await
    }

    #[instrument(skip(self), level = "debug")]
    async fn list_records(&self) -> Result<Vec<FileSyncRecord>, VaultError> {
        Ok(self.table().await?.records.into_values().collect())
    }

    #[instrument(skip(self, entry), level = "debug", fields(filename = %entry.filename))]
    async fn append_log(&self, entry: SyncLogEntry) -> Result<(), VaultError> {
        let line = serde_json::to_vec(&entry)?;
        let mut segment = self.segments().await?.last().copied().unwrap_or(0);
        loop {
            let key = self.segment_key(segment);
            if self
                .bucket
                .cas_append_line(&key, &line, self.segment_lines)
                .await?
            {
                return Ok(());
            }
            debug!(segment, "Sync log segment full, starting the next one");
            segment += 1;
        }
    }

    #[instrument(skip(self), level = "debug")]
    async fn recent_log(&self, limit: usize) -> Result<Vec<SyncLogEntry>, VaultError> {
        let mut tail: Vec<SyncLogEntry> = Vec::new();
        for segment in self.segments().await?.into_iter().rev() {
            if tail.len() >= limit {
                break;
            }
            if let Some((data, _)) = self.bucket.get_object(&self.segment_key(segment)).await? {
                let mut entries = parse_log(&data);
                entries.append(&mut tail);
                tail = entries;
            }
        }
        let start = tail.len().saturating_sub(limit);
        Ok(tail.split_off(start))
    }
}
