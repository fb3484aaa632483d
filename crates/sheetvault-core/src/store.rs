use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::VaultError;

/// Content type used for spreadsheets when the caller does not know better.
pub const XLSX_CONTENT_TYPE: &str =
    "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet";

/// Listing/head information about a stored object.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectInfo {
    /// Object key (primary) or file name (backup)
    pub key: String,
    pub size_bytes: u64,
    pub last_modified: DateTime<Utc>,
    /// Backend-specific identity (S3 ETag, Drive file ID)
    pub etag: Option<String>,
}

/// Blob store abstraction used for both primary storage and the backup mirror.
///
/// Implementations hold no per-request mutable state and are shared behind
/// `Arc<dyn ObjectStore>`.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Short backend name for logs ("r2", "gdrive", "memory").
    fn backend_name(&self) -> &'static str;

    /// Fetch an object. Missing objects yield `VaultError::NotFound`.
    async fn get(&self, key: &str) -> Result<Bytes, VaultError>;

    /// Create or replace an object.
    async fn put(
        &self,
        key: &str,
        data: Bytes,
        content_type: &str,
        metadata: Option<&HashMap<String, String>>,
    ) -> Result<(), VaultError>;

    /// Delete an object. Deleting a missing object succeeds.
    async fn delete(&self, key: &str) -> Result<(), VaultError>;

    async fn exists(&self, key: &str) -> Result<bool, VaultError> {
        Ok(self.head(key).await?.is_some())
    }

    /// Time-limited read-only URL for one object.
    async fn presign(&self, key: &str, ttl: Duration) -> Result<String, VaultError>;

    /// Object information without the body.
    async fn head(&self, key: &str) -> Result<Option<ObjectInfo>, VaultError>;

    /// All objects whose key starts with `prefix`.
    async fn list(&self, prefix: &str) -> Result<Vec<ObjectInfo>, VaultError>;
}

/// Last path segment of an object key.
pub fn file_name(key: &str) -> &str {
    key.rsplit('/').next().unwrap_or(key)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_file_name() {
        assert_eq!(file_name("doc/a.xlsx"), "a.xlsx");
        assert_eq!(file_name("a.xlsx"), "a.xlsx");
        assert_eq!(file_name("doc/nested/"), "");
    }
}
