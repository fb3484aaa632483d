use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use sheetvault_core::{ObjectInfo, ObjectStore, VaultError};
use tracing::{debug, instrument};

use crate::bucket::R2Bucket;

/// Primary spreadsheet storage on R2.
///
/// Keys are used verbatim. Control documents live under a separate prefix
/// and are written through [`crate::R2SessionStore`] and
/// [`crate::R2SyncLedger`], never through this store.
#[derive(Clone)]
pub struct R2ObjectStore {
    bucket: R2Bucket,
}

impl R2ObjectStore {
    pub fn new(bucket: R2Bucket) -> Self {
        Self { bucket }
    }
}

#[async_trait]
impl ObjectStore for R2ObjectStore {
    fn backend_name(&self) -> &'static str {
        "r2"
    }

    #[instrument(skip(self), level = "debug")]
    async fn get(&self, key: &str) -> Result<Bytes, VaultError> {
        match self.bucket.get_object(key).await? {
            Some((data, _)) => {
                debug!(key, bytes = data.len(), "Loaded object");
                Ok(data)
            }
            None => Err(VaultError::NotFound(format!(
                "{} not found in bucket {}",
                key,
                self.bucket.bucket_name()
            ))),
        }
    }

    #[instrument(skip(self, data, metadata), level = "debug", fields(data_len = data.len()))]
    async fn put(
        &self,
        key: &str,
        data: Bytes,
        content_type: &str,
        metadata: Option<&HashMap<String, String>>,
    ) -> Result<(), VaultError> {
        self.bucket.put_object(key, data, content_type, metadata).await
    }

    #[instrument(skip(self), level = "debug")]
    async fn delete(&self, key: &str) -> Result<(), VaultError> {
        self.bucket.delete_object(key).await
    }

    #[instrument(skip(self), level = "debug")]
    async fn presign(&self, key: &str, ttl: Duration) -> Result<String, VaultError> {
        self.bucket.presign_get(key, ttl).await
    }

    #[instrument(skip(self), level = "debug")]
    async fn head(&self, key: &str) -> Result<Option<ObjectInfo>, VaultError> {
        self.bucket.head_object(key).await
    }

    #[instrument(skip(self), level = "debug")]
    async fn list(&self, prefix: &str) -> Result<Vec<ObjectInfo>, VaultError> {
        self.bucket.list_objects(prefix).await
    }
}

#[cfg(test)]
mod tests {
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use super::*;
    use crate::bucket::tests::bucket_at;

    #[tokio::test]
    async fn test_get_missing_object_is_not_found() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/vault/doc/missing.xlsx"))
            .respond_with(ResponseTemplate::new(404).set_body_string(
                "<Error><Code>NoSuchKey</Code><Message>missing</Message></Error>",
            ))
            .mount(&server)
            .await;

        let store = R2ObjectStore::new(bucket_at(&server.uri()));
        assert!(matches!(
            store.get("doc/missing.xlsx").await,
            Err(VaultError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_head_reports_etag_and_timestamp() {
        let server = MockServer::start().await;
        Mock::given(method("HEAD"))
            .and(path("/vault/doc/a.xlsx"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("ETag", "\"abc\"")
                    .insert_header("Last-Modified", "Wed, 21 Oct 2015 07:28:00 GMT"),
            )
            .mount(&server)
            .await;
        Mock::given(method("HEAD"))
            .and(path("/vault/doc/none.xlsx"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let store = R2ObjectStore::new(bucket_at(&server.uri()));
        let info = store.head("doc/a.xlsx").await.unwrap().unwrap();
        assert_eq!(info.etag.as_deref(), Some("\"abc\""));
        assert_eq!(info.last_modified.to_rfc3339(), "2015-10-21T07:28:00+00:00");
        assert!(!store.exists("doc/none.xlsx").await.unwrap());
    }

    #[tokio::test]
    async fn test_presign_is_offline_and_signed() {
        let store = R2ObjectStore::new(bucket_at("https://example.r2.cloudflarestorage.com"));
        let url = store
            .presign("doc/a.xlsx", Duration::from_secs(600))
            .await
            .unwrap();
        assert!(url.starts_with("https://example.r2.cloudflarestorage.com/vault/doc/a.xlsx?"));
        assert!(url.contains("X-Amz-Signature="));
        assert!(url.contains("X-Amz-Expires=600"));
    }
}
