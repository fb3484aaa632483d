use std::collections::HashMap;
use std::fmt::Debug;
use std::future::Future;
use std::time::Duration;

use aws_config::Region;
use aws_sdk_s3::config::retry::RetryConfig;
use aws_sdk_s3::config::timeout::TimeoutConfig;
use aws_sdk_s3::config::{BehaviorVersion, Credentials};
use aws_sdk_s3::error::SdkError;
use aws_sdk_s3::presigning::PresigningConfig;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::Client as S3Client;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::Serialize;
use sheetvault_core::{ObjectInfo, VaultError};
use tracing::{debug, warn};

/// Maximum retries for transient errors (429 / 5xx / timeouts).
const MAX_RETRIES: u32 = 3;
/// Base delay for exponential backoff.
const BASE_DELAY_MS: u64 = 200;
/// Maximum retries for CAS (compare-and-swap) loops.
const CAS_MAX_RETRIES: u32 = 10;

/// Connection settings for one R2 bucket.
#[derive(Debug, Clone)]
pub struct R2Settings {
    pub account_id: String,
    pub access_key_id: String,
    pub secret_access_key: String,
    pub bucket: String,
    /// Overrides the account endpoint (S3-compatible test servers)
    pub endpoint: Option<String>,
    pub timeout: Duration,
}

impl R2Settings {
    pub fn endpoint(&self) -> String {
        self.endpoint.clone().unwrap_or_else(|| {
            format!("https://{}.r2.cloudflarestorage.com", self.account_id)
        })
    }
}

/// S3 client bound to one bucket, with the retrying and conditional
/// primitives every R2 backend builds on.
#[derive(Clone)]
pub struct R2Bucket {
    client: S3Client,
    bucket: String,
}

impl R2Bucket {
    pub fn new(client: S3Client, bucket: String) -> Self {
        Self { client, bucket }
    }

    /// Build the S3 client for R2. Retries are handled here, not by the SDK.
    pub fn connect(settings: &R2Settings) -> Self {
        let credentials = Credentials::new(
            &settings.access_key_id,
            &settings.secret_access_key,
            None,
            None,
            "r2",
        );

        let timeouts = TimeoutConfig::builder()
            .connect_timeout(Duration::from_secs(5))
            .operation_timeout(settings.timeout)
            .build();

        let config = aws_sdk_s3::Config::builder()
            .behavior_version(BehaviorVersion::latest())
            .credentials_provider(credentials)
            .region(Region::new("auto"))
            .endpoint_url(settings.endpoint())
            .force_path_style(true)
            .timeout_config(timeouts)
            .retry_config(RetryConfig::disabled())
            .build();

        Self::new(S3Client::from_conf(config), settings.bucket.clone())
    }

    pub fn bucket_name(&self) -> &str {
        &self.bucket
    }

    // =========================================================================
    // R2 primitives with retry
    // =========================================================================

    /// Object body and ETag, or `None` when the key does not exist.
    pub(crate) async fn get_object(&self, key: &str) -> Result<Option<(Bytes, String)>, VaultError> {
        let result = send_with_retry("get_object", key, || {
            self.client
                .get_object()
                .bucket(&self.bucket)
                .key(key)
                .send()
        })
        .await;

        match result {
            Ok(output) => {
                let etag = output.e_tag().unwrap_or("").to_string();
                let data = output
                    .body
                    .collect()
                    .await
                    .map_err(|e| {
                        VaultError::UpstreamUnavailable(format!(
                            "Failed to read R2 object body for {}: {}",
                            key, e
                        ))
                    })?
                    .into_bytes();
                Ok(Some((data, etag)))
            }
            Err(e) if status_of(&e) == Some(404) => Ok(None),
            Err(e) => Err(classify("get_object", key, &e)),
        }
    }

    pub(crate) async fn head_object(&self, key: &str) -> Result<Option<ObjectInfo>, VaultError> {
        let result = send_with_retry("head_object", key, || {
            self.client
                .head_object()
                .bucket(&self.bucket)
                .key(key)
                .send()
        })
        .await;

        match result {
            Ok(output) => Ok(Some(ObjectInfo {
                key: key.to_string(),
                size_bytes: output.content_length.unwrap_or(0).max(0) as u64,
                last_modified: output
                    .last_modified
                    .as_ref()
                    .and_then(to_chrono)
                    .unwrap_or_else(Utc::now),
                etag: output.e_tag,
            })),
            Err(e) if status_of(&e) == Some(404) => Ok(None),
            Err(e) => Err(classify("head_object", key, &e)),
        }
    }

    pub(crate) async fn put_object(
        &self,
        key: &str,
        data: Bytes,
        content_type: &str,
        metadata: Option<&HashMap<String, String>>,
    ) -> Result<(), VaultError> {
        send_with_retry("put_object", key, || {
            self.client
                .put_object()
                .bucket(&self.bucket)
                .key(key)
                .content_type(content_type)
                .set_metadata(metadata.cloned())
                .body(ByteStream::from(data.clone()))
                .send()
        })
        .await
        .map(|_| ())
        .map_err(|e| classify("put_object", key, &e))
    }

    /// Conditionally put an object using ETag.
    ///
    /// - `Some(etag)`: `If-Match` (update the version we read).
    /// - `None`: `If-None-Match: *` (create, fail if it exists).
    ///
    /// Returns `Ok(false)` on 412 so callers can re-read and retry.
    pub(crate) async fn put_object_conditional(
        &self,
        key: &str,
        data: Vec<u8>,
        expected_etag: Option<&str>,
    ) -> Result<bool, VaultError> {
        let data = Bytes::from(data);
        let result = send_with_retry("put_object_conditional", key, || {
            let request = self
                .client
                .put_object()
                .bucket(&self.bucket)
                .key(key)
                .content_type("application/json")
                .body(ByteStream::from(data.clone()));
            let request = match expected_etag {
                Some(etag) => request.if_match(etag),
                None => request.if_none_match("*"),
            };
            request.send()
        })
        .await;

        match result {
            Ok(_) => Ok(true),
            Err(e) if is_precondition_failed(&e) => Ok(false),
            Err(e) => Err(classify("put_object_conditional", key, &e)),
        }
    }

    /// Delete an object. Missing keys are not an error.
    pub(crate) async fn delete_object(&self, key: &str) -> Result<(), VaultError> {
        let result = send_with_retry("delete_object", key, || {
            self.client
                .delete_object()
                .bucket(&self.bucket)
                .key(key)
                .send()
        })
        .await;

        match result {
            Ok(_) => Ok(()),
            Err(e) if status_of(&e) == Some(404) => Ok(()),
            Err(e) => Err(classify("delete_object", key, &e)),
        }
    }

    /// Every object under `prefix`, following continuation tokens.
    pub(crate) async fn list_objects(&self, prefix: &str) -> Result<Vec<ObjectInfo>, VaultError> {
        let mut objects = Vec::new();
        let mut continuation_token: Option<String> = None;

        loop {
            let token = continuation_token.take();
            let output = send_with_retry("list_objects", prefix, || {
                self.client
                    .list_objects_v2()
                    .bucket(&self.bucket)
                    .prefix(prefix)
                    .set_continuation_token(token.clone())
                    .send()
            })
            .await
            .map_err(|e| classify("list_objects", prefix, &e))?;

            if let Some(contents) = output.contents {
                for obj in contents {
                    if let Some(key) = obj.key {
                        objects.push(ObjectInfo {
                            key,
                            size_bytes: obj.size.unwrap_or(0).max(0) as u64,
                            last_modified: obj
                                .last_modified
                                .as_ref()
                                .and_then(to_chrono)
                                .unwrap_or_else(Utc::now),
                            etag: obj.e_tag,
                        });
                    }
                }
            }

            if output.is_truncated.unwrap_or(false) {
                continuation_token = output.next_continuation_token;
            } else {
                break;
            }
        }

        debug!(prefix, count = objects.len(), "Listed R2 objects");
        Ok(objects)
    }

    /// SigV4 query-presigned GET URL.
    pub(crate) async fn presign_get(&self, key: &str, ttl: Duration) -> Result<String, VaultError> {
        let config = PresigningConfig::expires_in(ttl).map_err(|e| {
            VaultError::ValidationFailed(format!("Invalid presign TTL {:?}: {}", ttl, e))
        })?;

        let request = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .presigned(config)
            .await
            .map_err(|e| classify("presign", key, &e))?;

        Ok(request.uri().to_string())
    }

    // =========================================================================
    // CAS (Compare-And-Swap) operations
    // =========================================================================

    /// Read a JSON control document.
    pub(crate) async fn read_json<T: DeserializeOwned>(
        &self,
        key: &str,
    ) -> Result<Option<T>, VaultError> {
        match self.get_object(key).await? {
            Some((data, _)) => Ok(Some(serde_json::from_slice(&data)?)),
            None => Ok(None),
        }
    }

    /// Atomically read-modify-write a JSON document using ETag-based CAS.
    ///
    /// 1. GET document with ETag (or `init()` when missing)
    /// 2. Apply `mutator`; an error aborts without writing
    /// 3. PUT with If-Match (or If-None-Match: * for new), skipped when
    ///    the mutation changed nothing
    /// 4. On 412, retry from step 1 (up to `CAS_MAX_RETRIES`)
    pub(crate) async fn cas_update<T, R, I, F>(
        &self,
        key: &str,
        init: I,
        mut mutator: F,
    ) -> Result<R, VaultError>
    where
        T: Serialize + DeserializeOwned,
        I: Fn() -> T,
        F: FnMut(&mut T) -> Result<R, VaultError>,
    {
        for attempt in 0..CAS_MAX_RETRIES {
            let (mut document, etag, original) = match self.get_object(key).await? {
                Some((data, etag)) => (serde_json::from_slice::<T>(&data)?, Some(etag), Some(data)),
                None => (init(), None, None),
            };

            let outcome = mutator(&mut document)?;

            let json = serde_json::to_vec(&document)?;
            if original.as_deref() == Some(json.as_slice()) {
                return Ok(outcome);
            }

            if self
                .put_object_conditional(key, json, etag.as_deref())
                .await?
            {
                debug!(attempt, key, "CAS update succeeded");
                return Ok(outcome);
            }

            warn!(attempt, key, "CAS conflict (412), retrying");
            backoff_sleep(attempt).await;
        }

        Err(VaultError::UpstreamUnavailable(format!(
            "CAS update of {} exhausted {} retries",
            key, CAS_MAX_RETRIES
        )))
    }

    /// Atomically append one line to a JSONL object holding at most
    /// `max_lines` lines. A full object is left untouched and `Ok(false)` is
    /// returned so the caller can continue in a fresh object.
    pub(crate) async fn cas_append_line(
        &self,
        key: &str,
        line: &[u8],
        max_lines: usize,
    ) -> Result<bool, VaultError> {
        for attempt in 0..CAS_MAX_RETRIES {
            let (data, etag) = match self.get_object(key).await? {
                Some((data, etag)) => (data.to_vec(), Some(etag)),
                None => (Vec::new(), None),
            };

            let Some(data) = append_line(data, line, max_lines) else {
                return Ok(false);
            };

            if self
                .put_object_conditional(key, data, etag.as_deref())
                .await?
            {
                return Ok(true);
            }

            warn!(attempt, key, "JSONL append conflict (412), retrying");
            backoff_sleep(attempt).await;
        }

        Err(VaultError::UpstreamUnavailable(format!(
            "Append to {} exhausted {} retries",
            key, CAS_MAX_RETRIES
        )))
    }
}

/// `existing` plus `line`, or `None` when `existing` already holds
/// `max_lines` lines. Existing content is never rewritten.
fn append_line(mut existing: Vec<u8>, line: &[u8], max_lines: usize) -> Option<Vec<u8>> {
    let lines = existing
        .split(|b| *b == b'\n')
        .filter(|l| !l.is_empty())
        .count();
    if lines >= max_lines {
        return None;
    }
    if !existing.is_empty() && !existing.ends_with(b"\n") {
        existing.push(b'\n');
    }
    existing.extend_from_slice(line);
    existing.push(b'\n');
    Some(existing)
}

/// Re-send on transient failures with exponential backoff.
async fn send_with_retry<T, E, F, Fut>(op: &str, key: &str, send: F) -> Result<T, SdkError<E>>
where
    F: Fn() -> Fut,
    Fut: Future<Output = Result<T, SdkError<E>>>,
    E: Debug,
{
    let mut attempt = 0;
    loop {
        match send().await {
            Err(e) if is_retryable(&e) && attempt < MAX_RETRIES => {
                warn!(attempt, op, key, "R2 retryable error, retrying");
                backoff_sleep(attempt).await;
                attempt += 1;
            }
            result => return result,
        }
    }
}

/// Sleep with exponential backoff + jitter.
async fn backoff_sleep(attempt: u32) {
    let base = Duration::from_millis(BASE_DELAY_MS * 2u64.pow(attempt.min(6)));
    let jitter = Duration::from_millis(rand_jitter());
    tokio::time::sleep(base + jitter).await;
}

/// Simple jitter: random-ish value 0..50ms using timestamp nanos.
fn rand_jitter() -> u64 {
    use std::time::SystemTime;
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .map(|d| d.subsec_nanos() as u64 % 50)
        .unwrap_or(0)
}

fn status_of<E: Debug>(err: &SdkError<E>) -> Option<u16> {
    match err {
        SdkError::ServiceError(e) => Some(e.raw().status().as_u16()),
        SdkError::ResponseError(e) => Some(e.raw().status().as_u16()),
        _ => None,
    }
}

/// 429, 5xx, timeouts and dispatch failures.
fn is_retryable<E: Debug>(err: &SdkError<E>) -> bool {
    match err {
        SdkError::TimeoutError(_) | SdkError::DispatchFailure(_) => true,
        _ => matches!(status_of(err), Some(status) if status == 429 || (500..=504).contains(&status)),
    }
}

fn is_precondition_failed<E: Debug>(err: &SdkError<E>) -> bool {
    status_of(err) == Some(412)
}

fn classify<E: Debug>(op: &str, key: &str, err: &SdkError<E>) -> VaultError
where
    SdkError<E>: std::fmt::Display,
{
    let context = format!("R2 {} {}: {}", op, key, err);
    match err {
        SdkError::TimeoutError(_) | SdkError::DispatchFailure(_) => {
            VaultError::UpstreamUnavailable(context)
        }
        _ => match status_of(err) {
            Some(status) => VaultError::from_http_status(status, context),
            None => VaultError::Internal(context),
        },
    }
}

fn to_chrono(dt: &aws_sdk_s3::primitives::DateTime) -> Option<DateTime<Utc>> {
    DateTime::from_timestamp(dt.secs(), dt.subsec_nanos())
}

#[cfg(test)]
pub(crate) mod tests {
    use sheetvault_core::sync::SyncRecordTable;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use super::*;

    pub(crate) fn bucket_at(uri: &str) -> R2Bucket {
        R2Bucket::connect(&R2Settings {
            account_id: "test-account".to_string(),
            access_key_id: "test-key".to_string(),
            secret_access_key: "test-secret".to_string(),
            bucket: "vault".to_string(),
            endpoint: Some(uri.to_string()),
            timeout: Duration::from_secs(5),
        })
    }

    #[test]
    fn test_default_endpoint_uses_account() {
        let settings = R2Settings {
            account_id: "abc123".to_string(),
            access_key_id: String::new(),
            secret_access_key: String::new(),
            bucket: "vault".to_string(),
            endpoint: None,
            timeout: Duration::from_secs(30),
        };
        assert_eq!(settings.endpoint(), "https://abc123.r2.cloudflarestorage.com");
    }

    #[tokio::test]
    async fn test_get_object_returns_body_and_etag() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/vault/doc/a.xlsx"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("ETag", "\"v1\"")
                    .set_body_bytes(b"workbook".to_vec()),
            )
            .mount(&server)
            .await;

        let bucket = bucket_at(&server.uri());
        let (data, etag) = bucket.get_object("doc/a.xlsx").await.unwrap().unwrap();
        assert_eq!(data, Bytes::from_static(b"workbook"));
        assert_eq!(etag, "\"v1\"");
    }

    #[tokio::test]
    async fn test_missing_object_is_none() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/vault/doc/missing.xlsx"))
            .respond_with(ResponseTemplate::new(404).set_body_string(
                "<Error><Code>NoSuchKey</Code><Message>missing</Message></Error>",
            ))
            .mount(&server)
            .await;

        let bucket = bucket_at(&server.uri());
        assert!(bucket.get_object("doc/missing.xlsx").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_forbidden_maps_to_permission_denied() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/vault/doc/secret.xlsx"))
            .respond_with(ResponseTemplate::new(403).set_body_string(
                "<Error><Code>AccessDenied</Code><Message>denied</Message></Error>",
            ))
            .mount(&server)
            .await;

        let bucket = bucket_at(&server.uri());
        assert!(matches!(
            bucket.get_object("doc/secret.xlsx").await,
            Err(VaultError::PermissionDenied(_))
        ));
    }

    #[tokio::test]
    async fn test_cas_update_retries_after_precondition_failed() {
        let server = MockServer::start().await;
        let key = "_sheetvault/sync/records.json";
        Mock::given(method("GET"))
            .and(path(format!("/vault/{}", key)))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("ETag", "\"v1\"")
                    .set_body_string("{\"records\":{}}"),
            )
            .mount(&server)
            .await;
        Mock::given(method("PUT"))
            .and(path(format!("/vault/{}", key)))
            .respond_with(ResponseTemplate::new(412).set_body_string(
                "<Error><Code>PreconditionFailed</Code><Message>etag</Message></Error>",
            ))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("PUT"))
            .and(path(format!("/vault/{}", key)))
            .respond_with(ResponseTemplate::new(200).insert_header("ETag", "\"v2\""))
            .mount(&server)
            .await;

        let bucket = bucket_at(&server.uri());
        let updated = bucket
            .cas_update(key, SyncRecordTable::default, |table: &mut SyncRecordTable| {
                table.upsert(sheetvault_core::FileSyncRecord::pending("doc/a.xlsx", "a.xlsx"));
                Ok(table.records.len())
            })
            .await
            .unwrap();
        assert_eq!(updated, 1);

        let puts = server
            .received_requests()
            .await
            .unwrap()
            .into_iter()
            .filter(|r| r.method.as_str() == "PUT")
            .count();
        assert_eq!(puts, 2);
    }

    #[test]
    fn test_append_line_never_rewrites_full_object() {
        let first = append_line(Vec::new(), b"{\"n\":1}", 2).unwrap();
        assert_eq!(first, b"{\"n\":1}\n".to_vec());

        let second = append_line(first, b"{\"n\":2}", 2).unwrap();
        assert_eq!(second, b"{\"n\":1}\n{\"n\":2}\n".to_vec());

        assert!(append_line(second.clone(), b"{\"n\":3}", 2).is_none());

        // A missing trailing newline is repaired, not overwritten.
        let repaired = append_line(b"{\"n\":1}".to_vec(), b"{\"n\":2}", 5).unwrap();
        assert_eq!(repaired, second);
    }

    #[tokio::test]
    async fn test_cas_update_skips_write_when_unchanged() {
        let server = MockServer::start().await;
        let key = "_sheetvault/sync/records.json";
        Mock::given(method("GET"))
            .and(path(format!("/vault/{}", key)))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("ETag", "\"v1\"")
                    .set_body_string("{\"records\":{}}"),
            )
            .mount(&server)
            .await;

        let bucket = bucket_at(&server.uri());
        bucket
            .cas_update(key, SyncRecordTable::default, |_: &mut SyncRecordTable| Ok(()))
            .await
            .unwrap();

        let requests = server.received_requests().await.unwrap();
        assert!(requests.iter().all(|r| r.method.as_str() == "GET"));
    }
}
