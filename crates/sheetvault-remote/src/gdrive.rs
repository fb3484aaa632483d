//! Google Drive API v3 as a backup store.
//!
//! Every key maps to one file name inside a single configured folder. Drive
//! identifies files by id, so each operation first resolves the name.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::{BufMut, Bytes, BytesMut};
use chrono::{DateTime, Utc};
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use serde_json::json;
use sheetvault_core::{ObjectInfo, ObjectStore, VaultError};
use tracing::{debug, instrument};
use uuid::Uuid;

use crate::http::{ensure_success, read_json, send_authorized, transport_error};
use crate::token_manager::TokenManager;

const DRIVE_API_BASE: &str = "https://www.googleapis.com/drive/v3";
const DRIVE_UPLOAD_BASE: &str = "https://www.googleapis.com/upload/drive/v3";
const FOLDER_MIME_TYPE: &str = "application/vnd.google-apps.folder";
const FILE_FIELDS: &str = "id,name,size,modifiedTime,webContentLink";

/// Metadata returned by Google Drive API.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DriveFile {
    id: String,
    name: String,
    #[serde(default)]
    size: Option<String>,
    #[serde(default)]
    modified_time: Option<String>,
    #[serde(default)]
    web_content_link: Option<String>,
}

impl DriveFile {
    fn info(&self) -> ObjectInfo {
        ObjectInfo {
            key: self.name.clone(),
            size_bytes: self
                .size
                .as_deref()
                .and_then(|s| s.parse().ok())
                .unwrap_or(0),
            last_modified: self
                .modified_time
                .as_deref()
                .and_then(|t| DateTime::parse_from_rfc3339(t).ok())
                .map(|t| t.with_timezone(&Utc))
                .unwrap_or_default(),
            etag: Some(self.id.clone()),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FileList {
    #[serde(default)]
    files: Vec<DriveFile>,
    #[serde(default)]
    next_page_token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CreatedFile {
    id: String,
}

/// Backup mirror in one Google Drive folder.
pub struct GDriveBackupStore {
    http: Client,
    tokens: Arc<TokenManager>,
    folder_id: String,
    api_base: String,
    upload_base: String,
}

impl GDriveBackupStore {
    pub fn new(http: Client, tokens: Arc<TokenManager>, folder_id: impl Into<String>) -> Self {
        Self {
            http,
            tokens,
            folder_id: folder_id.into(),
            api_base: DRIVE_API_BASE.to_string(),
            upload_base: DRIVE_UPLOAD_BASE.to_string(),
        }
    }

    /// Point the client at other API hosts (tests, proxies).
    pub fn with_base_urls(mut self, api_base: &str, upload_base: &str) -> Self {
        self.api_base = api_base.trim_end_matches('/').to_string();
        self.upload_base = upload_base.trim_end_matches('/').to_string();
        self
    }

    fn folder_query(&self) -> String {
        format!(
            "'{}' in parents and trashed = false and mimeType != '{}'",
            escape_query(&self.folder_id),
            FOLDER_MIME_TYPE
        )
    }

    /// Resolve a key to its Drive file, if any.
    async fn find_file(&self, key: &str) -> Result<Option<DriveFile>, VaultError> {
        let query = format!("name = '{}' and {}", escape_query(key), self.folder_query());
        let url = format!("{}/files", self.api_base);
        let fields = format!("files({})", FILE_FIELDS);

        let resp = send_authorized(&self.http, &self.tokens, "Drive file lookup", |http| {
            http.get(&url).query(&[
                ("q", query.as_str()),
                ("fields", fields.as_str()),
                ("pageSize", "1"),
            ])
        })
        .await?;
        let resp = ensure_success(resp, "Drive file lookup").await?;
        let list: FileList = read_json(resp, "Drive file lookup").await?;
        Ok(list.files.into_iter().next())
    }

    async fn require_file(&self, key: &str) -> Result<DriveFile, VaultError> {
        self.find_file(key)
            .await?
            .ok_or_else(|| VaultError::NotFound(format!("Backup file not found: {}", key)))
    }
}

#[async_trait]
impl ObjectStore for GDriveBackupStore {
    fn backend_name(&self) -> &'static str {
        "gdrive"
    }

    #[instrument(skip(self), level = "debug")]
    async fn get(&self, key: &str) -> Result<Bytes, VaultError> {
        let file = self.require_file(key).await?;
        let url = format!("{}/files/{}", self.api_base, file.id);

        let resp = send_authorized(&self.http, &self.tokens, "Drive download", |http| {
            http.get(&url).query(&[("alt", "media")])
        })
        .await?;
        let resp = ensure_success(resp, "Drive download").await?;
        let data = resp
            .bytes()
            .await
            .map_err(|e| transport_error("Drive download", e))?;
        debug!("Downloaded {} bytes for file {}", data.len(), file.id);
        Ok(data)
    }

    #[instrument(skip(self, data, metadata), level = "debug", fields(data_len = data.len()))]
    async fn put(
        &self,
        key: &str,
        data: Bytes,
        content_type: &str,
        metadata: Option<&HashMap<String, String>>,
    ) -> Result<(), VaultError> {
        let existing = self.find_file(key).await?;
        let app_properties = metadata.cloned().unwrap_or_default();

        let (description, file_meta) = match &existing {
            Some(_) => ("Drive update", json!({ "appProperties": app_properties })),
            None => (
                "Drive create",
                json!({
                    "name": key,
                    "parents": [self.folder_id],
                    "mimeType": content_type,
                    "appProperties": app_properties,
                }),
            ),
        };
        let boundary = format!("sheetvault_{}", Uuid::new_v4().simple());
        let body = multipart_related(&boundary, &file_meta, &data, content_type)?;
        let multipart_type = format!("multipart/related; boundary={}", boundary);

        let resp = match &existing {
            Some(file) => {
                let url = format!("{}/files/{}", self.upload_base, file.id);
                send_authorized(&self.http, &self.tokens, description, |http| {
                    http.patch(&url)
                        .query(&[("uploadType", "multipart"), ("fields", "id")])
                        .header(reqwest::header::CONTENT_TYPE, &multipart_type)
                        .body(body.clone())
                })
                .await?
            }
            None => {
                let url = format!("{}/files", self.upload_base);
                send_authorized(&self.http, &self.tokens, description, |http| {
                    http.post(&url)
                        .query(&[("uploadType", "multipart"), ("fields", "id")])
                        .header(reqwest::header::CONTENT_TYPE, &multipart_type)
                        .body(body.clone())
                })
                .await?
            }
        };
        let resp = ensure_success(resp, description).await?;
        let created: CreatedFile = read_json(resp, description).await?;
        debug!(file_id = %created.id, "{} of {} ({} bytes)", description, key, data.len());
        Ok(())
    }

    #[instrument(skip(self), level = "debug")]
    async fn delete(&self, key: &str) -> Result<(), VaultError> {
        let Some(file) = self.find_file(key).await? else {
            return Ok(());
        };
        let url = format!("{}/files/{}", self.api_base, file.id);
        let resp = send_authorized(&self.http, &self.tokens, "Drive delete", |http| {
            http.delete(&url)
        })
        .await?;
        if resp.status() == StatusCode::NOT_FOUND {
            return Ok(());
        }
        ensure_success(resp, "Drive delete").await?;
        Ok(())
    }

    /// Drive has no expiring links; the TTL is ignored and the file's
    /// download link is returned.
    #[instrument(skip(self), level = "debug")]
    async fn presign(&self, key: &str, _ttl: Duration) -> Result<String, VaultError> {
        let file = self.require_file(key).await?;
        Ok(file.web_content_link.unwrap_or_else(|| {
            format!(
                "https://drive.google.com/uc?id={}&export=download",
                file.id
            )
        }))
    }

    #[instrument(skip(self), level = "debug")]
    async fn head(&self, key: &str) -> Result<Option<ObjectInfo>, VaultError> {
        Ok(self.find_file(key).await?.map(|file| file.info()))
    }

    #[instrument(skip(self), level = "debug")]
    async fn list(&self, prefix: &str) -> Result<Vec<ObjectInfo>, VaultError> {
        let url = format!("{}/files", self.api_base);
        let query = self.folder_query();
        let fields = format!("nextPageToken,files({})", FILE_FIELDS);
        let mut objects = Vec::new();
        let mut page_token: Option<String> = None;

        loop {
            let resp = send_authorized(&self.http, &self.tokens, "Drive list", |http| {
                let mut request = http.get(&url).query(&[
                    ("q", query.as_str()),
                    ("fields", fields.as_str()),
                    ("pageSize", "1000"),
                ]);
                if let Some(token) = &page_token {
                    request = request.query(&[("pageToken", token.as_str())]);
                }
                request
            })
            .await?;
            let resp = ensure_success(resp, "Drive list").await?;
            let page: FileList = read_json(resp, "Drive list").await?;

            objects.extend(
                page.files
                    .iter()
                    .filter(|f| f.name.starts_with(prefix))
                    .map(DriveFile::info),
            );

            match page.next_page_token {
                Some(token) if !token.is_empty() => page_token = Some(token),
                _ => break,
            }
        }

        debug!("Listed {} backup files under '{}'", objects.len(), prefix);
        Ok(objects)
    }
}

/// Escape a literal for a Drive `q` expression.
fn escape_query(value: &str) -> String {
    value.replace('\\', "\\\\").replace('\'', "\\'")
}

/// `multipart/related` body: JSON metadata part, then the media part.
fn multipart_related(
    boundary: &str,
    metadata: &serde_json::Value,
    data: &[u8],
    content_type: &str,
) -> Result<Bytes, VaultError> {
    let meta = serde_json::to_vec(metadata)?;
    let mut body = BytesMut::with_capacity(meta.len() + data.len() + 256);
    body.put_slice(format!("--{}\r\n", boundary).as_bytes());
    body.put_slice(b"Content-Type: application/json; charset=UTF-8\r\n\r\n");
    body.put_slice(&meta);
    body.put_slice(format!("\r\n--{}\r\n", boundary).as_bytes());
    body.put_slice(format!("Content-Type: {}\r\n\r\n", content_type).as_bytes());
    body.put_slice(data);
    body.put_slice(format!("\r\n--{}--\r\n", boundary).as_bytes());
    Ok(body.freeze())
}
