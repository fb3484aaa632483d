//! Microsoft Graph (OneDrive / SharePoint drive) as the editing surface.
//!
//! Working copies live in one temp folder of one drive. Workbook edits go
//! through persistent workbook sessions; copies complete asynchronously and
//! are watched through the monitor URL Graph hands back.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use reqwest::header::{CONTENT_RANGE, CONTENT_TYPE, LOCATION};
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::json;
use sheetvault_core::{
    EditingSurface, ExportFormat, LayoutOperation, RemoteItem, VaultError, XLSX_CONTENT_TYPE,
};
use tracing::{debug, info, instrument, warn};

use crate::http::{ensure_success, read_json, send_authorized, transport_error};
use crate::token_manager::TokenManager;

const GRAPH_BASE: &str = "https://graph.microsoft.com/v1.0";
const SESSION_HEADER: &str = "workbook-session-id";
/// Largest body Graph accepts on a simple PUT upload.
const SIMPLE_UPLOAD_LIMIT: usize = 4 * 1024 * 1024;
/// Upload-session chunk size; must be a multiple of 320 KiB.
const UPLOAD_CHUNK: usize = 5 * 1024 * 1024;
const COPY_POLL_INTERVAL: Duration = Duration::from_secs(1);
const COPY_POLL_ATTEMPTS: u32 = 30;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DriveItem {
    id: String,
    #[serde(default)]
    name: String,
    #[serde(default)]
    size: u64,
    #[serde(default)]
    last_modified_date_time: Option<DateTime<Utc>>,
}

impl From<DriveItem> for RemoteItem {
    fn from(item: DriveItem) -> Self {
        RemoteItem {
            id: item.id,
            name: item.name,
            size_bytes: item.size,
            last_modified: item.last_modified_date_time,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UploadSession {
    upload_url: String,
}

#[derive(Debug, Deserialize)]
struct WorkbookSession {
    id: String,
}

/// Copy monitor status. A monitor that already redirected to the new item
/// carries the item's `id` instead.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CopyMonitor {
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    resource_id: Option<String>,
    #[serde(default)]
    id: Option<String>,
}

/// Change-notification subscription on the drive root.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Subscription {
    pub id: String,
    pub expiration_date_time: DateTime<Utc>,
    #[serde(default)]
    pub resource: Option<String>,
}

pub struct GraphEditingSurface {
    http: Client,
    tokens: Arc<TokenManager>,
    base_url: String,
    drive_id: String,
    temp_folder: String,
    copy_poll_interval: Duration,
    copy_poll_attempts: u32,
}

impl GraphEditingSurface {
    pub fn new(
        http: Client,
        tokens: Arc<TokenManager>,
        drive_id: impl Into<String>,
        temp_folder: impl Into<String>,
    ) -> Self {
        Self {
            http,
            tokens,
            base_url: GRAPH_BASE.to_string(),
            drive_id: drive_id.into(),
            temp_folder: temp_folder.into().trim_matches('/').to_string(),
            copy_poll_interval: COPY_POLL_INTERVAL,
            copy_poll_attempts: COPY_POLL_ATTEMPTS,
        }
    }

    pub fn with_base_url(mut self, base_url: &str) -> Self {
        self.base_url = base_url.trim_end_matches('/').to_string();
        self
    }

    pub fn with_copy_poll(mut self, interval: Duration, attempts: u32) -> Self {
        self.copy_poll_interval = interval;
        self.copy_poll_attempts = attempts;
        self
    }

    fn drive_url(&self) -> String {
        format!("{}/drives/{}", self.base_url, self.drive_id)
    }

    fn item_url(&self, item_id: &str) -> String {
        format!("{}/items/{}", self.drive_url(), item_id)
    }

    fn temp_path(&self, name: &str) -> String {
        format!(
            "{}/root:/{}/{}:",
            self.drive_url(),
            self.temp_folder,
            urlencoding::encode(name)
        )
    }

    async fn get_item(&self, item_id: &str) -> Result<RemoteItem, VaultError> {
        let url = self.item_url(item_id);
        let resp = send_authorized(&self.http, &self.tokens, "Graph item lookup", |http| {
            http.get(&url)
        })
        .await?;
        let resp = ensure_success(resp, "Graph item lookup").await?;
        let item: DriveItem = read_json(resp, "Graph item lookup").await?;
        Ok(item.into())
    }

    /// Large files go through an upload session in fixed-size chunks. The
    /// session URL is pre-authorized, so chunks carry no bearer token.
    async fn upload_in_chunks(&self, name: &str, data: Bytes) -> Result<RemoteItem, VaultError> {
        let url = format!("{}/createUploadSession", self.temp_path(name));
        let resp = send_authorized(&self.http, &self.tokens, "Graph upload session", |http| {
            http.post(&url).json(&json!({
                "item": { "@microsoft.graph.conflictBehavior": "replace" }
            }))
        })
        .await?;
        let resp = ensure_success(resp, "Graph upload session").await?;
        let session: UploadSession = read_json(resp, "Graph upload session").await?;

        let total = data.len();
        let mut start = 0;
        while start < total {
            let end = usize::min(start + UPLOAD_CHUNK, total);
            let resp = self
                .http
                .put(&session.upload_url)
                .header(
                    CONTENT_RANGE,
                    format!("bytes {}-{}/{}", start, end - 1, total),
                )
                .body(data.slice(start..end))
                .send()
                .await
                .map_err(|e| transport_error("Graph chunk upload", e))?;
            let resp = ensure_success(resp, "Graph chunk upload").await?;

            if end == total {
                let item: DriveItem = read_json(resp, "Graph chunk upload").await?;
                return Ok(item.into());
            }
            debug!("Uploaded chunk {}-{} of {}", start, end - 1, total);
            start = end;
        }

        Err(VaultError::ValidationFailed(
            "Cannot upload an empty file through an upload session".to_string(),
        ))
    }

    async fn wait_for_copy(&self, monitor_url: &str) -> Result<String, VaultError> {
        for attempt in 1..=self.copy_poll_attempts {
            tokio::time::sleep(self.copy_poll_interval).await;

            let resp = self
                .http
                .get(monitor_url)
                .send()
                .await
                .map_err(|e| transport_error("Graph copy monitor", e))?;
            let resp = ensure_success(resp, "Graph copy monitor").await?;
            let monitor: CopyMonitor = read_json(resp, "Graph copy monitor").await?;

            match monitor.status.as_deref() {
                Some("completed") => {
                    if let Some(id) = monitor.resource_id {
                        return Ok(id);
                    }
                }
                Some("failed") => {
                    return Err(VaultError::UpstreamUnavailable(format!(
                        "Graph copy failed (monitor {})",
                        monitor_url
                    )));
                }
                Some(_) => {}
                None => {
                    if let Some(id) = monitor.id {
                        return Ok(id);
                    }
                }
            }
            debug!(attempt, "Copy still in progress");
        }

        Err(VaultError::UpstreamUnavailable(format!(
            "Graph copy did not complete after {} polls",
            self.copy_poll_attempts
        )))
    }

    /// Subscribe to change notifications for the whole drive.
    #[instrument(skip(self, client_state), level = "debug")]
    pub async fn create_subscription(
        &self,
        notification_url: &str,
        client_state: &str,
        expires_at: DateTime<Utc>,
    ) -> Result<Subscription, VaultError> {
        let url = format!("{}/subscriptions", self.base_url);
        let body = json!({
            "changeType": "updated",
            "notificationUrl": notification_url,
            "resource": format!("/drives/{}/root", self.drive_id),
            "expirationDateTime": expires_at,
            "clientState": client_state,
        });
        let resp = send_authorized(&self.http, &self.tokens, "Graph subscribe", |http| {
            http.post(&url).json(&body)
        })
        .await?;
        let resp = ensure_success(resp, "Graph subscribe").await?;
        let subscription: Subscription = read_json(resp, "Graph subscribe").await?;
        info!(
            subscription_id = %subscription.id,
            expires_at = %subscription.expiration_date_time,
            "Created Graph subscription"
        );
        Ok(subscription)
    }

    #[instrument(skip(self), level = "debug")]
    pub async fn renew_subscription(
        &self,
        subscription_id: &str,
        expires_at: DateTime<Utc>,
    ) -> Result<Subscription, VaultError> {
        let url = format!("{}/subscriptions/{}", self.base_url, subscription_id);
        let body = json!({ "expirationDateTime": expires_at });
        let resp = send_authorized(&self.http, &self.tokens, "Graph renew subscription", |http| {
            http.patch(&url).json(&body)
        })
        .await?;
        let resp = ensure_success(resp, "Graph renew subscription").await?;
        read_json(resp, "Graph renew subscription").await
    }
}

#[async_trait]
impl EditingSurface for GraphEditingSurface {
    fn surface_name(&self) -> &'static str {
        "graph"
    }

    #[instrument(skip(self, data), level = "debug", fields(data_len = data.len()))]
    async fn upload_temp(&self, name: &str, data: Bytes) -> Result<RemoteItem, VaultError> {
        if data.len() > SIMPLE_UPLOAD_LIMIT {
            return self.upload_in_chunks(name, data).await;
        }

        let url = format!("{}/content", self.temp_path(name));
        let resp = send_authorized(&self.http, &self.tokens, "Graph upload", |http| {
            http.put(&url)
                .header(CONTENT_TYPE, XLSX_CONTENT_TYPE)
                .body(data.clone())
        })
        .await?;
        let resp = ensure_success(resp, "Graph upload").await?;
        let item: DriveItem = read_json(resp, "Graph upload").await?;
        debug!(item_id = %item.id, "Uploaded working copy {}", name);
        Ok(item.into())
    }

    #[instrument(skip(self), level = "debug")]
    async fn copy_item(&self, item_id: &str, new_name: &str) -> Result<RemoteItem, VaultError> {
        let url = format!("{}/copy", self.item_url(item_id));
        let body = json!({ "name": new_name });
        let resp = send_authorized(&self.http, &self.tokens, "Graph copy", |http| {
            http.post(&url).json(&body)
        })
        .await?;
        let resp = ensure_success(resp, "Graph copy").await?;

        let monitor_url = resp
            .headers()
            .get(LOCATION)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
            .ok_or_else(|| {
                VaultError::UpstreamUnavailable("Graph copy returned no monitor URL".to_string())
            })?;

        let new_id = self.wait_for_copy(&monitor_url).await?;
        self.get_item(&new_id).await
    }

    #[instrument(skip(self), level = "debug")]
    async fn open_session(&self, item_id: &str) -> Result<String, VaultError> {
        let url = format!("{}/workbook/createSession", self.item_url(item_id));
        let resp = send_authorized(&self.http, &self.tokens, "Graph create session", |http| {
            http.post(&url).json(&json!({ "persistChanges": true }))
        })
        .await?;
        let resp = ensure_success(resp, "Graph create session").await?;
        let session: WorkbookSession = read_json(resp, "Graph create session").await?;
        Ok(session.id)
    }

    #[instrument(skip(self, session_id, operation), level = "debug", fields(worksheet = %operation.worksheet, address = %operation.address))]
    async fn apply_layout(
        &self,
        item_id: &str,
        session_id: &str,
        operation: &LayoutOperation,
    ) -> Result<(), VaultError> {
        let url = format!(
            "{}/workbook/worksheets/{}/range(address='{}')/format",
            self.item_url(item_id),
            urlencoding::encode(&operation.worksheet),
            urlencoding::encode(&operation.address.replace('\'', "''"))
        );
        let resp = send_authorized(&self.http, &self.tokens, "Graph range format", |http| {
            http.patch(&url)
                .header(SESSION_HEADER, session_id)
                .json(&operation.format)
        })
        .await?;
        ensure_success(resp, "Graph range format").await?;
        Ok(())
    }

    #[instrument(skip(self, session_id), level = "debug")]
    async fn close_session(&self, item_id: &str, session_id: &str) -> Result<(), VaultError> {
        let url = format!("{}/workbook/closeSession", self.item_url(item_id));
        let resp = send_authorized(&self.http, &self.tokens, "Graph close session", |http| {
            http.post(&url)
                .header(SESSION_HEADER, session_id)
                .json(&json!({}))
        })
        .await?;
        ensure_success(resp, "Graph close session").await?;
        Ok(())
    }

    #[instrument(skip(self), level = "debug")]
    async fn download(&self, item_id: &str) -> Result<Bytes, VaultError> {
        let url = format!("{}/content", self.item_url(item_id));
        let resp = send_authorized(&self.http, &self.tokens, "Graph download", |http| {
            http.get(&url)
        })
        .await?;
        let resp = ensure_success(resp, "Graph download").await?;
        resp.bytes()
            .await
            .map_err(|e| transport_error("Graph download", e))
    }

    #[instrument(skip(self), level = "debug")]
    async fn export(&self, item_id: &str, format: ExportFormat) -> Result<Bytes, VaultError> {
        let url = format!("{}/content", self.item_url(item_id));
        let resp = send_authorized(&self.http, &self.tokens, "Graph export", |http| {
            http.get(&url).query(&[("format", format.as_str())])
        })
        .await?;
        let resp = ensure_success(resp, "Graph export").await?;
        resp.bytes()
            .await
            .map_err(|e| transport_error("Graph export", e))
    }

    #[instrument(skip(self), level = "debug")]
    async fn delete(&self, item_id: &str) -> Result<(), VaultError> {
        let url = self.item_url(item_id);
        let resp = send_authorized(&self.http, &self.tokens, "Graph delete", |http| {
            http.delete(&url)
        })
        .await?;
        if resp.status() == StatusCode::NOT_FOUND {
            warn!(item_id, "Working copy already gone");
            return Ok(());
        }
        ensure_success(resp, "Graph delete").await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;
    use wiremock::matchers::{body_json, header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use super::*;
    use crate::token_manager::TokenGrant;

    async fn surface(server: &MockServer) -> GraphEditingSurface {
        Mock::given(method("POST"))
            .and(path("/token"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "access_token": "graph-token",
                "expires_in": 3600
            })))
            .mount(server)
            .await;
        let grant = TokenGrant::microsoft("tenant", "cid", "secret")
            .with_token_url(&format!("{}/token", server.uri()));
        let tokens = Arc::new(TokenManager::new(Client::new(), grant));
        GraphEditingSurface::new(Client::new(), tokens, "d1", "/sheetvault-tmp/")
            .with_base_url(&server.uri())
            .with_copy_poll(Duration::from_millis(5), 3)
    }

    fn item(id: &str, name: &str) -> serde_json::Value {
        json!({
            "id": id,
            "name": name,
            "size": 4,
            "lastModifiedDateTime": "2026-05-01T08:00:00Z"
        })
    }

    #[tokio::test]
    async fn test_simple_upload_into_temp_folder() {
        let server = MockServer::start().await;
        let surface = surface(&server).await;
        Mock::given(method("PUT"))
            .and(path("/drives/d1/root:/sheetvault-tmp/a.xlsx:/content"))
            .and(header("authorization", "Bearer graph-token"))
            .respond_with(ResponseTemplate::new(201).set_body_json(item("i-1", "a.xlsx")))
            .expect(1)
            .mount(&server)
            .await;

        let uploaded = surface
            .upload_temp("a.xlsx", Bytes::from_static(b"XLSX"))
            .await
            .unwrap();
        assert_eq!(uploaded.id, "i-1");
        assert_eq!(uploaded.size_bytes, 4);
        assert!(uploaded.last_modified.is_some());
    }

    #[tokio::test]
    async fn test_large_upload_uses_session() {
        let server = MockServer::start().await;
        let surface = surface(&server).await;
        let total = SIMPLE_UPLOAD_LIMIT + 1;
        Mock::given(method("POST"))
            .and(path("/drives/d1/root:/sheetvault-tmp/big.xlsx:/createUploadSession"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "uploadUrl": format!("{}/upload-session/1", server.uri())
            })))
            .mount(&server)
            .await;
        Mock::given(method("PUT"))
            .and(path("/upload-session/1"))
            .and(header(
                "content-range",
                format!("bytes 0-{}/{}", total - 1, total).as_str(),
            ))
            .respond_with(ResponseTemplate::new(201).set_body_json(item("big-1", "big.xlsx")))
            .expect(1)
            .mount(&server)
            .await;

        let uploaded = surface
            .upload_temp("big.xlsx", Bytes::from(vec![7u8; total]))
            .await
            .unwrap();
        assert_eq!(uploaded.id, "big-1");
    }

    #[tokio::test]
    async fn test_copy_follows_monitor_until_completed() {
        let server = MockServer::start().await;
        let surface = surface(&server).await;
        Mock::given(method("POST"))
            .and(path("/drives/d1/items/i-1/copy"))
            .and(body_json(json!({"name": "fork.xlsx"})))
            .respond_with(
                ResponseTemplate::new(202)
                    .insert_header("Location", format!("{}/monitor/7", server.uri()).as_str()),
            )
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/monitor/7"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "status": "completed",
                "resourceId": "i-2"
            })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/drives/d1/items/i-2"))
            .respond_with(ResponseTemplate::new(200).set_body_json(item("i-2", "fork.xlsx")))
            .mount(&server)
            .await;

        let copied = surface.copy_item("i-1", "fork.xlsx").await.unwrap();
        assert_eq!(copied.id, "i-2");
        assert_eq!(copied.name, "fork.xlsx");
    }

    #[tokio::test]
    async fn test_copy_gives_up_after_bounded_polls() {
        let server = MockServer::start().await;
        let surface = surface(&server).await;
        Mock::given(method("POST"))
            .and(path("/drives/d1/items/i-1/copy"))
            .respond_with(
                ResponseTemplate::new(202)
                    .insert_header("Location", format!("{}/monitor/slow", server.uri()).as_str()),
            )
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/monitor/slow"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "status": "inProgress",
                "percentageComplete": 10.0
            })))
            .expect(3)
            .mount(&server)
            .await;

        let err = surface.copy_item("i-1", "fork.xlsx").await.unwrap_err();
        assert!(matches!(err, VaultError::UpstreamUnavailable(_)));
    }

    #[tokio::test]
    async fn test_session_layout_close_carry_session_header() {
        let server = MockServer::start().await;
        let surface = surface(&server).await;
        Mock::given(method("POST"))
            .and(path("/drives/d1/items/i-1/workbook/createSession"))
            .and(body_json(json!({"persistChanges": true})))
            .respond_with(ResponseTemplate::new(201).set_body_json(json!({"id": "wb-1"})))
            .mount(&server)
            .await;
        Mock::given(method("PATCH"))
            .and(path(
                "/drives/d1/items/i-1/workbook/worksheets/Sheet1/range(address='A1%3AC3')/format",
            ))
            .and(header(SESSION_HEADER, "wb-1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({})))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/drives/d1/items/i-1/workbook/closeSession"))
            .and(header(SESSION_HEADER, "wb-1"))
            .respond_with(ResponseTemplate::new(204))
            .expect(1)
            .mount(&server)
            .await;

        let session = surface.open_session("i-1").await.unwrap();
        assert_eq!(session, "wb-1");
        let op = LayoutOperation {
            worksheet: "Sheet1".to_string(),
            address: "A1:C3".to_string(),
            format: json!({"columnWidth": 120}),
        };
        surface.apply_layout("i-1", &session, &op).await.unwrap();
        surface.close_session("i-1", &session).await.unwrap();
    }

    #[tokio::test]
    async fn test_rejected_layout_is_validation_failure() {
        let server = MockServer::start().await;
        let surface = surface(&server).await;
        Mock::given(method("PATCH"))
            .respond_with(ResponseTemplate::new(400).set_body_json(json!({
                "error": {"code": "InvalidArgument"}
            })))
            .mount(&server)
            .await;

        let op = LayoutOperation {
            worksheet: "Nope".to_string(),
            address: "ZZ".to_string(),
            format: json!({}),
        };
        assert!(matches!(
            surface.apply_layout("i-1", "wb-1", &op).await,
            Err(VaultError::ValidationFailed(_))
        ));
    }

    #[tokio::test]
    async fn test_export_and_download() {
        let server = MockServer::start().await;
        let surface = surface(&server).await;
        Mock::given(method("GET"))
            .and(path("/drives/d1/items/i-1/content"))
            .and(query_param("format", "pdf"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(b"%PDF-1.7".to_vec()))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/drives/d1/items/i-1/content"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(b"XLSX".to_vec()))
            .mount(&server)
            .await;

        let pdf = surface.export("i-1", ExportFormat::Pdf).await.unwrap();
        assert!(pdf.starts_with(b"%PDF-"));
        let native = surface.download("i-1").await.unwrap();
        assert_eq!(&native[..], b"XLSX");
    }

    #[tokio::test]
    async fn test_delete_tolerates_missing_item() {
        let server = MockServer::start().await;
        let surface = surface(&server).await;
        Mock::given(method("DELETE"))
            .and(path("/drives/d1/items/gone"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        surface.delete("gone").await.unwrap();
    }

    #[tokio::test]
    async fn test_expired_token_is_refreshed_once() {
        let server = MockServer::start().await;
        let surface = surface(&server).await;
        Mock::given(method("DELETE"))
            .and(path("/drives/d1/items/i-1"))
            .respond_with(ResponseTemplate::new(204))
            .up_to_n_times(1)
            .with_priority(2)
            .mount(&server)
            .await;
        Mock::given(method("DELETE"))
            .and(path("/drives/d1/items/i-1"))
            .respond_with(ResponseTemplate::new(401))
            .up_to_n_times(1)
            .with_priority(1)
            .mount(&server)
            .await;

        surface.delete("i-1").await.unwrap();
    }

    #[tokio::test]
    async fn test_subscription_targets_drive_root() {
        let server = MockServer::start().await;
        let surface = surface(&server).await;
        let expires = Utc.with_ymd_and_hms(2026, 6, 1, 0, 0, 0).unwrap();
        Mock::given(method("POST"))
            .and(path("/subscriptions"))
            .and(body_json(json!({
                "changeType": "updated",
                "notificationUrl": "https://vault.example/webhooks/graph",
                "resource": "/drives/d1/root",
                "expirationDateTime": expires,
                "clientState": "s3cret"
            })))
            .respond_with(ResponseTemplate::new(201).set_body_json(json!({
                "id": "sub-1",
                "expirationDateTime": "2026-06-01T00:00:00Z",
                "resource": "/drives/d1/root"
            })))
            .mount(&server)
            .await;

        let subscription = surface
            .create_subscription("https://vault.example/webhooks/graph", "s3cret", expires)
            .await
            .unwrap();
        assert_eq!(subscription.id, "sub-1");
        assert_eq!(subscription.expiration_date_time, expires);
    }
}
