use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::VaultError;

/// A file living in the editing surface's temp area.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteItem {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub size_bytes: u64,
    #[serde(default)]
    pub last_modified: Option<DateTime<Utc>>,
}

/// Opaque formatting change forwarded to a worksheet range. What the
/// `format` payload does is up to the surface.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LayoutOperation {
    pub worksheet: String,
    pub address: String,
    pub format: serde_json::Value,
}

/// Rendered artifact formats the surface can export.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExportFormat {
    Pdf,
    Html,
}

impl ExportFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExportFormat::Pdf => "pdf",
            ExportFormat::Html => "html",
        }
    }

    pub fn content_type(&self) -> &'static str {
        match self {
            ExportFormat::Pdf => "application/pdf",
            ExportFormat::Html => "text/html",
        }
    }
}

/// Change kinds announced by push notifications.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum RemoteChangeType {
    Created,
    Updated,
    Deleted,
}

/// Third-party editing surface hosting working copies.
#[async_trait]
pub trait EditingSurface: Send + Sync {
    fn surface_name(&self) -> &'static str;

    /// Upload into the surface's temp folder under `name`.
    async fn upload_temp(&self, name: &str, data: Bytes) -> Result<RemoteItem, VaultError>;

    /// Server-side copy inside the temp folder. May complete asynchronously
    /// on the remote side; implementations wait for completion.
    async fn copy_item(&self, item_id: &str, new_name: &str) -> Result<RemoteItem, VaultError>;

    /// Open a persistent workbook session; returns the session id.
    async fn open_session(&self, item_id: &str) -> Result<String, VaultError>;

    async fn apply_layout(
        &self,
        item_id: &str,
        session_id: &str,
        operation: &LayoutOperation,
    ) -> Result<(), VaultError>;

    /// Close the session, persisting its changes.
    async fn close_session(&self, item_id: &str, session_id: &str) -> Result<(), VaultError>;

    async fn download(&self, item_id: &str) -> Result<Bytes, VaultError>;

    async fn export(&self, item_id: &str, format: ExportFormat) -> Result<Bytes, VaultError>;

    /// Delete a working copy. Deleting a missing item succeeds.
    async fn delete(&self, item_id: &str) -> Result<(), VaultError>;
}
