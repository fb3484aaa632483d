use std::sync::Arc;

use sheetvault_core::{
    BackupSynchronizer, EditSessionManager, ExternalEditingBridge, ObjectStore, VaultError,
};

use crate::error::ApiError;
use crate::webhook::WebhookIngress;

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub sessions: Arc<EditSessionManager>,
    /// Primary store, used directly to resolve staged uploads
    pub primary: Arc<dyn ObjectStore>,
    pub backup: Option<Arc<BackupSynchronizer>>,
    pub bridge: Option<Arc<ExternalEditingBridge>>,
    pub webhooks: WebhookIngress,
    pub keys: KeyPolicy,
}

impl AppState {
    pub fn backup(&self) -> Result<&BackupSynchronizer, ApiError> {
        self.backup
            .as_deref()
            .ok_or(ApiError::NotConfigured("Backup replication"))
    }

    pub fn bridge(&self) -> Result<&ExternalEditingBridge, ApiError> {
        self.bridge
            .as_deref()
            .ok_or(ApiError::NotConfigured("Editing bridge"))
    }
}

/// Which primary keys callers may name.
///
/// Documents live outside the control prefix (lock table, sync ledger) and
/// the upload prefix. Staged content for a completion must live under the
/// upload prefix, since it is deleted once consumed.
#[derive(Debug, Clone)]
pub struct KeyPolicy {
    pub control_prefix: String,
    pub upload_prefix: String,
}

impl KeyPolicy {
    pub fn new(control_prefix: impl Into<String>, upload_prefix: impl Into<String>) -> Self {
        Self {
            control_prefix: control_prefix.into(),
            upload_prefix: upload_prefix.into(),
        }
    }

    /// Reject keys that name control documents or staged uploads.
    pub fn document_key(&self, key: &str) -> Result<(), VaultError> {
        if under(key, &self.control_prefix) || under(key, &self.upload_prefix) {
            return Err(VaultError::ValidationFailed(format!(
                "{} is reserved and cannot be edited or staged",
                key
            )));
        }
        Ok(())
    }

    /// Accept only keys strictly inside the upload prefix.
    pub fn staged_key(&self, key: &str) -> Result<(), VaultError> {
        if self.upload_prefix.is_empty()
            || key.len() <= self.upload_prefix.len()
            || !key.starts_with(&self.upload_prefix)
            || under(key, &self.control_prefix)
        {
            return Err(VaultError::ValidationFailed(format!(
                "stagedKey must be an upload under {:?}",
                self.upload_prefix
            )));
        }
        Ok(())
    }
}

fn under(key: &str, prefix: &str) -> bool {
    !prefix.is_empty() && key.starts_with(prefix)
}
