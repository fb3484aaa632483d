//! In-process backends for local runs and tests.
//!
//! `DashMap` entry locking gives the same per-key atomicity the R2 backends
//! get from conditional writes.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use dashmap::DashMap;

use crate::error::VaultError;
use crate::session::{
    AcquireOutcome, EditSession, SessionFinish, SessionLedger, SessionStore,
};
use crate::store::{ObjectInfo, ObjectStore};
use crate::surface::{EditingSurface, ExportFormat, LayoutOperation, RemoteItem};
use crate::sync::{FileSyncRecord, SyncLedger, SyncLogEntry, SyncRecordTable};

#[derive(Debug, Clone)]
struct StoredObject {
    data: Bytes,
    content_type: String,
    metadata: HashMap<String, String>,
    last_modified: DateTime<Utc>,
}

/// Object store held in memory.
#[derive(Debug)]
pub struct MemoryObjectStore {
    name: &'static str,
    objects: DashMap<String, StoredObject>,
    puts: AtomicUsize,
}

impl MemoryObjectStore {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            objects: DashMap::new(),
            puts: AtomicUsize::new(0),
        }
    }

    /// Seed or overwrite an object without counting it as a `put`.
    pub fn insert(&self, key: &str, data: impl Into<Bytes>) {
        self.insert_at(key, data, Utc::now());
    }

    pub fn insert_at(&self, key: &str, data: impl Into<Bytes>, last_modified: DateTime<Utc>) {
        self.objects.insert(
            key.to_string(),
            StoredObject {
                data: data.into(),
                content_type: "application/octet-stream".to_string(),
                metadata: HashMap::new(),
                last_modified,
            },
        );
    }

    /// Number of `put` calls served so far.
    pub fn put_count(&self) -> usize {
        self.puts.load(Ordering::SeqCst)
    }

    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    pub fn metadata(&self, key: &str) -> Option<HashMap<String, String>> {
        self.objects.get(key).map(|o| o.metadata.clone())
    }

    pub fn content_type(&self, key: &str) -> Option<String> {
        self.objects.get(key).map(|o| o.content_type.clone())
    }
}

#[async_trait]
impl ObjectStore for MemoryObjectStore {
    fn backend_name(&self) -> &'static str {
        self.name
    }

    async fn get(&self, key: &str) -> Result<Bytes, VaultError> {
        self.objects
            .get(key)
            .map(|o| o.data.clone())
            .ok_or_else(|| VaultError::NotFound(key.to_string()))
    }

    async fn put(
        &self,
        key: &str,
        data: Bytes,
        content_type: &str,
        metadata: Option<&HashMap<String, String>>,
    ) -> Result<(), VaultError> {
        self.puts.fetch_add(1, Ordering::SeqCst);
        self.objects.insert(
            key.to_string(),
            StoredObject {
                data,
                content_type: content_type.to_string(),
                metadata: metadata.cloned().unwrap_or_default(),
                last_modified: Utc::now(),
            },
        );
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), VaultError> {
        self.objects.remove(key);
        Ok(())
    }

    async fn presign(&self, key: &str, ttl: Duration) -> Result<String, VaultError> {
        if !self.objects.contains_key(key) {
            return Err(VaultError::NotFound(key.to_string()));
        }
        Ok(format!(
            "memory://{}/{}?expires={}",
            self.name,
            key,
            ttl.as_secs()
        ))
    }

    async fn head(&self, key: &str) -> Result<Option<ObjectInfo>, VaultError> {
        Ok(self.objects.get(key).map(|o| ObjectInfo {
            key: key.to_string(),
            size_bytes: o.data.len() as u64,
            last_modified: o.last_modified,
            etag: Some(crate::checksum::checksum(&o.data)),
        }))
    }

    async fn list(&self, prefix: &str) -> Result<Vec<ObjectInfo>, VaultError> {
        let mut infos: Vec<ObjectInfo> = self
            .objects
            .iter()
            .filter(|entry| entry.key().starts_with(prefix))
            .map(|entry| ObjectInfo {
                key: entry.key().clone(),
                size_bytes: entry.data.len() as u64,
                last_modified: entry.last_modified,
                etag: Some(crate::checksum::checksum(&entry.data)),
            })
            .collect();
        infos.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(infos)
    }
}

/// Lock table held in memory: one ledger per object key plus an id index.
#[derive(Debug, Default)]
pub struct MemorySessionStore {
    ledgers: DashMap<String, SessionLedger>,
    by_id: DashMap<String, String>,
}

impl MemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn ledger_mut(
        &self,
        session: &EditSession,
    ) -> Result<dashmap::mapref::one::RefMut<'_, String, SessionLedger>, VaultError> {
        self.ledgers
            .get_mut(&session.object_key)
            .ok_or_else(|| VaultError::SessionNotFound(session.id.clone()))
    }
}

#[async_trait]
impl SessionStore for MemorySessionStore {
    async fn try_acquire(
        &self,
        candidate: EditSession,
        now: DateTime<Utc>,
    ) -> Result<AcquireOutcome, VaultError> {
        let object_key = candidate.object_key.clone();
        let session_id = candidate.id.clone();

        let outcome = self
            .ledgers
            .entry(object_key.clone())
            .or_insert_with(|| SessionLedger::new(&object_key))
            .try_acquire(candidate, now);

        if matches!(outcome, AcquireOutcome::Acquired(_)) {
            self.by_id.insert(session_id, object_key);
        }
        Ok(outcome)
    }

    async fn find_live(
        &self,
        object_key: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<EditSession>, VaultError> {
        Ok(self
            .ledgers
            .get(object_key)
            .and_then(|ledger| ledger.live(now).cloned()))
    }

    async fn get(&self, session_id: &str) -> Result<Option<EditSession>, VaultError> {
        let object_key = match self.by_id.get(session_id) {
            Some(key) => key.clone(),
            None => return Ok(None),
        };
        Ok(self
            .ledgers
            .get(&object_key)
            .and_then(|ledger| ledger.find(session_id).cloned()))
    }

    async fn claim(
        &self,
        session: &EditSession,
        now: DateTime<Utc>,
    ) -> Result<EditSession, VaultError> {
        self.ledger_mut(session)?.claim(&session.id, now)
    }

    async fn release(&self, session: &EditSession) -> Result<EditSession, VaultError> {
        self.ledger_mut(session)?.release(&session.id)
    }

    async fn finish(
        &self,
        session: &EditSession,
        finish: SessionFinish,
        now: DateTime<Utc>,
    ) -> Result<EditSession, VaultError> {
        self.ledger_mut(session)?.finish(&session.id, &finish, now)
    }

    async fn history(&self, object_key: &str) -> Result<Vec<EditSession>, VaultError> {
        Ok(self
            .ledgers
            .get(object_key)
            .map(|ledger| ledger.sessions.clone())
            .unwrap_or_default())
    }
}

fn lock<T>(mutex: &Mutex<T>) -> Result<MutexGuard<'_, T>, VaultError> {
    mutex
        .lock()
        .map_err(|_| VaultError::Internal("memory backend lock poisoned".to_string()))
}

/// Sync records and log held in memory.
#[derive(Debug, Default)]
pub struct MemorySyncLedger {
    table: Mutex<SyncRecordTable>,
    log: Mutex<Vec<SyncLogEntry>>,
}

impl MemorySyncLedger {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SyncLedger for MemorySyncLedger {
    async fn get_record(&self, primary_key: &str) -> Result<Option<FileSyncRecord>, VaultError> {
        let table = lock(&self.table)?;
        Ok(table.records.get(primary_key).cloned())
    }

    async fn find_synced_by_checksum(
        &self,
        checksum: &str,
    ) -> Result<Option<FileSyncRecord>, VaultError> {
        let table = lock(&self.table)?;
        Ok(table.find_synced_by_checksum(checksum).cloned())
    }

    async fn upsert_record(&self, record: FileSyncRecord) -> Result<(), VaultError> {
        lock(&self.table)?.upsert(record);
        Ok(())
    }

    async fn list_records(&self) -> Result<Vec<FileSyncRecord>, VaultError> {
        let table = lock(&self.table)?;
        Ok(table.records.values().cloned().collect())
    }

    async fn append_log(&self, entry: SyncLogEntry) -> Result<(), VaultError> {
        lock(&self.log)?.push(entry);
        Ok(())
    }

    async fn recent_log(&self, limit: usize) -> Result<Vec<SyncLogEntry>, VaultError> {
        let log = lock(&self.log)?;
        let start = log.len().saturating_sub(limit);
        Ok(log[start..].to_vec())
    }
}

/// Editing surface held in memory.
#[derive(Debug, Default)]
pub struct MemoryEditingSurface {
    items: DashMap<String, (String, Bytes)>,
    sessions: DashMap<String, String>,
    layouts: Mutex<Vec<(String, LayoutOperation)>>,
    fail_on: Mutex<Option<&'static str>>,
    deletes: AtomicUsize,
    copies: AtomicUsize,
}

impl MemoryEditingSurface {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent call to `operation` fail as unavailable.
    pub fn fail_on(&self, operation: &'static str) {
        *self.fail_on.lock().expect("surface poisoned") = Some(operation);
    }

    /// Replace an item's content as a remote editor would.
    pub fn edit(&self, item_id: &str, data: impl Into<Bytes>) {
        if let Some(mut item) = self.items.get_mut(item_id) {
            item.1 = data.into();
        }
    }

    pub fn contains(&self, item_id: &str) -> bool {
        self.items.contains_key(item_id)
    }

    pub fn item_count(&self) -> usize {
        self.items.len()
    }

    /// Copy requests received, failed ones included.
    pub fn copy_count(&self) -> usize {
        self.copies.load(Ordering::SeqCst)
    }

    pub fn delete_count(&self) -> usize {
        self.deletes.load(Ordering::SeqCst)
    }

    pub fn applied_layouts(&self) -> Vec<(String, LayoutOperation)> {
        self.layouts.lock().expect("surface poisoned").clone()
    }

    fn check(&self, operation: &'static str) -> Result<(), VaultError> {
        match *lock(&self.fail_on)? {
            Some(failing) if failing == operation => Err(VaultError::UpstreamUnavailable(
                format!("memory surface {} unavailable", operation),
            )),
            _ => Ok(()),
        }
    }

    fn item(&self, item_id: &str) -> Result<(String, Bytes), VaultError> {
        self.items
            .get(item_id)
            .map(|item| item.clone())
            .ok_or_else(|| VaultError::NotFound(item_id.to_string()))
    }

    fn store(&self, name: &str, data: Bytes) -> RemoteItem {
        let id = uuid::Uuid::new_v4().simple().to_string();
        let item = RemoteItem {
            id: id.clone(),
            name: name.to_string(),
            size_bytes: data.len() as u64,
            last_modified: Some(Utc::now()),
        };
        self.items.insert(id, (name.to_string(), data));
        item
    }
}

#[async_trait]
impl EditingSurface for MemoryEditingSurface {
    fn surface_name(&self) -> &'static str {
        "memory"
    }

    async fn upload_temp(&self, name: &str, data: Bytes) -> Result<RemoteItem, VaultError> {
        self.check("upload")?;
        Ok(self.store(name, data))
    }

    async fn copy_item(&self, item_id: &str, new_name: &str) -> Result<RemoteItem, VaultError> {
        self.copies.fetch_add(1, Ordering::SeqCst);
        self.check("copy")?;
        let (_, data) = self.item(item_id)?;
        Ok(self.store(new_name, data))
    }

    async fn open_session(&self, item_id: &str) -> Result<String, VaultError> {
        self.check("open")?;
        self.item(item_id)?;
        let session_id = uuid::Uuid::new_v4().to_string();
        self.sessions.insert(session_id.clone(), item_id.to_string());
        Ok(session_id)
    }

    async fn apply_layout(
        &self,
        item_id: &str,
        session_id: &str,
        operation: &LayoutOperation,
    ) -> Result<(), VaultError> {
        self.check("layout")?;
        if self.sessions.get(session_id).map(|s| s.clone()).as_deref() != Some(item_id) {
            return Err(VaultError::ValidationFailed(format!(
                "unknown workbook session {}",
                session_id
            )));
        }
        lock(&self.layouts)?.push((item_id.to_string(), operation.clone()));
        Ok(())
    }

    async fn close_session(&self, _item_id: &str, session_id: &str) -> Result<(), VaultError> {
        self.check("close")?;
        self.sessions.remove(session_id);
        Ok(())
    }

    async fn download(&self, item_id: &str) -> Result<Bytes, VaultError> {
        self.check("download")?;
        Ok(self.item(item_id)?.1)
    }

    async fn export(&self, item_id: &str, format: ExportFormat) -> Result<Bytes, VaultError> {
        self.check("export")?;
        let (_, data) = self.item(item_id)?;
        let mut rendered = format!("%{}-", format.as_str().to_uppercase()).into_bytes();
        rendered.extend_from_slice(&data);
        Ok(Bytes::from(rendered))
    }

    async fn delete(&self, item_id: &str) -> Result<(), VaultError> {
        self.check("delete")?;
        self.deletes.fetch_add(1, Ordering::SeqCst);
        self.items.remove(item_id);
        Ok(())
    }
}
