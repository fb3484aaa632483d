//! Core of sheetvault: concurrency-safe edit locks over spreadsheets in
//! object storage, one-way backup replication, and a bridge to an external
//! editing surface.
//!
//! Storage backends implement the traits in [`store`], [`session`],
//! [`sync`] and [`surface`]; everything else is backend-agnostic.

pub mod backup;
pub mod bridge;
pub mod checksum;
pub mod clock;
pub mod error;
pub mod memory;
pub mod retry;
pub mod session;
pub mod session_manager;
pub mod store;
pub mod surface;
pub mod sync;

pub use backup::{BackupSynchronizer, ConflictPolicy, PassReport, SyncScope};
pub use bridge::{ExternalEditingBridge, ReconcileOutcome, WorkingCopy, WorkingCopyState};
pub use checksum::{checksum, is_checksum};
pub use clock::{Clock, ManualClock, SystemClock};
pub use error::VaultError;
pub use retry::{RetryExecutor, RetryPolicy};
pub use session::{EditSession, SessionFinish, SessionStatus, SessionStore};
pub use session_manager::{
    CompletedSession, Completion, EditSessionManager, LockCheck, StartedSession,
};
pub use store::{ObjectInfo, ObjectStore, XLSX_CONTENT_TYPE};
pub use surface::{EditingSurface, ExportFormat, LayoutOperation, RemoteChangeType, RemoteItem};
pub use sync::{FileSyncRecord, SyncLedger, SyncLogEntry, SyncStatus};
