//! Cloudflare R2 backends for sheetvault.
//!
//! Spreadsheets live under their own keys; the lock table and the sync
//! ledger are JSON control documents under a separate prefix, updated with
//! ETag compare-and-swap (`If-Match` / `If-None-Match: *`).

mod bucket;
mod ledger;
mod objects;
mod sessions;

pub use bucket::{R2Bucket, R2Settings};
pub use ledger::R2SyncLedger;
pub use objects::R2ObjectStore;
pub use sessions::R2SessionStore;

/// Prefix for control documents unless configured otherwise.
pub const DEFAULT_CONTROL_PREFIX: &str = "_sheetvault/";
