//! Remote systems reached over plain HTTPS: Google Drive as the backup
//! mirror and Microsoft Graph as the external editing surface. Both share
//! one OAuth2 token manager type.

mod gdrive;
mod graph;
mod http;
pub mod token_manager;

pub use gdrive::GDriveBackupStore;
pub use graph::{GraphEditingSurface, Subscription};
pub use token_manager::{TokenGrant, TokenManager};
