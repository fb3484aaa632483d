use std::time::Duration;

use clap::Parser;

/// Configuration for the sheetvault server.
#[derive(Parser, Debug, Clone)]
#[command(name = "sheetvault-server")]
#[command(about = "Edit locks, backup replication and editing bridge for spreadsheets in R2")]
pub struct Config {
    /// TCP host to bind to
    #[arg(long, default_value = "0.0.0.0", env = "SHEETVAULT_HOST")]
    pub host: String,

    /// TCP port to bind to
    #[arg(long, default_value = "8080", env = "SHEETVAULT_PORT")]
    pub port: u16,

    /// Run every backend in process memory (local runs, demos)
    #[arg(long, env = "SHEETVAULT_MEMORY_BACKENDS")]
    pub memory_backends: bool,

    /// Cloudflare account ID
    #[arg(long, env = "CLOUDFLARE_ACCOUNT_ID")]
    pub cloudflare_account_id: Option<String>,

    /// R2 bucket holding the spreadsheets and control documents
    #[arg(long, env = "R2_BUCKET_NAME")]
    pub r2_bucket_name: Option<String>,

    /// R2 access key ID (for S3-compatible API)
    #[arg(long, env = "R2_ACCESS_KEY_ID")]
    pub r2_access_key_id: Option<String>,

    /// R2 secret access key (for S3-compatible API)
    #[arg(long, env = "R2_SECRET_ACCESS_KEY")]
    pub r2_secret_access_key: Option<String>,

    /// Override the R2 endpoint (S3-compatible test servers)
    #[arg(long, env = "R2_ENDPOINT")]
    pub r2_endpoint: Option<String>,

    /// Key prefix for the lock table and sync ledger
    #[arg(long, default_value = "_sheetvault/", env = "SHEETVAULT_CONTROL_PREFIX")]
    pub control_prefix: String,

    /// Key prefix for content staged ahead of a session completion
    #[arg(long, default_value = "_uploads/", env = "SHEETVAULT_UPLOAD_PREFIX")]
    pub upload_prefix: String,

    /// Only keys under this prefix are replicated
    #[arg(long, default_value = "", env = "BACKUP_SYNC_PREFIX")]
    pub backup_sync_prefix: String,

    /// Google OAuth2 Client ID
    #[arg(long, env = "GOOGLE_CLIENT_ID")]
    pub google_client_id: Option<String>,

    /// Google OAuth2 Client Secret
    #[arg(long, env = "GOOGLE_CLIENT_SECRET")]
    pub google_client_secret: Option<String>,

    /// Long-lived Google refresh token for the backup account
    #[arg(long, env = "GOOGLE_REFRESH_TOKEN")]
    pub google_refresh_token: Option<String>,

    /// Drive folder receiving the backup mirror
    #[arg(long, env = "GDRIVE_BACKUP_FOLDER_ID")]
    pub gdrive_backup_folder_id: Option<String>,

    /// Entra ID tenant for Microsoft Graph
    #[arg(long, env = "GRAPH_TENANT_ID")]
    pub graph_tenant_id: Option<String>,

    /// Graph application (client) ID
    #[arg(long, env = "GRAPH_CLIENT_ID")]
    pub graph_client_id: Option<String>,

    /// Graph client secret
    #[arg(long, env = "GRAPH_CLIENT_SECRET")]
    pub graph_client_secret: Option<String>,

    /// Drive hosting working copies
    #[arg(long, env = "GRAPH_DRIVE_ID")]
    pub graph_drive_id: Option<String>,

    /// Folder (under the drive root) for working copies
    #[arg(long, default_value = "sheetvault-tmp", env = "GRAPH_TEMP_FOLDER")]
    pub graph_temp_folder: String,

    /// Edit session lifetime (seconds)
    #[arg(long, default_value = "1800", env = "SESSION_TTL_SECS")]
    pub session_ttl_secs: u64,

    /// Shared secret echoed back by Graph as clientState
    #[arg(long, env = "WEBHOOK_CLIENT_STATE")]
    pub webhook_client_state: Option<String>,

    /// Public base URL of this server; enables the Graph subscription
    #[arg(long, env = "WEBHOOK_PUBLIC_URL")]
    pub webhook_public_url: Option<String>,

    /// Bounded queue between the webhook handler and its worker
    #[arg(long, default_value = "1024", env = "WEBHOOK_QUEUE_CAPACITY")]
    pub webhook_queue_capacity: usize,

    /// Attempts per remote call, first call included
    #[arg(long, default_value = "3", env = "RETRY_MAX_ATTEMPTS")]
    pub retry_max_attempts: u32,

    /// Base backoff between attempts (milliseconds)
    #[arg(long, default_value = "200", env = "RETRY_BASE_DELAY_MS")]
    pub retry_base_delay_ms: u64,

    /// Objects replicated concurrently during a pass
    #[arg(long, default_value = "8", env = "BACKUP_SYNC_CONCURRENCY")]
    pub backup_sync_concurrency: usize,

    /// Run a one-way backup pass every N seconds (disabled when unset)
    #[arg(long, env = "BACKUP_SYNC_INTERVAL_SECS")]
    pub backup_sync_interval_secs: Option<u64>,

    /// Timeout for every outbound HTTP call (seconds)
    #[arg(long, default_value = "60", env = "HTTP_TIMEOUT_SECS")]
    pub http_timeout_secs: u64,
}

/// Credentials for the R2 primary store, when all are present.
pub struct R2Credentials<'a> {
    pub account_id: &'a str,
    pub bucket: &'a str,
    pub access_key_id: &'a str,
    pub secret_access_key: &'a str,
}

/// Google Drive backup settings, when all are present.
pub struct DriveCredentials<'a> {
    pub client_id: &'a str,
    pub client_secret: &'a str,
    pub refresh_token: &'a str,
    pub folder_id: &'a str,
}

/// Microsoft Graph settings, when all are present.
pub struct GraphCredentials<'a> {
    pub tenant_id: &'a str,
    pub client_id: &'a str,
    pub client_secret: &'a str,
    pub drive_id: &'a str,
}

impl Config {
    pub fn session_ttl(&self) -> chrono::Duration {
        chrono::Duration::seconds(i64::try_from(self.session_ttl_secs).unwrap_or(i64::MAX))
    }

    pub fn http_timeout(&self) -> Duration {
        Duration::from_secs(self.http_timeout_secs)
    }

    pub fn retry_base_delay(&self) -> Duration {
        Duration::from_millis(self.retry_base_delay_ms)
    }

    pub fn backup_sync_interval(&self) -> Option<Duration> {
        self.backup_sync_interval_secs
            .filter(|secs| *secs > 0)
            .map(Duration::from_secs)
    }

    pub fn r2(&self) -> Option<R2Credentials<'_>> {
        Some(R2Credentials {
            account_id: self.cloudflare_account_id.as_deref()?,
            bucket: self.r2_bucket_name.as_deref()?,
            access_key_id: self.r2_access_key_id.as_deref()?,
            secret_access_key: self.r2_secret_access_key.as_deref()?,
        })
    }

    pub fn drive(&self) -> Option<DriveCredentials<'_>> {
        Some(DriveCredentials {
            client_id: self.google_client_id.as_deref()?,
            client_secret: self.google_client_secret.as_deref()?,
            refresh_token: self.google_refresh_token.as_deref()?,
            folder_id: self.gdrive_backup_folder_id.as_deref()?,
        })
    }

    pub fn graph(&self) -> Option<GraphCredentials<'_>> {
        Some(GraphCredentials {
            tenant_id: self.graph_tenant_id.as_deref()?,
            client_id: self.graph_client_id.as_deref()?,
            client_secret: self.graph_client_secret.as_deref()?,
            drive_id: self.graph_drive_id.as_deref()?,
        })
    }

    /// Where Graph should deliver change notifications.
    pub fn notification_url(&self) -> Option<String> {
        self.webhook_public_url
            .as_deref()
            .map(|base| format!("{}/webhooks/graph", base.trim_end_matches('/')))
    }
}
