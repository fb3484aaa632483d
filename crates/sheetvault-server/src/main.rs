//! sheetvault server.
//!
//! This server:
//! - Hands out edit locks on spreadsheets stored in R2 and guards write-back
//!   with checksums
//! - Mirrors primary storage into a Google Drive folder
//! - Stages working copies on Microsoft Graph and reconciles them on demand
//!   or from change notifications

use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use sheetvault_core::memory::{
    MemoryEditingSurface, MemoryObjectStore, MemorySessionStore, MemorySyncLedger,
};
use sheetvault_core::{
    BackupSynchronizer, EditSessionManager, EditingSurface, ExternalEditingBridge, ObjectStore,
    RetryExecutor, RetryPolicy, SessionStore, SyncLedger, SyncScope,
};
use sheetvault_r2::{R2Bucket, R2ObjectStore, R2SessionStore, R2Settings, R2SyncLedger};
use sheetvault_remote::{
    GDriveBackupStore, GraphEditingSurface, TokenGrant, TokenManager,
};
use sheetvault_server::config::Config;
use sheetvault_server::webhook::WebhookIngress;
use sheetvault_server::{app, tasks, AppState, KeyPolicy};
use tokio::net::TcpListener;
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// Backends selected from the configuration.
struct Backends {
    primary: Arc<dyn ObjectStore>,
    sessions: Arc<dyn SessionStore>,
    ledger: Arc<dyn SyncLedger>,
    backup: Option<Arc<dyn ObjectStore>>,
    surface: Option<Arc<dyn EditingSurface>>,
    graph: Option<Arc<GraphEditingSurface>>,
}

fn build_backends(config: &Config) -> anyhow::Result<Backends> {
    if config.memory_backends {
        warn!("  Backends: in-memory (nothing survives a restart)");
        return Ok(Backends {
            primary: Arc::new(MemoryObjectStore::new("memory")),
            sessions: Arc::new(MemorySessionStore::new()),
            ledger: Arc::new(MemorySyncLedger::new()),
            backup: Some(Arc::new(MemoryObjectStore::new("memory-backup"))),
            surface: Some(Arc::new(MemoryEditingSurface::new())),
            graph: None,
        });
    }

    let r2 = config.r2().context(
        "R2 is not configured: set CLOUDFLARE_ACCOUNT_ID, R2_BUCKET_NAME, R2_ACCESS_KEY_ID \
         and R2_SECRET_ACCESS_KEY (or pass --memory-backends)",
    )?;
    let bucket = R2Bucket::connect(&R2Settings {
        account_id: r2.account_id.to_string(),
        access_key_id: r2.access_key_id.to_string(),
        secret_access_key: r2.secret_access_key.to_string(),
        bucket: r2.bucket.to_string(),
        endpoint: config.r2_endpoint.clone(),
        timeout: config.http_timeout(),
    });
    info!("  Primary: R2 bucket {}", r2.bucket);

    let http = reqwest::Client::builder()
        .timeout(config.http_timeout())
        .build()
        .context("Failed to create HTTP client")?;

    let backup: Option<Arc<dyn ObjectStore>> = match config.drive() {
        Some(drive) => {
            info!("  Backup: Google Drive folder {}", drive.folder_id);
            let tokens = Arc::new(TokenManager::new(
                http.clone(),
                TokenGrant::google(drive.client_id, drive.client_secret, drive.refresh_token),
            ));
            Some(Arc::new(GDriveBackupStore::new(
                http.clone(),
                tokens,
                drive.folder_id,
            )))
        }
        None => {
            warn!("  Backup: DISABLED (no Google Drive credentials configured)");
            None
        }
    };

    let graph = match config.graph() {
        Some(graph) => {
            info!(
                "  Editing surface: Graph drive {} (folder {})",
                graph.drive_id, config.graph_temp_folder
            );
            let tokens = Arc::new(TokenManager::new(
                http.clone(),
                TokenGrant::microsoft(graph.tenant_id, graph.client_id, graph.client_secret),
            ));
            Some(Arc::new(GraphEditingSurface::new(
                http.clone(),
                tokens,
                graph.drive_id,
                config.graph_temp_folder.as_str(),
            )))
        }
        None => {
            warn!("  Editing surface: DISABLED (no Graph credentials configured)");
            None
        }
    };

    Ok(Backends {
        primary: Arc::new(R2ObjectStore::new(bucket.clone())),
        sessions: Arc::new(R2SessionStore::new(bucket.clone(), &config.control_prefix)),
        ledger: Arc::new(R2SyncLedger::new(bucket, &config.control_prefix)),
        backup,
        surface: graph
            .clone()
            .map(|graph| graph as Arc<dyn EditingSurface>),
        graph,
    })
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = Config::parse();

    info!("Starting sheetvault-server v{}", env!("CARGO_PKG_VERSION"));
    info!("  Host: {}", config.host);
    info!("  Port: {}", config.port);
    info!("  Session TTL: {}s", config.session_ttl_secs);

    let backends = build_backends(&config)?;
    let retry = RetryExecutor::new(RetryPolicy::new(
        config.retry_max_attempts,
        config.retry_base_delay(),
    ));

    let sessions = Arc::new(EditSessionManager::new(
        backends.sessions,
        backends.primary.clone(),
        retry.clone(),
        config.session_ttl(),
    ));

    let backup = backends.backup.map(|backup_store| {
        Arc::new(
            BackupSynchronizer::new(
                backends.primary.clone(),
                backup_store,
                backends.ledger.clone(),
                retry.clone(),
            )
            .with_concurrency(config.backup_sync_concurrency)
            .with_scope(SyncScope {
                prefix: config.backup_sync_prefix.clone(),
                exclude_prefixes: vec![
                    config.control_prefix.clone(),
                    config.upload_prefix.clone(),
                ],
            }),
        )
    });

    let bridge = backends.surface.map(|surface| {
        Arc::new(ExternalEditingBridge::new(
            backends.primary.clone(),
            surface,
            retry.clone(),
        ))
    });

    if config.webhook_client_state.is_none() {
        warn!("  Webhooks: clientState check DISABLED (WEBHOOK_CLIENT_STATE not set)");
    }
    let (webhooks, _worker) = WebhookIngress::start(
        config.webhook_client_state.clone(),
        config.webhook_queue_capacity,
        bridge.clone(),
    );

    if let (Some(backup), Some(period)) = (&backup, config.backup_sync_interval()) {
        tasks::spawn_backup_schedule(backup.clone(), period);
    }

    let state = AppState {
        sessions,
        primary: backends.primary,
        backup,
        bridge,
        webhooks,
        keys: KeyPolicy::new(config.control_prefix.as_str(), config.upload_prefix.as_str()),
    };

    // Bind and serve
    let addr = format!("{}:{}", config.host, config.port);
    let listener = TcpListener::bind(&addr).await?;
    info!("Listening on http://{}", addr);

    // Graph validates the notification URL while the subscription is created,
    // so this starts only once the listener is bound.
    match (&backends.graph, config.notification_url()) {
        (Some(graph), Some(url)) => {
            let client_state = config.webhook_client_state.clone().unwrap_or_default();
            info!("  Webhooks: subscribing {}", url);
            tasks::spawn_subscription_keeper(graph.clone(), url, client_state);
        }
        (Some(_), None) => warn!("  Webhooks: no subscription (WEBHOOK_PUBLIC_URL not set)"),
        _ => {}
    }

    axum::serve(listener, app(state))
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("Server shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
        info!("Received Ctrl+C, initiating shutdown");
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
                info!("Received SIGTERM, initiating shutdown");
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
