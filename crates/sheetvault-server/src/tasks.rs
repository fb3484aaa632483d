//! Background tasks owned by the server process.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use sheetvault_core::BackupSynchronizer;
use sheetvault_remote::GraphEditingSurface;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{error, info, warn};

const SUBSCRIPTION_RENEW_EVERY: Duration = Duration::from_secs(24 * 60 * 60);
const SUBSCRIPTION_RETRY_AFTER: Duration = Duration::from_secs(5 * 60);

/// Expiry requested for the Graph subscription.
fn subscription_expiry() -> DateTime<Utc> {
    Utc::now() + chrono::Duration::days(2)
}

/// Run `sync_backup_pass` every `period`. A failed pass is logged and the
/// schedule carries on.
pub fn spawn_backup_schedule(backup: Arc<BackupSynchronizer>, period: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(period_secs = period.as_secs(), "Scheduled backup passes enabled");

        loop {
            ticker.tick().await;
            match backup.sync_backup_pass().await {
                Ok(report) => info!(
                    examined = report.examined,
                    uploaded = report.uploaded,
                    skipped = report.skipped,
                    failed = report.failed,
                    conflicts = report.conflicts,
                    "Scheduled backup pass finished"
                ),
                Err(e) => error!(error = %e, "Scheduled backup pass failed"),
            }
        }
    })
}

/// Keep a drive-root subscription alive: create it, then renew it daily.
/// Creation is retried until it succeeds, since Graph validates the
/// notification URL against this server while it is starting up.
pub fn spawn_subscription_keeper(
    surface: Arc<GraphEditingSurface>,
    notification_url: String,
    client_state: String,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let subscription_id = loop {
            match surface
                .create_subscription(&notification_url, &client_state, subscription_expiry())
                .await
            {
                Ok(subscription) => break subscription.id,
                Err(e) => {
                    warn!(error = %e, "Graph subscription failed, retrying");
                    tokio::time::sleep(SUBSCRIPTION_RETRY_AFTER).await;
                }
            }
        };

        loop {
            tokio::time::sleep(SUBSCRIPTION_RENEW_EVERY).await;
            match surface
                .renew_subscription(&subscription_id, subscription_expiry())
                .await
            {
                Ok(renewed) => info!(
                    subscription_id = %renewed.id,
                    expires_at = %renewed.expiration_date_time,
                    "Renewed Graph subscription"
                ),
                Err(e) => warn!(
                    subscription_id = %subscription_id,
                    error = %e,
                    "Graph subscription renewal failed"
                ),
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use sheetvault_core::memory::{MemoryObjectStore, MemorySyncLedger};
    use sheetvault_core::{RetryExecutor, SyncLedger};

    use super::*;

    #[tokio::test]
    async fn test_backup_schedule_runs_passes() {
        let primary = Arc::new(MemoryObjectStore::new("primary"));
        primary.insert("doc/a.xlsx", b"A".to_vec());
        let backup_store = Arc::new(MemoryObjectStore::new("backup"));
        let ledger = Arc::new(MemorySyncLedger::new());
        let backup = Arc::new(BackupSynchronizer::new(
            primary,
            backup_store.clone(),
            ledger.clone(),
            RetryExecutor::default(),
        ));

        let handle = spawn_backup_schedule(backup, Duration::from_millis(20));
        for _ in 0..100 {
            if !ledger.list_records().await.unwrap().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        // Later passes find nothing new to upload.
        tokio::time::sleep(Duration::from_millis(60)).await;
        handle.abort();

        assert_eq!(backup_store.put_count(), 1);
        assert_eq!(ledger.list_records().await.unwrap().len(), 1);
    }
}
