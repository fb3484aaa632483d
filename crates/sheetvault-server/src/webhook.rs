//! Graph change-notification ingress.
//!
//! The handler only validates, de-duplicates and enqueues. A single worker
//! task drains the queue into the bridge, so a slow or failing reconcile
//! never delays the acknowledgement Graph waits for.

use std::sync::Arc;
use std::time::Duration;

use moka::future::Cache;
use serde::Deserialize;
use sheetvault_core::{ExternalEditingBridge, RemoteChangeType};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// How long an accepted notification suppresses identical replays.
const REPLAY_WINDOW: Duration = Duration::from_secs(5 * 60);
const REPLAY_CAPACITY: u64 = 10_000;

#[derive(Debug, Deserialize)]
pub struct NotificationBatch {
    #[serde(default)]
    pub value: Vec<ChangeNotification>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeNotification {
    #[serde(default)]
    pub change_type: String,
    #[serde(default)]
    pub resource: String,
    #[serde(default)]
    pub resource_data: Option<ResourceData>,
    #[serde(default)]
    pub resource_id: Option<String>,
    #[serde(default)]
    pub client_state: Option<String>,
    #[serde(default)]
    pub subscription_id: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ResourceData {
    #[serde(default)]
    pub id: Option<String>,
}

impl ChangeNotification {
    /// Remote item the notification is about: `resourceData.id`, then
    /// `resourceId`, then the segment after `items/` in `resource`.
    pub fn item_id(&self) -> Option<String> {
        self.resource_data
            .as_ref()
            .and_then(|data| data.id.clone())
            .or_else(|| self.resource_id.clone())
            .or_else(|| {
                let (_, rest) = self.resource.split_once("items/")?;
                let id = rest.split('/').next()?;
                (!id.is_empty()).then(|| id.to_string())
            })
    }

    pub fn change(&self) -> Option<RemoteChangeType> {
        match self.change_type.as_str() {
            "created" => Some(RemoteChangeType::Created),
            "updated" => Some(RemoteChangeType::Updated),
            "deleted" => Some(RemoteChangeType::Deleted),
            _ => None,
        }
    }
}

/// One accepted notification on its way to the worker.
#[derive(Debug, Clone)]
pub struct QueuedChange {
    pub item_id: String,
    pub change: RemoteChangeType,
}

/// What happened to one notification entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Queued,
    BadClientState,
    Unusable,
    Replay,
    QueueFull,
    NoBridge,
}

#[derive(Clone)]
pub struct WebhookIngress {
    client_state: Option<String>,
    seen: Cache<String, ()>,
    queue: Option<mpsc::Sender<QueuedChange>>,
}

impl WebhookIngress {
    /// Build the ingress and, when a bridge is configured, spawn its worker.
    pub fn start(
        client_state: Option<String>,
        capacity: usize,
        bridge: Option<Arc<ExternalEditingBridge>>,
    ) -> (Self, Option<JoinHandle<()>>) {
        let seen = Cache::builder()
            .max_capacity(REPLAY_CAPACITY)
            .time_to_live(REPLAY_WINDOW)
            .build();

        let (queue, worker) = match bridge {
            Some(bridge) => {
                let (tx, rx) = mpsc::channel(capacity.max(1));
                (Some(tx), Some(tokio::spawn(run_worker(bridge, rx))))
            }
            None => (None, None),
        };

        (
            Self {
                client_state,
                seen,
                queue,
            },
            worker,
        )
    }

    /// Validate, de-duplicate and enqueue one entry. Never blocks.
    pub async fn admit(&self, notification: &ChangeNotification) -> Admission {
        if let Some(expected) = &self.client_state {
            if notification.client_state.as_deref() != Some(expected.as_str()) {
                warn!(
                    subscription_id = notification.subscription_id.as_deref().unwrap_or(""),
                    "Dropping notification with mismatched clientState"
                );
                return Admission::BadClientState;
            }
        }

        let (Some(item_id), Some(change)) = (notification.item_id(), notification.change())
        else {
            debug!(resource = %notification.resource, "Notification without usable item/change");
            return Admission::Unusable;
        };

        let Some(queue) = &self.queue else {
            debug!(%item_id, "No editing bridge configured, ignoring notification");
            return Admission::NoBridge;
        };

        let replay_key = format!(
            "{}|{}|{}",
            notification.subscription_id.as_deref().unwrap_or(""),
            item_id,
            notification.change_type
        );
        let entry = self.seen.entry(replay_key).or_insert(()).await;
        if !entry.is_fresh() {
            debug!(%item_id, "Replayed notification ignored");
            return Admission::Replay;
        }

        match queue.try_send(QueuedChange {
            item_id: item_id.clone(),
            change,
        }) {
            Ok(()) => Admission::Queued,
            Err(e) => {
                warn!(%item_id, error = %e, "Webhook queue unavailable, dropping notification");
                Admission::QueueFull
            }
        }
    }
}

async fn run_worker(bridge: Arc<ExternalEditingBridge>, mut rx: mpsc::Receiver<QueuedChange>) {
    info!("Webhook worker started");
    while let Some(queued) = rx.recv().await {
        match bridge
            .reconcile_remote_change(&queued.item_id, queued.change)
            .await
        {
            Ok(Some(copy)) => info!(
                working_copy = %copy.id,
                item_id = %queued.item_id,
                state = ?copy.state,
                "Reconciled remote change"
            ),
            Ok(None) => debug!(item_id = %queued.item_id, "Notification needed no action"),
            Err(e) => warn!(
                item_id = %queued.item_id,
                error = %e,
                "Failed to reconcile remote change"
            ),
        }
    }
    info!("Webhook worker stopped");
}
