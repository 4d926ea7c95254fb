use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, info, warn};
use ulid::Ulid;

use crate::model::Ms;

const CHANNEL_CAPACITY: usize = 256;
const FIREHOSE_CAPACITY: usize = 4096;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NotificationKind {
    Booked,
    Reminder,
    Completed,
    Cancelled,
}

impl NotificationKind {
    pub fn as_str(self) -> &'static str {
        match self {
            NotificationKind::Booked => "booked",
            NotificationKind::Reminder => "reminder",
            NotificationKind::Completed => "completed",
            NotificationKind::Cancelled => "cancelled",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notification {
    pub kind: NotificationKind,
    pub appointment_id: Ulid,
    pub location_id: Ulid,
    pub customer_id: Ulid,
    pub at: Ms,
}

/// Fire-and-forget broadcast of lifecycle notifications, per location plus a
/// firehose for dispatchers that serve every location.
pub struct NotifyHub {
    channels: DashMap<Ulid, broadcast::Sender<Notification>>,
    firehose: broadcast::Sender<Notification>,
}

impl Default for NotifyHub {
    fn default() -> Self {
        Self::new()
    }
}

impl NotifyHub {
    pub fn new() -> Self {
        Self {
            channels: DashMap::new(),
            firehose: broadcast::channel(FIREHOSE_CAPACITY).0,
        }
    }

    /// Subscribe to one location. Creates the channel if needed.
    pub fn subscribe(&self, location_id: Ulid) -> broadcast::Receiver<Notification> {
        let sender = self
            .channels
            .entry(location_id)
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0);
        sender.subscribe()
    }

    pub fn subscribe_all(&self) -> broadcast::Receiver<Notification> {
        self.firehose.subscribe()
    }

    /// Never fails and never blocks. No-op if nobody is listening.
    pub fn send(&self, notification: Notification) {
        metrics::counter!(
            crate::observability::NOTIFICATIONS_TOTAL,
            "kind" => notification.kind.as_str()
        )
        .increment(1);
        if let Some(sender) = self.channels.get(&notification.location_id) {
            let _ = sender.send(notification.clone());
        }
        let _ = self.firehose.send(notification);
    }
}

// ── Outbound delivery ────────────────────────────────────────────

pub type DeliveryError = Box<dyn std::error::Error + Send + Sync>;

/// An outbound messaging integration (chat app, SMS, e-mail).
#[async_trait]
pub trait NotificationChannel: Send + Sync {
    fn name(&self) -> &str;

    async fn deliver(&self, notification: &Notification) -> Result<(), DeliveryError>;
}

/// Writes the JSON payload to the log. Used when no real channel is configured.
pub struct LogChannel;

#[async_trait]
impl NotificationChannel for LogChannel {
    fn name(&self) -> &str {
        "log"
    }

    async fn deliver(&self, notification: &Notification) -> Result<(), DeliveryError> {
        let payload = serde_json::to_string(notification)?;
        info!(target: "slotkeeper::outbound", %payload, "notification");
        Ok(())
    }
}

/// Drain `rx` into `channel` until the hub is dropped. Delivery failures are
/// logged and counted, never retried.
pub async fn run_dispatcher(
    mut rx: broadcast::Receiver<Notification>,
    channel: Arc<dyn NotificationChannel>,
) {
    loop {
        match rx.recv().await {
            Ok(notification) => {
                if let Err(e) = channel.deliver(&notification).await {
                    warn!(
                        channel = channel.name(),
                        kind = notification.kind.as_str(),
                        appointment = %notification.appointment_id,
                        "notification delivery failed: {e}"
                    );
                    metrics::counter!(crate::observability::NOTIFICATION_FAILURES_TOTAL)
                        .increment(1);
                }
            }
            Err(RecvError::Lagged(skipped)) => {
                warn!(channel = channel.name(), "dispatcher lagged, {skipped} notifications dropped");
            }
            Err(RecvError::Closed) => {
                debug!(channel = channel.name(), "notification hub closed");
                break;
            }
        }
    }
}
