// Change feed delivering document notifications to event triggers
//
// Delivery is at-least-once and ordered per doctype within a domain. Each
// subscriber gets its own broadcast receiver; a subscriber that falls behind
// loses the oldest notifications and logs how many were skipped.

use crate::models::ChangeEvent;
use futures::StreamExt;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

/// Default number of notifications buffered per subscriber
pub const DEFAULT_FEED_CAPACITY: usize = 1024;

/// Source of change notifications
pub trait ChangeFeed: Send + Sync {
    /// Start receiving every notification published from now on
    fn subscribe(&self) -> broadcast::Receiver<ChangeEvent>;
}

/// In-process change feed
#[derive(Debug, Clone)]
pub struct BroadcastChangeFeed {
    sender: broadcast::Sender<ChangeEvent>,
}

impl BroadcastChangeFeed {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Publish a notification; returns how many subscribers received it
    pub fn publish(&self, event: ChangeEvent) -> usize {
        debug!(
            domain = %event.domain,
            doctype = %event.doctype,
            verb = %event.verb,
            "Publishing change event"
        );
        self.sender.send(event).unwrap_or(0)
    }
}

impl Default for BroadcastChangeFeed {
    fn default() -> Self {
        Self::new(DEFAULT_FEED_CAPACITY)
    }
}

impl ChangeFeed for BroadcastChangeFeed {
    fn subscribe(&self) -> broadcast::Receiver<ChangeEvent> {
        self.sender.subscribe()
    }
}

/// Change feed fed by JSON [`ChangeEvent`] messages on a NATS subject
pub struct NatsChangeFeed {
    local: BroadcastChangeFeed,
    shutdown: CancellationToken,
}

impl NatsChangeFeed {
    /// Subscribe to `subject` and fan messages out to local subscribers
    #[instrument(skip(client))]
    pub async fn connect(
        client: async_nats::Client,
        subject: &str,
    ) -> anyhow::Result<Self> {
        let mut subscriber = client
            .subscribe(subject.to_string())
            .await
            .map_err(|e| anyhow::anyhow!("Failed to subscribe to {}: {}", subject, e))?;
        let local = BroadcastChangeFeed::default();
        let shutdown = CancellationToken::new();

        let forward = local.clone();
        let stop = shutdown.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = stop.cancelled() => break,
                    message = subscriber.next() => {
                        let Some(message) = message else {
                            warn!("Change feed subscription closed by server");
                            break;
                        };
                        match serde_json::from_slice::<ChangeEvent>(&message.payload) {
                            Ok(event) => {
                                forward.publish(event);
                            }
                            Err(e) => {
                                warn!(
                                    subject = %message.subject,
                                    error = %e,
                                    "Dropping malformed change event"
                                );
                            }
                        }
                    }
                }
            }
            if let Err(e) = subscriber.unsubscribe().await {
                debug!(error = %e, "Failed to unsubscribe change feed");
            }
        });

        info!(subject = subject, "NATS change feed connected");
        Ok(Self { local, shutdown })
    }

    pub fn close(&self) {
        self.shutdown.cancel();
    }
}

impl ChangeFeed for NatsChangeFeed {
    fn subscribe(&self) -> broadcast::Receiver<ChangeEvent> {
        self.local.subscribe()
    }
}

impl Drop for NatsChangeFeed {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}
