// Real-time job state notifications

use crate::models::JobStateEvent;
use async_trait::async_trait;
use tokio::sync::broadcast;
use tracing::{debug, warn};

/// Receives every job state transition
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait JobNotifier: Send + Sync {
    /// Publish `event`; failures are logged, never returned
    async fn notify(&self, event: &JobStateEvent);
}

/// In-process notifier for local subscribers
#[derive(Debug, Clone)]
pub struct BroadcastNotifier {
    sender: broadcast::Sender<JobStateEvent>,
}

impl BroadcastNotifier {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<JobStateEvent> {
        self.sender.subscribe()
    }
}

impl Default for BroadcastNotifier {
    fn default() -> Self {
        Self::new(1024)
    }
}

#[async_trait]
impl JobNotifier for BroadcastNotifier {
    async fn notify(&self, event: &JobStateEvent) {
        // No subscribers is not an error
        let _ = self.sender.send(event.clone());
    }
}

/// Publishes JSON events on `{prefix}.{domain}.{job_id}`
#[derive(Debug, Clone)]
pub struct NatsNotifier {
    client: async_nats::Client,
    prefix: String,
}

impl NatsNotifier {
    pub fn new(client: async_nats::Client, prefix: impl Into<String>) -> Self {
        Self {
            client,
            prefix: prefix.into(),
        }
    }

    pub fn subject_for(&self, event: &JobStateEvent) -> String {
        state_subject(&self.prefix, event)
    }
}

fn state_subject(prefix: &str, event: &JobStateEvent) -> String {
    format!("{}.{}.{}", prefix, event.domain, event.job_id)
}

#[async_trait]
impl JobNotifier for NatsNotifier {
    async fn notify(&self, event: &JobStateEvent) {
        let payload = match serde_json::to_vec(event) {
            Ok(payload) => payload,
            Err(e) => {
                warn!(error = %e, "Failed to serialize job state event");
                return;
            }
        };

        let subject = self.subject_for(event);
        match self.client.publish(subject.clone(), payload.into()).await {
            Ok(()) => debug!(subject = %subject, state = %event.state, "Job state published"),
            Err(e) => warn!(error = %e, subject = %subject, "Failed to publish job state event"),
        }
    }
}
