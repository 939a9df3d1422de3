// Event triggers: react to document changes, optionally debounced

use super::{Emitter, Lifecycle, Trigger};
use crate::errors::TriggerError;
use crate::feed::ChangeFeed;
use crate::models::{ChangeEvent, JobRequest, TriggerInfos, TriggerType};
use crate::schedule::{parse_event_arguments, parse_interval, EventSelector};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::time::{sleep_until, Instant};
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, instrument, warn};

/// Emits a request for every matching change, or one per quiet debounce window
pub struct EventTrigger {
    infos: TriggerInfos,
    selectors: Arc<Vec<EventSelector>>,
    debounce: Option<Duration>,
    feed: Arc<dyn ChangeFeed>,
    lifecycle: Lifecycle,
}

impl EventTrigger {
    pub fn new(infos: TriggerInfos, feed: Arc<dyn ChangeFeed>) -> Result<Self, TriggerError> {
        let selectors = parse_event_arguments(&infos.arguments)?;
        let debounce = infos.debounce.as_deref().map(parse_interval).transpose()?;
        Ok(Self {
            infos,
            selectors: Arc::new(selectors),
            debounce,
            feed,
            lifecycle: Lifecycle::default(),
        })
    }

    /// Whether `event` belongs to this trigger's domain and matches a selector
    pub fn matches(&self, event: &ChangeEvent) -> bool {
        event_matches(&self.infos.domain, &self.selectors, event)
    }
}

fn event_matches(domain: &str, selectors: &[EventSelector], event: &ChangeEvent) -> bool {
    event.domain == domain && selectors.iter().any(|s| s.matches(event))
}

impl Trigger for EventTrigger {
    fn trigger_type(&self) -> TriggerType {
        TriggerType::Event
    }

    fn schedule(&self) -> ReceiverStream<JobRequest> {
        // Subscribe before returning so no change published afterwards is missed
        let changes = self.feed.subscribe();
        let template = self.infos.job_request();
        let selectors = self.selectors.clone();
        let debounce = self.debounce;
        self.lifecycle.start(move |emitter| async move {
            watch(emitter, changes, template, selectors, debounce).await
        })
    }

    fn unschedule(&self) {
        self.lifecycle.cancel();
    }

    fn infos(&self) -> &TriggerInfos {
        &self.infos
    }
}

fn request_for(template: &JobRequest, event: ChangeEvent, debounced: bool) -> JobRequest {
    let mut request = template.clone();
    request.event = Some(event);
    request.debounced = debounced;
    request
}

/// Latest matched change waiting for its debounce window to close
struct Pending {
    event: ChangeEvent,
    coalesced: u32,
    deadline: Instant,
}

#[instrument(skip_all, fields(domain = %template.domain, trigger_id = ?template.trigger_id))]
async fn watch(
    emitter: Emitter,
    mut changes: broadcast::Receiver<ChangeEvent>,
    template: JobRequest,
    selectors: Arc<Vec<EventSelector>>,
    debounce: Option<Duration>,
) {
    let mut pending: Option<Pending> = None;

    loop {
        // Far-future placeholder; the branch is disabled while nothing is pending
        let deadline = pending
            .as_ref()
            .map(|p| p.deadline)
            .unwrap_or_else(|| Instant::now() + Duration::from_secs(86_400));

        tokio::select! {
            biased;
            _ = emitter.cancel_token().cancelled() => {
                if pending.is_some() {
                    debug!("Dropping pending debounced event on unschedule");
                }
                return;
            }
            _ = sleep_until(deadline), if pending.is_some() => {
                if let Some(p) = pending.take() {
                    debug!(coalesced = p.coalesced, "Debounce window elapsed");
                    if !emitter.emit(request_for(&template, p.event, p.coalesced > 1)).await {
                        return;
                    }
                }
            }
            received = changes.recv() => match received {
                Ok(event) => {
                    if !event_matches(&template.domain, &selectors, &event) {
                        continue;
                    }
                    match debounce {
                        None => {
                            if !emitter.emit(request_for(&template, event, false)).await {
                                return;
                            }
                        }
                        Some(window) => {
                            let coalesced = pending.as_ref().map_or(0, |p| p.coalesced) + 1;
                            pending = Some(Pending {
                                event,
                                coalesced,
                                deadline: Instant::now() + window,
                            });
                        }
                    }
                }
                Err(RecvError::Lagged(skipped)) => {
                    warn!(skipped = skipped, "Event trigger fell behind the change feed");
                }
                Err(RecvError::Closed) => {
                    debug!("Change feed closed");
                    if let Some(p) = pending.take() {
                        emitter.emit(request_for(&template, p.event, p.coalesced > 1)).await;
                    }
                    return;
                }
            }
        }
    }
}
