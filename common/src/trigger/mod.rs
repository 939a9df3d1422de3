// Runtime triggers turning trigger infos into streams of job requests
//
// Every variant follows the same contract: `schedule` starts one producer
// task and hands back the consuming end of a single-slot channel, and
// `unschedule` cancels that task. A cancelled producer never sends again,
// and the stream ends once the channel drains.

pub mod at;
pub mod cron;
pub mod event;

pub use self::at::AtTrigger;
pub use self::cron::CronTrigger;
pub use self::event::EventTrigger;

use crate::errors::TriggerError;
use crate::feed::ChangeFeed;
use crate::models::{JobRequest, TriggerInfos, TriggerType};
use chrono_tz::Tz;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;

/// Default staleness window for one-shot triggers
pub const DEFAULT_STALE_WINDOW: Duration = Duration::from_secs(24 * 60 * 60);

/// Capability shared by every trigger variant
pub trait Trigger: Send + Sync {
    fn trigger_type(&self) -> TriggerType;

    /// Start producing job requests
    ///
    /// One-shot variants yield at most one request, recurring ones run until
    /// unscheduled. Only the first call starts a producer; later calls get a
    /// stream that is already finished.
    fn schedule(&self) -> ReceiverStream<JobRequest>;

    /// Stop future emissions; the stream ends shortly after
    fn unschedule(&self);

    fn infos(&self) -> &TriggerInfos;
}

/// What a trigger needs from its environment besides its own infos
#[derive(Clone)]
pub struct TriggerContext {
    pub stale_window: Duration,
    /// Timezone cron rules are evaluated in
    pub timezone: Tz,
    pub feed: Arc<dyn ChangeFeed>,
}

impl TriggerContext {
    pub fn new(feed: Arc<dyn ChangeFeed>) -> Self {
        Self {
            stale_window: DEFAULT_STALE_WINDOW,
            timezone: Tz::UTC,
            feed,
        }
    }

    pub fn with_stale_window(mut self, stale_window: Duration) -> Self {
        self.stale_window = stale_window;
        self
    }

    pub fn with_timezone(mut self, timezone: Tz) -> Self {
        self.timezone = timezone;
        self
    }
}

/// Build the runtime trigger for `infos`, re-validating its arguments
pub fn new_trigger(
    infos: TriggerInfos,
    context: &TriggerContext,
) -> Result<Arc<dyn Trigger>, TriggerError> {
    let trigger: Arc<dyn Trigger> = match infos.trigger_type {
        TriggerType::At => Arc::new(AtTrigger::at(infos, context.stale_window)?),
        TriggerType::In => Arc::new(AtTrigger::delayed(infos, context.stale_window)?),
        TriggerType::Cron => Arc::new(CronTrigger::cron(infos, context.timezone)?),
        TriggerType::Every => Arc::new(CronTrigger::every(infos)?),
        TriggerType::Event => Arc::new(EventTrigger::new(infos, context.feed.clone())?),
    };
    Ok(trigger)
}

/// Look up a trigger type by its name, accepting an optional leading `@`
pub fn trigger_type_by_name(name: &str) -> Result<TriggerType, TriggerError> {
    name.parse::<TriggerType>()
        .map_err(|_| TriggerError::UnknownType(name.to_string()))
}

/// Sending half of a trigger's emission stream
pub(crate) struct Emitter {
    sender: mpsc::Sender<JobRequest>,
    cancel: CancellationToken,
}

impl Emitter {
    /// Hand a request to the consumer; false once cancelled or the consumer is gone
    pub(crate) async fn emit(&self, request: JobRequest) -> bool {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => false,
            sent = self.sender.send(request) => sent.is_ok(),
        }
    }

    pub(crate) fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }
}

/// Cancellation and start-once bookkeeping shared by the variants
#[derive(Debug, Default)]
pub(crate) struct Lifecycle {
    cancel: CancellationToken,
    started: AtomicBool,
}

impl Lifecycle {
    /// Spawn `producer` the first time; afterwards return an ended stream
    pub(crate) fn start<F, Fut>(&self, producer: F) -> ReceiverStream<JobRequest>
    where
        F: FnOnce(Emitter) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let (sender, receiver) = mpsc::channel(1);
        if self.started.swap(true, Ordering::SeqCst) || self.cancel.is_cancelled() {
            return ReceiverStream::new(receiver);
        }

        tokio::spawn(producer(Emitter {
            sender,
            cancel: self.cancel.clone(),
        }));
        ReceiverStream::new(receiver)
    }

    pub(crate) fn cancel(&self) {
        self.cancel.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::feed::BroadcastChangeFeed;

    fn context() -> TriggerContext {
        TriggerContext::new(Arc::new(BroadcastChangeFeed::default()))
    }

    #[test]
    fn test_trigger_type_by_name() {
        assert_eq!(trigger_type_by_name("@every").unwrap(), TriggerType::Every);
        assert!(matches!(
            trigger_type_by_name("webhook"),
            Err(TriggerError::UnknownType(_))
        ));
    }

    #[tokio::test]
    async fn test_new_trigger_picks_variant() {
        for (trigger_type, arguments) in [
            (TriggerType::At, "2030-01-01T00:00:00Z"),
            (TriggerType::In, "10m"),
            (TriggerType::Cron, "0 0 * * * *"),
            (TriggerType::Every, "1h"),
            (TriggerType::Event, "io.cozy.files"),
        ] {
            let infos = TriggerInfos::builder(trigger_type, "log")
                .domain("alice.example.net")
                .arguments(arguments)
                .build()
                .unwrap();
            let trigger = new_trigger(infos, &context()).unwrap();
            assert_eq!(trigger.trigger_type(), trigger_type);
        }
    }

    #[tokio::test]
    async fn test_new_trigger_rejects_tampered_document() {
        let mut infos = TriggerInfos::builder(TriggerType::Every, "log")
            .arguments("1h")
            .build()
            .unwrap();
        infos.arguments = "soon".to_string();

        let err = new_trigger(infos, &context()).err().unwrap();
        assert!(matches!(err, TriggerError::InvalidArgument(_)));
    }
}
