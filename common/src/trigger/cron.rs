// Recurring triggers: cron rules and fixed intervals

use super::{Emitter, Lifecycle, Trigger};
use crate::errors::TriggerError;
use crate::models::{JobRequest, TriggerInfos, TriggerType};
use crate::schedule::Recurrence;
use chrono::Utc;
use chrono_tz::Tz;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, instrument, warn};

/// Emits one request per tick until unscheduled
///
/// The next tick is always computed from the current time, so ticks missed
/// while the process was down are skipped rather than replayed.
pub struct CronTrigger {
    infos: TriggerInfos,
    recurrence: Recurrence,
    lifecycle: Lifecycle,
}

impl CronTrigger {
    pub fn cron(infos: TriggerInfos, timezone: Tz) -> Result<Self, TriggerError> {
        let recurrence = Recurrence::cron(&infos.arguments, timezone)?;
        Ok(Self::new(infos, recurrence))
    }

    pub fn every(infos: TriggerInfos) -> Result<Self, TriggerError> {
        let recurrence = Recurrence::every(&infos.arguments)?;
        Ok(Self::new(infos, recurrence))
    }

    fn new(infos: TriggerInfos, recurrence: Recurrence) -> Self {
        Self {
            infos,
            recurrence,
            lifecycle: Lifecycle::default(),
        }
    }
}

impl Trigger for CronTrigger {
    fn trigger_type(&self) -> TriggerType {
        self.infos.trigger_type
    }

    fn schedule(&self) -> ReceiverStream<JobRequest> {
        let request = self.infos.job_request();
        let recurrence = self.recurrence.clone();
        self.lifecycle
            .start(move |emitter| async move { tick(emitter, request, recurrence).await })
    }

    fn unschedule(&self) {
        self.lifecycle.cancel();
    }

    fn infos(&self) -> &TriggerInfos {
        &self.infos
    }
}

#[instrument(skip_all, fields(domain = %request.domain, trigger_id = ?request.trigger_id))]
async fn tick(emitter: Emitter, request: JobRequest, recurrence: Recurrence) {
    // Last cron fire time; keeps a timer that wakes a little early from firing the same tick twice
    let mut previous = None;

    loop {
        let wait = match &recurrence {
            Recurrence::Every(interval) => *interval,
            Recurrence::Cron { .. } => {
                let now = Utc::now();
                let reference = previous.filter(|p| *p > now).unwrap_or(now);
                let Some(next) = recurrence.next_after(reference) else {
                    warn!("Cron rule has no upcoming tick; stopping");
                    return;
                };
                previous = Some(next);
                (next - now).to_std().unwrap_or_default()
            }
        };

        tokio::select! {
            _ = emitter.cancel_token().cancelled() => return,
            _ = tokio::time::sleep(wait) => {}
        }

        debug!("Recurring trigger tick");
        if !emitter.emit(request.clone()).await {
            return;
        }
    }
}
