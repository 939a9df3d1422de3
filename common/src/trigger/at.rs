// One-shot triggers: `at` a timestamp, or `in` a delay after creation

use super::{Emitter, Lifecycle, Trigger};
use crate::errors::{ArgumentError, TriggerError};
use crate::models::{JobRequest, TriggerInfos, TriggerType};
use crate::schedule::{parse_duration, parse_timestamp};
use chrono::{DateTime, Utc};
use std::time::Duration;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, info, instrument};

/// Fires once at `fire_at`; fires immediately when late by less than the stale window
pub struct AtTrigger {
    infos: TriggerInfos,
    fire_at: DateTime<Utc>,
    stale_window: Duration,
    lifecycle: Lifecycle,
}

impl AtTrigger {
    /// `at` trigger: the arguments are an absolute timestamp
    pub fn at(infos: TriggerInfos, stale_window: Duration) -> Result<Self, TriggerError> {
        let fire_at = parse_timestamp(&infos.arguments)?;
        Ok(Self::with_fire_time(infos, fire_at, stale_window))
    }

    /// `in` trigger: the arguments are a delay counted from the infos' creation
    pub fn delayed(infos: TriggerInfos, stale_window: Duration) -> Result<Self, TriggerError> {
        let delay = parse_duration(&infos.arguments)?;
        let fire_at = chrono::Duration::from_std(delay)
            .ok()
            .and_then(|delay| infos.created_at.checked_add_signed(delay))
            .ok_or_else(|| ArgumentError::InvalidDuration {
                value: infos.arguments.clone(),
                reason: "fire time out of range".to_string(),
            })?;
        Ok(Self::with_fire_time(infos, fire_at, stale_window))
    }

    fn with_fire_time(infos: TriggerInfos, fire_at: DateTime<Utc>, stale_window: Duration) -> Self {
        Self {
            infos,
            fire_at,
            stale_window,
            lifecycle: Lifecycle::default(),
        }
    }

    pub fn fire_at(&self) -> DateTime<Utc> {
        self.fire_at
    }
}

impl Trigger for AtTrigger {
    fn trigger_type(&self) -> TriggerType {
        self.infos.trigger_type
    }

    fn schedule(&self) -> ReceiverStream<JobRequest> {
        let request = self.infos.job_request();
        let fire_at = self.fire_at;
        let stale_window = self.stale_window;
        let trigger_id = self.infos.id;
        self.lifecycle.start(move |emitter| async move {
            fire_once(emitter, request, fire_at, stale_window, trigger_id).await
        })
    }

    fn unschedule(&self) {
        self.lifecycle.cancel();
    }

    fn infos(&self) -> &TriggerInfos {
        &self.infos
    }
}

#[instrument(skip(emitter, request, stale_window), fields(domain = %request.domain))]
async fn fire_once(
    emitter: Emitter,
    request: JobRequest,
    fire_at: DateTime<Utc>,
    stale_window: Duration,
    trigger_id: uuid::Uuid,
) {
    let now = Utc::now();
    if fire_at <= now {
        let late = (now - fire_at).to_std().unwrap_or_default();
        if late > stale_window {
            info!(%fire_at, late_seconds = late.as_secs(), "Discarding stale one-shot trigger");
            return;
        }
    } else {
        let wait = (fire_at - now).to_std().unwrap_or_default();
        debug!(wait_ms = wait.as_millis() as u64, "Waiting for fire time");
        tokio::select! {
            _ = emitter.cancel_token().cancelled() => return,
            _ = tokio::time::sleep(wait) => {}
        }
    }

    if emitter.emit(request).await {
        debug!("One-shot trigger fired");
    }
}
