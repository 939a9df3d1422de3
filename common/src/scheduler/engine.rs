// Scheduler engine: owns the live triggers and forwards their emissions to the broker

use crate::broker::Broker;
use crate::errors::{QueueError, StoreError, TriggerError};
use crate::models::{Job, JobRequest, TriggerInfos};
use crate::store::TriggerStore;
use crate::telemetry;
use crate::trigger::{new_trigger, Trigger, TriggerContext};
use futures::StreamExt;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

/// Registry of running triggers
///
/// Constructed once per process and shared by reference. Registry changes
/// come both from callers and from trigger tasks ending on their own, so the
/// map is guarded. `add` and `remove` keep the lock across their store write,
/// so a trigger is live exactly when its document is stored.
pub struct Scheduler {
    store: Arc<dyn TriggerStore>,
    broker: Arc<Broker>,
    context: TriggerContext,
    triggers: Mutex<HashMap<Uuid, Arc<dyn Trigger>>>,
}

impl Scheduler {
    pub fn new(
        store: Arc<dyn TriggerStore>,
        broker: Arc<Broker>,
        context: TriggerContext,
    ) -> Arc<Self> {
        Arc::new(Self {
            store,
            broker,
            context,
            triggers: Mutex::new(HashMap::new()),
        })
    }

    /// Load every persisted trigger and start it; returns how many started
    ///
    /// A document that no longer parses is logged and left in the store.
    #[instrument(skip(self))]
    pub async fn start(self: &Arc<Self>) -> Result<usize, TriggerError> {
        let stored = self.store.list_triggers(None).await?;
        let mut triggers = self.triggers.lock().await;
        let mut started = 0;

        for infos in stored {
            let id = infos.id;
            let trigger = match new_trigger(infos, &self.context) {
                Ok(trigger) => trigger,
                Err(e) => {
                    error!(trigger_id = %id, error = %e, "Skipping unreadable trigger");
                    continue;
                }
            };
            match self.launch(&mut triggers, trigger) {
                Ok(()) => started += 1,
                Err(e) => warn!(trigger_id = %id, error = %e, "Trigger not started"),
            }
        }
        telemetry::update_active_triggers(triggers.len());

        info!(triggers = started, "Scheduler started");
        Ok(started)
    }

    /// Persist `infos` and start its trigger
    ///
    /// Arguments are checked before anything is written, so a malformed
    /// trigger is never stored.
    #[instrument(skip(self, infos), fields(domain = %infos.domain, trigger_id = %infos.id, trigger_type = %infos.trigger_type))]
    pub async fn add(self: &Arc<Self>, infos: TriggerInfos) -> Result<TriggerInfos, TriggerError> {
        new_trigger(infos.clone(), &self.context)?;
        if !self.broker.has_worker(&infos.worker_type) {
            return Err(QueueError::UnknownWorker(infos.worker_type.clone()).into());
        }

        let mut triggers = self.triggers.lock().await;
        if triggers.contains_key(&infos.id) {
            return Err(TriggerError::AlreadyExists(infos.id));
        }
        let stored = self.store.create_trigger(&infos).await.map_err(|e| match e {
            StoreError::AlreadyExists(_) => TriggerError::AlreadyExists(infos.id),
            other => other.into(),
        })?;

        self.launch(&mut triggers, new_trigger(stored.clone(), &self.context)?)?;
        telemetry::update_active_triggers(triggers.len());
        info!("Trigger added");
        Ok(stored)
    }

    /// Stop a trigger and delete its document; jobs it already queued still run
    #[instrument(skip(self))]
    pub async fn remove(&self, domain: &str, id: Uuid) -> Result<(), TriggerError> {
        let mut triggers = self.triggers.lock().await;
        let removed = match triggers.get(&id) {
            Some(trigger) if trigger.infos().domain == domain => triggers.remove(&id),
            _ => None,
        };
        if let Some(trigger) = removed {
            trigger.unschedule();
            telemetry::update_active_triggers(triggers.len());
        }

        self.store
            .delete_trigger(domain, id)
            .await
            .map_err(|e| not_found(e, domain, id))?;
        info!("Trigger removed");
        Ok(())
    }

    pub async fn get(&self, domain: &str, id: Uuid) -> Result<TriggerInfos, TriggerError> {
        if let Some(trigger) = self.triggers.lock().await.get(&id) {
            if trigger.infos().domain == domain {
                return Ok(trigger.infos().clone());
            }
        }
        self.store
            .get_trigger(domain, id)
            .await
            .map_err(|e| not_found(e, domain, id))
    }

    /// Triggers of `domain`, optionally only those feeding `worker_type`
    pub async fn list(
        &self,
        domain: &str,
        worker_type: Option<&str>,
    ) -> Result<Vec<TriggerInfos>, TriggerError> {
        let triggers = self.store.list_triggers(Some(domain)).await?;
        Ok(triggers
            .into_iter()
            .filter(|t| worker_type.map_or(true, |w| t.worker_type == w))
            .collect())
    }

    /// Push one job from the trigger's infos right now, outside its schedule
    #[instrument(skip(self))]
    pub async fn run_once(&self, domain: &str, id: Uuid) -> Result<Job, TriggerError> {
        let infos = self.get(domain, id).await?;
        let job = self.broker.push_job(infos.job_request()).await?;
        info!(job_id = %job.id, "Trigger launched manually");
        Ok(job)
    }

    pub async fn active_count(&self) -> usize {
        self.triggers.lock().await.len()
    }

    /// Unschedule every live trigger; their documents stay stored
    pub async fn shutdown(&self) {
        let drained: Vec<Arc<dyn Trigger>> =
            self.triggers.lock().await.drain().map(|(_, t)| t).collect();
        for trigger in &drained {
            trigger.unschedule();
        }
        telemetry::update_active_triggers(0);
        info!(triggers = drained.len(), "Scheduler stopped");
    }

    /// Start `trigger` and track it in `triggers`
    ///
    /// The trigger is scheduled before this returns, so an event trigger is
    /// already subscribed to the change feed when its caller resumes.
    fn launch(
        self: &Arc<Self>,
        triggers: &mut HashMap<Uuid, Arc<dyn Trigger>>,
        trigger: Arc<dyn Trigger>,
    ) -> Result<(), TriggerError> {
        let id = trigger.infos().id;
        if triggers.contains_key(&id) {
            return Err(TriggerError::AlreadyExists(id));
        }
        let requests = trigger.schedule();
        triggers.insert(id, trigger.clone());
        tokio::spawn(Arc::clone(self).forward(trigger, requests));
        Ok(())
    }

    /// Hand every emission to the broker, then clean up when the trigger ends by itself
    #[instrument(skip_all, fields(domain = %trigger.infos().domain, trigger_id = %trigger.infos().id))]
    async fn forward(
        self: Arc<Self>,
        trigger: Arc<dyn Trigger>,
        mut requests: ReceiverStream<JobRequest>,
    ) {
        while let Some(request) = requests.next().await {
            match self.broker.push_job(request).await {
                Ok(job) => debug!(job_id = %job.id, "Trigger emitted job"),
                Err(e) => warn!(error = %e, "Trigger emission rejected"),
            }
        }

        let infos = trigger.infos();
        let ended_by_itself = {
            let mut triggers = self.triggers.lock().await;
            match triggers.get(&infos.id) {
                Some(current) if Arc::ptr_eq(current, &trigger) => {
                    triggers.remove(&infos.id);
                    telemetry::update_active_triggers(triggers.len());
                    true
                }
                _ => false,
            }
        };
        if !ended_by_itself {
            return;
        }

        if infos.trigger_type.is_one_shot() {
            match self.store.delete_trigger(&infos.domain, infos.id).await {
                Ok(()) | Err(StoreError::NotFound(_)) => debug!("One-shot trigger retired"),
                Err(e) => error!(error = %e, "Failed to delete finished trigger"),
            }
        } else {
            warn!("Recurring trigger stopped on its own");
        }
    }
}

fn not_found(err: StoreError, domain: &str, id: Uuid) -> TriggerError {
    match err {
        StoreError::NotFound(_) => TriggerError::NotFound {
            domain: domain.to_string(),
            id,
        },
        other => other.into(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::feed::BroadcastChangeFeed;
    use crate::models::{ChangeEvent, JobOptions, JobState, TriggerType, Verb};
    use crate::store::{JobStore, MemoryStore};
    use chrono::Utc;
    use serde_json::json;
    use std::time::Duration;

    struct Fixture {
        store: Arc<MemoryStore>,
        feed: BroadcastChangeFeed,
        broker: Arc<Broker>,
        scheduler: Arc<Scheduler>,
    }

    fn fixture() -> Fixture {
        let store = Arc::new(MemoryStore::new());
        let broker = Broker::builder(store.clone())
            .worker("w1", JobOptions::default())
            .build();
        let feed = BroadcastChangeFeed::default();
        let context = TriggerContext::new(Arc::new(feed.clone()));
        let scheduler = Scheduler::new(store.clone(), broker.clone(), context);
        Fixture {
            store,
            feed,
            broker,
            scheduler,
        }
    }

    fn file_created(id: &str) -> ChangeEvent {
        ChangeEvent {
            domain: "alice.example.net".to_string(),
            verb: Verb::Created,
            doctype: "io.cozy.files".to_string(),
            doc: json!({ "_id": id }),
            old_doc: None,
        }
    }

    fn infos(trigger_type: TriggerType, arguments: &str) -> TriggerInfos {
        TriggerInfos::builder(trigger_type, "w1")
            .domain("alice.example.net")
            .arguments(arguments)
            .message(json!({"x": 1}))
            .build()
            .unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn test_in_trigger_fires_once_and_is_retired() {
        let f = fixture();
        let added = f.scheduler.add(infos(TriggerType::In, "2s")).await.unwrap();
        assert_eq!(f.scheduler.active_count().await, 1);

        tokio::time::sleep(Duration::from_secs(3)).await;

        let jobs = f.store.list_jobs("alice.example.net", Some("w1")).await.unwrap();
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].message, json!({"x": 1}));
        assert_eq!(jobs[0].trigger_id, Some(added.id));
        assert_eq!(jobs[0].state, JobState::Queued);

        assert_eq!(f.scheduler.active_count().await, 0);
        assert!(matches!(
            f.scheduler.get("alice.example.net", added.id).await,
            Err(TriggerError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_add_rejects_malformed_arguments_without_storing() {
        let f = fixture();
        let mut bad = infos(TriggerType::Every, "1h");
        bad.arguments = "often".to_string();

        let err = f.scheduler.add(bad).await.unwrap_err();
        assert!(matches!(err, TriggerError::InvalidArgument(_)));
        assert!(f.store.list_triggers(None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_add_rejects_unknown_worker() {
        let f = fixture();
        let mut infos = infos(TriggerType::Every, "1h");
        infos.worker_type = "fax".to_string();

        let err = f.scheduler.add(infos).await.unwrap_err();
        assert!(matches!(err, TriggerError::Queue(QueueError::UnknownWorker(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_remove_before_fire_prevents_jobs() {
        let f = fixture();
        let added = f.scheduler.add(infos(TriggerType::Every, "10s")).await.unwrap();

        tokio::time::sleep(Duration::from_secs(5)).await;
        f.scheduler.remove("alice.example.net", added.id).await.unwrap();
        tokio::time::sleep(Duration::from_secs(30)).await;

        assert!(f.store.list_jobs("alice.example.net", None).await.unwrap().is_empty());
        assert!(f.store.list_triggers(None).await.unwrap().is_empty());
        assert_eq!(f.scheduler.active_count().await, 0);
    }

    #[tokio::test]
    async fn test_remove_is_scoped_by_domain() {
        let f = fixture();
        let added = f.scheduler.add(infos(TriggerType::Every, "1h")).await.unwrap();

        let err = f.scheduler.remove("bob.example.net", added.id).await.unwrap_err();
        assert!(matches!(err, TriggerError::NotFound { .. }));
        assert_eq!(f.scheduler.active_count().await, 1);
        f.scheduler.shutdown().await;
    }

    #[tokio::test]
    async fn test_run_once_pushes_a_job_immediately() {
        let f = fixture();
        let added = f.scheduler.add(infos(TriggerType::Cron, "@yearly")).await.unwrap();

        let job = f.scheduler.run_once("alice.example.net", added.id).await.unwrap();
        assert_eq!(job.worker_type, "w1");
        assert_eq!(job.trigger_id, Some(added.id));
        assert_eq!(f.broker.queue_len("w1"), 1);
        f.scheduler.shutdown().await;
    }

    #[tokio::test]
    async fn test_list_filters_by_worker_type() {
        let f = fixture();
        f.scheduler.add(infos(TriggerType::Every, "1h")).await.unwrap();
        f.scheduler.add(infos(TriggerType::Cron, "@daily")).await.unwrap();

        assert_eq!(f.scheduler.list("alice.example.net", None).await.unwrap().len(), 2);
        assert_eq!(f.scheduler.list("alice.example.net", Some("w1")).await.unwrap().len(), 2);
        assert!(f.scheduler.list("alice.example.net", Some("mail")).await.unwrap().is_empty());
        assert!(f.scheduler.list("bob.example.net", None).await.unwrap().is_empty());
        f.scheduler.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_reloads_persisted_triggers() {
        let f = fixture();
        // Stored by an earlier process a second ago
        let mut earlier = infos(TriggerType::In, "2s");
        earlier.created_at = Utc::now() - chrono::Duration::seconds(1);
        f.store.create_trigger(&earlier).await.unwrap();

        assert_eq!(f.scheduler.start().await.unwrap(), 1);
        tokio::time::sleep(Duration::from_secs(2)).await;

        let jobs = f.store.list_jobs("alice.example.net", None).await.unwrap();
        assert_eq!(jobs.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_event_trigger_sees_change_published_right_after_add() {
        let f = fixture();
        f.scheduler
            .add(infos(TriggerType::Event, "io.cozy.files"))
            .await
            .unwrap();
        assert_eq!(f.feed.publish(file_created("a")), 1);

        tokio::time::sleep(Duration::from_secs(1)).await;
        let jobs = f.store.list_jobs("alice.example.net", None).await.unwrap();
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].event.as_ref().unwrap().doc["_id"], "a");
        f.scheduler.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_debounce_window_yields_one_job_with_last_event() {
        let f = fixture();
        let debounced = TriggerInfos::builder(TriggerType::Event, "w1")
            .domain("alice.example.net")
            .arguments("io.cozy.files:CREATED")
            .debounce("5s")
            .build()
            .unwrap();
        f.scheduler.add(debounced).await.unwrap();

        for id in ["a", "b", "c"] {
            f.feed.publish(file_created(id));
            tokio::time::sleep(Duration::from_secs(1)).await;
        }
        let jobs = f.store.list_jobs("alice.example.net", None).await.unwrap();
        assert!(jobs.is_empty());

        tokio::time::sleep(Duration::from_secs(5)).await;
        let jobs = f.store.list_jobs("alice.example.net", None).await.unwrap();
        assert_eq!(jobs.len(), 1);
        assert!(jobs[0].debounced);
        assert_eq!(jobs[0].event.as_ref().unwrap().doc["_id"], "c");

        // A change after the window closed starts a new one
        f.feed.publish(file_created("d"));
        tokio::time::sleep(Duration::from_secs(6)).await;
        let jobs = f.store.list_jobs("alice.example.net", None).await.unwrap();
        assert_eq!(jobs.len(), 2);
        assert!(jobs.iter().any(|j| !j.debounced && j.event.as_ref().unwrap().doc["_id"] == "d"));
        f.scheduler.shutdown().await;
    }

    #[tokio::test]
    async fn test_concurrent_add_and_remove_stay_consistent() {
        let f = fixture();
        for _ in 0..20 {
            let trigger = infos(TriggerType::Every, "1h");
            let id = trigger.id;
            let (_, _) = tokio::join!(
                f.scheduler.add(trigger),
                f.scheduler.remove("alice.example.net", id)
            );

            let live = f.scheduler.triggers.lock().await.contains_key(&id);
            let stored = f.store.get_trigger("alice.example.net", id).await.is_ok();
            assert_eq!(live, stored);
        }
        f.scheduler.shutdown().await;
    }
}
