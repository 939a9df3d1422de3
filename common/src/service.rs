// Client-facing operations on jobs and triggers

use crate::broker::Broker;
use crate::errors::{QueueError, StoreError, TriggerError};
use crate::models::{Job, JobOptions, JobRequest, TriggerInfos};
use crate::scheduler::Scheduler;
use crate::store::JobStore;
use std::sync::Arc;
use tracing::instrument;
use uuid::Uuid;

/// Entry point for callers outside the engine (API handlers, CLIs, tests)
#[derive(Clone)]
pub struct JobService {
    jobs: Arc<dyn JobStore>,
    broker: Arc<Broker>,
    scheduler: Arc<Scheduler>,
}

impl JobService {
    pub fn new(jobs: Arc<dyn JobStore>, broker: Arc<Broker>, scheduler: Arc<Scheduler>) -> Self {
        Self {
            jobs,
            broker,
            scheduler,
        }
    }

    /// Queue a job directly, without a trigger
    #[instrument(skip(self, message, options))]
    pub async fn push_job(
        &self,
        domain: &str,
        worker_type: &str,
        message: serde_json::Value,
        options: JobOptions,
    ) -> Result<Job, QueueError> {
        let request = JobRequest::new(domain, worker_type, message).with_options(options);
        self.broker.push_job(request).await
    }

    pub async fn get_job(&self, domain: &str, id: Uuid) -> Result<Job, StoreError> {
        self.jobs.get_job(domain, id).await
    }

    pub async fn list_jobs(
        &self,
        domain: &str,
        worker_type: Option<&str>,
    ) -> Result<Vec<Job>, StoreError> {
        self.jobs.list_jobs(domain, worker_type).await
    }

    pub async fn add_trigger(&self, infos: TriggerInfos) -> Result<TriggerInfos, TriggerError> {
        self.scheduler.add(infos).await
    }

    pub async fn get_trigger(&self, domain: &str, id: Uuid) -> Result<TriggerInfos, TriggerError> {
        self.scheduler.get(domain, id).await
    }

    pub async fn list_triggers(
        &self,
        domain: &str,
        worker_type: Option<&str>,
    ) -> Result<Vec<TriggerInfos>, TriggerError> {
        self.scheduler.list(domain, worker_type).await
    }

    pub async fn delete_trigger(&self, domain: &str, id: Uuid) -> Result<(), TriggerError> {
        self.scheduler.remove(domain, id).await
    }

    /// Run a trigger once, right now
    pub async fn launch_trigger(&self, domain: &str, id: Uuid) -> Result<Job, TriggerError> {
        self.scheduler.run_once(domain, id).await
    }
}
