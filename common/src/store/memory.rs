// In-memory store used by tests and by deployments without a database

use super::{doc_key, next_rev, JobStore, TriggerStore};
use crate::errors::StoreError;
use crate::models::{Job, JobState, TriggerInfos};
use async_trait::async_trait;
use std::collections::HashMap;
use tokio::sync::RwLock;
use tracing::{debug, instrument};
use uuid::Uuid;

/// Trigger and job documents held in process memory
#[derive(Debug, Default)]
pub struct MemoryStore {
    triggers: RwLock<HashMap<(String, Uuid), TriggerInfos>>,
    jobs: RwLock<HashMap<(String, Uuid), Job>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl TriggerStore for MemoryStore {
    #[instrument(skip(self, infos), fields(domain = %infos.domain, trigger_id = %infos.id))]
    async fn create_trigger(&self, infos: &TriggerInfos) -> Result<TriggerInfos, StoreError> {
        let mut triggers = self.triggers.write().await;
        let key = (infos.domain.clone(), infos.id);
        if triggers.contains_key(&key) {
            return Err(StoreError::AlreadyExists(doc_key(&infos.domain, infos.id)));
        }

        let mut stored = infos.clone();
        stored.rev = Some(next_rev(None));
        triggers.insert(key, stored.clone());
        debug!("Trigger stored");
        Ok(stored)
    }

    async fn get_trigger(&self, domain: &str, id: Uuid) -> Result<TriggerInfos, StoreError> {
        self.triggers
            .read()
            .await
            .get(&(domain.to_string(), id))
            .cloned()
            .ok_or_else(|| StoreError::NotFound(doc_key(domain, id)))
    }

    async fn list_triggers(&self, domain: Option<&str>) -> Result<Vec<TriggerInfos>, StoreError> {
        let triggers = self.triggers.read().await;
        let mut list: Vec<TriggerInfos> = triggers
            .values()
            .filter(|t| domain.map_or(true, |d| t.domain == d))
            .cloned()
            .collect();
        list.sort_by_key(|t| t.created_at);
        Ok(list)
    }

    async fn delete_trigger(&self, domain: &str, id: Uuid) -> Result<(), StoreError> {
        self.triggers
            .write()
            .await
            .remove(&(domain.to_string(), id))
            .map(|_| ())
            .ok_or_else(|| StoreError::NotFound(doc_key(domain, id)))
    }
}

#[async_trait]
impl JobStore for MemoryStore {
    #[instrument(skip(self, job), fields(domain = %job.domain, job_id = %job.id))]
    async fn create_job(&self, job: &Job) -> Result<Job, StoreError> {
        let mut jobs = self.jobs.write().await;
        let key = (job.domain.clone(), job.id);
        if jobs.contains_key(&key) {
            return Err(StoreError::AlreadyExists(doc_key(&job.domain, job.id)));
        }

        let mut stored = job.clone();
        stored.rev = Some(next_rev(None));
        jobs.insert(key, stored.clone());
        Ok(stored)
    }

    async fn get_job(&self, domain: &str, id: Uuid) -> Result<Job, StoreError> {
        self.jobs
            .read()
            .await
            .get(&(domain.to_string(), id))
            .cloned()
            .ok_or_else(|| StoreError::NotFound(doc_key(domain, id)))
    }

    #[instrument(skip(self, job), fields(domain = %job.domain, job_id = %job.id, state = %job.state))]
    async fn update_job(&self, job: &Job) -> Result<Job, StoreError> {
        let mut jobs = self.jobs.write().await;
        let current = jobs
            .get_mut(&(job.domain.clone(), job.id))
            .ok_or_else(|| StoreError::NotFound(doc_key(&job.domain, job.id)))?;

        if current.rev != job.rev {
            return Err(StoreError::Conflict {
                expected: job.rev.clone().unwrap_or_default(),
                actual: current.rev.clone().unwrap_or_default(),
            });
        }

        let mut stored = job.clone();
        stored.rev = Some(next_rev(job.rev.as_deref()));
        *current = stored.clone();
        Ok(stored)
    }

    async fn list_jobs(
        &self,
        domain: &str,
        worker_type: Option<&str>,
    ) -> Result<Vec<Job>, StoreError> {
        let jobs = self.jobs.read().await;
        let mut list: Vec<Job> = jobs
            .values()
            .filter(|j| j.domain == domain)
            .filter(|j| worker_type.map_or(true, |w| j.worker_type == w))
            .cloned()
            .collect();
        list.sort_by_key(|j| j.queued_at);
        Ok(list)
    }

    async fn list_unfinished_jobs(&self) -> Result<Vec<Job>, StoreError> {
        let jobs = self.jobs.read().await;
        let mut list: Vec<Job> = jobs
            .values()
            .filter(|j| match j.state {
                JobState::Queued | JobState::Running => true,
                JobState::Errored => j.next_retry_at.is_some(),
                JobState::Done => false,
            })
            .cloned()
            .collect();
        list.sort_by_key(|j| j.queued_at);
        Ok(list)
    }
}
