// Persistence collaborators for trigger and job documents
//
// Documents are keyed by domain + id. Job updates are optimistic: the caller
// passes the revision it last read and gets `StoreError::Conflict` when the
// stored document moved on in the meantime.

pub mod memory;
pub mod postgres;

pub use memory::MemoryStore;
pub use postgres::PgStore;

use crate::errors::StoreError;
use crate::models::{Job, TriggerInfos};
use async_trait::async_trait;
use uuid::Uuid;

/// Storage for trigger descriptions
#[async_trait]
pub trait TriggerStore: Send + Sync {
    /// Persist a new trigger; returns it with its first revision
    async fn create_trigger(&self, infos: &TriggerInfos) -> Result<TriggerInfos, StoreError>;

    async fn get_trigger(&self, domain: &str, id: Uuid) -> Result<TriggerInfos, StoreError>;

    /// All triggers, or only those of `domain`
    async fn list_triggers(&self, domain: Option<&str>) -> Result<Vec<TriggerInfos>, StoreError>;

    async fn delete_trigger(&self, domain: &str, id: Uuid) -> Result<(), StoreError>;
}

/// Storage for job documents
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Persist a new job; returns it with its first revision
    async fn create_job(&self, job: &Job) -> Result<Job, StoreError>;

    async fn get_job(&self, domain: &str, id: Uuid) -> Result<Job, StoreError>;

    /// Replace a job whose `rev` matches the stored one; returns it with its new revision
    async fn update_job(&self, job: &Job) -> Result<Job, StoreError>;

    async fn list_jobs(
        &self,
        domain: &str,
        worker_type: Option<&str>,
    ) -> Result<Vec<Job>, StoreError>;

    /// Jobs that still need work after a restart: queued, running, or waiting for a retry
    async fn list_unfinished_jobs(&self) -> Result<Vec<Job>, StoreError>;
}

/// Revision token following `current`, shaped `{generation}-{nonce}`
pub fn next_rev(current: Option<&str>) -> String {
    let generation = current
        .and_then(|rev| rev.split('-').next())
        .and_then(|n| n.parse::<u64>().ok())
        .unwrap_or(0);
    format!("{}-{}", generation + 1, Uuid::new_v4().simple())
}

pub(crate) fn doc_key(domain: &str, id: Uuid) -> String {
    format!("{}/{}", domain, id)
}
