// Worker handlers and the registry mapping worker types to them

use crate::broker::BrokerBuilder;
use crate::config::{JobDefaultsConfig, WorkerTypeConfig};
use crate::models::{ChangeEvent, Job, JobOptions};
use async_trait::async_trait;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use uuid::Uuid;

/// Everything a handler learns about the job it runs
#[derive(Debug, Clone)]
pub struct WorkerContext {
    pub domain: String,
    pub job_id: Uuid,
    pub worker_type: String,
    pub message: serde_json::Value,
    pub event: Option<ChangeEvent>,
    pub debounced: bool,
    /// 1 for the first attempt
    pub attempt: u32,
}

impl From<&Job> for WorkerContext {
    fn from(job: &Job) -> Self {
        Self {
            domain: job.domain.clone(),
            job_id: job.id,
            worker_type: job.worker_type.clone(),
            message: job.message.clone(),
            event: job.event.clone(),
            debounced: job.debounced,
            attempt: job.attempts,
        }
    }
}

/// Business logic behind a worker type
///
/// A job may run more than once under retry, so handlers must be idempotent.
#[async_trait]
pub trait WorkerHandler: Send + Sync {
    async fn run(&self, ctx: WorkerContext) -> anyhow::Result<()>;
}

struct FnHandler<F>(F);

#[async_trait]
impl<F, Fut> WorkerHandler for FnHandler<F>
where
    F: Fn(WorkerContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    async fn run(&self, ctx: WorkerContext) -> anyhow::Result<()> {
        (self.0)(ctx).await
    }
}

/// Wrap an async closure as a handler
pub fn handler_fn<F, Fut>(f: F) -> Arc<dyn WorkerHandler>
where
    F: Fn(WorkerContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    Arc::new(FnHandler(f))
}

/// Pool sizing and job limits of one worker type
#[derive(Debug, Clone)]
pub struct WorkerSettings {
    /// Number of jobs of this type running at once
    pub concurrency: usize,
    pub defaults: JobOptions,
}

impl WorkerSettings {
    pub fn new(concurrency: usize, defaults: JobOptions) -> Self {
        Self {
            concurrency: concurrency.max(1),
            defaults,
        }
    }

    pub fn from_config(worker: &WorkerTypeConfig, global: &JobDefaultsConfig) -> Self {
        Self::new(worker.concurrency, worker.job_defaults(global))
    }
}

#[derive(Clone)]
pub(crate) struct RegisteredWorker {
    pub(crate) handler: Arc<dyn WorkerHandler>,
    pub(crate) settings: WorkerSettings,
}

/// Worker type -> handler and settings
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    workers: HashMap<String, RegisteredWorker>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or replace) the handler for `worker_type`
    pub fn register(
        &mut self,
        worker_type: impl Into<String>,
        handler: Arc<dyn WorkerHandler>,
        settings: WorkerSettings,
    ) -> &mut Self {
        self.workers
            .insert(worker_type.into(), RegisteredWorker { handler, settings });
        self
    }

    pub fn get(&self, worker_type: &str) -> Option<Arc<dyn WorkerHandler>> {
        self.workers.get(worker_type).map(|w| w.handler.clone())
    }

    pub fn settings(&self, worker_type: &str) -> Option<&WorkerSettings> {
        self.workers.get(worker_type).map(|w| &w.settings)
    }

    pub fn worker_types(&self) -> impl Iterator<Item = &str> {
        self.workers.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.workers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }

    /// Declare one broker queue per registered worker type
    pub fn register_queues(&self, mut builder: BrokerBuilder) -> BrokerBuilder {
        for (worker_type, worker) in &self.workers {
            builder = builder.worker(worker_type.clone(), worker.settings.defaults.clone());
        }
        builder
    }

    pub(crate) fn entries(&self) -> impl Iterator<Item = (&String, &RegisteredWorker)> {
        self.workers.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn context() -> WorkerContext {
        WorkerContext {
            domain: "alice.example.net".to_string(),
            job_id: Uuid::new_v4(),
            worker_type: "echo".to_string(),
            message: json!({"ok": true}),
            event: None,
            debounced: false,
            attempt: 1,
        }
    }

    #[tokio::test]
    async fn test_handler_fn_runs_closure() {
        let handler = handler_fn(|ctx: WorkerContext| async move {
            if ctx.message["ok"] == true {
                Ok(())
            } else {
                Err(anyhow::anyhow!("not ok"))
            }
        });

        assert!(handler.run(context()).await.is_ok());

        let mut failing = context();
        failing.message = json!({"ok": false});
        assert!(handler.run(failing).await.is_err());
    }

    #[test]
    fn test_registry_lookup() {
        let mut registry = HandlerRegistry::new();
        registry.register(
            "echo",
            handler_fn(|_| async { Ok(()) }),
            WorkerSettings::new(0, JobOptions::default()),
        );

        assert!(registry.get("echo").is_some());
        assert!(registry.get("mail").is_none());
        // Concurrency is at least one slot
        assert_eq!(registry.settings("echo").unwrap().concurrency, 1);
    }
}
