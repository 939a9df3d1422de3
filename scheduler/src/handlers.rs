// Built-in worker handlers shipped with the daemon

use async_trait::async_trait;
use jobs_core::config::{Settings, WorkerTypeConfig};
use jobs_core::worker::{HandlerRegistry, WorkerContext, WorkerHandler, WorkerSettings};
use std::sync::Arc;
use tracing::{info, warn};

pub const LOG_WORKER: &str = "log";

/// Logs the job message; useful to check triggers end to end
pub struct LogHandler;

#[async_trait]
impl WorkerHandler for LogHandler {
    async fn run(&self, ctx: WorkerContext) -> anyhow::Result<()> {
        info!(
            domain = %ctx.domain,
            job_id = %ctx.job_id,
            attempt = ctx.attempt,
            debounced = ctx.debounced,
            doctype = ctx.event.as_ref().map(|e| e.doctype.as_str()),
            message = %ctx.message,
            "log worker"
        );
        Ok(())
    }
}

/// Handlers for the configured worker types
///
/// Worker types without a built-in handler are skipped with a warning. The
/// `log` worker is always available, with one slot unless configured.
pub fn registry(settings: &Settings) -> HandlerRegistry {
    let mut registry = HandlerRegistry::new();

    for worker in &settings.workers {
        match worker.worker_type.as_str() {
            LOG_WORKER => {
                registry.register(
                    LOG_WORKER,
                    Arc::new(LogHandler),
                    WorkerSettings::from_config(worker, &settings.defaults),
                );
            }
            other => warn!(worker_type = other, "No built-in handler for worker type"),
        }
    }

    if registry.get(LOG_WORKER).is_none() {
        let fallback = WorkerTypeConfig {
            worker_type: LOG_WORKER.to_string(),
            concurrency: 1,
            max_exec_count: None,
            timeout_seconds: None,
            max_exec_time_seconds: None,
        };
        registry.register(
            LOG_WORKER,
            Arc::new(LogHandler),
            WorkerSettings::from_config(&fallback, &settings.defaults),
        );
    }
    registry
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use uuid::Uuid;

    #[tokio::test]
    async fn test_log_handler_succeeds() {
        let ctx = WorkerContext {
            domain: "alice.example.net".to_string(),
            job_id: Uuid::new_v4(),
            worker_type: LOG_WORKER.to_string(),
            message: json!({"hello": "world"}),
            event: None,
            debounced: false,
            attempt: 1,
        };
        assert!(LogHandler.run(ctx).await.is_ok());
    }

    #[test]
    fn test_registry_always_has_log_worker() {
        let mut settings = Settings::default();
        settings.workers.clear();
        let registry = registry(&settings);
        assert_eq!(registry.settings(LOG_WORKER).unwrap().concurrency, 1);
    }

    #[test]
    fn test_registry_uses_configured_concurrency() {
        let mut settings = Settings::default();
        settings.workers[0].concurrency = 4;
        let registry = registry(&settings);
        assert_eq!(registry.settings(LOG_WORKER).unwrap().concurrency, 4);
    }
}
