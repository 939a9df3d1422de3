// Worker pool: N execution slots per worker type
//
// Each slot pulls from its worker type's broker queue, runs the handler in its
// own task under the job's time limits, and reports the outcome back to the
// broker. A failing or panicking handler only fails its own job.

use super::handler::{HandlerRegistry, WorkerContext, WorkerHandler};
use crate::broker::Broker;
use crate::errors::ExecutionError;
use crate::models::Job;
use crate::telemetry;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::{JoinError, JoinSet};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

pub struct WorkerPool {
    broker: Arc<Broker>,
    registry: HandlerRegistry,
    cancel: CancellationToken,
    slots: Mutex<JoinSet<()>>,
}

impl WorkerPool {
    pub fn new(broker: Arc<Broker>, registry: HandlerRegistry) -> Self {
        Self {
            broker,
            registry,
            cancel: CancellationToken::new(),
            slots: Mutex::new(JoinSet::new()),
        }
    }

    /// Spawn the configured number of slots for every registered worker type
    pub async fn start(&self) {
        let mut slots = self.slots.lock().await;
        for (worker_type, worker) in self.registry.entries() {
            if !self.broker.has_worker(worker_type) {
                warn!(worker_type = %worker_type, "No broker queue for worker type; not starting slots");
                continue;
            }
            for slot in 0..worker.settings.concurrency {
                slots.spawn(run_slot(
                    self.broker.clone(),
                    worker_type.clone(),
                    worker.handler.clone(),
                    self.cancel.clone(),
                    slot,
                ));
            }
            info!(
                worker_type = %worker_type,
                concurrency = worker.settings.concurrency,
                "Worker slots started"
            );
        }
    }

    /// Stop taking new jobs and wait for running ones to finish
    pub async fn shutdown(&self) {
        info!("Shutting down worker pool");
        self.cancel.cancel();

        let mut slots = self.slots.lock().await;
        while let Some(result) = slots.join_next().await {
            if let Err(e) = result {
                error!(error = %e, "Worker slot ended abnormally");
            }
        }
        info!("Worker pool stopped");
    }
}

#[instrument(skip(broker, handler, cancel))]
async fn run_slot(
    broker: Arc<Broker>,
    worker_type: String,
    handler: Arc<dyn WorkerHandler>,
    cancel: CancellationToken,
    slot: usize,
) {
    debug!("Worker slot ready");
    while let Some(job) = broker.next_job(&worker_type, &cancel).await {
        execute(&broker, handler.clone(), job).await;
    }
    debug!("Worker slot stopped");
}

/// Time limit for the next attempt, and whether it comes from the cumulative budget
fn attempt_limit(job: &Job) -> (Option<Duration>, bool) {
    let per_attempt = job.options.attempt_timeout();
    let remaining = job
        .options
        .overall_limit()
        .map(|limit| limit.saturating_sub(job.exec_time()));

    match (per_attempt, remaining) {
        (Some(attempt), Some(remaining)) if remaining < attempt => (Some(remaining), true),
        (None, Some(remaining)) => (Some(remaining), true),
        (attempt, _) => (attempt, false),
    }
}

fn panic_message(err: JoinError) -> String {
    if err.is_cancelled() {
        return "handler task was cancelled".to_string();
    }
    let payload = err.into_panic();
    payload
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic payload".to_string())
}

/// Run one attempt of `job` and record its outcome
#[instrument(skip_all, fields(domain = %job.domain, job_id = %job.id, worker_type = %job.worker_type))]
async fn execute(broker: &Arc<Broker>, handler: Arc<dyn WorkerHandler>, job: Job) {
    let job = match broker.start_job(job.clone()).await {
        Ok(job) => job,
        Err(e) => {
            error!(error = %e, "Failed to mark job running; releasing it");
            broker.release_job(job);
            return;
        }
    };

    let (limit, limit_is_overall) = attempt_limit(&job);
    let ctx = WorkerContext::from(&job);
    let started = Instant::now();

    let mut task = tokio::spawn(async move { handler.run(ctx).await });
    let outcome = match limit {
        Some(limit) => match tokio::time::timeout(limit, &mut task).await {
            Ok(joined) => Some(joined),
            Err(_) => {
                task.abort();
                None
            }
        },
        None => Some(task.await),
    };
    let elapsed = started.elapsed();
    telemetry::record_job_duration(&job.worker_type, elapsed);

    let failure = match outcome {
        Some(Ok(Ok(()))) => None,
        Some(Ok(Err(e))) => Some(ExecutionError::Failure(format!("{:#}", e))),
        Some(Err(join_error)) => Some(ExecutionError::Failure(format!(
            "handler panicked: {}",
            panic_message(join_error)
        ))),
        None => {
            let limit_ms = limit.map_or(0, |l| l.as_millis() as u64);
            Some(if limit_is_overall {
                ExecutionError::OverallTimeout(limit_ms)
            } else {
                ExecutionError::Timeout(limit_ms)
            })
        }
    };

    let recorded = match failure {
        None => broker.complete_job(job, elapsed).await,
        Some(failure) => broker.fail_job(job, failure, elapsed).await,
    };
    // Transient store errors are already retried; a job left `running` is recovered on restart
    if let Err(e) = recorded {
        error!(error = %e, "Failed to record job outcome");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::StoreError;
    use crate::models::{JobOptions, JobRequest, JobState};
    use crate::retry::FixedDelay;
    use crate::store::{JobStore, MemoryStore};
    use crate::worker::handler::{handler_fn, WorkerSettings};
    use serde_json::json;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn options(max_exec_count: u32, timeout: Option<u64>, max_exec_time: Option<u64>) -> JobOptions {
        JobOptions {
            max_exec_count,
            timeout: timeout.map(Duration::from_secs),
            max_exec_time: max_exec_time.map(Duration::from_secs),
        }
    }

    async fn run_until_terminal(
        handler: Arc<dyn WorkerHandler>,
        job_options: JobOptions,
    ) -> (Job, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        let job = run_on_store(store.clone(), handler, job_options).await;
        (job, store)
    }

    async fn run_on_store(
        store: Arc<dyn JobStore>,
        handler: Arc<dyn WorkerHandler>,
        job_options: JobOptions,
    ) -> Job {
        let mut registry = HandlerRegistry::new();
        registry.register("test", handler, WorkerSettings::new(1, job_options));
        let broker = registry
            .register_queues(Broker::builder(store.clone()))
            .retry_strategy(Arc::new(FixedDelay::new(Duration::from_secs(1))))
            .build();

        let pool = WorkerPool::new(broker.clone(), registry);
        pool.start().await;

        let job = broker
            .push_job(JobRequest::new("alice.example.net", "test", json!({"x": 1})))
            .await
            .unwrap();

        let finished = loop {
            tokio::time::sleep(Duration::from_millis(100)).await;
            let current = store.get_job("alice.example.net", job.id).await.unwrap();
            if current.is_terminal() {
                break current;
            }
        };
        pool.shutdown().await;
        broker.shutdown();
        finished
    }

    /// Memory store whose first `failures` job updates fail with `error`
    struct FlakyStore {
        inner: MemoryStore,
        failures: AtomicU32,
        error: fn() -> StoreError,
    }

    impl FlakyStore {
        fn new(failures: u32, error: fn() -> StoreError) -> Self {
            Self {
                inner: MemoryStore::new(),
                failures: AtomicU32::new(failures),
                error,
            }
        }
    }

    #[async_trait::async_trait]
    impl JobStore for FlakyStore {
        async fn create_job(&self, job: &Job) -> Result<Job, StoreError> {
            self.inner.create_job(job).await
        }

        async fn get_job(&self, domain: &str, id: uuid::Uuid) -> Result<Job, StoreError> {
            self.inner.get_job(domain, id).await
        }

        async fn update_job(&self, job: &Job) -> Result<Job, StoreError> {
            let fail = self
                .failures
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            if fail {
                return Err((self.error)());
            }
            self.inner.update_job(job).await
        }

        async fn list_jobs(
            &self,
            domain: &str,
            worker_type: Option<&str>,
        ) -> Result<Vec<Job>, StoreError> {
            self.inner.list_jobs(domain, worker_type).await
        }

        async fn list_unfinished_jobs(&self) -> Result<Vec<Job>, StoreError> {
            self.inner.list_unfinished_jobs().await
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_successful_job_is_done() {
        let (job, _) =
            run_until_terminal(handler_fn(|_| async { Ok(()) }), options(3, Some(5), None)).await;
        assert_eq!(job.state, JobState::Done);
        assert_eq!(job.attempts, 1);
        assert!(job.started_at.is_some());
        assert!(job.finished_at.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_always_failing_job_uses_every_attempt() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let handler = handler_fn(move |_| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err(anyhow::anyhow!("always broken"))
            }
        });

        let (job, _) = run_until_terminal(handler, options(3, Some(5), None)).await;
        assert_eq!(job.state, JobState::Errored);
        assert_eq!(job.attempts, 3);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(job.error_kind.as_deref(), Some("exhausted_retries"));
        assert!(job.last_error.unwrap().contains("always broken"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_panicking_handler_is_a_failure() {
        let handler = handler_fn(|ctx: WorkerContext| async move {
            if ctx.attempt == 1 {
                panic!("first attempt explodes");
            }
            Ok(())
        });

        let (job, _) = run_until_terminal(handler, options(2, Some(5), None)).await;
        assert_eq!(job.state, JobState::Done);
        assert_eq!(job.attempts, 2);
        assert!(job.last_error.unwrap().contains("first attempt explodes"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_handler_times_out_each_attempt() {
        let handler = handler_fn(|_| async {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(())
        });

        let (job, _) = run_until_terminal(handler, options(2, Some(2), None)).await;
        assert_eq!(job.state, JobState::Errored);
        assert_eq!(job.attempts, 2);
        assert!(job.exec_time_ms >= 4_000);
        assert!(job.last_error.unwrap().contains("timeout"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cumulative_budget_stops_retries() {
        let handler = handler_fn(|_| async {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(())
        });

        // 10 attempts of 3s would need 30s, the budget is 7s
        let (job, _) = run_until_terminal(handler, options(10, Some(3), Some(7))).await;
        assert_eq!(job.state, JobState::Errored);
        assert_eq!(job.error_kind.as_deref(), Some("overall_timeout"));
        assert_eq!(job.attempts, 3);
        assert!(job.exec_time_ms <= 7_100);
    }

    #[test]
    fn test_attempt_limit_prefers_the_tighter_bound() {
        let mut job = Job::from_request(
            JobRequest::new("alice.example.net", "test", json!({})),
            options(3, Some(10), Some(25)),
        );
        assert_eq!(attempt_limit(&job), (Some(Duration::from_secs(10)), false));

        job.exec_time_ms = 20_000;
        assert_eq!(attempt_limit(&job), (Some(Duration::from_secs(5)), true));

        job.options.timeout = None;
        job.options.max_exec_time = None;
        assert_eq!(attempt_limit(&job), (None, false));
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_waits_for_running_job() {
        let store = Arc::new(MemoryStore::new());
        let mut registry = HandlerRegistry::new();
        registry.register(
            "test",
            handler_fn(|_| async {
                tokio::time::sleep(Duration::from_secs(3)).await;
                Ok(())
            }),
            WorkerSettings::new(1, options(1, None, None)),
        );
        let broker = registry.register_queues(Broker::builder(store.clone())).build();
        let pool = WorkerPool::new(broker.clone(), registry);
        pool.start().await;

        let job = broker
            .push_job(JobRequest::new("alice.example.net", "test", json!({})))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        pool.shutdown().await;

        let job = store.get_job("alice.example.net", job.id).await.unwrap();
        assert_eq!(job.state, JobState::Done);
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_store_errors_do_not_strand_job() {
        let store = Arc::new(FlakyStore::new(3, || {
            StoreError::Database("connection reset".to_string())
        }));
        let job = run_on_store(
            store,
            handler_fn(|_| async { Ok(()) }),
            options(3, Some(5), None),
        )
        .await;

        assert_eq!(job.state, JobState::Done);
        assert_eq!(job.attempts, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rejected_pickup_is_released_to_the_queue() {
        let store = Arc::new(FlakyStore::new(1, || StoreError::Conflict {
            expected: "1-a".to_string(),
            actual: "2-b".to_string(),
        }));
        let job = run_on_store(
            store,
            handler_fn(|_| async { Ok(()) }),
            options(3, Some(5), None),
        )
        .await;

        assert_eq!(job.state, JobState::Done);
        // The rejected pickup never reached the store
        assert_eq!(job.attempts, 1);
    }
}
