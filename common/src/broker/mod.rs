// Broker: persists jobs, routes them to per-worker-type queues, and drives
// the job state machine
//
//   queued -> running -> done
//                     -> errored (next_retry_at set) -> queued ...
//                     -> errored (terminal)
//
// Every transition is written to the job store before it is announced, and
// retry timing lives on the job document so a restart can pick it up again.

pub mod queue;

pub use queue::{FairQueue, Reservation};

use crate::errors::{ExecutionError, QueueError, StoreError};
use crate::models::{Job, JobOptions, JobRequest, JobState, JobStateEvent};
use crate::notifier::{BroadcastNotifier, JobNotifier};
use crate::retry::{ExponentialBackoff, RetryStrategy};
use crate::store::JobStore;
use crate::telemetry;
use chrono::Utc;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

/// Backoff between attempts of a job store call that failed transiently
const STORE_RETRY_BASE: Duration = Duration::from_millis(100);
const STORE_RETRY_MAX: Duration = Duration::from_secs(5);
/// Pause before a job whose pickup failed goes back on its queue
const RELEASE_DELAY: Duration = Duration::from_secs(1);

struct WorkerQueue {
    jobs: FairQueue,
    /// Limits for jobs that leave them unset
    defaults: JobOptions,
}

/// Job intake and state transitions for every registered worker type
pub struct Broker {
    store: Arc<dyn JobStore>,
    notifier: Arc<dyn JobNotifier>,
    retry: Arc<dyn RetryStrategy>,
    queues: HashMap<String, WorkerQueue>,
    /// Waiting jobs allowed per worker type; 0 means unbounded
    max_backlog: usize,
    /// Delays between attempts of a store call hit by a transient error
    store_retry: ExponentialBackoff,
    shutdown: CancellationToken,
}

pub struct BrokerBuilder {
    store: Arc<dyn JobStore>,
    notifier: Arc<dyn JobNotifier>,
    retry: Arc<dyn RetryStrategy>,
    queues: HashMap<String, WorkerQueue>,
    max_backlog: usize,
}

impl BrokerBuilder {
    pub fn notifier(mut self, notifier: Arc<dyn JobNotifier>) -> Self {
        self.notifier = notifier;
        self
    }

    pub fn retry_strategy(mut self, retry: Arc<dyn RetryStrategy>) -> Self {
        self.retry = retry;
        self
    }

    pub fn max_backlog(mut self, max_backlog: usize) -> Self {
        self.max_backlog = max_backlog;
        self
    }

    /// Accept jobs for `worker_type`, filling their unset limits from `defaults`
    pub fn worker(mut self, worker_type: impl Into<String>, defaults: JobOptions) -> Self {
        self.queues.insert(
            worker_type.into(),
            WorkerQueue {
                jobs: FairQueue::new(),
                defaults,
            },
        );
        self
    }

    pub fn build(self) -> Arc<Broker> {
        Arc::new(Broker {
            store: self.store,
            notifier: self.notifier,
            retry: self.retry,
            queues: self.queues,
            max_backlog: self.max_backlog,
            store_retry: ExponentialBackoff::with_config(STORE_RETRY_BASE, STORE_RETRY_MAX, 0.1),
            shutdown: CancellationToken::new(),
        })
    }
}

impl Broker {
    pub fn builder(store: Arc<dyn JobStore>) -> BrokerBuilder {
        BrokerBuilder {
            store,
            notifier: Arc::new(BroadcastNotifier::default()),
            retry: Arc::new(ExponentialBackoff::default()),
            queues: HashMap::new(),
            max_backlog: 0,
        }
    }

    pub fn worker_types(&self) -> impl Iterator<Item = &str> {
        self.queues.keys().map(String::as_str)
    }

    pub fn has_worker(&self, worker_type: &str) -> bool {
        self.queues.contains_key(worker_type)
    }

    /// Jobs waiting for a slot of `worker_type`
    pub fn queue_len(&self, worker_type: &str) -> usize {
        self.queues.get(worker_type).map_or(0, |q| q.jobs.len())
    }

    /// Persist a new `queued` job for `request` and put it on its worker queue
    ///
    /// # Errors
    /// `UnknownWorker` when no queue serves the worker type, `QueueFull` when
    /// the backlog limit is reached, `Store` when the job cannot be persisted.
    #[instrument(skip(self, request), fields(domain = %request.domain, worker_type = %request.worker_type))]
    pub async fn push_job(&self, request: JobRequest) -> Result<Job, QueueError> {
        let queue = self
            .queues
            .get(&request.worker_type)
            .ok_or_else(|| QueueError::UnknownWorker(request.worker_type.clone()))?;

        // The place is taken before the store write so concurrent pushes cannot overshoot
        let reservation = if self.max_backlog > 0 {
            match queue.jobs.try_reserve(self.max_backlog) {
                Some(reservation) => Some(reservation),
                None => {
                    warn!(limit = self.max_backlog, "Rejecting job: queue is full");
                    return Err(QueueError::QueueFull {
                        worker_type: request.worker_type,
                        limit: self.max_backlog,
                    });
                }
            }
        } else {
            None
        };

        let options = request.options.with_defaults(&queue.defaults);
        let job = self.store.create_job(&Job::from_request(request, options)).await?;

        match reservation {
            Some(reservation) => reservation.fill(job.clone()),
            None => queue.jobs.push(job.clone()),
        }
        telemetry::record_job_pushed(&job.worker_type);
        telemetry::update_queue_size(&job.worker_type, queue.jobs.len());
        self.publish(&job).await;

        info!(job_id = %job.id, "Job queued");
        Ok(job)
    }

    /// Wait for the next job of `worker_type`; `None` on cancellation or unknown type
    pub async fn next_job(&self, worker_type: &str, cancel: &CancellationToken) -> Option<Job> {
        let queue = self.queues.get(worker_type)?;
        let job = queue.jobs.pop(cancel).await;
        if job.is_some() {
            telemetry::update_queue_size(worker_type, queue.jobs.len());
        }
        job
    }

    /// queued -> running: counts the attempt and stamps the start time
    #[instrument(skip(self, job), fields(domain = %job.domain, job_id = %job.id))]
    pub async fn start_job(&self, mut job: Job) -> Result<Job, StoreError> {
        job.state = JobState::Running;
        job.started_at = Some(Utc::now());
        job.attempts += 1;
        job.next_retry_at = None;

        let job = self.persist(&job).await?;
        self.publish(&job).await;
        debug!(attempt = job.attempts, "Job running");
        Ok(job)
    }

    /// running -> done
    #[instrument(skip(self, job), fields(domain = %job.domain, job_id = %job.id))]
    pub async fn complete_job(&self, mut job: Job, elapsed: Duration) -> Result<Job, StoreError> {
        job.state = JobState::Done;
        job.finished_at = Some(Utc::now());
        job.exec_time_ms = job.exec_time_ms.saturating_add(elapsed.as_millis() as u64);
        job.error_kind = None;

        let job = self.persist(&job).await?;
        telemetry::record_job_done(&job.worker_type);
        self.publish(&job).await;
        info!(attempt = job.attempts, "Job done");
        Ok(job)
    }

    /// running -> errored, then either a retry timer or a terminal failure
    ///
    /// The cumulative time limit wins over any remaining attempts. The failed
    /// attempt is always persisted before the retry is armed.
    #[instrument(skip(self, job, failure), fields(domain = %job.domain, job_id = %job.id, attempt = job.attempts))]
    pub async fn fail_job(
        self: &Arc<Self>,
        mut job: Job,
        failure: ExecutionError,
        elapsed: Duration,
    ) -> Result<Job, StoreError> {
        let now = Utc::now();
        job.state = JobState::Errored;
        job.exec_time_ms = job.exec_time_ms.saturating_add(elapsed.as_millis() as u64);

        let overall_limit = job.options.overall_limit();
        let over_budget = matches!(failure, ExecutionError::OverallTimeout(_))
            || overall_limit.map_or(false, |limit| job.exec_time() >= limit);

        let terminal = if over_budget {
            let limit_ms = overall_limit.map_or(0, |limit| limit.as_millis() as u64);
            Some(ExecutionError::OverallTimeout(limit_ms))
        } else if job.attempts >= job.options.max_exec_count {
            Some(ExecutionError::ExhaustedRetries(job.options.max_exec_count))
        } else {
            None
        };

        match terminal {
            Some(terminal) => {
                job.next_retry_at = None;
                job.finished_at = Some(now);
                job.error_kind = Some(terminal.kind().to_string());
                job.last_error = Some(match failure {
                    ExecutionError::OverallTimeout(_) => terminal.to_string(),
                    other => format!("{} (last attempt: {})", terminal, other),
                });

                let job = self.persist(&job).await?;
                telemetry::record_job_errored(&job.worker_type, terminal.kind());
                self.publish(&job).await;
                warn!(error = %terminal, "Job failed permanently");
                Ok(job)
            }
            None => {
                let delay = self.retry.next_delay(job.attempts);
                let retry_at = chrono::Duration::from_std(delay)
                    .ok()
                    .and_then(|delay| now.checked_add_signed(delay))
                    .unwrap_or(now);
                job.next_retry_at = Some(retry_at);
                job.error_kind = Some(failure.kind().to_string());
                job.last_error = Some(failure.to_string());

                let job = self.persist(&job).await?;
                telemetry::record_job_retried(&job.worker_type);
                self.publish(&job).await;
                warn!(
                    error = %failure,
                    retry_in_ms = delay.as_millis() as u64,
                    "Job attempt failed; retry scheduled"
                );

                self.schedule_retry(job.clone(), delay);
                Ok(job)
            }
        }
    }

    /// Put a job whose pickup could not be recorded back on its queue after a pause
    ///
    /// The stored copy decides: a job still `queued` there is queued again,
    /// anything else belongs to another writer and is left alone.
    pub fn release_job(self: &Arc<Self>, job: Job) {
        let broker = Arc::clone(self);
        tokio::spawn(async move {
            tokio::select! {
                // Still `queued` in the store, so recovery picks it up
                _ = broker.shutdown.cancelled() => {}
                _ = tokio::time::sleep(RELEASE_DELAY) => {
                    broker.requeue_stored(&job).await;
                }
            }
        });
    }

    #[instrument(skip(self, job), fields(domain = %job.domain, job_id = %job.id))]
    async fn requeue_stored(&self, job: &Job) {
        let Some(queue) = self.queues.get(&job.worker_type) else {
            return;
        };
        let stored = self
            .retry_store("get_job", || self.store.get_job(&job.domain, job.id))
            .await;
        match stored {
            Ok(stored) if stored.state == JobState::Queued => {
                queue.jobs.push(stored);
                telemetry::update_queue_size(&job.worker_type, queue.jobs.len());
                info!("Released job queued again");
            }
            Ok(stored) => {
                warn!(state = %stored.state, "Released job changed in the store; not queued again");
            }
            Err(e) => error!(error = %e, "Released job left for restart recovery"),
        }
    }

    /// Write `job`, retrying transient store errors until shutdown
    async fn persist(&self, job: &Job) -> Result<Job, StoreError> {
        self.retry_store("update_job", || self.store.update_job(job))
            .await
    }

    /// Run a store call again with backoff while it fails transiently
    ///
    /// Gives up with the last error on a permanent error or once the broker
    /// is shut down; the persisted state is then picked up by recovery.
    async fn retry_store<T, F, Fut>(&self, operation: &str, mut call: F) -> Result<T, StoreError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, StoreError>>,
    {
        let mut failures = 0;
        loop {
            let err = match call().await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_transient() && !self.shutdown.is_cancelled() => e,
                Err(e) => return Err(e),
            };
            failures += 1;
            let delay = self.store_retry.next_delay(failures);
            warn!(
                operation = operation,
                error = %err,
                failures = failures,
                retry_in_ms = delay.as_millis() as u64,
                "Job store call failed; retrying"
            );
            tokio::select! {
                _ = self.shutdown.cancelled() => return Err(err),
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    /// Move an errored job back to `queued` once `delay` has passed
    fn schedule_retry(self: &Arc<Self>, job: Job, delay: Duration) {
        let broker = Arc::clone(self);
        tokio::spawn(async move {
            tokio::select! {
                // The job stays persisted with its retry time for the next start
                _ = broker.shutdown.cancelled() => {}
                _ = tokio::time::sleep(delay) => {
                    let job_id = job.id;
                    if let Err(e) = broker.requeue(job).await {
                        error!(job_id = %job_id, error = %e, "Failed to requeue job for retry");
                    }
                }
            }
        });
    }

    /// errored -> queued
    #[instrument(skip(self, job), fields(domain = %job.domain, job_id = %job.id))]
    async fn requeue(&self, mut job: Job) -> Result<Job, StoreError> {
        let queue = self
            .queues
            .get(&job.worker_type)
            .ok_or_else(|| StoreError::NotFound(format!("worker queue {}", job.worker_type)))?;

        job.state = JobState::Queued;
        job.next_retry_at = None;
        let job = self.persist(&job).await?;

        queue.jobs.push(job.clone());
        telemetry::update_queue_size(&job.worker_type, queue.jobs.len());
        self.publish(&job).await;
        debug!(attempt = job.attempts, "Job requeued for retry");
        Ok(job)
    }

    /// Reload unfinished jobs after a restart; returns how many were picked up
    ///
    /// Queued jobs go back on their queue, jobs caught running count as an
    /// interrupted attempt, and pending retries get their timer back.
    #[instrument(skip(self))]
    pub async fn recover(self: &Arc<Self>) -> Result<usize, StoreError> {
        let jobs = self.store.list_unfinished_jobs().await?;
        let now = Utc::now();
        let mut recovered = 0;

        for job in jobs {
            let Some(queue) = self.queues.get(&job.worker_type) else {
                warn!(
                    job_id = %job.id,
                    worker_type = %job.worker_type,
                    "Skipping job for unregistered worker type"
                );
                continue;
            };

            match job.state {
                JobState::Queued => queue.jobs.push(job),
                JobState::Running => {
                    let job_id = job.id;
                    let interrupted = ExecutionError::Failure("interrupted".to_string());
                    if let Err(e) = self.fail_job(job, interrupted, Duration::ZERO).await {
                        error!(job_id = %job_id, error = %e, "Failed to record interrupted job");
                        continue;
                    }
                }
                JobState::Errored => {
                    let Some(retry_at) = job.next_retry_at else {
                        continue;
                    };
                    let delay = (retry_at - now).to_std().unwrap_or_default();
                    self.schedule_retry(job, delay);
                }
                JobState::Done => continue,
            }
            recovered += 1;
        }

        for worker_type in self.queues.keys() {
            telemetry::update_queue_size(worker_type, self.queue_len(worker_type));
        }
        info!(recovered = recovered, "Job recovery complete");
        Ok(recovered)
    }

    /// Stop pending retry timers and store retries; their jobs stay persisted for recovery
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    async fn publish(&self, job: &Job) {
        self.notifier.notify(&JobStateEvent::from(job)).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notifier::MockJobNotifier;
    use crate::retry::FixedDelay;
    use crate::store::MemoryStore;
    use serde_json::json;

    fn defaults(max_exec_count: u32) -> JobOptions {
        JobOptions {
            max_exec_count,
            max_exec_time: None,
            timeout: Some(Duration::from_secs(30)),
        }
    }

    fn broker(store: Arc<MemoryStore>) -> Arc<Broker> {
        Broker::builder(store)
            .retry_strategy(Arc::new(FixedDelay::new(Duration::from_secs(2))))
            .worker("thumbnail", defaults(3))
            .build()
    }

    fn request() -> JobRequest {
        JobRequest::new("alice.example.net", "thumbnail", json!({"file": "a.jpg"}))
    }

    #[tokio::test]
    async fn test_push_job_persists_queued_job_with_defaults() {
        let store = Arc::new(MemoryStore::new());
        let broker = broker(store.clone());

        let job = broker.push_job(request()).await.unwrap();
        assert_eq!(job.state, JobState::Queued);
        assert_eq!(job.options.max_exec_count, 3);
        assert_eq!(job.options.timeout, Some(Duration::from_secs(30)));
        assert_eq!(broker.queue_len("thumbnail"), 1);

        let stored = store.get_job("alice.example.net", job.id).await.unwrap();
        assert_eq!(stored.rev, job.rev);
    }

    #[tokio::test]
    async fn test_push_job_rejects_unknown_worker() {
        let broker = broker(Arc::new(MemoryStore::new()));
        let err = broker
            .push_job(JobRequest::new("alice.example.net", "fax", json!({})))
            .await
            .unwrap_err();
        assert!(matches!(err, QueueError::UnknownWorker(_)));
    }

    #[tokio::test]
    async fn test_push_job_applies_backlog_limit() {
        let broker = Broker::builder(Arc::new(MemoryStore::new()))
            .worker("thumbnail", defaults(1))
            .max_backlog(2)
            .build();

        broker.push_job(request()).await.unwrap();
        broker.push_job(request()).await.unwrap();
        let err = broker.push_job(request()).await.unwrap_err();
        assert!(matches!(err, QueueError::QueueFull { limit: 2, .. }));
    }

    #[tokio::test]
    async fn test_concurrent_pushes_respect_backlog_limit() {
        let broker = Broker::builder(Arc::new(MemoryStore::new()))
            .worker("thumbnail", defaults(1))
            .max_backlog(2)
            .build();

        let results =
            futures::future::join_all((0..10).map(|_| broker.push_job(request()))).await;
        let accepted = results.iter().filter(|r| r.is_ok()).count();
        assert_eq!(accepted, 2);
        assert_eq!(broker.queue_len("thumbnail"), 2);
        assert!(results
            .iter()
            .filter_map(|r| r.as_ref().err())
            .all(|e| matches!(e, QueueError::QueueFull { limit: 2, .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_attempt_is_persisted_then_requeued() {
        let store = Arc::new(MemoryStore::new());
        let broker = broker(store.clone());
        let cancel = CancellationToken::new();

        broker.push_job(request()).await.unwrap();
        let job = broker.next_job("thumbnail", &cancel).await.unwrap();
        let job = broker.start_job(job).await.unwrap();

        let failed = broker
            .fail_job(job, ExecutionError::Failure("boom".into()), Duration::from_millis(5))
            .await
            .unwrap();
        assert_eq!(failed.state, JobState::Errored);
        assert!(failed.next_retry_at.is_some());
        assert_eq!(failed.error_kind.as_deref(), Some("execution_failure"));
        assert_eq!(broker.queue_len("thumbnail"), 0);

        let retried = broker.next_job("thumbnail", &cancel).await.unwrap();
        assert_eq!(retried.state, JobState::Queued);
        assert_eq!(retried.attempts, 1);
        assert_eq!(retried.exec_time_ms, 5);
        assert!(retried.next_retry_at.is_none());
    }

    #[tokio::test]
    async fn test_last_allowed_attempt_is_terminal() {
        let broker = Broker::builder(Arc::new(MemoryStore::new()))
            .worker("thumbnail", defaults(1))
            .build();
        let cancel = CancellationToken::new();

        broker.push_job(request()).await.unwrap();
        let job = broker.next_job("thumbnail", &cancel).await.unwrap();
        let job = broker.start_job(job).await.unwrap();
        let failed = broker
            .fail_job(job, ExecutionError::Timeout(30_000), Duration::from_secs(30))
            .await
            .unwrap();

        assert!(failed.is_terminal());
        assert_eq!(failed.attempts, 1);
        assert_eq!(failed.error_kind.as_deref(), Some("exhausted_retries"));
        assert!(failed.last_error.unwrap().contains("timeout"));
    }

    #[tokio::test]
    async fn test_overall_budget_overrides_remaining_attempts() {
        let broker = broker(Arc::new(MemoryStore::new()));
        let cancel = CancellationToken::new();

        let mut req = request();
        req.options.max_exec_time = Some(Duration::from_secs(10));
        broker.push_job(req).await.unwrap();

        let job = broker.next_job("thumbnail", &cancel).await.unwrap();
        let job = broker.start_job(job).await.unwrap();
        let failed = broker
            .fail_job(job, ExecutionError::Failure("slow".into()), Duration::from_secs(11))
            .await
            .unwrap();

        assert!(failed.is_terminal());
        assert_eq!(failed.attempts, 1);
        assert_eq!(failed.error_kind.as_deref(), Some("overall_timeout"));
    }

    #[tokio::test]
    async fn test_every_transition_is_notified() {
        let mut notifier = MockJobNotifier::new();
        notifier.expect_notify().times(3).returning(|_| ());

        let broker = Broker::builder(Arc::new(MemoryStore::new()))
            .notifier(Arc::new(notifier))
            .worker("thumbnail", defaults(1))
            .build();
        let cancel = CancellationToken::new();

        broker.push_job(request()).await.unwrap();
        let job = broker.next_job("thumbnail", &cancel).await.unwrap();
        let job = broker.start_job(job).await.unwrap();
        broker.complete_job(job, Duration::from_millis(3)).await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_recover_requeues_and_counts_interrupted_attempts() {
        let store = Arc::new(MemoryStore::new());
        let cancel = CancellationToken::new();

        // First process: one job left queued, one caught running
        {
            let broker = broker(store.clone());
            broker.push_job(request()).await.unwrap();
            broker.push_job(request()).await.unwrap();
            let job = broker.next_job("thumbnail", &cancel).await.unwrap();
            broker.start_job(job).await.unwrap();
        }

        let broker = broker(store.clone());
        assert_eq!(broker.recover().await.unwrap(), 2);
        assert_eq!(broker.queue_len("thumbnail"), 1);

        // The interrupted job comes back after its retry delay
        let first = broker.next_job("thumbnail", &cancel).await.unwrap();
        let second = broker.next_job("thumbnail", &cancel).await.unwrap();
        let interrupted = if first.attempts == 1 { first } else { second };
        assert_eq!(interrupted.attempts, 1);
        assert_eq!(interrupted.last_error.as_deref(), Some("Execution failed: interrupted"));
    }
}
