// Per-worker-type job queue, FIFO per domain and round-robin across domains

use crate::models::Job;
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Default)]
struct QueueState {
    by_domain: HashMap<String, VecDeque<Job>>,
    /// Domains with waiting jobs, in service order
    ring: VecDeque<String>,
    len: usize,
    /// Places promised to pushes still being persisted
    reserved: usize,
}

/// Waiting jobs of one worker type
///
/// A domain that pushes many jobs only gets one turn per round, so a busy
/// tenant cannot starve the others sharing the worker type.
#[derive(Debug, Default)]
pub struct FairQueue {
    state: Mutex<QueueState>,
    available: Notify,
}

impl FairQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, job: Job) {
        self.insert(job, false);
    }

    /// Hold a place for a job that is not pushed yet
    ///
    /// `None` once `limit` jobs are waiting or promised. Dropping the
    /// reservation without filling it gives the place back.
    pub fn try_reserve(&self, limit: usize) -> Option<Reservation<'_>> {
        let mut state = self.lock();
        if state.len + state.reserved >= limit {
            return None;
        }
        state.reserved += 1;
        Some(Reservation {
            queue: self,
            filled: false,
        })
    }

    fn insert(&self, job: Job, reserved: bool) {
        {
            let mut state = self.lock();
            if reserved {
                state.reserved = state.reserved.saturating_sub(1);
            }
            let domain = job.domain.clone();
            let waiting = state.by_domain.entry(domain.clone()).or_default();
            let was_idle = waiting.is_empty();
            waiting.push_back(job);
            if was_idle {
                state.ring.push_back(domain);
            }
            state.len += 1;
        }
        self.available.notify_one();
    }

    /// Next job in round-robin order, without waiting
    pub fn try_pop(&self) -> Option<Job> {
        let mut state = self.lock();
        let domain = state.ring.pop_front()?;
        let waiting = state.by_domain.get_mut(&domain)?;
        let job = waiting.pop_front();
        if waiting.is_empty() {
            state.by_domain.remove(&domain);
        } else {
            state.ring.push_back(domain);
        }
        if job.is_some() {
            state.len -= 1;
        }
        job
    }

    /// Wait for the next job; `None` once `cancel` fires, even if jobs are left
    pub async fn pop(&self, cancel: &CancellationToken) -> Option<Job> {
        loop {
            if cancel.is_cancelled() {
                return None;
            }
            if let Some(job) = self.try_pop() {
                return Some(job);
            }
            tokio::select! {
                _ = cancel.cancelled() => return None,
                _ = self.available.notified() => {}
            }
        }
    }

    pub fn len(&self) -> usize {
        self.lock().len
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// A place held in a [`FairQueue`] by [`FairQueue::try_reserve`]
#[must_use]
pub struct Reservation<'a> {
    queue: &'a FairQueue,
    filled: bool,
}

impl Reservation<'_> {
    /// Push `job` into the held place
    pub fn fill(mut self, job: Job) {
        self.filled = true;
        self.queue.insert(job, true);
    }
}

impl Drop for Reservation<'_> {
    fn drop(&mut self) {
        if !self.filled {
            let mut state = self.queue.lock();
            state.reserved = state.reserved.saturating_sub(1);
        }
    }
}
