//! In-process priority queue with aging and backpressure.
//!
//! Effective priority is `priority - wait_secs / aging_factor_secs` (lower
//! is more urgent). Every waiting entry shares the same `now`, so ordering
//! by `priority * aging_factor + enqueued_at` is equivalent and stable. The
//! map key adds an admission sequence for FIFO tie-breaking.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, Notify};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use sgate_models::{JobId, TranscodeJob};

use crate::clock::{Clock, SystemClock};
use crate::error::{QueueError, QueueResult};

/// Queue configuration.
#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// Admission limit; `enqueue` fails with backpressure at this length
    pub max_capacity: usize,
    /// Seconds of waiting worth one priority level
    pub aging_factor_secs: f64,
    /// Default wait used by consumers polling `dequeue`
    pub dequeue_poll_timeout: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_capacity: 1000,
            aging_factor_secs: 30.0,
            dequeue_poll_timeout: Duration::from_secs(1),
        }
    }
}

impl QueueConfig {
    /// Create config from environment variables.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            max_capacity: std::env::var("QUEUE_MAX_CAPACITY")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.max_capacity),
            aging_factor_secs: std::env::var("QUEUE_AGING_FACTOR_SECS")
                .ok()
                .and_then(|s| s.parse().ok())
                .filter(|v: &f64| *v > 0.0)
                .unwrap_or(defaults.aging_factor_secs),
            dequeue_poll_timeout: Duration::from_millis(
                std::env::var("QUEUE_POLL_TIMEOUT_MS")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(1000),
            ),
        }
    }
}

/// A waiting job.
#[derive(Debug, Clone)]
pub struct QueueEntry {
    pub job: TranscodeJob,
    pub enqueued_at: DateTime<Utc>,
    /// Retry backoff: not handed out before this instant
    pub not_before: Option<DateTime<Utc>>,
    pub seq: u64,
}

type SlotKey = (i64, u64);

#[derive(Default)]
struct QueueState {
    slots: BTreeMap<SlotKey, QueueEntry>,
    index: HashMap<JobId, SlotKey>,
    next_seq: u64,
    closed: bool,
}

enum Pop {
    Ready(Box<QueueEntry>),
    Delayed(DateTime<Utc>),
    Empty,
}

impl QueueState {
    fn pop_ready(&mut self, now: DateTime<Utc>) -> Pop {
        let mut earliest: Option<DateTime<Utc>> = None;
        let mut ready: Option<SlotKey> = None;
        for (key, entry) in &self.slots {
            match entry.not_before {
                Some(at) if at > now => {
                    earliest = Some(earliest.map_or(at, |e| e.min(at)));
                }
                _ => {
                    ready = Some(*key);
                    break;
                }
            }
        }

        if let Some(key) = ready {
            if let Some(entry) = self.slots.remove(&key) {
                self.index.remove(&entry.job.id);
                return Pop::Ready(Box::new(entry));
            }
        }
        match earliest {
            Some(at) => Pop::Delayed(at),
            None => Pop::Empty,
        }
    }
}

/// Priority job queue shared by the submission API and the pool dispatcher.
pub struct PriorityJobQueue {
    config: QueueConfig,
    clock: Arc<dyn Clock>,
    state: Mutex<QueueState>,
    notify: Notify,
}

impl PriorityJobQueue {
    pub fn new(config: QueueConfig) -> Self {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    pub fn with_clock(config: QueueConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            config,
            clock,
            state: Mutex::new(QueueState::default()),
            notify: Notify::new(),
        }
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    pub fn clock(&self) -> Arc<dyn Clock> {
        Arc::clone(&self.clock)
    }

    fn aging_ms(&self) -> f64 {
        self.config.aging_factor_secs.max(0.001) * 1000.0
    }

    fn score(&self, priority: u8, enqueued_at: DateTime<Utc>) -> i64 {
        (f64::from(priority) * self.aging_ms()) as i64 + enqueued_at.timestamp_millis()
    }

    /// Effective priority of an entry at `now` (lower is more urgent).
    pub fn effective_priority(&self, entry: &QueueEntry, now: DateTime<Utc>) -> f64 {
        let waited = (now - entry.enqueued_at).num_milliseconds().max(0) as f64 / 1000.0;
        f64::from(entry.job.priority) - waited / self.config.aging_factor_secs.max(0.001)
    }

    async fn admit(
        &self,
        job: TranscodeJob,
        enqueued_at: DateTime<Utc>,
        enforce_capacity: bool,
    ) -> QueueResult<()> {
        let mut state = self.state.lock().await;
        if state.closed {
            return Err(QueueError::Closed);
        }
        if state.index.contains_key(&job.id) {
            return Err(QueueError::DuplicateJob(job.id));
        }
        if enforce_capacity && state.slots.len() >= self.config.max_capacity {
            warn!(
                job_id = %job.id,
                capacity = self.config.max_capacity,
                "Rejecting job: queue at capacity"
            );
            return Err(QueueError::backpressure(self.config.max_capacity));
        }

        let seq = state.next_seq;
        state.next_seq += 1;
        let key = (self.score(job.priority, enqueued_at), seq);
        debug!(job_id = %job.id, priority = job.priority, seq, "Job enqueued");

        state.index.insert(job.id.clone(), key);
        state.slots.insert(
            key,
            QueueEntry {
                not_before: job.next_attempt_at,
                job,
                enqueued_at,
                seq,
            },
        );
        drop(state);

        self.notify.notify_one();
        Ok(())
    }

    /// Admit a new job, failing fast at capacity.
    pub async fn enqueue(&self, job: TranscodeJob) -> QueueResult<()> {
        let now = self.clock.now();
        self.admit(job, now, true).await
    }

    /// Re-admit a job that was already accepted (retry, drain, worker loss).
    /// Capacity is not enforced.
    pub async fn requeue(&self, job: TranscodeJob) -> QueueResult<()> {
        let now = self.clock.now();
        self.admit(job, now, false).await
    }

    /// Re-admit a job with its original enqueue time (crash recovery).
    pub async fn restore(&self, job: TranscodeJob, enqueued_at: DateTime<Utc>) -> QueueResult<()> {
        self.admit(job, enqueued_at, false).await
    }

    /// Take the most urgent eligible job without waiting.
    pub async fn try_dequeue(&self) -> Option<TranscodeJob> {
        let now = self.clock.now();
        let mut state = self.state.lock().await;
        match state.pop_ready(now) {
            Pop::Ready(entry) => Some(entry.job),
            _ => None,
        }
    }

    /// Wait up to `timeout` for a job.
    pub async fn dequeue(&self, timeout: Duration) -> Option<TranscodeJob> {
        self.dequeue_until_cancelled(timeout, &CancellationToken::new())
            .await
    }

    /// Wait up to `timeout` for a job; returns `None` early on close or cancel.
    pub async fn dequeue_until_cancelled(
        &self,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Option<TranscodeJob> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let now = self.clock.now();
            let delayed_until = {
                let mut state = self.state.lock().await;
                if state.closed {
                    return None;
                }
                match state.pop_ready(now) {
                    Pop::Ready(entry) => return Some(entry.job),
                    Pop::Delayed(at) => Some(at),
                    Pop::Empty => None,
                }
            };

            let tokio_now = tokio::time::Instant::now();
            if tokio_now >= deadline {
                return None;
            }
            let wake_at = match delayed_until {
                Some(at) => {
                    let wait = (at - now).to_std().unwrap_or(Duration::ZERO);
                    deadline.min(tokio_now + wait)
                }
                None => deadline,
            };

            tokio::select! {
                _ = &mut notified => {}
                _ = tokio::time::sleep_until(wake_at) => {}
                _ = cancel.cancelled() => return None,
            }
        }
    }

    /// Withdraw a waiting job. Returns `true` if it was queued.
    pub async fn remove(&self, job_id: &JobId) -> bool {
        let mut state = self.state.lock().await;
        match state.index.remove(job_id) {
            Some(key) => {
                state.slots.remove(&key);
                true
            }
            None => false,
        }
    }

    pub async fn contains(&self, job_id: &JobId) -> bool {
        self.state.lock().await.index.contains_key(job_id)
    }

    pub async fn len(&self) -> usize {
        self.state.lock().await.slots.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Waiting entries in dequeue order (ignoring backoff).
    pub async fn snapshot(&self) -> Vec<QueueEntry> {
        self.state.lock().await.slots.values().cloned().collect()
    }

    /// Stop admitting jobs and wake every waiting consumer.
    pub async fn close(&self) {
        self.state.lock().await.closed = true;
        self.notify.notify_waiters();
    }

    pub async fn is_closed(&self) -> bool {
        self.state.lock().await.closed
    }
}
