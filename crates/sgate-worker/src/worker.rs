//! Transcode worker.
//!
//! A [`TranscodeWorker`] runs one job attempt end to end: it encodes every
//! rendition in order, aggregates progress, and records the terminal state.
//! A [`WorkerRuntime`] wraps it in the task loop the pool spawns, adding
//! heartbeats and reporting outcomes back to the pool.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{mpsc, watch};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn, Instrument};

use sgate_models::{
    FailureKind, JobError, JobEvent, JobId, JobStatus, TranscodeJob, WorkerId,
};
use sgate_queue::{publish_or_log, EventBus, PriorityJobQueue};
use sgate_store::JobStore;

use crate::config::WorkerConfig;
use crate::encoder::{Encoder, EncoderError, ProgressCallback};
use crate::error::{WorkerError, WorkerResult};
use crate::lease::Lease;
use crate::logging::JobLogger;
use crate::metrics;
use crate::progress::{ProgressAggregator, ProgressThrottle};
use crate::retry::{backoff_delay, retry_async, FailureTracker, RetryConfig};

/// Collaborators shared by every worker of a pool.
#[derive(Clone)]
pub struct WorkerContext {
    pub store: Arc<dyn JobStore>,
    pub queue: Arc<PriorityJobQueue>,
    pub bus: Arc<dyn EventBus>,
    pub encoder: Arc<dyn Encoder>,
    pub config: WorkerConfig,
}

/// A job handed to a worker by the pool.
pub struct Assignment {
    pub job: TranscodeJob,
    pub lease: Lease,
    /// Child of the lease token; fired by user cancellation.
    pub cancel: CancellationToken,
}

/// How an attempt ended.
#[derive(Debug, Clone)]
pub enum JobOutcome {
    Completed(Box<TranscodeJob>),
    Failed(FailureKind),
    /// Transient failure; the job went back to the queue
    Retried { retry_count: u32 },
    Cancelled,
    /// Lease revoked mid-attempt; nothing more was written
    LeaseLost,
    /// The terminal state could not be persisted
    Aborted(String),
}

/// Sent to the pool after every attempt.
#[derive(Debug)]
pub struct WorkerReport {
    pub worker_id: WorkerId,
    pub job_id: JobId,
    pub outcome: JobOutcome,
    pub elapsed: Duration,
}

enum RunResult {
    Done,
    Cancelled,
    LeaseLost,
    Failed(JobError),
}

fn interrupted(lease: &Lease) -> RunResult {
    if lease.is_revoked() {
        RunResult::LeaseLost
    } else {
        RunResult::Cancelled
    }
}

pub struct TranscodeWorker {
    id: WorkerId,
    ctx: WorkerContext,
    save_retry: RetryConfig,
}

impl TranscodeWorker {
    pub fn new(id: WorkerId, ctx: WorkerContext) -> Self {
        let save_retry = RetryConfig::new("save_job").with_max_retries(ctx.config.store_write_retries);
        Self {
            id,
            ctx,
            save_retry,
        }
    }

    pub fn id(&self) -> &WorkerId {
        &self.id
    }

    /// Wall-clock budget for one attempt.
    pub fn job_timeout(&self, job: &TranscodeJob) -> Duration {
        let fallback = self.ctx.config.default_profile_duration.as_secs_f64();
        let expected: f64 = job
            .profiles
            .iter()
            .map(|p| p.expected_duration_secs.filter(|d| *d > 0.0).unwrap_or(fallback))
            .sum();
        let secs = (expected * self.ctx.config.timeout_multiplier).max(0.001);
        Duration::try_from_secs_f64(secs).unwrap_or(Duration::from_secs(365 * 24 * 3600))
    }

    /// Run one attempt of the assigned job.
    pub async fn execute(&self, assignment: Assignment) -> JobOutcome {
        let logger = JobLogger::new(&assignment.job.id, &self.id, assignment.job.retry_count + 1);
        let span = logger.create_span();
        self.execute_attempt(assignment, &logger)
            .instrument(span)
            .await
    }

    async fn execute_attempt(&self, assignment: Assignment, logger: &JobLogger) -> JobOutcome {
        let Assignment {
            mut job,
            lease,
            cancel,
        } = assignment;
        let started = Instant::now();

        {
            let Some(guard) = lease.guard().await else {
                return JobOutcome::LeaseLost;
            };
            if cancel.is_cancelled() {
                drop(guard);
                return self.finish_cancelled(job, &lease, logger).await;
            }
            if let Err(e) = job.start() {
                logger.write_failed("start", &e);
                return JobOutcome::Aborted(e.to_string());
            }
            if let Err(e) = self.persist(&job).await {
                logger.write_failed("start", &e);
                return JobOutcome::Aborted(e.to_string());
            }
            let event = JobEvent::started(job.id.clone(), self.id.clone(), job.retry_count + 1);
            publish_or_log(self.ctx.bus.as_ref(), event).await;
        }
        metrics::record_job_started();
        logger.started(job.profiles.len());

        let timeout = self.job_timeout(&job);
        let attempt_token = cancel.child_token();
        let result = match tokio::time::timeout(
            timeout,
            self.encode_renditions(&mut job, &lease, &cancel, &attempt_token, logger),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => {
                attempt_token.cancel();
                RunResult::Failed(JobError::new(
                    FailureKind::Timeout,
                    format!("attempt exceeded {:.1}s", timeout.as_secs_f64()),
                ))
            }
        };

        match result {
            RunResult::Done => self.finish_completed(job, &lease, &cancel, started, logger).await,
            RunResult::Cancelled => self.finish_cancelled(job, &lease, logger).await,
            RunResult::LeaseLost => {
                logger.lease_lost();
                JobOutcome::LeaseLost
            }
            RunResult::Failed(error) => self.finish_failed(job, error, &lease, &cancel, logger).await,
        }
    }

    async fn encode_renditions(
        &self,
        job: &mut TranscodeJob,
        lease: &Lease,
        cancel: &CancellationToken,
        attempt: &CancellationToken,
        logger: &JobLogger,
    ) -> RunResult {
        let aggregator = ProgressAggregator::new(&job.profiles);
        let mut throttle = ProgressThrottle::new(
            self.ctx.config.progress_min_delta,
            self.ctx.config.progress_min_interval,
        );
        let input_ref = job.input_ref.clone();
        let profiles = job.profiles.clone();
        let mut last_error: Option<JobError> = None;

        for (index, profile) in profiles.iter().enumerate() {
            if cancel.is_cancelled() {
                return interrupted(lease);
            }
            {
                let Some(_guard) = lease.guard().await else {
                    return RunResult::LeaseLost;
                };
                if cancel.is_cancelled() {
                    return interrupted(lease);
                }
                if let Some(output) = job.rendition_mut(&profile.name) {
                    output.begin();
                }
                self.persist_best_effort(job, logger).await;
            }

            let rendition_started = Instant::now();
            let (tx, mut rx) = watch::channel(0.0f64);
            let callback: ProgressCallback = Box::new(move |fraction| {
                tx.send_replace(fraction);
            });
            let encode = self
                .ctx
                .encoder
                .encode(&input_ref, profile, callback, attempt.clone());
            tokio::pin!(encode);

            let mut progress_open = true;
            let result = loop {
                tokio::select! {
                    res = &mut encode => break res,
                    changed = rx.changed(), if progress_open => {
                        if changed.is_err() {
                            progress_open = false;
                            continue;
                        }
                        let fraction = *rx.borrow_and_update();
                        let overall = aggregator.overall(index, fraction);
                        self.report_progress(job, overall, &profile.name, &mut throttle, lease, cancel)
                            .await;
                    }
                    _ = cancel.cancelled() => return interrupted(lease),
                }
            };

            match result {
                Ok(segments) => {
                    metrics::record_rendition(&profile.name, rendition_started.elapsed());
                    let overall = aggregator.overall(index, 1.0);
                    let Some(_guard) = lease.guard().await else {
                        return RunResult::LeaseLost;
                    };
                    if cancel.is_cancelled() {
                        return interrupted(lease);
                    }
                    if let Some(output) = job.rendition_mut(&profile.name) {
                        output.finish(segments);
                    }
                    job.set_progress(overall);
                    self.persist_best_effort(job, logger).await;
                    if throttle.should_emit(overall, Instant::now()) {
                        let event =
                            JobEvent::progress(job.id.clone(), overall, Some(profile.name.clone()));
                        publish_or_log(self.ctx.bus.as_ref(), event).await;
                    }
                    debug!(job_id = %job.id, rendition = %profile.name, "Rendition done");
                }
                Err(EncoderError::Cancelled) if cancel.is_cancelled() => {
                    return interrupted(lease);
                }
                Err(err) => {
                    let job_error = err.to_job_error();
                    logger.rendition_failed(&profile.name, &job_error);
                    {
                        let Some(_guard) = lease.guard().await else {
                            return RunResult::LeaseLost;
                        };
                        if cancel.is_cancelled() {
                            return interrupted(lease);
                        }
                        if let Some(output) = job.rendition_mut(&profile.name) {
                            output.fail(job_error.message.clone());
                        }
                        self.persist_best_effort(job, logger).await;
                    }
                    if !self.ctx.config.partial_success || err.affects_whole_job() {
                        return RunResult::Failed(job_error);
                    }
                    last_error = Some(job_error);
                }
            }
        }

        if job.done_renditions().next().is_none() {
            return RunResult::Failed(last_error.unwrap_or_else(|| {
                JobError::new(FailureKind::EncoderCrashed, "no rendition produced output")
            }));
        }
        RunResult::Done
    }

    async fn report_progress(
        &self,
        job: &mut TranscodeJob,
        overall: f64,
        rendition: &str,
        throttle: &mut ProgressThrottle,
        lease: &Lease,
        cancel: &CancellationToken,
    ) {
        if cancel.is_cancelled() || !throttle.should_emit(overall, Instant::now()) {
            return;
        }
        let Some(_guard) = lease.guard().await else {
            return;
        };
        if cancel.is_cancelled() {
            return;
        }
        job.set_progress(overall);
        if let Err(e) = self.ctx.store.save_job(job).await {
            debug!(job_id = %job.id, "Progress write failed: {}", e);
        }
        let event = JobEvent::progress(job.id.clone(), overall, Some(rendition.to_string()));
        publish_or_log(self.ctx.bus.as_ref(), event).await;
    }

    async fn finish_completed(
        &self,
        mut job: TranscodeJob,
        lease: &Lease,
        cancel: &CancellationToken,
        started: Instant,
        logger: &JobLogger,
    ) -> JobOutcome {
        let Some(guard) = lease.guard().await else {
            return JobOutcome::LeaseLost;
        };
        if cancel.is_cancelled() {
            drop(guard);
            return self.finish_cancelled(job, lease, logger).await;
        }
        if let Err(e) = job.complete() {
            return JobOutcome::Aborted(e.to_string());
        }
        if let Err(e) = self.persist(&job).await {
            logger.write_failed("completion", &e);
            return JobOutcome::Aborted(e.to_string());
        }

        let elapsed = started.elapsed();
        let renditions = job.done_renditions().count() as u32;
        let event = JobEvent::completed(job.id.clone(), renditions, elapsed.as_millis() as u64);
        publish_or_log(self.ctx.bus.as_ref(), event).await;
        drop(guard);

        metrics::record_job_completed(elapsed);
        logger.completed(renditions, elapsed);
        JobOutcome::Completed(Box::new(job))
    }

    async fn finish_cancelled(
        &self,
        mut job: TranscodeJob,
        lease: &Lease,
        logger: &JobLogger,
    ) -> JobOutcome {
        let Some(_guard) = lease.guard().await else {
            return JobOutcome::LeaseLost;
        };
        if job.status != JobStatus::Cancelling {
            if let Err(e) = job.request_cancel() {
                return JobOutcome::Aborted(e.to_string());
            }
        }
        if job.status != JobStatus::Cancelled {
            if let Err(e) = job.mark_cancelled() {
                return JobOutcome::Aborted(e.to_string());
            }
        }
        if let Err(e) = self.persist(&job).await {
            logger.write_failed("cancellation", &e);
            return JobOutcome::Aborted(e.to_string());
        }
        publish_or_log(self.ctx.bus.as_ref(), JobEvent::cancelled(job.id.clone())).await;
        metrics::record_job_cancelled();
        logger.cancelled();
        JobOutcome::Cancelled
    }

    async fn finish_failed(
        &self,
        mut job: TranscodeJob,
        error: JobError,
        lease: &Lease,
        cancel: &CancellationToken,
        logger: &JobLogger,
    ) -> JobOutcome {
        let Some(guard) = lease.guard().await else {
            return JobOutcome::LeaseLost;
        };
        if cancel.is_cancelled() {
            drop(guard);
            return self.finish_cancelled(job, lease, logger).await;
        }

        let kind = error.kind;
        if kind.is_transient() && job.can_retry() {
            let delay = backoff_delay(
                self.ctx.config.retry_base_backoff,
                self.ctx.config.max_backoff,
                job.retry_count,
            );
            let next_attempt =
                self.ctx.queue.clock().now() + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::zero());
            if let Err(e) = job.requeue_for_retry(Some(error), Some(next_attempt)) {
                return JobOutcome::Aborted(e.to_string());
            }
            if let Err(e) = self.persist(&job).await {
                logger.write_failed("retry", &e);
                return JobOutcome::Aborted(e.to_string());
            }

            let retry_count = job.retry_count;
            let event = JobEvent::queued(job.id.clone(), job.priority, retry_count);
            if let Err(e) = self.ctx.queue.requeue(job).await {
                // Still Queued in the store; recovery picks it up.
                logger.requeue_failed(&e);
            }
            publish_or_log(self.ctx.bus.as_ref(), event).await;
            metrics::record_job_retried(kind);
            logger.retry_scheduled(kind, retry_count, delay);
            return JobOutcome::Retried { retry_count };
        }

        let message = error.message.clone();
        if let Err(e) = job.fail(error) {
            return JobOutcome::Aborted(e.to_string());
        }
        if let Err(e) = self.persist(&job).await {
            logger.write_failed("failure", &e);
            return JobOutcome::Aborted(e.to_string());
        }
        let event = JobEvent::failed(job.id.clone(), kind, message.clone(), job.retry_count);
        publish_or_log(self.ctx.bus.as_ref(), event).await;
        metrics::record_job_failed(kind);
        logger.failed(kind, &message);
        JobOutcome::Failed(kind)
    }

    async fn persist(&self, job: &TranscodeJob) -> WorkerResult<()> {
        let store = &self.ctx.store;
        retry_async(&self.save_retry, || store.save_job(job))
            .await
            .into_result()
            .map_err(WorkerError::from)
    }

    async fn persist_best_effort(&self, job: &TranscodeJob, logger: &JobLogger) {
        if let Err(e) = self.persist(job).await {
            logger.progress_write_failed(&e);
        }
    }
}

/// Task loop of one pooled worker.
pub struct WorkerRuntime {
    worker: TranscodeWorker,
    assignments: mpsc::Receiver<Assignment>,
    reports: mpsc::UnboundedSender<WorkerReport>,
    heartbeat: Arc<AtomicI64>,
    shutdown: CancellationToken,
}

impl WorkerRuntime {
    pub fn new(
        worker: TranscodeWorker,
        assignments: mpsc::Receiver<Assignment>,
        reports: mpsc::UnboundedSender<WorkerReport>,
        heartbeat: Arc<AtomicI64>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            worker,
            assignments,
            reports,
            heartbeat,
            shutdown,
        }
    }

    pub async fn run(self) {
        let WorkerRuntime {
            worker,
            mut assignments,
            reports,
            heartbeat,
            shutdown,
        } = self;

        let mut ticker = tokio::time::interval(worker.ctx.config.heartbeat_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut failures = FailureTracker::new("heartbeat", 3);
        debug!(worker_id = %worker.id, "Worker started");

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => beat(&worker, &heartbeat, None, &mut failures).await,
                next = assignments.recv() => {
                    let Some(assignment) = next else { break };
                    let job_id = assignment.job.id.clone();
                    let started = Instant::now();

                    let execution = worker.execute(assignment);
                    tokio::pin!(execution);
                    let outcome = loop {
                        tokio::select! {
                            outcome = &mut execution => break outcome,
                            _ = ticker.tick() => {
                                beat(&worker, &heartbeat, Some(&job_id), &mut failures).await;
                            }
                        }
                    };

                    let report = WorkerReport {
                        worker_id: worker.id.clone(),
                        job_id,
                        outcome,
                        elapsed: started.elapsed(),
                    };
                    if reports.send(report).is_err() {
                        break;
                    }
                }
            }
        }
        debug!(worker_id = %worker.id, "Worker stopped");
    }
}

async fn beat(
    worker: &TranscodeWorker,
    heartbeat: &AtomicI64,
    job_id: Option<&JobId>,
    failures: &mut FailureTracker,
) {
    let now = worker.ctx.queue.clock().now();
    heartbeat.store(chrono::Utc::now().timestamp_millis(), Ordering::SeqCst);

    let Some(job_id) = job_id else { return };
    match worker.ctx.store.record_heartbeat(job_id, &worker.id, now).await {
        Ok(_) => failures.record_success(),
        Err(e) => {
            if failures.record_failure() {
                warn!(job_id = %job_id, worker_id = %worker.id, "Heartbeat write failed: {}", e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeEncoder;
    use sgate_models::{EventPayload, RenditionProfile, RenditionStatus};
    use sgate_queue::{BroadcastEventBus, QueueConfig};
    use sgate_store::MemoryStore;
    use tokio::sync::broadcast;

    struct Harness {
        store: Arc<MemoryStore>,
        queue: Arc<PriorityJobQueue>,
        events: broadcast::Receiver<JobEvent>,
        worker: TranscodeWorker,
    }

    fn harness(encoder: Arc<FakeEncoder>, config: WorkerConfig) -> Harness {
        let store = Arc::new(MemoryStore::new());
        let queue = Arc::new(PriorityJobQueue::new(QueueConfig::default()));
        let bus = BroadcastEventBus::new(1024);
        let events = bus.subscribe();
        let ctx = WorkerContext {
            store: store.clone(),
            queue: queue.clone(),
            bus: Arc::new(bus),
            encoder,
            config,
        };
        Harness {
            store,
            queue,
            events,
            worker: TranscodeWorker::new(WorkerId::new(), ctx),
        }
    }

    fn fast_config() -> WorkerConfig {
        WorkerConfig {
            retry_base_backoff: Duration::from_millis(10),
            progress_min_interval: Duration::from_millis(5),
            ..Default::default()
        }
    }

    fn ladder() -> Vec<RenditionProfile> {
        ["1080p", "720p", "480p"]
            .iter()
            .filter_map(|n| RenditionProfile::preset(n))
            .collect()
    }

    async fn assign(h: &Harness, job: TranscodeJob) -> Assignment {
        let mut job = job;
        job.assign(h.worker.id().clone()).unwrap();
        h.store.save_job(&job).await.unwrap();
        let lease = Lease::new(job.id.clone(), h.worker.id().clone());
        let cancel = lease.token().child_token();
        Assignment { job, lease, cancel }
    }

    fn drain(events: &mut broadcast::Receiver<JobEvent>) -> Vec<JobEvent> {
        let mut out = Vec::new();
        while let Ok(ev) = events.try_recv() {
            out.push(ev);
        }
        out
    }

    #[tokio::test]
    async fn test_all_renditions_complete() {
        let mut h = harness(Arc::new(FakeEncoder::new(4, Duration::from_millis(2))), fast_config());
        let assignment = assign(&h, TranscodeJob::new("c1", "in.mkv", ladder(), 3)).await;
        let job_id = assignment.job.id.clone();

        let outcome = h.worker.execute(assignment).await;
        assert!(matches!(outcome, JobOutcome::Completed(_)));

        let stored = h.store.load_job(&job_id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Completed);
        assert_eq!(stored.progress_percent, 100.0);
        assert_eq!(stored.renditions.len(), 3);
        assert!(stored.renditions.iter().all(|r| r.status == RenditionStatus::Done));

        let events = drain(&mut h.events);
        assert!(matches!(events.first().map(|e| &e.payload), Some(EventPayload::JobStarted { .. })));
        assert!(matches!(events.last().map(|e| &e.payload), Some(EventPayload::JobCompleted { renditions: 3, .. })));

        let progress: Vec<f64> = events
            .iter()
            .filter_map(|e| match e.payload {
                EventPayload::JobProgress { percent, .. } => Some(percent),
                _ => None,
            })
            .collect();
        assert!(!progress.is_empty());
        assert!(progress.windows(2).all(|w| w[1] >= w[0]));
    }

    #[tokio::test]
    async fn test_transient_failure_is_requeued_with_backoff() {
        let encoder = Arc::new(FakeEncoder::new(1, Duration::from_millis(1)));
        encoder.fail_next("720p", EncoderError::EncoderCrashed("segfault".into()));
        let h = harness(encoder, fast_config());
        let assignment = assign(&h, TranscodeJob::new("c1", "in.mkv", ladder(), 3)).await;
        let job_id = assignment.job.id.clone();

        let outcome = h.worker.execute(assignment).await;
        assert!(matches!(outcome, JobOutcome::Retried { retry_count: 1 }));

        let stored = h.store.load_job(&job_id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Queued);
        assert_eq!(stored.retry_count, 1);
        assert_eq!(stored.error.as_ref().unwrap().kind, FailureKind::EncoderCrashed);
        assert!(stored.next_attempt_at.is_some());
        assert!(stored.renditions.is_empty());
        assert!(h.queue.contains(&job_id).await);
    }

    #[tokio::test]
    async fn test_terminal_failure_skips_retry() {
        let encoder = Arc::new(FakeEncoder::new(1, Duration::from_millis(1)));
        encoder.fail_next("1080p", EncoderError::UnsupportedCodec("av1 /opt/enc/bin".into()));
        let mut h = harness(encoder, fast_config());
        let assignment = assign(&h, TranscodeJob::new("c1", "in.mkv", ladder(), 3)).await;
        let job_id = assignment.job.id.clone();

        let outcome = h.worker.execute(assignment).await;
        assert!(matches!(outcome, JobOutcome::Failed(FailureKind::UnsupportedCodec)));

        let stored = h.store.load_job(&job_id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Failed);
        assert_eq!(stored.retry_count, 0);
        assert!(!h.queue.contains(&job_id).await);

        let failed = drain(&mut h.events)
            .into_iter()
            .find_map(|e| match e.payload {
                EventPayload::JobFailed { kind, message, .. } => Some((kind, message)),
                _ => None,
            })
            .unwrap();
        assert_eq!(failed.0, FailureKind::UnsupportedCodec);
        assert!(!failed.1.contains("/opt/enc"));
    }

    #[tokio::test]
    async fn test_exhausted_retries_fail_with_trigger_kind() {
        let encoder = Arc::new(FakeEncoder::new(1, Duration::from_millis(1)));
        encoder.fail_next("1080p", EncoderError::EncoderCrashed("boom".into()));
        let h = harness(encoder, fast_config());
        let mut job = TranscodeJob::new("c1", "in.mkv", ladder(), 3).with_max_retries(2);
        job.retry_count = 2;
        let assignment = assign(&h, job).await;
        let job_id = assignment.job.id.clone();

        let outcome = h.worker.execute(assignment).await;
        assert!(matches!(outcome, JobOutcome::Failed(FailureKind::EncoderCrashed)));
        let stored = h.store.load_job(&job_id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Failed);
        assert_eq!(stored.retry_count, 2);
    }

    #[tokio::test]
    async fn test_cancellation_discards_outputs() {
        let mut h = harness(Arc::new(FakeEncoder::new(50, Duration::from_millis(10))), fast_config());
        let assignment = assign(&h, TranscodeJob::new("c1", "in.mkv", ladder(), 3)).await;
        let job_id = assignment.job.id.clone();
        let cancel = assignment.cancel.clone();

        let canceller = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(60)).await;
            cancel.cancel();
        });
        let outcome = tokio::time::timeout(Duration::from_secs(2), h.worker.execute(assignment))
            .await
            .expect("cancellation must be prompt");
        canceller.await.unwrap();
        assert!(matches!(outcome, JobOutcome::Cancelled));

        let stored = h.store.load_job(&job_id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Cancelled);
        assert!(stored.renditions.is_empty());

        let events = drain(&mut h.events);
        let cancelled_at = events
            .iter()
            .position(|e| matches!(e.payload, EventPayload::JobCancelled))
            .unwrap();
        assert!(events[cancelled_at..]
            .iter()
            .all(|e| !matches!(e.payload, EventPayload::JobProgress { .. })));
    }

    #[tokio::test]
    async fn test_revoked_lease_stops_writes() {
        let mut h = harness(Arc::new(FakeEncoder::new(50, Duration::from_millis(10))), fast_config());
        let assignment = assign(&h, TranscodeJob::new("c1", "in.mkv", ladder(), 3)).await;
        let job_id = assignment.job.id.clone();
        let lease = assignment.lease.clone();

        let revoker = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(40)).await;
            lease.revoke().await;
        });
        let outcome = h.worker.execute(assignment).await;
        revoker.await.unwrap();
        assert!(matches!(outcome, JobOutcome::LeaseLost));

        let _ = drain(&mut h.events);
        let snapshot = h.store.load_job(&job_id).await.unwrap().unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        let later = h.store.load_job(&job_id).await.unwrap().unwrap();
        assert_eq!(snapshot.updated_at, later.updated_at);
        assert!(h.events.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_timeout_is_retryable() {
        let config = WorkerConfig {
            timeout_multiplier: 1.0,
            ..fast_config()
        };
        let h = harness(Arc::new(FakeEncoder::new(100, Duration::from_millis(10))), config);
        let profiles = vec![RenditionProfile::preset("480p").unwrap().with_expected_duration(0.05)];
        let assignment = assign(&h, TranscodeJob::new("c1", "in.mkv", profiles, 3)).await;
        let job_id = assignment.job.id.clone();

        assert_eq!(h.worker.job_timeout(&assignment.job), Duration::from_millis(50));
        let outcome = h.worker.execute(assignment).await;
        assert!(matches!(outcome, JobOutcome::Retried { .. }));

        let stored = h.store.load_job(&job_id).await.unwrap().unwrap();
        assert_eq!(stored.error.unwrap().kind, FailureKind::Timeout);
    }

    #[tokio::test]
    async fn test_partial_success_continues_past_failed_rendition() {
        let encoder = Arc::new(FakeEncoder::new(1, Duration::from_millis(1)));
        encoder.fail_next("720p", EncoderError::EncoderCrashed("boom".into()));
        let config = WorkerConfig {
            partial_success: true,
            ..fast_config()
        };
        let h = harness(encoder.clone(), config);
        let assignment = assign(&h, TranscodeJob::new("c1", "in.mkv", ladder(), 3)).await;

        let outcome = h.worker.execute(assignment).await;
        let JobOutcome::Completed(job) = outcome else {
            panic!("expected completion");
        };
        assert_eq!(encoder.calls(), 3);
        assert_eq!(job.done_renditions().count(), 2);
        let failed = job.renditions.iter().find(|r| r.profile_name == "720p").unwrap();
        assert_eq!(failed.status, RenditionStatus::Error);
    }

    #[test]
    fn test_job_timeout_uses_default_for_missing_durations() {
        let encoder = Arc::new(FakeEncoder::new(1, Duration::from_millis(1)));
        let config = WorkerConfig {
            default_profile_duration: Duration::from_secs(10),
            timeout_multiplier: 4.0,
            ..Default::default()
        };
        let h = harness(encoder, config);
        let profiles = vec![
            RenditionProfile::preset("720p").unwrap().with_expected_duration(5.0),
            RenditionProfile::preset("480p").unwrap(),
        ];
        let job = TranscodeJob::new("c1", "in", profiles, 1);
        assert_eq!(h.worker.job_timeout(&job), Duration::from_secs(60));
    }
}
