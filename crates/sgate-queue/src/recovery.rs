//! Restore queue contents from the store after a restart.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use tracing::{info, warn};

use sgate_models::{FailureKind, JobError, JobEvent, JobStatus, TranscodeJob, WorkerId};
use sgate_store::JobStore;

use crate::error::QueueResult;
use crate::events::{publish_or_log, EventBus};
use crate::queue::PriorityJobQueue;

/// Outcome counts of a recovery pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    /// Queued jobs put back in the queue
    pub restored: usize,
    /// Stale active jobs returned to the queue with `retry_count + 1`
    pub requeued: usize,
    /// Stale active jobs with no retries left
    pub failed: usize,
    /// Stale jobs that were mid-cancellation
    pub cancelled: usize,
    /// Active jobs with a fresh heartbeat, left to their owner
    pub untouched: usize,
}

/// Reconciles the store's pending jobs with the queue.
pub struct JobRecovery {
    store: Arc<dyn JobStore>,
    queue: Arc<PriorityJobQueue>,
    bus: Arc<dyn EventBus>,
    stale_after: Duration,
}

impl JobRecovery {
    pub fn new(
        store: Arc<dyn JobStore>,
        queue: Arc<PriorityJobQueue>,
        bus: Arc<dyn EventBus>,
        stale_after: std::time::Duration,
    ) -> Self {
        Self {
            store,
            queue,
            bus,
            stale_after: Duration::from_std(stale_after).unwrap_or_else(|_| Duration::seconds(30)),
        }
    }

    /// Startup pass: restores queued jobs and reclaims stale active ones.
    pub async fn run(&self) -> QueueResult<RecoveryReport> {
        let report = self.reconcile(true, |_| false).await?;
        info!(
            restored = report.restored,
            requeued = report.requeued,
            failed = report.failed,
            cancelled = report.cancelled,
            untouched = report.untouched,
            "Job recovery complete"
        );
        Ok(report)
    }

    /// Periodic pass over active jobs whose owner is not a local worker.
    ///
    /// Also restores queued jobs the queue lost track of, for example after
    /// a failed requeue.
    pub async fn reclaim_orphans<F>(&self, is_local: F) -> QueueResult<RecoveryReport>
    where
        F: Fn(&WorkerId) -> bool + Send + Sync,
    {
        self.reconcile(false, is_local).await
    }

    async fn reconcile<F>(&self, restore_queued: bool, is_local: F) -> QueueResult<RecoveryReport>
    where
        F: Fn(&WorkerId) -> bool + Send + Sync,
    {
        let now = self.queue.clock().now();
        let mut report = RecoveryReport::default();

        for job in self.store.list_pending_jobs().await? {
            match job.status {
                JobStatus::Queued => {
                    // After startup, only jobs missing from the queue for a
                    // full staleness window; a dispatch in flight is younger.
                    let due = restore_queued || now - job.updated_at > self.stale_after;
                    if due && !self.queue.contains(&job.id).await {
                        let enqueued_at = job.updated_at;
                        self.queue.restore(job, enqueued_at).await?;
                        report.restored += 1;
                    }
                }
                JobStatus::Assigned | JobStatus::Running | JobStatus::Cancelling => {
                    let owned_locally = job.assigned_worker.as_ref().is_some_and(&is_local);
                    if owned_locally || !self.is_stale(&job, now) {
                        report.untouched += 1;
                        continue;
                    }
                    self.reclaim(job, &mut report).await?;
                }
                _ => {}
            }
        }
        Ok(report)
    }

    fn is_stale(&self, job: &TranscodeJob, now: DateTime<Utc>) -> bool {
        let last_seen = job.heartbeat_at.unwrap_or(job.updated_at);
        now - last_seen > self.stale_after
    }

    async fn reclaim(&self, mut job: TranscodeJob, report: &mut RecoveryReport) -> QueueResult<()> {
        let worker = job
            .assigned_worker
            .as_ref()
            .map(|w| w.to_string())
            .unwrap_or_default();

        if job.status == JobStatus::Cancelling {
            job.mark_cancelled()?;
            self.store.save_job(&job).await?;
            publish_or_log(self.bus.as_ref(), JobEvent::cancelled(job.id.clone())).await;
            report.cancelled += 1;
            return Ok(());
        }

        let error = JobError::new(FailureKind::WorkerLost, format!("worker {} stopped heartbeating", worker));
        if job.requeue_for_retry(Some(error.clone()), None).is_ok() {
            warn!(job_id = %job.id, worker = %worker, retry = job.retry_count, "Requeueing job from lost worker");
            self.store.save_job(&job).await?;
            let event = JobEvent::queued(job.id.clone(), job.priority, job.retry_count);
            self.queue.requeue(job).await?;
            publish_or_log(self.bus.as_ref(), event).await;
            report.requeued += 1;
        } else {
            warn!(job_id = %job.id, worker = %worker, "Lost worker and no retries left");
            let event = JobEvent::failed(job.id.clone(), error.kind, error.message.clone(), job.retry_count);
            job.fail(error)?;
            self.store.save_job(&job).await?;
            publish_or_log(self.bus.as_ref(), event).await;
            report.failed += 1;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{Clock, ManualClock};
    use crate::events::BroadcastEventBus;
    use crate::queue::QueueConfig;
    use sgate_store::MemoryStore;

    struct Fixture {
        store: Arc<MemoryStore>,
        queue: Arc<PriorityJobQueue>,
        clock: Arc<ManualClock>,
        recovery: JobRecovery,
    }

    fn fixture() -> Fixture {
        let store = Arc::new(MemoryStore::new());
        let clock = Arc::new(ManualClock::default());
        let queue = Arc::new(PriorityJobQueue::with_clock(QueueConfig::default(), clock.clone()));
        let recovery = JobRecovery::new(
            store.clone(),
            queue.clone(),
            Arc::new(BroadcastEventBus::default()),
            std::time::Duration::from_secs(30),
        );
        Fixture {
            store,
            queue,
            clock,
            recovery,
        }
    }

    fn running_job(heartbeat: DateTime<Utc>) -> TranscodeJob {
        let mut job = TranscodeJob::new("c", "in", vec![], 5);
        job.assign(WorkerId::new()).unwrap();
        job.start().unwrap();
        job.record_heartbeat(heartbeat);
        job
    }

    #[tokio::test]
    async fn test_restores_queued_jobs() {
        let f = fixture();
        let job = TranscodeJob::new("c", "in", vec![], 3);
        f.store.save_job(&job).await.unwrap();

        let report = f.recovery.run().await.unwrap();
        assert_eq!(report.restored, 1);
        assert!(f.queue.contains(&job.id).await);

        // A second pass does not duplicate.
        let again = f.recovery.run().await.unwrap();
        assert_eq!(again.restored, 0);
        assert_eq!(f.queue.len().await, 1);
    }

    #[tokio::test]
    async fn test_stale_running_job_is_requeued() {
        let f = fixture();
        let job = running_job(f.clock.now());
        f.store.save_job(&job).await.unwrap();
        f.clock.advance(Duration::seconds(60));

        let report = f.recovery.run().await.unwrap();
        assert_eq!(report.requeued, 1);

        let stored = f.store.load_job(&job.id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Queued);
        assert_eq!(stored.retry_count, 1);
        assert_eq!(stored.error.unwrap().kind, FailureKind::WorkerLost);
        assert!(f.queue.contains(&job.id).await);
    }

    #[tokio::test]
    async fn test_fresh_heartbeat_left_alone() {
        let f = fixture();
        let job = running_job(f.clock.now());
        f.store.save_job(&job).await.unwrap();
        f.clock.advance(Duration::seconds(5));

        let report = f.recovery.run().await.unwrap();
        assert_eq!(report.untouched, 1);
        assert!(!f.queue.contains(&job.id).await);
    }

    #[tokio::test]
    async fn test_exhausted_job_fails_with_worker_lost() {
        let f = fixture();
        let mut job = running_job(f.clock.now());
        job.retry_count = job.max_retries;
        f.store.save_job(&job).await.unwrap();
        f.clock.advance(Duration::seconds(60));

        let report = f.recovery.run().await.unwrap();
        assert_eq!(report.failed, 1);
        let stored = f.store.load_job(&job.id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Failed);
        assert_eq!(stored.error.unwrap().kind, FailureKind::WorkerLost);
    }

    #[tokio::test]
    async fn test_stale_cancelling_job_is_cancelled() {
        let f = fixture();
        let mut job = running_job(f.clock.now());
        job.request_cancel().unwrap();
        f.store.save_job(&job).await.unwrap();
        f.clock.advance(Duration::seconds(60));

        let report = f.recovery.run().await.unwrap();
        assert_eq!(report.cancelled, 1);
        let stored = f.store.load_job(&job.id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Cancelled);
    }

    #[tokio::test]
    async fn test_local_workers_are_skipped() {
        let f = fixture();
        let job = running_job(f.clock.now());
        let owner = job.assigned_worker.clone().unwrap();
        f.store.save_job(&job).await.unwrap();
        f.clock.advance(Duration::seconds(60));

        let report = f.recovery.reclaim_orphans(|w| *w == owner).await.unwrap();
        assert_eq!(report.untouched, 1);
        assert_eq!(report.requeued, 0);
    }

    #[tokio::test]
    async fn test_orphan_pass_restores_lost_queued_jobs() {
        let f = fixture();
        let job = TranscodeJob::new("c", "in", vec![], 3);
        f.store.save_job(&job).await.unwrap();

        // Fresh jobs may be between the store and the queue.
        let report = f.recovery.reclaim_orphans(|_| false).await.unwrap();
        assert_eq!(report.restored, 0);
        assert!(!f.queue.contains(&job.id).await);

        f.clock.advance(Duration::seconds(60));
        let report = f.recovery.reclaim_orphans(|_| false).await.unwrap();
        assert_eq!(report.restored, 1);
        assert!(f.queue.contains(&job.id).await);

        let again = f.recovery.reclaim_orphans(|_| false).await.unwrap();
        assert_eq!(again.restored, 0);
        assert_eq!(f.queue.len().await, 1);
    }
}
