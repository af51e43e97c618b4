//! The scheduler facade: submission API over queue, pool and publisher.
//!
//! A [`Scheduler`] owns every moving part of one scheduler instance. Nothing
//! is global; collaborators (stores, bus, encoder, clock) are injected.
//! While started it runs three background tasks next to the worker pool:
//! - the completion consumer, which publishes manifests for finished jobs
//! - the retention sweeper, which archives old terminal jobs
//! - the orphan scanner, which reclaims jobs of workers outside this process

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use sgate_manifest::{ManifestGenerator, ManifestPublisher, PUBLISHED_TYPES};
use sgate_models::{
    FailureKind, JobError, JobEvent, JobId, JobStatus, Manifest, ManifestType, TranscodeJob,
    WorkerHandle,
};
use sgate_queue::{
    publish_or_log, BroadcastEventBus, Clock, EventBus, JobRecovery, PriorityJobQueue,
    SystemClock,
};
use sgate_store::{JobFilter, JobStore, ManifestStore, MemoryStore};
use sgate_worker::{
    metrics, retry_async, Encoder, PoolMetrics, RetryConfig, WorkerContext, WorkerPoolManager,
};

use crate::capability::{Capability, JobKind, JobRequest, TranscodeRequest};
use crate::config::SchedulerConfig;
use crate::error::{ApiError, ApiResult};
use crate::stats::{CountingBus, StatsCounters};
use crate::views::{CancelAck, JobStatusView, SchedulerStats};

/// External services a scheduler runs against.
#[derive(Clone)]
pub struct Collaborators {
    pub store: Arc<dyn JobStore>,
    pub manifests: Arc<dyn ManifestStore>,
    pub bus: Arc<dyn EventBus>,
    pub encoder: Arc<dyn Encoder>,
    pub clock: Arc<dyn Clock>,
}

impl Collaborators {
    /// Single-process wiring: one [`MemoryStore`] for jobs and manifests,
    /// the given broadcast bus and the system clock.
    pub fn in_memory(encoder: Arc<dyn Encoder>, bus: BroadcastEventBus) -> Self {
        let store = Arc::new(MemoryStore::new());
        Self {
            store: store.clone(),
            manifests: store,
            bus: Arc::new(bus),
            encoder,
            clock: Arc::new(SystemClock),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }
}

#[derive(Default)]
struct Lifecycle {
    started: bool,
    stopped: bool,
    tasks: Vec<JoinHandle<()>>,
}

struct SchedulerInner {
    config: SchedulerConfig,
    store: Arc<dyn JobStore>,
    manifests: Arc<dyn ManifestStore>,
    bus: Arc<dyn EventBus>,
    queue: Arc<PriorityJobQueue>,
    pool: WorkerPoolManager,
    publisher: ManifestPublisher,
    counters: Arc<StatsCounters>,
    shutdown: CancellationToken,
}

/// Priority transcode scheduler.
pub struct Scheduler {
    inner: Arc<SchedulerInner>,
    lifecycle: Mutex<Lifecycle>,
}

impl Scheduler {
    pub fn new(config: SchedulerConfig, collaborators: Collaborators) -> Self {
        let config = config.normalized();
        let counters = Arc::new(StatsCounters::default());
        let bus: Arc<dyn EventBus> = Arc::new(CountingBus::new(collaborators.bus, counters.clone()));
        let queue = Arc::new(PriorityJobQueue::with_clock(
            config.queue.clone(),
            collaborators.clock,
        ));

        let ctx = WorkerContext {
            store: collaborators.store.clone(),
            queue: queue.clone(),
            bus: bus.clone(),
            encoder: collaborators.encoder,
            config: config.worker.clone(),
        };
        let pool = WorkerPoolManager::new(config.pool.clone(), ctx);
        let publisher = ManifestPublisher::new(
            ManifestGenerator::new(config.manifest.clone()),
            collaborators.manifests.clone(),
            bus.clone(),
        );

        Self {
            inner: Arc::new(SchedulerInner {
                config,
                store: collaborators.store,
                manifests: collaborators.manifests,
                bus,
                queue,
                pool,
                publisher,
                counters,
                shutdown: CancellationToken::new(),
            }),
            lifecycle: Mutex::new(Lifecycle::default()),
        }
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.inner.config
    }

    pub fn pool(&self) -> &WorkerPoolManager {
        &self.inner.pool
    }

    pub fn queue(&self) -> &Arc<PriorityJobQueue> {
        &self.inner.queue
    }

    /// Recover persisted jobs, start the pool and the background tasks.
    ///
    /// A scheduler runs once; a stopped scheduler cannot be restarted.
    pub async fn start(&self) -> ApiResult<()> {
        let mut lifecycle = self.lifecycle.lock().await;
        if lifecycle.started {
            return Err(ApiError::conflict("scheduler already started"));
        }

        let report = self.inner.recovery(1).run().await?;
        self.inner.pool.start().await?;
        let completions = self
            .inner
            .pool
            .take_completions()
            .await
            .ok_or_else(|| ApiError::internal("completion stream already taken"))?;
        lifecycle.started = true;

        let inner = &self.inner;
        lifecycle
            .tasks
            .push(tokio::spawn(inner.clone().completion_loop(completions)));
        lifecycle.tasks.push(tokio::spawn(inner.clone().retention_loop()));
        lifecycle.tasks.push(tokio::spawn(inner.clone().orphan_loop()));

        info!(
            restored = report.restored,
            requeued = report.requeued,
            "Scheduler started"
        );
        Ok(())
    }

    /// Drain the pool, finish manifest work and stop background tasks.
    ///
    /// Jobs still running after `shutdown_timeout` go back to the queue
    /// as a retry and stay persisted for the next start.
    pub async fn stop(&self) -> ApiResult<()> {
        let mut lifecycle = self.lifecycle.lock().await;
        if !lifecycle.started || lifecycle.stopped {
            return Err(ApiError::conflict("scheduler is not running"));
        }
        lifecycle.stopped = true;

        let pool_result = self.inner.pool.stop(self.inner.config.shutdown_timeout).await;
        self.inner.shutdown.cancel();
        for handle in lifecycle.tasks.drain(..) {
            let abort = handle.abort_handle();
            if tokio::time::timeout(Duration::from_secs(10), handle).await.is_err() {
                warn!("Scheduler task did not stop in time");
                abort.abort();
            }
        }
        self.inner.queue.close().await;
        pool_result?;

        info!("Scheduler stopped");
        Ok(())
    }

    /// Validate and admit a transcode job.
    ///
    /// Fails with `Validation` before anything is stored and with
    /// `Backpressure` when the queue is full; in both cases no job exists
    /// afterwards.
    pub async fn submit_job(&self, request: TranscodeRequest) -> ApiResult<JobId> {
        request.validate()?;
        let inner = &self.inner;
        let max_retries = request
            .max_retries
            .unwrap_or(inner.config.default_max_retries);
        let job = TranscodeJob::new(
            request.content_id,
            request.input_ref,
            request.profiles,
            request.priority,
        )
        .with_max_retries(max_retries);
        let job_id = job.id.clone();
        let priority = job.priority;

        inner.store.save_job(&job).await?;
        if let Err(e) = inner.queue.enqueue(job).await {
            if let Err(cleanup) = inner.store.delete_job(&job_id).await {
                error!(job_id = %job_id, "Failed to remove rejected job: {}", cleanup);
            }
            warn!(job_id = %job_id, "Job rejected: {}", e);
            return Err(e.into());
        }

        publish_or_log(inner.bus.as_ref(), JobEvent::queued(job_id.clone(), priority, 0)).await;
        inner.counters.record_submitted();
        metrics::record_job_submitted(priority);
        info!(job_id = %job_id, priority, "Job submitted");
        Ok(job_id)
    }

    /// Current view of a job, served from the archive after retention.
    pub async fn get_job_status(&self, job_id: &JobId) -> ApiResult<JobStatusView> {
        let (job, archived) = self.inner.find_job(job_id).await?;
        Ok(JobStatusView::from_job(&job, archived))
    }

    /// Request cancellation.
    ///
    /// Queued jobs are cancelled at once. Running jobs move to `Cancelling`
    /// and their worker stops at the next cancellation point. Terminal jobs
    /// are reported unchanged with `accepted: false`.
    pub async fn cancel_job(&self, job_id: &JobId) -> ApiResult<CancelAck> {
        let (job, _) = self.inner.find_job(job_id).await?;
        if job.is_terminal() {
            return Ok(CancelAck {
                job_id: job_id.clone(),
                status: job.status,
                accepted: false,
            });
        }

        let status = self.inner.pool.cancel(job_id).await?;
        let accepted = matches!(status, JobStatus::Cancelling | JobStatus::Cancelled);
        info!(job_id = %job_id, status = %status, accepted, "Cancellation requested");
        Ok(CancelAck {
            job_id: job_id.clone(),
            status,
            accepted,
        })
    }

    pub async fn list_jobs(&self, filter: &JobFilter) -> ApiResult<Vec<JobStatusView>> {
        let jobs = self.inner.store.list_jobs(filter).await?;
        Ok(jobs.iter().map(JobStatusView::from).collect())
    }

    /// Re-admit a failed job with a fresh retry budget.
    pub async fn retry_job(&self, job_id: &JobId) -> ApiResult<JobStatusView> {
        let inner = &self.inner;
        let original = inner
            .store
            .load_job(job_id)
            .await?
            .ok_or_else(|| ApiError::not_found(format!("job {}", job_id)))?;
        if original.status != JobStatus::Failed {
            return Err(ApiError::conflict(format!(
                "only failed jobs can be retried; job {} is {}",
                job_id, original.status
            )));
        }

        let mut job = original.clone();
        job.reset_for_manual_retry()?;
        inner.store.save_job(&job).await?;
        if let Err(e) = inner.queue.enqueue(job.clone()).await {
            if let Err(restore) = inner.store.save_job(&original).await {
                error!(job_id = %job_id, "Failed to restore rejected retry: {}", restore);
            }
            return Err(e.into());
        }

        publish_or_log(inner.bus.as_ref(), JobEvent::queued(job_id.clone(), job.priority, 0)).await;
        inner.counters.record_manual_retry();
        info!(job_id = %job_id, "Failed job re-admitted");
        Ok(JobStatusView::from(&job))
    }

    pub async fn stats(&self) -> SchedulerStats {
        let depth = self.inner.queue.len().await;
        self.inner.counters.snapshot(depth)
    }

    pub async fn pool_metrics(&self) -> PoolMetrics {
        self.inner.pool.metrics().await
    }

    pub async fn workers(&self) -> Vec<WorkerHandle> {
        self.inner.pool.workers().await
    }

    /// Resize the worker pool within its configured bounds.
    pub async fn scale(&self, target: usize) -> ApiResult<usize> {
        Ok(self.inner.pool.scale(target).await?)
    }

    /// A stored manifest; the latest version when `version` is `None`.
    pub async fn manifest(
        &self,
        content_id: &str,
        manifest_type: ManifestType,
        version: Option<u32>,
    ) -> ApiResult<Manifest> {
        self.inner
            .manifests
            .load_manifest(content_id, manifest_type, version)
            .await?
            .ok_or_else(|| {
                let which = version.map_or_else(|| "latest".to_string(), |v| format!("v{}", v));
                ApiError::not_found(format!("{} manifest {} for {}", manifest_type, which, content_id))
            })
    }

    pub async fn manifest_versions(
        &self,
        content_id: &str,
        manifest_type: ManifestType,
    ) -> ApiResult<Vec<u32>> {
        Ok(self
            .inner
            .manifests
            .list_versions(content_id, manifest_type)
            .await?)
    }

    /// HLS media playlist of one rendition of a completed job.
    pub async fn media_playlist(&self, job_id: &JobId, profile_name: &str) -> ApiResult<String> {
        let (job, _) = self.inner.find_job(job_id).await?;
        if job.status != JobStatus::Completed {
            return Err(ApiError::conflict(format!(
                "job {} is {}, not completed",
                job_id, job.status
            )));
        }
        self.inner
            .publisher
            .generator()
            .media_playlists(&job)?
            .into_iter()
            .find(|(name, _)| name == profile_name)
            .map(|(_, body)| body)
            .ok_or_else(|| ApiError::not_found(format!("rendition {} of job {}", profile_name, job_id)))
    }
}

#[async_trait]
impl Capability for Scheduler {
    fn kind(&self) -> JobKind {
        JobKind::Transcode
    }

    async fn submit(&self, request: JobRequest) -> ApiResult<JobId> {
        match request {
            JobRequest::Transcode(request) => self.submit_job(request).await,
            other => Err(ApiError::not_implemented(format!(
                "{} jobs are not handled by the transcode scheduler",
                other.kind()
            ))),
        }
    }

    async fn status(&self, job_id: &JobId) -> ApiResult<JobStatusView> {
        self.get_job_status(job_id).await
    }

    async fn cancel(&self, job_id: &JobId) -> ApiResult<CancelAck> {
        self.cancel_job(job_id).await
    }
}

impl SchedulerInner {
    /// Recovery treats a job as abandoned after `factor` heartbeat timeouts.
    fn recovery(&self, factor: u32) -> JobRecovery {
        JobRecovery::new(
            self.store.clone(),
            self.queue.clone(),
            self.bus.clone(),
            self.config.worker.heartbeat_timeout() * factor.max(1),
        )
    }

    async fn find_job(&self, job_id: &JobId) -> ApiResult<(TranscodeJob, bool)> {
        if let Some(job) = self.store.load_job(job_id).await? {
            return Ok((job, false));
        }
        if let Some(job) = self.store.load_archived_job(job_id).await? {
            return Ok((job, true));
        }
        Err(ApiError::not_found(format!("job {}", job_id)))
    }

    async fn completion_loop(self: Arc<Self>, mut completions: mpsc::UnboundedReceiver<TranscodeJob>) {
        loop {
            tokio::select! {
                biased;
                job = completions.recv() => match job {
                    Some(job) => self.publish_manifests(job).await,
                    None => break,
                },
                _ = self.shutdown.cancelled() => {
                    while let Ok(job) = completions.try_recv() {
                        self.publish_manifests(job).await;
                    }
                    break;
                }
            }
        }
        debug!("Completion consumer stopped");
    }

    /// Publish every manifest type for a completed job.
    ///
    /// Assembly is checked for all types first, so a broken job publishes
    /// nothing. Store failures are retried per type; a type that already
    /// went out is not written again.
    async fn publish_manifests(&self, job: TranscodeJob) {
        if let Err(e) = self.publisher.check_assembly(&job) {
            metrics::record_manifest_failure();
            if e.is_assembly() {
                warn!(job_id = %job.id, "Manifest assembly failed: {}", e);
                if let Err(e) = self.fail_assembly(&job.id, e.to_string()).await {
                    error!(job_id = %job.id, "Failed to record manifest failure: {}", e);
                }
            } else {
                error!(job_id = %job.id, "Cannot build manifests: {}", e);
            }
            return;
        }

        let retry = RetryConfig::new("publish_manifest").with_max_retries(3);
        let publisher = &self.publisher;
        let target = &job;
        let mut published = Vec::with_capacity(PUBLISHED_TYPES.len());
        for manifest_type in PUBLISHED_TYPES {
            let result = retry_async(&retry, move || publisher.publish(target, manifest_type))
                .await
                .into_result();
            match result {
                Ok(manifest) => published.push(manifest),
                Err(e) => {
                    metrics::record_manifest_failure();
                    error!(
                        job_id = %job.id,
                        manifest_type = %manifest_type,
                        "Manifest publication failed: {}",
                        e
                    );
                    return;
                }
            }
        }

        for manifest in &published {
            metrics::record_manifest_published(manifest.manifest_type.as_str(), manifest.partial);
        }
        self.counters.record_completed();
        debug!(job_id = %job.id, manifests = published.len(), "Manifests published");
    }

    /// A completed job whose outputs cannot form a manifest ends `Failed`.
    async fn fail_assembly(&self, job_id: &JobId, reason: String) -> ApiResult<()> {
        let Some(mut job) = self.store.load_job(job_id).await? else {
            return Ok(());
        };
        if job.status != JobStatus::Completed {
            return Ok(());
        }
        job.fail(JobError::new(FailureKind::ManifestAssembly, reason))?;
        self.store.save_job(&job).await?;

        let message = job.error.as_ref().map(|e| e.message.clone()).unwrap_or_default();
        let event = JobEvent::failed(job_id.clone(), FailureKind::ManifestAssembly, message, job.retry_count);
        publish_or_log(self.bus.as_ref(), event).await;
        metrics::record_job_failed(FailureKind::ManifestAssembly);
        Ok(())
    }

    async fn retention_loop(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(self.config.retention_sweep_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let retention = chrono::Duration::from_std(self.config.retention)
            .unwrap_or_else(|_| chrono::Duration::hours(24));

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = ticker.tick() => {}
            }
            let cutoff = self.queue.clock().now() - retention;
            match self.store.archive_terminal_before(cutoff).await {
                Ok(0) => {}
                Ok(archived) => info!(archived, "Archived terminal jobs past retention"),
                Err(e) => warn!("Retention sweep failed: {}", e),
            }
        }
    }

    async fn orphan_loop(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(self.config.orphan_scan_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The pool reclaims its own dead workers after one timeout; foreign
        // owners get twice that before this scan steps in.
        let recovery = self.recovery(2);
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = ticker.tick() => {}
            }
            let local: HashSet<_> = self.pool.live_worker_ids().await.into_iter().collect();
            match recovery.reclaim_orphans(|w| local.contains(w)).await {
                Ok(report) if report.restored + report.requeued + report.failed + report.cancelled > 0 => {
                    warn!(
                        restored = report.restored,
                        requeued = report.requeued,
                        failed = report.failed,
                        cancelled = report.cancelled,
                        "Reclaimed stranded jobs"
                    );
                }
                Ok(_) => {}
                Err(e) => warn!("Orphan scan failed: {}", e),
            }
        }
    }
}
