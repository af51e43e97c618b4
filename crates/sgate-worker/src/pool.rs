//! Worker pool manager.
//!
//! Owns the worker tasks and the assignment table. Three background tasks
//! run while the pool is up:
//! - the dispatcher, which pairs queued jobs with idle workers
//! - the report handler, which folds attempt outcomes back into worker state
//! - the supervisor, which detects dead workers and autoscales
//!
//! Every assignment change happens under the pool lock, so a job is owned by
//! at most one worker at any time.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{TimeZone, Utc};
use futures::future::join_all;
use serde::Serialize;
use tokio::sync::{mpsc, Mutex, Notify};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use sgate_models::{
    FailureKind, JobError, JobEvent, JobId, JobStatus, TranscodeJob, WorkerHandle, WorkerId,
    WorkerState,
};
use sgate_queue::publish_or_log;

use crate::config::PoolConfig;
use crate::error::{WorkerError, WorkerResult};
use crate::lease::Lease;
use crate::metrics;
use crate::worker::{Assignment, JobOutcome, TranscodeWorker, WorkerContext, WorkerReport, WorkerRuntime};

/// Point-in-time pool statistics.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct PoolMetrics {
    pub active: usize,
    pub idle: usize,
    pub draining: usize,
    /// Workers declared dead since start
    pub dead: usize,
    pub total: usize,
    pub queue_depth: usize,
    /// Mean wall time of completed jobs
    pub avg_processing_ms: f64,
}

struct WorkerSlot {
    handle: WorkerHandle,
    sender: mpsc::Sender<Assignment>,
    task: JoinHandle<()>,
    heartbeat: Arc<AtomicI64>,
    shutdown: CancellationToken,
    drain_deadline: Option<Instant>,
}

struct ActiveJob {
    worker_id: WorkerId,
    lease: Lease,
    cancel: CancellationToken,
}

#[derive(Default)]
struct PoolState {
    running: bool,
    started: bool,
    workers: BTreeMap<WorkerId, WorkerSlot>,
    active: HashMap<JobId, ActiveJob>,
    retired: Vec<JoinHandle<()>>,
    dead_count: usize,
    completed_count: u64,
    completed_total_ms: u128,
    up_streak: usize,
    utilization: VecDeque<f64>,
}

impl PoolState {
    fn count(&self, state: WorkerState) -> usize {
        self.workers.values().filter(|s| s.handle.state == state).count()
    }

    fn live(&self) -> usize {
        self.workers.values().filter(|s| s.handle.state.is_live()).count()
    }

    /// Queued, or assigned to one of our workers without a live lease.
    fn is_dispatchable(&self, job: &TranscodeJob) -> bool {
        match job.status {
            JobStatus::Queued => true,
            JobStatus::Assigned => {
                !self.active.contains_key(&job.id)
                    && job
                        .assigned_worker
                        .as_ref()
                        .is_some_and(|w| self.workers.contains_key(w))
            }
            _ => false,
        }
    }
}

/// What became of a dequeued job.
enum Placement {
    Assigned,
    /// Not dispatchable any more; the store decides its fate
    Skipped,
    /// Goes back to the queue
    Returned,
}

struct PoolInner {
    config: PoolConfig,
    ctx: WorkerContext,
    state: Mutex<PoolState>,
    idle: Notify,
    dispatch_stop: CancellationToken,
    shutdown: CancellationToken,
    reports_tx: mpsc::UnboundedSender<WorkerReport>,
    reports_rx: Mutex<Option<mpsc::UnboundedReceiver<WorkerReport>>>,
    completions_tx: mpsc::UnboundedSender<TranscodeJob>,
    completions_rx: Mutex<Option<mpsc::UnboundedReceiver<TranscodeJob>>>,
}

/// Manages a dynamically sized set of transcode workers.
pub struct WorkerPoolManager {
    inner: Arc<PoolInner>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl WorkerPoolManager {
    pub fn new(config: PoolConfig, ctx: WorkerContext) -> Self {
        let (reports_tx, reports_rx) = mpsc::unbounded_channel();
        let (completions_tx, completions_rx) = mpsc::unbounded_channel();
        Self {
            inner: Arc::new(PoolInner {
                config: config.normalized(),
                ctx,
                state: Mutex::new(PoolState::default()),
                idle: Notify::new(),
                dispatch_stop: CancellationToken::new(),
                shutdown: CancellationToken::new(),
                reports_tx,
                reports_rx: Mutex::new(Some(reports_rx)),
                completions_tx,
                completions_rx: Mutex::new(Some(completions_rx)),
            }),
            tasks: Mutex::new(Vec::new()),
        }
    }

    pub fn config(&self) -> &PoolConfig {
        &self.inner.config
    }

    /// Completed jobs, in completion order. Can be taken once.
    pub async fn take_completions(&self) -> Option<mpsc::UnboundedReceiver<TranscodeJob>> {
        self.inner.completions_rx.lock().await.take()
    }

    /// Spawn the minimum worker set and the background tasks.
    ///
    /// A pool runs once; a stopped pool cannot be restarted.
    pub async fn start(&self) -> WorkerResult<()> {
        let reports = {
            let mut state = self.inner.state.lock().await;
            if state.started {
                return Err(WorkerError::PoolAlreadyRunning);
            }
            state.started = true;
            state.running = true;
            for _ in 0..self.inner.config.min_workers {
                self.inner.spawn_worker(&mut state);
            }
            self.inner.reports_rx.lock().await.take()
        };

        let mut tasks = self.tasks.lock().await;
        tasks.push(tokio::spawn(self.inner.clone().dispatch_loop()));
        if let Some(reports) = reports {
            tasks.push(tokio::spawn(self.inner.clone().report_loop(reports)));
        }
        tasks.push(tokio::spawn(self.inner.clone().supervise()));

        info!(
            min_workers = self.inner.config.min_workers,
            max_workers = self.inner.config.max_workers,
            "Worker pool started"
        );
        Ok(())
    }

    /// Stop dispatching and wait up to `drain_timeout` for running jobs.
    ///
    /// Jobs still running at the deadline lose their lease and go back to
    /// the queue as a retry.
    pub async fn stop(&self, drain_timeout: Duration) -> WorkerResult<()> {
        let deadline = Instant::now() + drain_timeout;
        {
            let mut state = self.inner.state.lock().await;
            if !state.running {
                return Err(WorkerError::PoolNotRunning);
            }
            state.running = false;
            self.inner.dispatch_stop.cancel();

            let ids: Vec<WorkerId> = state.workers.keys().cloned().collect();
            for id in ids {
                self.inner.drain_worker(&mut state, &id, deadline);
            }
        }
        info!("Worker pool draining");

        loop {
            if self.inner.state.lock().await.active.is_empty() || Instant::now() >= deadline {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        let mut handles = {
            let mut state = self.inner.state.lock().await;
            let leftover: Vec<JobId> = state.active.keys().cloned().collect();
            for job_id in leftover {
                if let Err(e) = self
                    .inner
                    .reclaim_job(&mut state, &job_id, "scheduler stopped before the job finished")
                    .await
                {
                    warn!(job_id = %job_id, "Failed to reclaim job on stop: {}", e);
                }
            }
            let mut handles: Vec<JoinHandle<()>> = std::mem::take(&mut state.retired);
            handles.extend(std::mem::take(&mut state.workers).into_values().map(|s| s.task));
            handles
        };

        self.inner.shutdown.cancel();
        handles.append(&mut *self.tasks.lock().await);
        let aborts: Vec<_> = handles.iter().map(|h| h.abort_handle()).collect();
        if tokio::time::timeout(Duration::from_secs(5), join_all(handles))
            .await
            .is_err()
        {
            warn!(tasks = aborts.len(), "Pool tasks did not stop in time");
            aborts.iter().for_each(|a| a.abort());
        }
        info!("Worker pool stopped");
        Ok(())
    }

    /// Resize the pool. The target is clamped to `[min_workers, max_workers]`;
    /// shrinking retires idle workers first and drains busy ones.
    pub async fn scale(&self, target: usize) -> WorkerResult<usize> {
        let target = target.clamp(self.inner.config.min_workers, self.inner.config.max_workers);
        let mut state = self.inner.state.lock().await;
        if !state.running {
            return Err(WorkerError::PoolNotRunning);
        }
        self.inner.resize(&mut state, target);
        Ok(target)
    }

    pub async fn metrics(&self) -> PoolMetrics {
        let queue_depth = self.inner.ctx.queue.len().await;
        let state = self.inner.state.lock().await;
        PoolMetrics {
            active: state.count(WorkerState::Busy),
            idle: state.count(WorkerState::Idle),
            draining: state.count(WorkerState::Draining),
            dead: state.dead_count,
            total: state.workers.len(),
            queue_depth,
            avg_processing_ms: if state.completed_count == 0 {
                0.0
            } else {
                state.completed_total_ms as f64 / state.completed_count as f64
            },
        }
    }

    /// Snapshot of every worker, with the latest heartbeat filled in.
    pub async fn workers(&self) -> Vec<WorkerHandle> {
        let state = self.inner.state.lock().await;
        state
            .workers
            .values()
            .map(|slot| {
                let mut handle = slot.handle.clone();
                if let Some(at) = Utc
                    .timestamp_millis_opt(slot.heartbeat.load(Ordering::SeqCst))
                    .single()
                {
                    handle.last_heartbeat = at;
                }
                handle
            })
            .collect()
    }

    /// Workers that are still expected to heartbeat.
    pub async fn live_worker_ids(&self) -> Vec<WorkerId> {
        self.inner.state.lock().await.workers.keys().cloned().collect()
    }

    /// Cancel a job wherever it is.
    ///
    /// Queued jobs are cancelled immediately. Jobs owned by a local worker
    /// move to `Cancelling` and the worker acknowledges. Terminal jobs
    /// report their status unchanged.
    pub async fn cancel(&self, job_id: &JobId) -> WorkerResult<JobStatus> {
        let inner = &self.inner;
        let state = inner.state.lock().await;

        if let Some(active) = state.active.get(job_id) {
            let lease = active.lease.clone();
            let cancel = active.cancel.clone();
            let guard = lease.guard().await;
            if let Some(_guard) = guard {
                let mut job = inner
                    .ctx
                    .store
                    .load_job(job_id)
                    .await?
                    .ok_or_else(|| WorkerError::JobNotFound(job_id.clone()))?;
                if job.is_terminal() {
                    return Ok(job.status);
                }
                let status = job.request_cancel()?;
                inner.ctx.store.save_job(&job).await?;
                cancel.cancel();
                debug!(job_id = %job_id, "Cancellation signalled to worker");
                return Ok(status);
            }
        }

        let mut job = inner
            .ctx
            .store
            .load_job(job_id)
            .await?
            .ok_or_else(|| WorkerError::JobNotFound(job_id.clone()))?;
        match job.status {
            JobStatus::Queued => {
                inner.ctx.queue.remove(job_id).await;
                let status = job.request_cancel()?;
                inner.ctx.store.save_job(&job).await?;
                drop(state);
                publish_or_log(inner.ctx.bus.as_ref(), JobEvent::cancelled(job_id.clone())).await;
                metrics::record_job_cancelled();
                Ok(status)
            }
            JobStatus::Assigned | JobStatus::Running => {
                // Owned by a worker outside this pool; it acknowledges or
                // recovery finishes the cancellation once it goes stale.
                let status = job.request_cancel()?;
                inner.ctx.store.save_job(&job).await?;
                Ok(status)
            }
            status => Ok(status),
        }
    }

    /// Abort a worker task without any cleanup, as if its process died.
    pub async fn kill_worker(&self, worker_id: &WorkerId) -> WorkerResult<()> {
        let state = self.inner.state.lock().await;
        let slot = state
            .workers
            .get(worker_id)
            .ok_or_else(|| WorkerError::WorkerNotFound(worker_id.clone()))?;
        slot.task.abort();
        warn!(worker_id = %worker_id, "Worker task aborted");
        Ok(())
    }
}

impl PoolInner {
    fn spawn_worker(&self, state: &mut PoolState) -> WorkerId {
        let id = WorkerId::new();
        let (sender, receiver) = mpsc::channel(1);
        let heartbeat = Arc::new(AtomicI64::new(Utc::now().timestamp_millis()));
        let shutdown = self.shutdown.child_token();

        let worker = TranscodeWorker::new(id.clone(), self.ctx.clone());
        let runtime = WorkerRuntime::new(
            worker,
            receiver,
            self.reports_tx.clone(),
            heartbeat.clone(),
            shutdown.clone(),
        );
        let task = tokio::spawn(runtime.run());

        state.workers.insert(
            id.clone(),
            WorkerSlot {
                handle: WorkerHandle::new(id.clone()),
                sender,
                task,
                heartbeat,
                shutdown,
                drain_deadline: None,
            },
        );
        self.idle.notify_one();
        debug!(worker_id = %id, "Worker spawned");
        id
    }

    /// Stop an idle worker now, or let a busy one finish first.
    fn drain_worker(&self, state: &mut PoolState, id: &WorkerId, deadline: Instant) {
        let idle = match state.workers.get_mut(id) {
            Some(slot) if slot.handle.state == WorkerState::Idle => true,
            Some(slot) if slot.handle.state == WorkerState::Busy => {
                slot.handle.state = WorkerState::Draining;
                slot.drain_deadline = Some(deadline);
                false
            }
            _ => false,
        };
        if idle {
            self.retire_worker(state, id);
        }
    }

    fn retire_worker(&self, state: &mut PoolState, id: &WorkerId) {
        if let Some(slot) = state.workers.remove(id) {
            slot.shutdown.cancel();
            state.retired.retain(|h| !h.is_finished());
            state.retired.push(slot.task);
            debug!(worker_id = %id, "Worker retired");
        }
    }

    fn resize(&self, state: &mut PoolState, target: usize) {
        let live = state.live();
        if target > live {
            for _ in live..target {
                self.spawn_worker(state);
            }
            return;
        }

        let mut excess = live - target;
        let deadline = Instant::now() + self.config.drain_timeout;
        let idle: Vec<WorkerId> = state
            .workers
            .values()
            .filter(|s| s.handle.state == WorkerState::Idle)
            .map(|s| s.handle.id.clone())
            .collect();
        let busy: Vec<WorkerId> = state
            .workers
            .values()
            .filter(|s| s.handle.state == WorkerState::Busy)
            .map(|s| s.handle.id.clone())
            .collect();
        for id in idle.into_iter().chain(busy) {
            if excess == 0 {
                break;
            }
            self.drain_worker(state, &id, deadline);
            excess -= 1;
        }
    }

    async fn dispatch_loop(self: Arc<Self>) {
        loop {
            if self.dispatch_stop.is_cancelled() {
                break;
            }

            let notified = self.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let has_idle = {
                let state = self.state.lock().await;
                state.workers.values().any(|s| s.handle.is_idle())
            };
            if !has_idle {
                tokio::select! {
                    _ = &mut notified => {}
                    _ = tokio::time::sleep(self.config.dispatch_poll_timeout) => {}
                    _ = self.dispatch_stop.cancelled() => break,
                }
                continue;
            }

            let Some(job) = self
                .ctx
                .queue
                .dequeue_until_cancelled(self.config.dispatch_poll_timeout, &self.dispatch_stop)
                .await
            else {
                continue;
            };

            let job_id = job.id.clone();
            if let Err(e) = self.assign(job).await {
                warn!(job_id = %job_id, "Failed to assign job: {}", e);
            }
        }
        debug!("Dispatcher stopped");
    }

    /// Hand a dequeued job to an idle worker.
    ///
    /// The queue no longer holds the job at this point, so every path that
    /// does not end in an assignment or a skip puts it back.
    async fn assign(&self, job: TranscodeJob) -> WorkerResult<()> {
        let mut state = self.state.lock().await;
        let placed = self.place(&mut state, &job).await;
        drop(state);

        match placed {
            Ok(Placement::Assigned) | Ok(Placement::Skipped) => Ok(()),
            Ok(Placement::Returned) => {
                self.ctx.queue.requeue(job).await?;
                Ok(())
            }
            Err(e) => {
                self.ctx.queue.requeue(job).await?;
                Err(e)
            }
        }
    }

    async fn place(&self, state: &mut PoolState, job: &TranscodeJob) -> WorkerResult<Placement> {
        let worker_id = state
            .workers
            .values()
            .find(|s| s.handle.is_idle() && !s.sender.is_closed())
            .map(|s| s.handle.id.clone());
        let Some(worker_id) = worker_id else {
            return Ok(Placement::Returned);
        };

        let mut current = match self.ctx.store.load_job(&job.id).await? {
            Some(current) if state.is_dispatchable(&current) => current,
            Some(current) => {
                debug!(job_id = %job.id, status = %current.status, "Skipping job no longer queued");
                return Ok(Placement::Skipped);
            }
            None => {
                warn!(job_id = %job.id, "Dequeued job missing from store");
                return Ok(Placement::Skipped);
            }
        };

        // Left assigned by a refused hand-off whose release was never saved.
        if current.status == JobStatus::Assigned {
            current.release()?;
        }
        current.assign(worker_id.clone())?;
        self.ctx.store.save_job(&current).await?;

        let lease = Lease::new(current.id.clone(), worker_id.clone());
        let cancel = lease.token().child_token();
        let assignment = Assignment {
            job: current,
            lease: lease.clone(),
            cancel: cancel.clone(),
        };

        let sent = match state.workers.get(&worker_id) {
            Some(slot) => slot.sender.try_send(assignment),
            None => Err(mpsc::error::TrySendError::Closed(assignment)),
        };
        match sent {
            Ok(()) => {
                let job_id = lease.job_id().clone();
                if let Some(slot) = state.workers.get_mut(&worker_id) {
                    slot.handle.state = WorkerState::Busy;
                    slot.handle.current_job_id = Some(job_id.clone());
                }
                debug!(job_id = %job_id, worker_id = %worker_id, "Job assigned");
                state.active.insert(
                    job_id,
                    ActiveJob {
                        worker_id,
                        lease,
                        cancel,
                    },
                );
                Ok(Placement::Assigned)
            }
            Err(err) => {
                let mut refused = err.into_inner().job;
                warn!(job_id = %refused.id, worker_id = %worker_id, "Worker refused assignment");
                refused.release()?;
                self.ctx.store.save_job(&refused).await?;
                Ok(Placement::Returned)
            }
        }
    }

    async fn report_loop(self: Arc<Self>, mut reports: mpsc::UnboundedReceiver<WorkerReport>) {
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                report = reports.recv() => match report {
                    Some(report) => self.on_report(report).await,
                    None => break,
                },
            }
        }
    }

    async fn on_report(&self, report: WorkerReport) {
        let mut state = self.state.lock().await;

        let owned = state
            .active
            .get(&report.job_id)
            .is_some_and(|a| a.worker_id == report.worker_id);
        if let JobOutcome::Aborted(reason) = &report.outcome {
            warn!(job_id = %report.job_id, worker_id = %report.worker_id, "Attempt aborted: {}", reason);
            // The stored state is whatever the last successful write left.
            if owned {
                if let Err(e) = self.reclaim_job(&mut state, &report.job_id, reason).await {
                    warn!(job_id = %report.job_id, "Failed to reclaim aborted job: {}", e);
                }
            }
        } else if owned {
            state.active.remove(&report.job_id);
        }

        let succeeded = matches!(report.outcome, JobOutcome::Completed(_));
        if succeeded {
            state.completed_count += 1;
            state.completed_total_ms += report.elapsed.as_millis();
        }

        let retire = match state.workers.get_mut(&report.worker_id) {
            Some(slot) => {
                slot.handle.current_job_id = None;
                if succeeded {
                    slot.handle.jobs_completed += 1;
                } else if matches!(report.outcome, JobOutcome::Failed(_) | JobOutcome::Retried { .. }) {
                    slot.handle.jobs_failed += 1;
                }
                match slot.handle.state {
                    WorkerState::Busy => {
                        slot.handle.state = WorkerState::Idle;
                        false
                    }
                    WorkerState::Draining => true,
                    _ => false,
                }
            }
            None => false,
        };
        if retire {
            self.retire_worker(&mut state, &report.worker_id);
        } else {
            self.idle.notify_one();
        }
        drop(state);

        if let JobOutcome::Completed(job) = report.outcome {
            if self.completions_tx.send(*job).is_err() {
                debug!(job_id = %report.job_id, "No completion consumer");
            }
        }
    }

    async fn supervise(self: Arc<Self>) {
        let mut health = tokio::time::interval(self.ctx.config.heartbeat_interval);
        health.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut scaling = tokio::time::interval(self.config.scale_interval);
        scaling.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = health.tick() => self.check_health().await,
                _ = scaling.tick() => self.autoscale().await,
            }
        }
    }

    async fn check_health(&self) {
        let now_ms = Utc::now().timestamp_millis();
        let timeout_ms = self.ctx.config.heartbeat_timeout().as_millis() as i64;
        let now = Instant::now();
        let mut state = self.state.lock().await;

        let dead: Vec<WorkerId> = state
            .workers
            .values()
            .filter(|s| {
                s.task.is_finished() || now_ms - s.heartbeat.load(Ordering::SeqCst) > timeout_ms
            })
            .map(|s| s.handle.id.clone())
            .collect();
        for id in dead {
            let Some(slot) = state.workers.remove(&id) else {
                continue;
            };
            slot.shutdown.cancel();
            slot.task.abort();
            state.dead_count += 1;
            metrics::record_worker_dead();
            warn!(worker_id = %id, "Worker declared dead");

            let orphaned: Vec<JobId> = state
                .active
                .iter()
                .filter(|(_, a)| a.worker_id == id)
                .map(|(job_id, _)| job_id.clone())
                .collect();
            for job_id in orphaned {
                let reason = format!("worker {} stopped heartbeating", id);
                if let Err(e) = self.reclaim_job(&mut state, &job_id, &reason).await {
                    warn!(job_id = %job_id, "Failed to reclaim job: {}", e);
                }
            }
        }

        let overdue: Vec<WorkerId> = state
            .workers
            .values()
            .filter(|s| {
                s.handle.state == WorkerState::Draining && s.drain_deadline.is_some_and(|d| now >= d)
            })
            .map(|s| s.handle.id.clone())
            .collect();
        for id in overdue {
            let orphaned: Vec<JobId> = state
                .active
                .iter()
                .filter(|(_, a)| a.worker_id == id)
                .map(|(job_id, _)| job_id.clone())
                .collect();
            for job_id in orphaned {
                if let Err(e) = self
                    .reclaim_job(&mut state, &job_id, "drain deadline exceeded")
                    .await
                {
                    warn!(job_id = %job_id, "Failed to reclaim job: {}", e);
                }
            }
            self.retire_worker(&mut state, &id);
        }

        if state.running {
            let live = state.live();
            for _ in live..self.config.min_workers {
                self.spawn_worker(&mut state);
            }
        }
    }

    async fn autoscale(&self) {
        let depth = self.ctx.queue.len().await;
        let mut state = self.state.lock().await;
        if !state.running {
            return;
        }

        let live = state.live();
        let busy = state.count(WorkerState::Busy);
        metrics::set_queue_depth(depth);
        metrics::set_workers("idle", state.count(WorkerState::Idle));
        metrics::set_workers("busy", busy);
        metrics::set_workers("draining", state.count(WorkerState::Draining));

        let window = self.config.scale_sustain_samples;
        let utilization = if live == 0 { 1.0 } else { busy as f64 / live as f64 };
        state.utilization.push_back(utilization);
        while state.utilization.len() > window {
            state.utilization.pop_front();
        }

        let pressure = depth as f64 > self.config.scale_up_threshold * live as f64;
        state.up_streak = if pressure { state.up_streak + 1 } else { 0 };

        if pressure && state.up_streak >= window && live < self.config.max_workers {
            let wanted = (depth as f64 / self.config.scale_up_threshold).ceil() as usize;
            let target = wanted.max(live + 1).min(self.config.max_workers);
            info!(queue_depth = depth, from = live, to = target, "Scaling up");
            self.resize(&mut state, target);
            state.up_streak = 0;
            state.utilization.clear();
            metrics::record_scale("up");
            return;
        }

        let mean = state.utilization.iter().sum::<f64>() / state.utilization.len().max(1) as f64;
        if !pressure
            && state.utilization.len() >= window
            && mean < self.config.scale_down_threshold
            && live > self.config.min_workers
        {
            info!(utilization = mean, from = live, to = live - 1, "Scaling down");
            self.resize(&mut state, live - 1);
            state.utilization.clear();
            metrics::record_scale("down");
        }
    }

    /// Take a job away from its worker and put it back in play.
    ///
    /// Revoking the lease waits for any in-flight write by the old owner,
    /// so nothing it does afterwards reaches the store.
    async fn reclaim_job(&self, state: &mut PoolState, job_id: &JobId, reason: &str) -> WorkerResult<()> {
        let Some(active) = state.active.remove(job_id) else {
            return Ok(());
        };
        active.lease.revoke().await;

        let Some(mut job) = self.ctx.store.load_job(job_id).await? else {
            return Ok(());
        };
        match job.status {
            JobStatus::Cancelling => {
                job.mark_cancelled()?;
                self.ctx.store.save_job(&job).await?;
                publish_or_log(self.ctx.bus.as_ref(), JobEvent::cancelled(job_id.clone())).await;
                metrics::record_job_cancelled();
            }
            JobStatus::Assigned | JobStatus::Running => {
                let error = JobError::new(FailureKind::WorkerLost, reason);
                if job.can_retry() {
                    job.requeue_for_retry(Some(error), None)?;
                    self.ctx.store.save_job(&job).await?;
                    let event = JobEvent::queued(job.id.clone(), job.priority, job.retry_count);
                    warn!(job_id = %job_id, retry = job.retry_count, "Requeueing reclaimed job");
                    self.ctx.queue.requeue(job).await?;
                    publish_or_log(self.ctx.bus.as_ref(), event).await;
                    metrics::record_job_retried(FailureKind::WorkerLost);
                } else {
                    let event = JobEvent::failed(
                        job.id.clone(),
                        error.kind,
                        error.message.clone(),
                        job.retry_count,
                    );
                    job.fail(error)?;
                    self.ctx.store.save_job(&job).await?;
                    publish_or_log(self.ctx.bus.as_ref(), event).await;
                    metrics::record_job_failed(FailureKind::WorkerLost);
                }
            }
            _ => {}
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::WorkerConfig;
    use crate::testing::{FakeEncoder, FlakyStore};
    use sgate_models::RenditionProfile;
    use sgate_queue::{BroadcastEventBus, PriorityJobQueue, QueueConfig};
    use sgate_store::{JobStore, MemoryStore};

    struct Fixture {
        store: Arc<MemoryStore>,
        queue: Arc<PriorityJobQueue>,
        pool: WorkerPoolManager,
    }

    fn fixture(encoder: FakeEncoder, pool_config: PoolConfig) -> Fixture {
        let store = Arc::new(MemoryStore::new());
        fixture_over(encoder, pool_config, store.clone(), store)
    }

    /// `store` is what the test inspects; the pool talks to `backend`.
    fn fixture_over(
        encoder: FakeEncoder,
        pool_config: PoolConfig,
        store: Arc<MemoryStore>,
        backend: Arc<dyn JobStore>,
    ) -> Fixture {
        let queue = Arc::new(PriorityJobQueue::new(QueueConfig::default()));
        let ctx = WorkerContext {
            store: backend,
            queue: queue.clone(),
            bus: Arc::new(BroadcastEventBus::default()),
            encoder: Arc::new(encoder),
            config: WorkerConfig {
                heartbeat_interval: Duration::from_millis(20),
                missed_heartbeats: 10,
                retry_base_backoff: Duration::from_millis(5),
                progress_min_interval: Duration::from_millis(5),
                ..Default::default()
            },
        };
        Fixture {
            store,
            queue,
            pool: WorkerPoolManager::new(pool_config, ctx),
        }
    }

    fn small_pool() -> PoolConfig {
        PoolConfig {
            min_workers: 2,
            max_workers: 4,
            scale_interval: Duration::from_millis(20),
            scale_sustain_samples: 2,
            drain_timeout: Duration::from_millis(200),
            dispatch_poll_timeout: Duration::from_millis(20),
            ..Default::default()
        }
    }

    async fn submit(f: &Fixture, priority: u8) -> JobId {
        let job = TranscodeJob::new(
            "content",
            "in.mkv",
            vec![RenditionProfile::preset("480p").unwrap()],
            priority,
        );
        f.store.save_job(&job).await.unwrap();
        let id = job.id.clone();
        f.queue.enqueue(job).await.unwrap();
        id
    }

    async fn wait_for_status(f: &Fixture, id: &JobId, status: JobStatus) -> TranscodeJob {
        for _ in 0..300 {
            if let Some(job) = f.store.load_job(id).await.unwrap() {
                if job.status == status {
                    return job;
                }
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("job {} never reached {}", id, status);
    }

    #[tokio::test]
    async fn test_start_spawns_min_workers() {
        let f = fixture(FakeEncoder::new(1, Duration::from_millis(1)), small_pool());
        f.pool.start().await.unwrap();
        let metrics = f.pool.metrics().await;
        assert_eq!(metrics.total, 2);
        assert_eq!(metrics.idle, 2);
        assert!(matches!(f.pool.start().await, Err(WorkerError::PoolAlreadyRunning)));
        f.pool.stop(Duration::from_millis(100)).await.unwrap();
    }

    #[tokio::test]
    async fn test_jobs_run_to_completion() {
        let f = fixture(FakeEncoder::new(2, Duration::from_millis(2)), small_pool());
        let mut completions = f.pool.take_completions().await.unwrap();
        f.pool.start().await.unwrap();

        let a = submit(&f, 3).await;
        let b = submit(&f, 3).await;
        wait_for_status(&f, &a, JobStatus::Completed).await;
        wait_for_status(&f, &b, JobStatus::Completed).await;

        let first = completions.recv().await.unwrap();
        let second = completions.recv().await.unwrap();
        let mut done = vec![first.id, second.id];
        done.sort();
        let mut expected = vec![a, b];
        expected.sort();
        assert_eq!(done, expected);

        assert!(f.pool.metrics().await.avg_processing_ms > 0.0);
        f.pool.stop(Duration::from_millis(100)).await.unwrap();
    }

    #[tokio::test]
    async fn test_cancel_queued_job() {
        let f = fixture(FakeEncoder::new(1, Duration::from_millis(1)), small_pool());
        let id = submit(&f, 5).await;

        // Pool not started: the job stays in the queue.
        let status = f.pool.cancel(&id).await.unwrap();
        assert_eq!(status, JobStatus::Cancelled);
        assert!(!f.queue.contains(&id).await);

        // Cancelling again is a no-op.
        assert_eq!(f.pool.cancel(&id).await.unwrap(), JobStatus::Cancelled);
    }

    #[tokio::test]
    async fn test_cancel_running_job() {
        let f = fixture(FakeEncoder::new(200, Duration::from_millis(10)), small_pool());
        f.pool.start().await.unwrap();
        let id = submit(&f, 0).await;
        wait_for_status(&f, &id, JobStatus::Running).await;

        let status = f.pool.cancel(&id).await.unwrap();
        assert_eq!(status, JobStatus::Cancelling);
        let job = wait_for_status(&f, &id, JobStatus::Cancelled).await;
        assert!(job.renditions.is_empty());
        f.pool.stop(Duration::from_millis(100)).await.unwrap();
    }

    #[tokio::test]
    async fn test_killed_worker_job_is_requeued() {
        let config = PoolConfig {
            min_workers: 1,
            max_workers: 1,
            ..small_pool()
        };
        let f = fixture(FakeEncoder::new(30, Duration::from_millis(10)), config);
        f.pool.start().await.unwrap();
        let id = submit(&f, 0).await;
        wait_for_status(&f, &id, JobStatus::Running).await;

        let victim = f.pool.workers().await[0].id.clone();
        f.pool.kill_worker(&victim).await.unwrap();

        let job = wait_for_status(&f, &id, JobStatus::Completed).await;
        assert_eq!(job.retry_count, 1);
        assert_eq!(job.error.unwrap().kind, FailureKind::WorkerLost);

        let metrics = f.pool.metrics().await;
        assert_eq!(metrics.dead, 1);
        assert_eq!(metrics.total, 1);
        assert!(!f.pool.live_worker_ids().await.contains(&victim));
        f.pool.stop(Duration::from_millis(100)).await.unwrap();
    }

    #[tokio::test]
    async fn test_scale_clamps_to_bounds() {
        let config = PoolConfig {
            scale_interval: Duration::from_secs(60),
            ..small_pool()
        };
        let f = fixture(FakeEncoder::new(1, Duration::from_millis(1)), config);
        assert!(matches!(f.pool.scale(3).await, Err(WorkerError::PoolNotRunning)));
        f.pool.start().await.unwrap();

        assert_eq!(f.pool.scale(100).await.unwrap(), 4);
        assert_eq!(f.pool.metrics().await.total, 4);

        assert_eq!(f.pool.scale(0).await.unwrap(), 2);
        assert_eq!(f.pool.metrics().await.total, 2);
        f.pool.stop(Duration::from_millis(100)).await.unwrap();
    }

    #[tokio::test]
    async fn test_autoscale_up_under_backlog() {
        let config = PoolConfig {
            min_workers: 1,
            max_workers: 4,
            ..small_pool()
        };
        let f = fixture(FakeEncoder::new(10, Duration::from_millis(10)), config);
        for _ in 0..20 {
            submit(&f, 5).await;
        }
        f.pool.start().await.unwrap();

        let mut peak = 0;
        for _ in 0..50 {
            peak = peak.max(f.pool.metrics().await.total);
            if peak == 4 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(peak, 4);
        f.pool.stop(Duration::from_millis(500)).await.unwrap();
    }

    #[tokio::test]
    async fn test_stop_requeues_unfinished_jobs() {
        let config = PoolConfig {
            min_workers: 1,
            max_workers: 1,
            ..small_pool()
        };
        let f = fixture(FakeEncoder::new(500, Duration::from_millis(10)), config);
        f.pool.start().await.unwrap();
        let id = submit(&f, 0).await;
        wait_for_status(&f, &id, JobStatus::Running).await;

        f.pool.stop(Duration::from_millis(50)).await.unwrap();

        let job = f.store.load_job(&id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Queued);
        assert_eq!(job.retry_count, 1);
        assert!(f.queue.contains(&id).await);
        assert!(matches!(f.pool.stop(Duration::ZERO).await, Err(WorkerError::PoolNotRunning)));
    }

    fn single_worker() -> PoolConfig {
        PoolConfig {
            min_workers: 1,
            max_workers: 1,
            ..small_pool()
        }
    }

    #[tokio::test]
    async fn test_failed_store_read_returns_job_to_queue() {
        let store = Arc::new(MemoryStore::new());
        let flaky = Arc::new(FlakyStore::new(store.clone()));
        let f = fixture_over(
            FakeEncoder::new(1, Duration::from_millis(1)),
            single_worker(),
            store,
            flaky.clone(),
        );
        let id = submit(&f, 3).await;
        flaky.fail_loads(1);
        f.pool.start().await.unwrap();

        let job = wait_for_status(&f, &id, JobStatus::Completed).await;
        assert_eq!(job.retry_count, 0);
        assert!(f.queue.is_empty().await);
        f.pool.stop(Duration::from_millis(200)).await.unwrap();
    }

    #[tokio::test]
    async fn test_failed_assignment_write_returns_job_to_queue() {
        let store = Arc::new(MemoryStore::new());
        let flaky = Arc::new(FlakyStore::new(store.clone()));
        let f = fixture_over(
            FakeEncoder::new(1, Duration::from_millis(1)),
            single_worker(),
            store,
            flaky.clone(),
        );
        let id = submit(&f, 3).await;
        flaky.fail_saves(1);
        f.pool.start().await.unwrap();

        let job = wait_for_status(&f, &id, JobStatus::Completed).await;
        assert_eq!(job.retry_count, 0);
        f.pool.stop(Duration::from_millis(200)).await.unwrap();
    }

    #[tokio::test]
    async fn test_unreleased_assignment_is_dispatched_again() {
        let f = fixture(FakeEncoder::new(1, Duration::from_millis(1)), single_worker());
        f.pool.start().await.unwrap();
        let worker = f.pool.live_worker_ids().await.remove(0);

        // As left by a refused hand-off whose release write failed.
        let mut job = TranscodeJob::new(
            "content",
            "in.mkv",
            vec![RenditionProfile::preset("480p").unwrap()],
            3,
        );
        let queued = job.clone();
        job.assign(worker).unwrap();
        f.store.save_job(&job).await.unwrap();
        f.queue.enqueue(queued).await.unwrap();

        let done = wait_for_status(&f, &job.id, JobStatus::Completed).await;
        assert_eq!(done.retry_count, 0);
        f.pool.stop(Duration::from_millis(200)).await.unwrap();
    }
}
