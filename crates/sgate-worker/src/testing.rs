//! Scripted encoder and fault-injecting store for unit tests.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;

use sgate_models::{JobId, RenditionProfile, Segment, TranscodeJob, WorkerId};
use sgate_store::{JobFilter, JobStore, MemoryStore, StoreError, StoreResult};

use crate::encoder::{Encoder, EncoderError, ProgressCallback};

pub(crate) struct FakeEncoder {
    steps: u32,
    step_delay: Duration,
    failures: Mutex<HashMap<String, VecDeque<EncoderError>>>,
    calls: AtomicUsize,
}

impl FakeEncoder {
    pub(crate) fn new(steps: u32, step_delay: Duration) -> Self {
        Self {
            steps: steps.max(1),
            step_delay,
            failures: Mutex::new(HashMap::new()),
            calls: AtomicUsize::new(0),
        }
    }

    /// Fail the next encode of `profile` with `error`.
    pub(crate) fn fail_next(&self, profile: &str, error: EncoderError) {
        self.failures
            .lock()
            .unwrap()
            .entry(profile.to_string())
            .or_default()
            .push_back(error);
    }

    pub(crate) fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Encoder for FakeEncoder {
    async fn encode(
        &self,
        _input_ref: &str,
        profile: &RenditionProfile,
        progress: ProgressCallback,
        cancel: CancellationToken,
    ) -> Result<Vec<Segment>, EncoderError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let scripted = self
            .failures
            .lock()
            .unwrap()
            .get_mut(&profile.name)
            .and_then(|q| q.pop_front());
        if let Some(error) = scripted {
            return Err(error);
        }

        for step in 1..=self.steps {
            tokio::select! {
                _ = cancel.cancelled() => return Err(EncoderError::Cancelled),
                _ = tokio::time::sleep(self.step_delay) => {}
            }
            progress(step as f64 / self.steps as f64);
        }
        Ok(vec![
            Segment::new(format!("{}/seg-00000.ts", profile.name), 6.0),
            Segment::new(format!("{}/seg-00001.ts", profile.name), 4.0),
        ])
    }
}

/// Job store over a [`MemoryStore`] whose next reads or writes can be made to fail.
pub(crate) struct FlakyStore {
    inner: Arc<MemoryStore>,
    load_failures: AtomicUsize,
    save_failures: AtomicUsize,
}

impl FlakyStore {
    pub(crate) fn new(inner: Arc<MemoryStore>) -> Self {
        Self {
            inner,
            load_failures: AtomicUsize::new(0),
            save_failures: AtomicUsize::new(0),
        }
    }

    pub(crate) fn fail_loads(&self, count: usize) {
        self.load_failures.store(count, Ordering::SeqCst);
    }

    pub(crate) fn fail_saves(&self, count: usize) {
        self.save_failures.store(count, Ordering::SeqCst);
    }

    fn take(counter: &AtomicUsize) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl JobStore for FlakyStore {
    async fn save_job(&self, job: &TranscodeJob) -> StoreResult<()> {
        if Self::take(&self.save_failures) {
            return Err(StoreError::backend("injected write failure"));
        }
        self.inner.save_job(job).await
    }

    async fn delete_job(&self, id: &JobId) -> StoreResult<bool> {
        self.inner.delete_job(id).await
    }

    async fn load_job(&self, id: &JobId) -> StoreResult<Option<TranscodeJob>> {
        if Self::take(&self.load_failures) {
            return Err(StoreError::backend("injected read failure"));
        }
        self.inner.load_job(id).await
    }

    async fn load_archived_job(&self, id: &JobId) -> StoreResult<Option<TranscodeJob>> {
        self.inner.load_archived_job(id).await
    }

    async fn list_pending_jobs(&self) -> StoreResult<Vec<TranscodeJob>> {
        self.inner.list_pending_jobs().await
    }

    async fn list_jobs(&self, filter: &JobFilter) -> StoreResult<Vec<TranscodeJob>> {
        self.inner.list_jobs(filter).await
    }

    async fn record_heartbeat(
        &self,
        id: &JobId,
        worker: &WorkerId,
        at: DateTime<Utc>,
    ) -> StoreResult<bool> {
        self.inner.record_heartbeat(id, worker, at).await
    }

    async fn archive_terminal_before(&self, cutoff: DateTime<Utc>) -> StoreResult<usize> {
        self.inner.archive_terminal_before(cutoff).await
    }
}
