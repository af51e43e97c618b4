//! Shared fixtures for scheduler scenarios.

#![allow(dead_code)]

use std::collections::{HashMap, HashSet, VecDeque};
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

use sgate_api::{Collaborators, Scheduler, SchedulerConfig, TranscodeRequest};
use sgate_models::{JobEvent, JobId, JobStatus, Manifest, ManifestType, RenditionProfile, Segment};
use sgate_queue::{BroadcastEventBus, QueueConfig, SystemClock};
use sgate_store::{ManifestStore, MemoryStore, StoreError, StoreResult};
use sgate_worker::{Encoder, EncoderError, PoolConfig, ProgressCallback, WorkerConfig};

/// Encoder with scripted failures and overlap detection.
pub struct ScriptedEncoder {
    steps: u32,
    step_delay: Duration,
    failures: Mutex<HashMap<String, VecDeque<EncoderError>>>,
    always_fail: Mutex<HashMap<String, EncoderError>>,
    empty_output: Mutex<HashSet<String>>,
    in_flight: Mutex<HashSet<String>>,
    overlaps: AtomicUsize,
    calls: AtomicUsize,
    started: Mutex<Vec<Instant>>,
}

impl ScriptedEncoder {
    pub fn new(steps: u32, step_delay: Duration) -> Self {
        Self {
            steps: steps.max(1),
            step_delay,
            failures: Mutex::new(HashMap::new()),
            always_fail: Mutex::new(HashMap::new()),
            empty_output: Mutex::new(HashSet::new()),
            in_flight: Mutex::new(HashSet::new()),
            overlaps: AtomicUsize::new(0),
            calls: AtomicUsize::new(0),
            started: Mutex::new(Vec::new()),
        }
    }

    pub fn fast() -> Self {
        Self::new(2, Duration::from_millis(5))
    }

    /// Fail the next encode of `profile`.
    pub fn fail_next(&self, profile: &str, error: EncoderError) {
        self.failures
            .lock()
            .unwrap()
            .entry(profile.to_string())
            .or_default()
            .push_back(error);
    }

    /// Fail every encode of `profile`.
    pub fn fail_always(&self, profile: &str, error: EncoderError) {
        self.always_fail
            .lock()
            .unwrap()
            .insert(profile.to_string(), error);
    }

    /// Report success for `profile` without producing segments.
    pub fn produce_nothing(&self, profile: &str) {
        self.empty_output.lock().unwrap().insert(profile.to_string());
    }

    /// Times two encodes of the same input ran at once.
    pub fn overlaps(&self) -> usize {
        self.overlaps.load(Ordering::SeqCst)
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Time between consecutive encode calls.
    pub fn call_gaps(&self) -> Vec<Duration> {
        let started = self.started.lock().unwrap();
        started.windows(2).map(|w| w[1] - w[0]).collect()
    }

    fn scripted_failure(&self, profile: &str) -> Option<EncoderError> {
        if let Some(err) = self.always_fail.lock().unwrap().get(profile) {
            return Some(err.clone());
        }
        self.failures
            .lock()
            .unwrap()
            .get_mut(profile)
            .and_then(|q| q.pop_front())
    }

    async fn run(
        &self,
        profile: &RenditionProfile,
        progress: ProgressCallback,
        cancel: CancellationToken,
    ) -> Result<Vec<Segment>, EncoderError> {
        if let Some(err) = self.scripted_failure(&profile.name) {
            return Err(err);
        }
        for step in 1..=self.steps {
            tokio::select! {
                _ = cancel.cancelled() => return Err(EncoderError::Cancelled),
                _ = tokio::time::sleep(self.step_delay) => {}
            }
            progress(step as f64 / self.steps as f64);
        }
        if self.empty_output.lock().unwrap().contains(&profile.name) {
            return Ok(Vec::new());
        }
        Ok(vec![
            Segment::new(format!("{}/seg-00000.ts", profile.name), 6.0),
            Segment::new(format!("{}/seg-00001.ts", profile.name), 6.0),
            Segment::new(format!("{}/seg-00002.ts", profile.name), 3.5),
        ])
    }
}

#[async_trait]
impl Encoder for ScriptedEncoder {
    async fn encode(
        &self,
        input_ref: &str,
        profile: &RenditionProfile,
        progress: ProgressCallback,
        cancel: CancellationToken,
    ) -> Result<Vec<Segment>, EncoderError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.started.lock().unwrap().push(Instant::now());
        if !self.in_flight.lock().unwrap().insert(input_ref.to_string()) {
            self.overlaps.fetch_add(1, Ordering::SeqCst);
        }
        let result = self.run(profile, progress, cancel).await;
        self.in_flight.lock().unwrap().remove(input_ref);
        result
    }
}

/// Manifest store over a [`MemoryStore`] that rejects the next writes of
/// one manifest type.
pub struct FlakyManifests {
    inner: Arc<MemoryStore>,
    failing: Mutex<HashMap<ManifestType, usize>>,
    saves: AtomicUsize,
}

impl FlakyManifests {
    pub fn new(inner: Arc<MemoryStore>) -> Self {
        Self {
            inner,
            failing: Mutex::new(HashMap::new()),
            saves: AtomicUsize::new(0),
        }
    }

    pub fn fail_next(&self, manifest_type: ManifestType, count: usize) {
        self.failing.lock().unwrap().insert(manifest_type, count);
    }

    /// Successful writes so far.
    pub fn saves(&self) -> usize {
        self.saves.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ManifestStore for FlakyManifests {
    async fn save_manifest(&self, manifest: &Manifest) -> StoreResult<()> {
        let reject = {
            let mut failing = self.failing.lock().unwrap();
            match failing.get_mut(&manifest.manifest_type) {
                Some(left) if *left > 0 => {
                    *left -= 1;
                    true
                }
                _ => false,
            }
        };
        if reject {
            return Err(StoreError::backend("manifest bucket unavailable"));
        }
        self.inner.save_manifest(manifest).await?;
        self.saves.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn load_manifest(
        &self,
        content_id: &str,
        manifest_type: ManifestType,
        version: Option<u32>,
    ) -> StoreResult<Option<Manifest>> {
        self.inner.load_manifest(content_id, manifest_type, version).await
    }

    async fn latest_version(
        &self,
        content_id: &str,
        manifest_type: ManifestType,
    ) -> StoreResult<Option<u32>> {
        self.inner.latest_version(content_id, manifest_type).await
    }

    async fn list_versions(
        &self,
        content_id: &str,
        manifest_type: ManifestType,
    ) -> StoreResult<Vec<u32>> {
        self.inner.list_versions(content_id, manifest_type).await
    }
}

/// Timings short enough for tests.
pub fn test_config(min_workers: usize, max_workers: usize) -> SchedulerConfig {
    SchedulerConfig {
        queue: QueueConfig {
            dequeue_poll_timeout: Duration::from_millis(20),
            ..Default::default()
        },
        worker: WorkerConfig {
            heartbeat_interval: Duration::from_millis(20),
            missed_heartbeats: 10,
            retry_base_backoff: Duration::from_millis(5),
            max_backoff: Duration::from_millis(50),
            progress_min_interval: Duration::from_millis(5),
            ..Default::default()
        },
        pool: PoolConfig {
            min_workers,
            max_workers,
            scale_interval: Duration::from_secs(60),
            dispatch_poll_timeout: Duration::from_millis(20),
            drain_timeout: Duration::from_secs(2),
            ..Default::default()
        },
        retention_sweep_interval: Duration::from_secs(60),
        orphan_scan_interval: Duration::from_secs(60),
        shutdown_timeout: Duration::from_secs(2),
        ..Default::default()
    }
}

pub struct Harness {
    pub scheduler: Scheduler,
    pub encoder: Arc<ScriptedEncoder>,
    pub bus: BroadcastEventBus,
    pub collaborators: Collaborators,
}

pub fn harness(config: SchedulerConfig, encoder: ScriptedEncoder) -> Harness {
    let encoder = Arc::new(encoder);
    let bus = BroadcastEventBus::new(16_384);
    let collaborators = Collaborators::in_memory(encoder.clone(), bus.clone());
    Harness {
        scheduler: Scheduler::new(config, collaborators.clone()),
        encoder,
        bus,
        collaborators,
    }
}

/// Harness whose manifests go through `manifests`.
pub fn harness_with_manifests(
    config: SchedulerConfig,
    encoder: ScriptedEncoder,
    store: Arc<MemoryStore>,
    manifests: Arc<dyn ManifestStore>,
) -> Harness {
    let encoder = Arc::new(encoder);
    let bus = BroadcastEventBus::new(16_384);
    let collaborators = Collaborators {
        store,
        manifests,
        bus: Arc::new(bus.clone()),
        encoder: encoder.clone(),
        clock: Arc::new(SystemClock),
    };
    Harness {
        scheduler: Scheduler::new(config, collaborators.clone()),
        encoder,
        bus,
        collaborators,
    }
}

pub fn request(content_id: &str, presets: &[&str], priority: u8) -> TranscodeRequest {
    let profiles = presets
        .iter()
        .map(|p| RenditionProfile::preset(p).unwrap())
        .collect();
    TranscodeRequest::new(content_id, format!("s3://ingest/{}.mkv", content_id), profiles, priority)
}

/// Poll `check` until it holds or `timeout` elapses.
pub async fn eventually<F, Fut>(timeout: Duration, mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if check().await {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

pub async fn wait_for_status(scheduler: &Scheduler, job_id: &JobId, status: JobStatus) -> bool {
    eventually(Duration::from_secs(10), move || async move {
        scheduler
            .get_job_status(job_id)
            .await
            .map(|v| v.status == status)
            .unwrap_or(false)
    })
    .await
}

/// Everything currently buffered on the receiver.
pub fn drain_events(rx: &mut broadcast::Receiver<JobEvent>) -> Vec<JobEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

pub fn events_for<'a>(events: &'a [JobEvent], job_id: &JobId) -> Vec<&'a JobEvent> {
    events.iter().filter(|e| &e.job_id == job_id).collect()
}
