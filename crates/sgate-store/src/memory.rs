//! In-process store backed by maps.

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use tracing::debug;

use sgate_models::{JobId, Manifest, ManifestType, TranscodeJob, WorkerId};

use crate::error::{StoreError, StoreResult};
use crate::traits::{page_jobs, JobFilter, JobStore, ManifestStore, DEFAULT_RETAINED_VERSIONS};

type ManifestKey = (String, ManifestType);

#[derive(Default)]
struct MemoryState {
    jobs: HashMap<JobId, TranscodeJob>,
    archived: HashMap<JobId, TranscodeJob>,
    manifests: HashMap<ManifestKey, BTreeMap<u32, Manifest>>,
}

/// Map-backed implementation of [`JobStore`] and [`ManifestStore`].
pub struct MemoryStore {
    state: RwLock<MemoryState>,
    retained_versions: usize,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::with_retained_versions(DEFAULT_RETAINED_VERSIONS)
    }

    /// Keep at least `retained_versions` manifest versions (minimum 1).
    pub fn with_retained_versions(retained_versions: usize) -> Self {
        Self {
            state: RwLock::new(MemoryState::default()),
            retained_versions: retained_versions.max(1),
        }
    }

    /// Number of active jobs.
    pub async fn job_count(&self) -> usize {
        self.state.read().await.jobs.len()
    }
}

#[async_trait]
impl JobStore for MemoryStore {
    async fn save_job(&self, job: &TranscodeJob) -> StoreResult<()> {
        let mut state = self.state.write().await;
        let mut job = job.clone();
        // Heartbeats land out of band; a stale copy must not rewind them.
        if let Some(existing) = state.jobs.get(&job.id) {
            if existing.assigned_worker == job.assigned_worker && existing.heartbeat_at > job.heartbeat_at {
                job.heartbeat_at = existing.heartbeat_at;
            }
        }
        state.jobs.insert(job.id.clone(), job);
        Ok(())
    }

    async fn delete_job(&self, id: &JobId) -> StoreResult<bool> {
        Ok(self.state.write().await.jobs.remove(id).is_some())
    }

    async fn load_job(&self, id: &JobId) -> StoreResult<Option<TranscodeJob>> {
        Ok(self.state.read().await.jobs.get(id).cloned())
    }

    async fn load_archived_job(&self, id: &JobId) -> StoreResult<Option<TranscodeJob>> {
        Ok(self.state.read().await.archived.get(id).cloned())
    }

    async fn list_pending_jobs(&self) -> StoreResult<Vec<TranscodeJob>> {
        let state = self.state.read().await;
        let pending: Vec<_> = state
            .jobs
            .values()
            .filter(|j| !j.is_terminal())
            .cloned()
            .collect();
        let filter = JobFilter {
            limit: usize::MAX,
            ..Default::default()
        };
        Ok(page_jobs(pending, &filter))
    }

    async fn list_jobs(&self, filter: &JobFilter) -> StoreResult<Vec<TranscodeJob>> {
        let state = self.state.read().await;
        let matching: Vec<_> = state
            .jobs
            .values()
            .filter(|j| filter.matches(j))
            .cloned()
            .collect();
        Ok(page_jobs(matching, filter))
    }

    async fn record_heartbeat(
        &self,
        id: &JobId,
        worker: &WorkerId,
        at: DateTime<Utc>,
    ) -> StoreResult<bool> {
        let mut state = self.state.write().await;
        match state.jobs.get_mut(id) {
            Some(job) if job.assigned_worker.as_ref() == Some(worker) => {
                job.record_heartbeat(at);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn archive_terminal_before(&self, cutoff: DateTime<Utc>) -> StoreResult<usize> {
        let mut state = self.state.write().await;
        let expired: Vec<JobId> = state
            .jobs
            .values()
            .filter(|j| j.is_terminal() && j.completed_at.is_some_and(|t| t < cutoff))
            .map(|j| j.id.clone())
            .collect();

        for id in &expired {
            if let Some(job) = state.jobs.remove(id) {
                state.archived.insert(id.clone(), job);
            }
        }

        if !expired.is_empty() {
            debug!("Archived {} terminal jobs", expired.len());
        }
        Ok(expired.len())
    }
}

#[async_trait]
impl ManifestStore for MemoryStore {
    async fn save_manifest(&self, manifest: &Manifest) -> StoreResult<()> {
        let mut state = self.state.write().await;
        let versions = state
            .manifests
            .entry((manifest.content_id.clone(), manifest.manifest_type))
            .or_default();

        if versions.contains_key(&manifest.version) {
            return Err(StoreError::VersionConflict {
                content_id: manifest.content_id.clone(),
                version: manifest.version,
            });
        }
        versions.insert(manifest.version, manifest.clone());

        while versions.len() > self.retained_versions {
            versions.pop_first();
        }
        Ok(())
    }

    async fn load_manifest(
        &self,
        content_id: &str,
        manifest_type: ManifestType,
        version: Option<u32>,
    ) -> StoreResult<Option<Manifest>> {
        let state = self.state.read().await;
        let Some(versions) = state
            .manifests
            .get(&(content_id.to_string(), manifest_type))
        else {
            return Ok(None);
        };
        let found = match version {
            Some(v) => versions.get(&v),
            None => versions.values().next_back(),
        };
        Ok(found.cloned())
    }

    async fn latest_version(
        &self,
        content_id: &str,
        manifest_type: ManifestType,
    ) -> StoreResult<Option<u32>> {
        let state = self.state.read().await;
        Ok(state
            .manifests
            .get(&(content_id.to_string(), manifest_type))
            .and_then(|v| v.keys().next_back().copied()))
    }

    async fn list_versions(
        &self,
        content_id: &str,
        manifest_type: ManifestType,
    ) -> StoreResult<Vec<u32>> {
        let state = self.state.read().await;
        Ok(state
            .manifests
            .get(&(content_id.to_string(), manifest_type))
            .map(|v| v.keys().copied().collect())
            .unwrap_or_default())
    }
}
