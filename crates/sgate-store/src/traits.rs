//! Persistence contracts the scheduler depends on.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use sgate_models::{JobId, JobStatus, Manifest, ManifestType, TranscodeJob, WorkerId};

use crate::error::StoreResult;

/// Number of manifest versions kept per content and type by default.
pub const DEFAULT_RETAINED_VERSIONS: usize = 5;

/// Query filter for [`JobStore::list_jobs`].
#[derive(Debug, Clone)]
pub struct JobFilter {
    pub status: Option<JobStatus>,
    pub content_id: Option<String>,
    pub limit: usize,
    pub offset: usize,
}

impl Default for JobFilter {
    fn default() -> Self {
        Self {
            status: None,
            content_id: None,
            limit: 100,
            offset: 0,
        }
    }
}

impl JobFilter {
    pub fn with_status(mut self, status: JobStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn with_content(mut self, content_id: impl Into<String>) -> Self {
        self.content_id = Some(content_id.into());
        self
    }

    pub fn matches(&self, job: &TranscodeJob) -> bool {
        self.status.map_or(true, |s| job.status == s)
            && self
                .content_id
                .as_deref()
                .map_or(true, |c| job.content_id == c)
    }
}

/// Sort jobs oldest first with the ID as a tiebreak, then page.
pub(crate) fn page_jobs(mut jobs: Vec<TranscodeJob>, filter: &JobFilter) -> Vec<TranscodeJob> {
    jobs.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
    jobs.into_iter()
        .skip(filter.offset)
        .take(filter.limit)
        .collect()
}

/// Durable record of job state.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Insert or replace a job.
    async fn save_job(&self, job: &TranscodeJob) -> StoreResult<()>;

    /// Remove a job that was never admitted. Returns `true` if it existed.
    async fn delete_job(&self, id: &JobId) -> StoreResult<bool>;

    /// Load an active (non-archived) job.
    async fn load_job(&self, id: &JobId) -> StoreResult<Option<TranscodeJob>>;

    /// Load a job moved out of the active set by retention.
    async fn load_archived_job(&self, id: &JobId) -> StoreResult<Option<TranscodeJob>>;

    /// All non-terminal jobs, oldest first.
    async fn list_pending_jobs(&self) -> StoreResult<Vec<TranscodeJob>>;

    /// Active jobs matching the filter, oldest first.
    async fn list_jobs(&self, filter: &JobFilter) -> StoreResult<Vec<TranscodeJob>>;

    /// Refresh the heartbeat of a job owned by `worker`.
    ///
    /// Returns `false` when the job is unknown or owned by someone else.
    async fn record_heartbeat(
        &self,
        id: &JobId,
        worker: &WorkerId,
        at: DateTime<Utc>,
    ) -> StoreResult<bool>;

    /// Archive terminal jobs that finished before `cutoff`. Returns the count.
    async fn archive_terminal_before(&self, cutoff: DateTime<Utc>) -> StoreResult<usize>;
}

/// Versioned manifest storage.
#[async_trait]
pub trait ManifestStore: Send + Sync {
    /// Persist a new version. Fails with `VersionConflict` if it exists.
    /// Older versions beyond the retention count are pruned.
    async fn save_manifest(&self, manifest: &Manifest) -> StoreResult<()>;

    /// Load a specific version, or the latest when `version` is `None`.
    async fn load_manifest(
        &self,
        content_id: &str,
        manifest_type: ManifestType,
        version: Option<u32>,
    ) -> StoreResult<Option<Manifest>>;

    /// Highest stored version.
    async fn latest_version(
        &self,
        content_id: &str,
        manifest_type: ManifestType,
    ) -> StoreResult<Option<u32>>;

    /// Retained versions, ascending.
    async fn list_versions(
        &self,
        content_id: &str,
        manifest_type: ManifestType,
    ) -> StoreResult<Vec<u32>>;
}
