//! Read models returned by the submission API.

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use sgate_models::{JobError, JobId, JobStatus, RenditionStatus, TranscodeJob, WorkerId};

/// Per-rendition state within a status view.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct RenditionView {
    pub profile_name: String,
    pub status: RenditionStatus,
    pub segments: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Externally visible job state.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct JobStatusView {
    pub job_id: JobId,
    pub content_id: String,
    pub status: JobStatus,
    pub priority: u8,
    pub progress_percent: f64,
    pub retry_count: u32,
    pub max_retries: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub assigned_worker: Option<WorkerId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<JobError>,
    pub renditions: Vec<RenditionView>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    /// Served from the archive after the retention window
    #[serde(default)]
    pub archived: bool,
}

impl JobStatusView {
    pub fn from_job(job: &TranscodeJob, archived: bool) -> Self {
        Self {
            job_id: job.id.clone(),
            content_id: job.content_id.clone(),
            status: job.status,
            priority: job.priority,
            progress_percent: job.progress_percent,
            retry_count: job.retry_count,
            max_retries: job.max_retries,
            assigned_worker: job.assigned_worker.clone(),
            error: job.error.clone(),
            renditions: job
                .renditions
                .iter()
                .map(|r| RenditionView {
                    profile_name: r.profile_name.clone(),
                    status: r.status,
                    segments: r.segments.len(),
                    error: r.error.clone(),
                })
                .collect(),
            created_at: job.created_at,
            updated_at: job.updated_at,
            completed_at: job.completed_at,
            archived,
        }
    }
}

impl From<&TranscodeJob> for JobStatusView {
    fn from(job: &TranscodeJob) -> Self {
        Self::from_job(job, false)
    }
}

/// Result of a cancellation request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct CancelAck {
    pub job_id: JobId,
    /// Status right after the request
    pub status: JobStatus,
    /// `false` when the job had already reached a terminal state
    pub accepted: bool,
}

/// Scheduler-wide counters since start.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct SchedulerStats {
    pub submitted: u64,
    pub completed: u64,
    pub failed: u64,
    pub cancelled: u64,
    pub retried: u64,
    pub manifests: u64,
    pub queue_depth: usize,
}
