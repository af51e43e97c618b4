//! Transcode job definition and state machine.

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;
use uuid::Uuid;

use crate::{JobError, RenditionOutput, RenditionProfile, RenditionStatus, WorkerId};

/// Lowest-urgency priority level (0 is the most urgent).
pub const MAX_PRIORITY: u8 = 9;

fn default_max_retries() -> u32 {
    3
}

/// Unique identifier for a job.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, JsonSchema)]
#[serde(transparent)]
pub struct JobId(pub String);

impl JobId {
    /// Generate a new random job ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// Create from an existing string.
    pub fn from_string(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    /// Get the inner string.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for JobId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Job status. The only backward edge is a retry back to `Queued`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema, Default)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Waiting in the priority queue
    #[default]
    Queued,
    /// Handed to a worker, not yet encoding
    Assigned,
    /// Renditions are being encoded
    Running,
    /// Cancellation requested, waiting for the worker to acknowledge
    Cancelling,
    /// All renditions encoded
    Completed,
    /// Terminal failure
    Failed,
    /// Cancelled by a caller
    Cancelled,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::Assigned => "assigned",
            JobStatus::Running => "running",
            JobStatus::Cancelling => "cancelling",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
        }
    }

    /// No more updates expected.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled
        )
    }

    /// Owned by a worker.
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            JobStatus::Assigned | JobStatus::Running | JobStatus::Cancelling
        )
    }

    /// Whether `self -> next` is an edge of the state machine.
    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        use JobStatus::*;
        match (self, next) {
            (Queued, Assigned) | (Queued, Cancelled) => true,
            (Assigned, Running)
            | (Assigned, Queued)
            | (Assigned, Cancelling)
            | (Assigned, Cancelled)
            | (Assigned, Failed) => true,
            (Running, Completed)
            | (Running, Failed)
            | (Running, Queued)
            | (Running, Cancelling) => true,
            (Cancelling, Cancelled) => true,
            // Manifest assembly can still reject a completed job.
            (Completed, Failed) => true,
            _ => false,
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Rejected state change.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransitionError {
    #[error("Invalid job transition {from} -> {to}")]
    Invalid { from: JobStatus, to: JobStatus },

    #[error("Retries exhausted ({retry_count}/{max_retries})")]
    RetriesExhausted { retry_count: u32, max_retries: u32 },
}

/// A transcode job: one input, many renditions.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct TranscodeJob {
    /// Unique job ID
    pub id: JobId,

    /// Content this job produces renditions for
    pub content_id: String,

    /// Reference to the source media (opaque to the scheduler)
    pub input_ref: String,

    /// Requested renditions
    pub profiles: Vec<RenditionProfile>,

    /// 0 (most urgent) to 9
    pub priority: u8,

    /// Authoritative status
    #[serde(default)]
    pub status: JobStatus,

    /// Aggregated progress (0-100)
    #[serde(default)]
    pub progress_percent: f64,

    /// Number of retry attempts so far
    #[serde(default)]
    pub retry_count: u32,

    /// Maximum retries allowed
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Creation timestamp
    pub created_at: DateTime<Utc>,

    /// Last update timestamp
    pub updated_at: DateTime<Utc>,

    /// Start of the latest attempt
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,

    /// Time a terminal state was reached
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,

    /// Latest failure (kept on retry for diagnostics)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<JobError>,

    /// Worker holding the assignment
    #[serde(skip_serializing_if = "Option::is_none")]
    pub assigned_worker: Option<WorkerId>,

    /// Last heartbeat from the owning worker
    #[serde(skip_serializing_if = "Option::is_none")]
    pub heartbeat_at: Option<DateTime<Utc>>,

    /// Earliest time the next attempt may start (retry backoff)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_attempt_at: Option<DateTime<Utc>>,

    /// Per-profile outputs of the current attempt
    #[serde(default)]
    pub renditions: Vec<RenditionOutput>,
}

impl TranscodeJob {
    /// Create a new queued job.
    pub fn new(
        content_id: impl Into<String>,
        input_ref: impl Into<String>,
        profiles: Vec<RenditionProfile>,
        priority: u8,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: JobId::new(),
            content_id: content_id.into(),
            input_ref: input_ref.into(),
            profiles,
            priority: priority.min(MAX_PRIORITY),
            status: JobStatus::Queued,
            progress_percent: 0.0,
            retry_count: 0,
            max_retries: default_max_retries(),
            created_at: now,
            updated_at: now,
            started_at: None,
            completed_at: None,
            error: None,
            assigned_worker: None,
            heartbeat_at: None,
            next_attempt_at: None,
            renditions: Vec::new(),
        }
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    fn transition(&mut self, to: JobStatus) -> Result<(), TransitionError> {
        if !self.status.can_transition_to(to) {
            return Err(TransitionError::Invalid {
                from: self.status,
                to,
            });
        }
        self.status = to;
        self.updated_at = Utc::now();
        Ok(())
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Check if another attempt is allowed.
    pub fn can_retry(&self) -> bool {
        self.retry_count < self.max_retries
    }

    /// Hand the job to a worker.
    pub fn assign(&mut self, worker: WorkerId) -> Result<(), TransitionError> {
        self.transition(JobStatus::Assigned)?;
        self.assigned_worker = Some(worker);
        self.heartbeat_at = Some(self.updated_at);
        self.next_attempt_at = None;
        Ok(())
    }

    /// Undo an assignment that never reached its worker. Not a retry.
    pub fn release(&mut self) -> Result<(), TransitionError> {
        if self.status != JobStatus::Assigned {
            return Err(TransitionError::Invalid {
                from: self.status,
                to: JobStatus::Queued,
            });
        }
        self.transition(JobStatus::Queued)?;
        self.assigned_worker = None;
        self.heartbeat_at = None;
        Ok(())
    }

    /// Begin encoding: resets per-rendition outputs for this attempt.
    pub fn start(&mut self) -> Result<(), TransitionError> {
        self.transition(JobStatus::Running)?;
        self.started_at = Some(self.updated_at);
        self.progress_percent = 0.0;
        self.renditions = self
            .profiles
            .iter()
            .map(|p| RenditionOutput::pending(p.name.clone()))
            .collect();
        Ok(())
    }

    /// Update progress (clamped to 0-100).
    pub fn set_progress(&mut self, percent: f64) {
        self.progress_percent = percent.clamp(0.0, 100.0);
        self.updated_at = Utc::now();
    }

    /// Record a worker heartbeat.
    pub fn record_heartbeat(&mut self, at: DateTime<Utc>) {
        self.heartbeat_at = Some(at);
    }

    /// Mutable output for a profile of the current attempt.
    pub fn rendition_mut(&mut self, profile_name: &str) -> Option<&mut RenditionOutput> {
        self.renditions
            .iter_mut()
            .find(|r| r.profile_name == profile_name)
    }

    /// Outputs that finished successfully.
    pub fn done_renditions(&self) -> impl Iterator<Item = &RenditionOutput> {
        self.renditions
            .iter()
            .filter(|r| r.status == RenditionStatus::Done)
    }

    /// Mark job as completed.
    pub fn complete(&mut self) -> Result<(), TransitionError> {
        self.transition(JobStatus::Completed)?;
        self.completed_at = Some(self.updated_at);
        self.progress_percent = 100.0;
        self.assigned_worker = None;
        Ok(())
    }

    /// Mark job as terminally failed.
    pub fn fail(&mut self, error: JobError) -> Result<(), TransitionError> {
        self.transition(JobStatus::Failed)?;
        self.completed_at = Some(self.updated_at);
        self.error = Some(error);
        self.assigned_worker = None;
        Ok(())
    }

    /// Ask for cancellation. Queued jobs are cancelled at once; owned jobs
    /// move to `Cancelling` until their worker acknowledges.
    pub fn request_cancel(&mut self) -> Result<JobStatus, TransitionError> {
        match self.status {
            JobStatus::Queued => {
                self.mark_cancelled()?;
            }
            JobStatus::Assigned | JobStatus::Running => {
                self.transition(JobStatus::Cancelling)?;
            }
            JobStatus::Cancelling => {}
            other => {
                return Err(TransitionError::Invalid {
                    from: other,
                    to: JobStatus::Cancelling,
                })
            }
        }
        Ok(self.status)
    }

    /// Record cancellation; partial outputs are discarded.
    pub fn mark_cancelled(&mut self) -> Result<(), TransitionError> {
        self.transition(JobStatus::Cancelled)?;
        self.completed_at = Some(self.updated_at);
        self.renditions.clear();
        self.assigned_worker = None;
        Ok(())
    }

    /// Return the job to the queue for another attempt.
    ///
    /// Increments `retry_count`; fails with `RetriesExhausted` when the
    /// budget is spent (the caller then fails the job).
    pub fn requeue_for_retry(
        &mut self,
        error: Option<JobError>,
        next_attempt_at: Option<DateTime<Utc>>,
    ) -> Result<(), TransitionError> {
        if !self.can_retry() {
            return Err(TransitionError::RetriesExhausted {
                retry_count: self.retry_count,
                max_retries: self.max_retries,
            });
        }
        self.transition(JobStatus::Queued)?;
        self.retry_count += 1;
        if error.is_some() {
            self.error = error;
        }
        self.next_attempt_at = next_attempt_at;
        self.assigned_worker = None;
        self.heartbeat_at = None;
        self.progress_percent = 0.0;
        self.renditions.clear();
        Ok(())
    }

    /// Operator-initiated retry of a failed job with a fresh retry budget.
    pub fn reset_for_manual_retry(&mut self) -> Result<(), TransitionError> {
        if self.status != JobStatus::Failed {
            return Err(TransitionError::Invalid {
                from: self.status,
                to: JobStatus::Queued,
            });
        }
        self.status = JobStatus::Queued;
        self.updated_at = Utc::now();
        self.retry_count = 0;
        self.error = None;
        self.progress_percent = 0.0;
        self.completed_at = None;
        self.next_attempt_at = None;
        self.renditions.clear();
        Ok(())
    }
}
