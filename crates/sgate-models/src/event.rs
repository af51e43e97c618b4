//! Scheduler events published on the event bus.

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::{FailureKind, JobId, ManifestType, WorkerId};

/// Event kinds, used for routing and metrics labels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    JobQueued,
    JobStarted,
    JobProgress,
    JobCompleted,
    JobFailed,
    JobCancelled,
    ManifestGenerated,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::JobQueued => "job_queued",
            EventKind::JobStarted => "job_started",
            EventKind::JobProgress => "job_progress",
            EventKind::JobCompleted => "job_completed",
            EventKind::JobFailed => "job_failed",
            EventKind::JobCancelled => "job_cancelled",
            EventKind::ManifestGenerated => "manifest_generated",
        }
    }
}

/// Kind-specific event data.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventPayload {
    /// Job admitted (or re-admitted for a retry)
    JobQueued { priority: u8, retry_count: u32 },

    /// A worker started an attempt
    JobStarted { worker_id: WorkerId, attempt: u32 },

    /// Aggregated progress (0-100)
    JobProgress {
        percent: f64,
        #[serde(skip_serializing_if = "Option::is_none")]
        rendition: Option<String>,
    },

    /// All renditions encoded
    JobCompleted { renditions: u32, duration_ms: u64 },

    /// Terminal failure
    JobFailed {
        kind: FailureKind,
        /// Sanitized diagnostic
        message: String,
        retry_count: u32,
    },

    /// Cancellation acknowledged
    JobCancelled,

    /// A manifest version was persisted
    ManifestGenerated {
        content_id: String,
        manifest_type: ManifestType,
        version: u32,
        variants: u32,
        partial: bool,
    },
}

impl EventPayload {
    pub fn kind(&self) -> EventKind {
        match self {
            EventPayload::JobQueued { .. } => EventKind::JobQueued,
            EventPayload::JobStarted { .. } => EventKind::JobStarted,
            EventPayload::JobProgress { .. } => EventKind::JobProgress,
            EventPayload::JobCompleted { .. } => EventKind::JobCompleted,
            EventPayload::JobFailed { .. } => EventKind::JobFailed,
            EventPayload::JobCancelled => EventKind::JobCancelled,
            EventPayload::ManifestGenerated { .. } => EventKind::ManifestGenerated,
        }
    }
}

/// Event envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct JobEvent {
    pub job_id: JobId,
    pub timestamp: DateTime<Utc>,
    pub payload: EventPayload,
}

impl JobEvent {
    pub fn new(job_id: JobId, payload: EventPayload) -> Self {
        Self {
            job_id,
            timestamp: Utc::now(),
            payload,
        }
    }

    pub fn kind(&self) -> EventKind {
        self.payload.kind()
    }

    pub fn queued(job_id: JobId, priority: u8, retry_count: u32) -> Self {
        Self::new(
            job_id,
            EventPayload::JobQueued {
                priority,
                retry_count,
            },
        )
    }

    pub fn started(job_id: JobId, worker_id: WorkerId, attempt: u32) -> Self {
        Self::new(job_id, EventPayload::JobStarted { worker_id, attempt })
    }

    pub fn progress(job_id: JobId, percent: f64, rendition: Option<String>) -> Self {
        Self::new(job_id, EventPayload::JobProgress { percent, rendition })
    }

    pub fn completed(job_id: JobId, renditions: u32, duration_ms: u64) -> Self {
        Self::new(
            job_id,
            EventPayload::JobCompleted {
                renditions,
                duration_ms,
            },
        )
    }

    pub fn failed(
        job_id: JobId,
        kind: FailureKind,
        message: impl Into<String>,
        retry_count: u32,
    ) -> Self {
        Self::new(
            job_id,
            EventPayload::JobFailed {
                kind,
                message: message.into(),
                retry_count,
            },
        )
    }

    pub fn cancelled(job_id: JobId) -> Self {
        Self::new(job_id, EventPayload::JobCancelled)
    }

    pub fn manifest_generated(
        job_id: JobId,
        content_id: impl Into<String>,
        manifest_type: ManifestType,
        version: u32,
        variants: u32,
        partial: bool,
    ) -> Self {
        Self::new(
            job_id,
            EventPayload::ManifestGenerated {
                content_id: content_id.into(),
                manifest_type,
                version,
                variants,
                partial,
            },
        )
    }
}
