//! Worker handles owned by the pool manager.

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use crate::JobId;

/// Unique identifier for a worker.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, JsonSchema)]
#[serde(transparent)]
pub struct WorkerId(pub String);

impl WorkerId {
    /// Generate a new worker ID.
    pub fn new() -> Self {
        Self(format!("worker-{}", Uuid::new_v4()))
    }

    pub fn from_string(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for WorkerId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lifecycle state of a worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema, Default)]
#[serde(rename_all = "snake_case")]
pub enum WorkerState {
    #[default]
    Idle,
    Busy,
    /// Accepts no new work; terminates after its current job
    Draining,
    /// Missed too many heartbeats
    Dead,
}

impl WorkerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkerState::Idle => "idle",
            WorkerState::Busy => "busy",
            WorkerState::Draining => "draining",
            WorkerState::Dead => "dead",
        }
    }

    /// Whether the worker still counts toward pool capacity.
    pub fn is_live(&self) -> bool {
        matches!(self, WorkerState::Idle | WorkerState::Busy)
    }
}

/// Snapshot of a worker as seen by the pool manager.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct WorkerHandle {
    pub id: WorkerId,
    pub state: WorkerState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_job_id: Option<JobId>,
    pub last_heartbeat: DateTime<Utc>,
    #[serde(default)]
    pub jobs_completed: u64,
    #[serde(default)]
    pub jobs_failed: u64,
}

impl WorkerHandle {
    pub fn new(id: WorkerId) -> Self {
        Self {
            id,
            state: WorkerState::Idle,
            current_job_id: None,
            last_heartbeat: Utc::now(),
            jobs_completed: 0,
            jobs_failed: 0,
        }
    }

    pub fn is_idle(&self) -> bool {
        self.state == WorkerState::Idle
    }
}
