//! Worker error types.

use sgate_models::{JobId, TransitionError, WorkerId};
use sgate_queue::QueueError;
use sgate_store::StoreError;
use thiserror::Error;

pub type WorkerResult<T> = Result<T, WorkerError>;

#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("Job not found: {0}")]
    JobNotFound(JobId),

    #[error("Worker not found: {0}")]
    WorkerNotFound(WorkerId),

    #[error("Lease revoked for job {0}")]
    LeaseRevoked(JobId),

    #[error("Pool is not running")]
    PoolNotRunning,

    #[error("Pool is already running")]
    PoolAlreadyRunning,

    #[error("Metrics setup failed: {0}")]
    Metrics(String),

    #[error("Invalid transition: {0}")]
    Transition(#[from] TransitionError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),
}

impl WorkerError {
    pub fn metrics(msg: impl Into<String>) -> Self {
        Self::Metrics(msg.into())
    }

    /// Check if error is retryable.
    pub fn is_retryable(&self) -> bool {
        match self {
            WorkerError::Store(e) => e.is_retryable(),
            WorkerError::Queue(e) => e.is_retryable(),
            _ => false,
        }
    }
}
