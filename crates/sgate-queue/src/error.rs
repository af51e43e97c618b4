//! Queue error types.

use sgate_models::{JobId, TransitionError};
use sgate_store::StoreError;
use thiserror::Error;

pub type QueueResult<T> = Result<T, QueueError>;

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("Queue at capacity ({capacity} jobs)")]
    Backpressure { capacity: usize },

    #[error("Queue is closed")]
    Closed,

    #[error("Job already queued: {0}")]
    DuplicateJob(JobId),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Invalid transition: {0}")]
    Transition(#[from] TransitionError),

    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl QueueError {
    pub fn backpressure(capacity: usize) -> Self {
        Self::Backpressure { capacity }
    }

    /// Callers may retry later with backoff.
    pub fn is_retryable(&self) -> bool {
        match self {
            QueueError::Backpressure { .. } | QueueError::Redis(_) => true,
            QueueError::Store(e) => e.is_retryable(),
            _ => false,
        }
    }
}
