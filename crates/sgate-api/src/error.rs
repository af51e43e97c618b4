//! API error types.

use sgate_manifest::ManifestError;
use sgate_models::TransitionError;
use sgate_queue::QueueError;
use sgate_store::StoreError;
use sgate_worker::WorkerError;
use thiserror::Error;

pub type ApiResult<T> = Result<T, ApiError>;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Queue is at capacity ({capacity}); retry later")]
    Backpressure { capacity: usize },

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Not implemented: {0}")]
    NotImplemented(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Queue error: {0}")]
    Queue(QueueError),

    #[error("Worker error: {0}")]
    Worker(WorkerError),

    #[error("Manifest error: {0}")]
    Manifest(#[from] ManifestError),
}

impl ApiError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    pub fn not_implemented(msg: impl Into<String>) -> Self {
        Self::NotImplemented(msg.into())
    }

    pub fn conflict(msg: impl Into<String>) -> Self {
        Self::Conflict(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Stable machine-readable code.
    pub fn code(&self) -> &'static str {
        match self {
            ApiError::Validation(_) => "validation_error",
            ApiError::Backpressure { .. } => "backpressure",
            ApiError::NotFound(_) => "not_found",
            ApiError::NotImplemented(_) => "not_implemented",
            ApiError::Conflict(_) => "conflict",
            ApiError::Internal(_)
            | ApiError::Store(_)
            | ApiError::Queue(_)
            | ApiError::Worker(_)
            | ApiError::Manifest(_) => "internal_error",
        }
    }

    /// Whether the caller may retry the same request later.
    pub fn is_retryable(&self) -> bool {
        match self {
            ApiError::Backpressure { .. } => true,
            ApiError::Store(e) => e.is_retryable(),
            ApiError::Queue(e) => e.is_retryable(),
            ApiError::Worker(e) => e.is_retryable(),
            ApiError::Manifest(e) => e.is_retryable(),
            _ => false,
        }
    }
}

impl From<QueueError> for ApiError {
    fn from(e: QueueError) -> Self {
        match e {
            QueueError::Backpressure { capacity } => ApiError::Backpressure { capacity },
            other => ApiError::Queue(other),
        }
    }
}

impl From<TransitionError> for ApiError {
    fn from(e: TransitionError) -> Self {
        ApiError::Conflict(e.to_string())
    }
}

impl From<WorkerError> for ApiError {
    fn from(e: WorkerError) -> Self {
        match e {
            WorkerError::JobNotFound(id) => ApiError::NotFound(format!("job {}", id)),
            WorkerError::Queue(q) => q.into(),
            WorkerError::Store(s) => ApiError::Store(s),
            WorkerError::Transition(t) => t.into(),
            other => ApiError::Worker(other),
        }
    }
}
