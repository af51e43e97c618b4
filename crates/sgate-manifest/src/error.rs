//! Manifest error types.

use sgate_models::{JobId, JobStatus, ManifestType};
use sgate_store::StoreError;
use thiserror::Error;

pub type ManifestResult<T> = Result<T, ManifestError>;

#[derive(Debug, Error)]
pub enum ManifestError {
    /// Rendition outputs do not add up to a playable manifest
    #[error("Manifest assembly failed: {0}")]
    Assembly(String),

    #[error("Job {job_id} is {status}, not completed")]
    NotCompleted { job_id: JobId, status: JobStatus },

    #[error("Could not allocate a {manifest_type} manifest version for {content_id}")]
    VersionContention {
        content_id: String,
        manifest_type: ManifestType,
    },

    #[error("Store error: {0}")]
    Store(#[from] StoreError),
}

impl ManifestError {
    pub fn assembly(msg: impl Into<String>) -> Self {
        Self::Assembly(msg.into())
    }

    /// Errors that mark the job as failed with `ManifestAssembly`.
    pub fn is_assembly(&self) -> bool {
        matches!(self, ManifestError::Assembly(_))
    }

    /// Check if error is retryable.
    pub fn is_retryable(&self) -> bool {
        match self {
            ManifestError::Store(e) => e.is_retryable(),
            ManifestError::VersionContention { .. } => true,
            _ => false,
        }
    }
}
