//! Encoder collaborator contract.
//!
//! The scheduler never touches codec parameters: it hands an input
//! reference and a profile to an [`Encoder`] and gets segments back.

use async_trait::async_trait;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use sgate_models::{FailureKind, JobError, RenditionProfile, Segment};

/// Progress callback receiving the completed fraction (0.0 to 1.0).
pub type ProgressCallback = Box<dyn Fn(f64) + Send + Sync + 'static>;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EncoderError {
    #[error("Input unreadable: {0}")]
    InputUnreadable(String),

    #[error("Encoder crashed: {0}")]
    EncoderCrashed(String),

    #[error("Encoder timed out: {0}")]
    Timeout(String),

    #[error("Unsupported codec: {0}")]
    UnsupportedCodec(String),

    #[error("Encoding cancelled")]
    Cancelled,
}

impl EncoderError {
    /// Persisted failure kind. Cancellation is not a failure.
    pub fn failure_kind(&self) -> Option<FailureKind> {
        match self {
            EncoderError::InputUnreadable(_) => Some(FailureKind::InputUnreadable),
            EncoderError::EncoderCrashed(_) => Some(FailureKind::EncoderCrashed),
            EncoderError::Timeout(_) => Some(FailureKind::Timeout),
            EncoderError::UnsupportedCodec(_) => Some(FailureKind::UnsupportedCodec),
            EncoderError::Cancelled => None,
        }
    }

    pub fn is_transient(&self) -> bool {
        self.failure_kind().is_some_and(|k| k.is_transient())
    }

    /// Errors that doom every rendition of the job, not just one.
    pub fn affects_whole_job(&self) -> bool {
        matches!(self, EncoderError::InputUnreadable(_))
    }

    pub fn to_job_error(&self) -> JobError {
        let kind = self.failure_kind().unwrap_or(FailureKind::EncoderCrashed);
        let detail = match self {
            EncoderError::InputUnreadable(m)
            | EncoderError::EncoderCrashed(m)
            | EncoderError::Timeout(m)
            | EncoderError::UnsupportedCodec(m) => m.as_str(),
            EncoderError::Cancelled => "encoder stopped unexpectedly",
        };
        JobError::new(kind, detail)
    }
}

#[async_trait]
pub trait Encoder: Send + Sync {
    /// Encode one rendition of `input_ref`.
    ///
    /// Implementations should report progress through `progress` and stop
    /// promptly with [`EncoderError::Cancelled`] once `cancel` fires.
    async fn encode(
        &self,
        input_ref: &str,
        profile: &RenditionProfile,
        progress: ProgressCallback,
        cancel: CancellationToken,
    ) -> Result<Vec<Segment>, EncoderError>;
}
