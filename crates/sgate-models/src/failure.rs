//! Persisted failure reasons.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::utils::sanitize_diagnostic;

/// Why a job attempt failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Input could not be read or decoded
    InputUnreadable,
    /// Encoder process crashed or returned garbage
    EncoderCrashed,
    /// Attempt exceeded its wall-clock budget
    Timeout,
    /// Requested codec is not available
    UnsupportedCodec,
    /// Owning worker stopped heartbeating
    WorkerLost,
    /// Rendition outputs could not be assembled into a manifest
    ManifestAssembly,
}

impl FailureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureKind::InputUnreadable => "input_unreadable",
            FailureKind::EncoderCrashed => "encoder_crashed",
            FailureKind::Timeout => "timeout",
            FailureKind::UnsupportedCodec => "unsupported_codec",
            FailureKind::WorkerLost => "worker_lost",
            FailureKind::ManifestAssembly => "manifest_assembly",
        }
    }

    /// Transient kinds are retried; the rest fail fast.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            FailureKind::EncoderCrashed | FailureKind::Timeout | FailureKind::WorkerLost
        )
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Failure recorded on a job: kind plus a sanitized diagnostic.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct JobError {
    pub kind: FailureKind,
    pub message: String,
}

impl JobError {
    /// Build a job error, sanitizing the raw diagnostic.
    pub fn new(kind: FailureKind, raw_message: impl AsRef<str>) -> Self {
        Self {
            kind,
            message: sanitize_diagnostic(raw_message.as_ref()),
        }
    }
}

impl fmt::Display for JobError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}
