//! Shared data models for the StreamGate transcode scheduler.
//!
//! This crate provides Serde-serializable types for:
//! - Transcode jobs and their state machine
//! - Rendition profiles and per-rendition outputs
//! - Adaptive-streaming manifests
//! - Worker handles
//! - Scheduler events and failure kinds

pub mod event;
pub mod failure;
pub mod job;
pub mod manifest;
pub mod profile;
pub mod rendition;
pub mod utils;
pub mod worker;

// Re-export common types
pub use event::{EventKind, EventPayload, JobEvent};
pub use failure::{FailureKind, JobError};
pub use job::{JobId, JobStatus, TranscodeJob, TransitionError, MAX_PRIORITY};
pub use manifest::{Manifest, ManifestType, Variant};
pub use profile::{Container, RenditionProfile, Resolution, ResolutionParseError, VideoCodec};
pub use rendition::{RenditionOutput, RenditionStatus, Segment};
pub use utils::sanitize_diagnostic;
pub use worker::{WorkerHandle, WorkerId, WorkerState};
