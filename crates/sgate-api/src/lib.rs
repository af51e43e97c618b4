//! Job submission API for the StreamGate transcode scheduler.
//!
//! This crate provides:
//! - `Scheduler`, which assembles queue, worker pool and manifest publisher
//! - Request validation and the per-kind `Capability` contract
//! - Status views, cancellation acknowledgements and scheduler statistics

pub mod capability;
pub mod config;
pub mod error;
pub mod scheduler;
mod stats;
pub mod validation;
pub mod views;

pub use capability::{
    Capabilities, Capability, JobKind, JobRequest, ThumbnailCapability, ThumbnailRequest,
    TranscodeRequest,
};
pub use config::SchedulerConfig;
pub use error::{ApiError, ApiResult};
pub use scheduler::{Collaborators, Scheduler};
pub use views::{CancelAck, JobStatusView, RenditionView, SchedulerStats};
