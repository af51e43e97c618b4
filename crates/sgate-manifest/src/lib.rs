//! Adaptive-streaming manifest generation.
//!
//! This crate provides:
//! - Assembly checks over a completed job's rendition outputs
//! - HLS master/media playlist and DASH MPD renderers
//! - Versioned publication through the manifest store

pub mod config;
pub mod dash;
pub mod error;
pub mod generator;
pub mod hls;
pub mod publisher;

pub use config::ManifestConfig;
pub use error::{ManifestError, ManifestResult};
pub use generator::{Assembly, ManifestGenerator, VariantSource, MEDIA_PLAYLIST};
pub use publisher::{ManifestPublisher, PUBLISHED_TYPES};
