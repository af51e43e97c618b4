//! Per-rendition encode outputs.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Status of a single rendition within a running job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema, Default)]
#[serde(rename_all = "snake_case")]
pub enum RenditionStatus {
    #[default]
    Pending,
    Encoding,
    Done,
    Error,
}

impl RenditionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RenditionStatus::Pending => "pending",
            RenditionStatus::Encoding => "encoding",
            RenditionStatus::Done => "done",
            RenditionStatus::Error => "error",
        }
    }
}

/// One media segment produced by the encoder.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct Segment {
    /// Location of the segment, relative to the rendition root
    pub uri: String,
    /// Playback duration in seconds
    pub duration_secs: f64,
    /// Size in bytes, when the encoder reports it
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub byte_size: Option<u64>,
}

impl Segment {
    pub fn new(uri: impl Into<String>, duration_secs: f64) -> Self {
        Self {
            uri: uri.into(),
            duration_secs,
            byte_size: None,
        }
    }
}

/// Output of one profile for one job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct RenditionOutput {
    pub profile_name: String,
    #[serde(default)]
    pub segments: Vec<Segment>,
    #[serde(default)]
    pub status: RenditionStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl RenditionOutput {
    pub fn pending(profile_name: impl Into<String>) -> Self {
        Self {
            profile_name: profile_name.into(),
            segments: Vec::new(),
            status: RenditionStatus::Pending,
            error: None,
        }
    }

    pub fn begin(&mut self) {
        self.status = RenditionStatus::Encoding;
    }

    pub fn finish(&mut self, segments: Vec<Segment>) {
        self.segments = segments;
        self.status = RenditionStatus::Done;
        self.error = None;
    }

    pub fn fail(&mut self, error: impl Into<String>) {
        self.segments.clear();
        self.status = RenditionStatus::Error;
        self.error = Some(error.into());
    }

    pub fn is_done(&self) -> bool {
        self.status == RenditionStatus::Done
    }

    /// Sum of segment durations.
    pub fn total_duration_secs(&self) -> f64 {
        self.segments.iter().map(|s| s.duration_secs).sum()
    }

    /// Longest segment, rounded up (HLS target duration).
    pub fn target_duration_secs(&self) -> u64 {
        self.segments
            .iter()
            .map(|s| s.duration_secs.ceil() as u64)
            .max()
            .unwrap_or(0)
    }
}
