//! Adaptive-streaming manifest types.

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::{JobId, Resolution};

/// Manifest flavour.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum ManifestType {
    /// HLS master playlist
    Hls,
    /// MPEG-DASH media presentation description
    Dash,
}

impl ManifestType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ManifestType::Hls => "hls",
            ManifestType::Dash => "dash",
        }
    }

    /// File extension used by the streaming collaborator.
    pub fn extension(&self) -> &'static str {
        match self {
            ManifestType::Hls => "m3u8",
            ManifestType::Dash => "mpd",
        }
    }

    pub fn content_type(&self) -> &'static str {
        match self {
            ManifestType::Hls => "application/vnd.apple.mpegurl",
            ManifestType::Dash => "application/dash+xml",
        }
    }
}

impl fmt::Display for ManifestType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One playable quality level listed in a manifest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct Variant {
    pub profile_name: String,
    /// Peak bandwidth in bits per second
    pub bandwidth: u64,
    pub resolution: Resolution,
    /// RFC 6381 codec string
    pub codecs: String,
    /// Location of the variant playlist / representation
    pub uri: String,
}

/// A generated manifest version.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct Manifest {
    pub content_id: String,
    pub job_id: JobId,
    pub manifest_type: ManifestType,
    /// Ordered by descending bandwidth
    pub variants: Vec<Variant>,
    /// Starts at 1, incremented on every regeneration
    pub version: u32,
    /// Built from a strict subset of the requested renditions
    pub partial: bool,
    pub generated_at: DateTime<Utc>,
    /// Rendered document
    pub body: String,
}

impl Manifest {
    /// Path under which the streaming collaborator serves this manifest.
    pub fn file_name(&self) -> String {
        format!("{}.{}", self.content_id, self.manifest_type.extension())
    }
}
