//! Rendition profiles.

use std::fmt;
use std::str::FromStr;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// AAC-LC audio codec string advertised alongside every video variant.
pub const AUDIO_CODEC_STRING: &str = "mp4a.40.2";

/// Frame size of a rendition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, JsonSchema)]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
}

impl Resolution {
    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    /// Total pixel count.
    pub fn pixels(&self) -> u64 {
        u64::from(self.width) * u64::from(self.height)
    }
}

impl fmt::Display for Resolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("Invalid resolution '{0}', expected WIDTHxHEIGHT")]
pub struct ResolutionParseError(pub String);

impl FromStr for Resolution {
    type Err = ResolutionParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (w, h) = s
            .trim()
            .split_once(['x', 'X'])
            .ok_or_else(|| ResolutionParseError(s.to_string()))?;
        let width = w.parse().map_err(|_| ResolutionParseError(s.to_string()))?;
        let height = h.parse().map_err(|_| ResolutionParseError(s.to_string()))?;
        Ok(Self { width, height })
    }
}

/// Video codec of a rendition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema, Default)]
#[serde(rename_all = "snake_case")]
pub enum VideoCodec {
    #[default]
    H264,
    H265,
    Vp9,
    Av1,
}

impl VideoCodec {
    pub fn as_str(&self) -> &'static str {
        match self {
            VideoCodec::H264 => "h264",
            VideoCodec::H265 => "h265",
            VideoCodec::Vp9 => "vp9",
            VideoCodec::Av1 => "av1",
        }
    }

    /// RFC 6381 codec string for the given frame height.
    ///
    /// H.264 advertises High profile with a level chosen from the height
    /// (3.0 up to 480p, 3.1 up to 720p, 4.0 up to 1080p, 5.1 above).
    pub fn rfc6381(&self, height: u32) -> String {
        match self {
            VideoCodec::H264 => {
                let level = match height {
                    0..=480 => "1e",
                    481..=720 => "1f",
                    721..=1080 => "28",
                    _ => "33",
                };
                format!("avc1.6400{}", level)
            }
            VideoCodec::H265 => {
                let level = if height <= 1080 { 120 } else { 150 };
                format!("hvc1.1.6.L{}.90", level)
            }
            VideoCodec::Vp9 => "vp09.00.40.08".to_string(),
            VideoCodec::Av1 => "av01.0.08M.08".to_string(),
        }
    }
}

impl fmt::Display for VideoCodec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Output container of a rendition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema, Default)]
#[serde(rename_all = "snake_case")]
pub enum Container {
    /// MPEG transport stream segments (classic HLS)
    #[default]
    Ts,
    /// Fragmented MP4 (CMAF, usable by HLS and DASH)
    Fmp4,
    /// Progressive MP4
    Mp4,
    /// WebM
    Webm,
}

impl Container {
    pub fn as_str(&self) -> &'static str {
        match self {
            Container::Ts => "ts",
            Container::Fmp4 => "fmp4",
            Container::Mp4 => "mp4",
            Container::Webm => "webm",
        }
    }

    /// Whether the container can carry the codec.
    pub fn supports(&self, codec: VideoCodec) -> bool {
        match self {
            Container::Ts => matches!(codec, VideoCodec::H264 | VideoCodec::H265),
            Container::Fmp4 | Container::Mp4 => true,
            Container::Webm => matches!(codec, VideoCodec::Vp9 | VideoCodec::Av1),
        }
    }

    /// MIME type used in DASH adaptation sets.
    pub fn mime_type(&self) -> &'static str {
        match self {
            Container::Ts => "video/mp2t",
            Container::Fmp4 | Container::Mp4 => "video/mp4",
            Container::Webm => "video/webm",
        }
    }
}

/// One requested quality level of a transcode job.
///
/// Immutable once part of a job request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct RenditionProfile {
    /// Unique name within the job (e.g. "720p")
    pub name: String,
    /// Output frame size
    pub resolution: Resolution,
    /// Target video bitrate in kbit/s
    pub bitrate_kbps: u32,
    /// Video codec
    #[serde(default)]
    pub codec: VideoCodec,
    /// Output container
    #[serde(default)]
    pub container: Container,
    /// Expected encode duration in seconds, used for progress weighting and
    /// the job wall-clock timeout
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected_duration_secs: Option<f64>,
}

impl RenditionProfile {
    /// Create a new profile with H.264 in MPEG-TS.
    pub fn new(name: impl Into<String>, resolution: Resolution, bitrate_kbps: u32) -> Self {
        Self {
            name: name.into(),
            resolution,
            bitrate_kbps,
            codec: VideoCodec::default(),
            container: Container::default(),
            expected_duration_secs: None,
        }
    }

    /// Look up one of the built-in presets (`1080p`, `720p`, `480p`, `360p`).
    pub fn preset(name: &str) -> Option<Self> {
        let (resolution, bitrate) = match name {
            "1080p" => (Resolution::new(1920, 1080), 5000),
            "720p" => (Resolution::new(1280, 720), 2500),
            "480p" => (Resolution::new(854, 480), 1000),
            "360p" => (Resolution::new(640, 360), 500),
            _ => return None,
        };
        Some(Self::new(name, resolution, bitrate))
    }

    /// The default ladder, highest quality first.
    pub fn default_ladder() -> Vec<Self> {
        ["1080p", "720p", "480p", "360p"]
            .iter()
            .filter_map(|name| Self::preset(name))
            .collect()
    }

    pub fn with_codec(mut self, codec: VideoCodec) -> Self {
        self.codec = codec;
        self
    }

    pub fn with_container(mut self, container: Container) -> Self {
        self.container = container;
        self
    }

    pub fn with_expected_duration(mut self, secs: f64) -> Self {
        self.expected_duration_secs = Some(secs);
        self
    }

    /// Advertised bandwidth in bits per second.
    pub fn bandwidth_bps(&self) -> u64 {
        u64::from(self.bitrate_kbps) * 1000
    }

    /// Codec string for manifests (video + audio).
    pub fn codecs_string(&self) -> String {
        format!(
            "{},{}",
            self.codec.rfc6381(self.resolution.height),
            AUDIO_CODEC_STRING
        )
    }
}
