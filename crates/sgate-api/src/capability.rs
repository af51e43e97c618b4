//! Job kinds and the capability contract.
//!
//! Each job kind is served by a [`Capability`]. Requests arrive as a tagged
//! [`JobRequest`] and [`Capabilities`] routes them by kind. Kinds without an
//! implementation answer with [`ApiError::NotImplemented`].

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use sgate_models::{JobId, RenditionProfile};

use crate::error::{ApiError, ApiResult};
use crate::validation;
use crate::views::{CancelAck, JobStatusView};

/// Request for a multi-rendition transcode.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct TranscodeRequest {
    pub content_id: String,
    pub input_ref: String,
    pub profiles: Vec<RenditionProfile>,
    /// 0 (most urgent) to 9
    #[serde(default = "default_priority")]
    pub priority: u8,
    /// Overrides the scheduler's default retry budget
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_retries: Option<u32>,
}

fn default_priority() -> u8 {
    5
}

impl TranscodeRequest {
    pub fn new(
        content_id: impl Into<String>,
        input_ref: impl Into<String>,
        profiles: Vec<RenditionProfile>,
        priority: u8,
    ) -> Self {
        Self {
            content_id: content_id.into(),
            input_ref: input_ref.into(),
            profiles,
            priority,
            max_retries: None,
        }
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }

    pub fn validate(&self) -> ApiResult<()> {
        validation::validate_content_id(&self.content_id)?;
        validation::validate_input_ref(&self.input_ref)?;
        validation::validate_priority(self.priority)?;
        validation::validate_profiles(&self.profiles)
    }
}

/// Request for poster frames.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct ThumbnailRequest {
    pub content_id: String,
    pub input_ref: String,
    /// Capture points in seconds from the start
    #[serde(default)]
    pub timestamps_secs: Vec<f64>,
}

/// A job submission of any kind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum JobRequest {
    Transcode(TranscodeRequest),
    Thumbnail(ThumbnailRequest),
}

/// Discriminant of [`JobRequest`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum JobKind {
    Transcode,
    Thumbnail,
}

impl JobKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobKind::Transcode => "transcode",
            JobKind::Thumbnail => "thumbnail",
        }
    }
}

impl fmt::Display for JobKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl JobRequest {
    pub fn kind(&self) -> JobKind {
        match self {
            JobRequest::Transcode(_) => JobKind::Transcode,
            JobRequest::Thumbnail(_) => JobKind::Thumbnail,
        }
    }
}

impl From<TranscodeRequest> for JobRequest {
    fn from(request: TranscodeRequest) -> Self {
        JobRequest::Transcode(request)
    }
}

/// Submit, query and cancel jobs of one kind.
#[async_trait]
pub trait Capability: Send + Sync {
    /// Kind served by this capability.
    fn kind(&self) -> JobKind;

    async fn submit(&self, request: JobRequest) -> ApiResult<JobId>;

    async fn status(&self, job_id: &JobId) -> ApiResult<JobStatusView>;

    async fn cancel(&self, job_id: &JobId) -> ApiResult<CancelAck>;
}

/// Thumbnail extraction. Not available yet; every call is rejected.
#[derive(Debug, Default, Clone, Copy)]
pub struct ThumbnailCapability;

#[async_trait]
impl Capability for ThumbnailCapability {
    fn kind(&self) -> JobKind {
        JobKind::Thumbnail
    }

    async fn submit(&self, _request: JobRequest) -> ApiResult<JobId> {
        Err(ApiError::not_implemented("thumbnail jobs"))
    }

    async fn status(&self, _job_id: &JobId) -> ApiResult<JobStatusView> {
        Err(ApiError::not_implemented("thumbnail job status"))
    }

    async fn cancel(&self, _job_id: &JobId) -> ApiResult<CancelAck> {
        Err(ApiError::not_implemented("thumbnail job cancellation"))
    }
}

/// Routes requests to the capability registered for their kind.
///
/// Job ids carry no kind, so `status` and `cancel` go to the transcode
/// capability, the only one that creates jobs.
pub struct Capabilities {
    transcode: Arc<dyn Capability>,
    thumbnail: Arc<dyn Capability>,
}

impl Capabilities {
    pub fn new(transcode: Arc<dyn Capability>) -> Self {
        Self {
            transcode,
            thumbnail: Arc::new(ThumbnailCapability),
        }
    }

    pub fn with_thumbnail(mut self, thumbnail: Arc<dyn Capability>) -> Self {
        self.thumbnail = thumbnail;
        self
    }

    pub fn get(&self, kind: JobKind) -> &Arc<dyn Capability> {
        match kind {
            JobKind::Transcode => &self.transcode,
            JobKind::Thumbnail => &self.thumbnail,
        }
    }

    pub async fn submit(&self, request: JobRequest) -> ApiResult<JobId> {
        self.get(request.kind()).submit(request).await
    }

    pub async fn status(&self, job_id: &JobId) -> ApiResult<JobStatusView> {
        self.transcode.status(job_id).await
    }

    pub async fn cancel(&self, job_id: &JobId) -> ApiResult<CancelAck> {
        self.transcode.cancel(job_id).await
    }
}
