//! Tracing setup and per-attempt job logging.
//!
//! Every line a worker writes about a job goes through [`JobLogger`], so the
//! job id, the worker and the attempt number are always present as fields
//! and log pipelines can filter on them without parsing messages.

use std::fmt::Display;
use std::time::Duration;

use tracing::{error, info, warn, Span};
use tracing_subscriber::util::TryInitError;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use sgate_models::{FailureKind, JobError, JobId, WorkerId};

const DEFAULT_FILTER: &str = "sgate=info,warn";

/// Output format of the global subscriber.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

impl LogFormat {
    /// Reads `LOG_FORMAT`; anything other than `json` means text.
    pub fn from_env() -> Self {
        Self::parse(std::env::var("LOG_FORMAT").ok().as_deref())
    }

    fn parse(value: Option<&str>) -> Self {
        match value {
            Some(v) if v.trim().eq_ignore_ascii_case("json") => LogFormat::Json,
            _ => LogFormat::Text,
        }
    }
}

/// Install the global subscriber in the format named by `LOG_FORMAT`.
/// `RUST_LOG` overrides the default filter.
pub fn init_tracing() -> Result<(), TryInitError> {
    init_tracing_with(LogFormat::from_env())
}

pub fn init_tracing_with(format: LogFormat) -> Result<(), TryInitError> {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));

    match format {
        LogFormat::Json => tracing_subscriber::registry()
            .with(fmt::layer().json().with_current_span(true))
            .with(env_filter)
            .try_init(),
        LogFormat::Text => tracing_subscriber::registry()
            .with(fmt::layer().with_target(true).with_thread_ids(false))
            .with(env_filter)
            .try_init(),
    }
}

/// Logger bound to one attempt of one job on one worker.
#[derive(Debug, Clone)]
pub struct JobLogger {
    job_id: JobId,
    worker_id: WorkerId,
    attempt: u32,
}

impl JobLogger {
    /// `attempt` is 1-based: a job that was never retried runs attempt 1.
    pub fn new(job_id: &JobId, worker_id: &WorkerId, attempt: u32) -> Self {
        Self {
            job_id: job_id.clone(),
            worker_id: worker_id.clone(),
            attempt,
        }
    }

    pub fn job_id(&self) -> &JobId {
        &self.job_id
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn started(&self, renditions: usize) {
        info!(
            job_id = %self.job_id,
            worker_id = %self.worker_id,
            attempt = self.attempt,
            renditions,
            "Attempt started"
        );
    }

    pub fn rendition_failed(&self, rendition: &str, error: &JobError) {
        warn!(
            job_id = %self.job_id,
            worker_id = %self.worker_id,
            attempt = self.attempt,
            rendition,
            kind = %error.kind,
            "Rendition failed: {}", error.message
        );
    }

    /// A state write that the attempt depends on could not be saved.
    /// `stage` names the transition, e.g. `start` or `completion`.
    pub fn write_failed(&self, stage: &'static str, error: &dyn Display) {
        error!(
            job_id = %self.job_id,
            worker_id = %self.worker_id,
            attempt = self.attempt,
            stage,
            "Could not record {}: {}", stage, error
        );
    }

    /// Progress snapshots are best effort; losing one is only a warning.
    pub fn progress_write_failed(&self, error: &dyn Display) {
        warn!(
            job_id = %self.job_id,
            worker_id = %self.worker_id,
            attempt = self.attempt,
            "Progress write failed: {}", error
        );
    }

    pub fn requeue_failed(&self, error: &dyn Display) {
        error!(
            job_id = %self.job_id,
            worker_id = %self.worker_id,
            attempt = self.attempt,
            "Requeue failed, leaving the job to recovery: {}", error
        );
    }

    pub fn lease_lost(&self) {
        warn!(
            job_id = %self.job_id,
            worker_id = %self.worker_id,
            attempt = self.attempt,
            "Lease revoked, abandoning attempt"
        );
    }

    pub fn completed(&self, renditions: u32, elapsed: Duration) {
        info!(
            job_id = %self.job_id,
            worker_id = %self.worker_id,
            attempt = self.attempt,
            renditions,
            elapsed_ms = elapsed.as_millis() as u64,
            "Job completed"
        );
    }

    pub fn cancelled(&self) {
        info!(
            job_id = %self.job_id,
            worker_id = %self.worker_id,
            attempt = self.attempt,
            "Job cancelled"
        );
    }

    pub fn retry_scheduled(&self, kind: FailureKind, retry_count: u32, delay: Duration) {
        warn!(
            job_id = %self.job_id,
            worker_id = %self.worker_id,
            attempt = self.attempt,
            kind = %kind,
            retry_count,
            delay_ms = delay.as_millis() as u64,
            "Attempt failed, retry scheduled"
        );
    }

    pub fn failed(&self, kind: FailureKind, message: &str) {
        error!(
            job_id = %self.job_id,
            worker_id = %self.worker_id,
            attempt = self.attempt,
            kind = %kind,
            "Job failed: {}", message
        );
    }

    /// Span for instrumenting the whole attempt, so encoder and store logs
    /// emitted inside it inherit the job context.
    pub fn create_span(&self) -> Span {
        tracing::info_span!(
            "attempt",
            job_id = %self.job_id,
            worker_id = %self.worker_id,
            attempt = self.attempt
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_format_parsing() {
        assert_eq!(LogFormat::parse(None), LogFormat::Text);
        assert_eq!(LogFormat::parse(Some("JSON")), LogFormat::Json);
        assert_eq!(LogFormat::parse(Some(" json ")), LogFormat::Json);
        assert_eq!(LogFormat::parse(Some("pretty")), LogFormat::Text);
    }

    #[test]
    fn test_logger_keeps_attempt_context() {
        let job_id = JobId::new();
        let worker_id = WorkerId::from_string("worker-0");
        let logger = JobLogger::new(&job_id, &worker_id, 2);

        assert_eq!(logger.job_id(), &job_id);
        assert_eq!(logger.attempt(), 2);
        // Without a subscriber the span is disabled, but building it must not panic.
        let _span = logger.create_span();
    }

    #[test]
    fn test_second_init_returns_error() {
        let _ = init_tracing_with(LogFormat::Text);
        assert!(init_tracing_with(LogFormat::Json).is_err());
    }
}
