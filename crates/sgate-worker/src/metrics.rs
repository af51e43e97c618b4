//! Scheduler metrics.
//!
//! Recorded through the `metrics` facade; [`init_prometheus`] installs a
//! Prometheus recorder whose handle renders the scrape body.

use std::time::Duration;

use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

use sgate_models::FailureKind;

use crate::error::{WorkerError, WorkerResult};

/// Metric name constants for consistency.
pub mod names {
    // Job lifecycle
    pub const JOBS_SUBMITTED_TOTAL: &str = "sgate_jobs_submitted_total";
    pub const JOBS_STARTED_TOTAL: &str = "sgate_jobs_started_total";
    pub const JOBS_COMPLETED_TOTAL: &str = "sgate_jobs_completed_total";
    pub const JOBS_FAILED_TOTAL: &str = "sgate_jobs_failed_total";
    pub const JOBS_RETRIED_TOTAL: &str = "sgate_jobs_retried_total";
    pub const JOBS_CANCELLED_TOTAL: &str = "sgate_jobs_cancelled_total";
    pub const JOB_DURATION_SECONDS: &str = "sgate_job_duration_seconds";
    pub const RENDITION_DURATION_SECONDS: &str = "sgate_rendition_duration_seconds";

    // Pool
    pub const QUEUE_DEPTH: &str = "sgate_queue_depth";
    pub const WORKERS: &str = "sgate_workers";
    pub const WORKERS_DEAD_TOTAL: &str = "sgate_workers_dead_total";
    pub const SCALE_EVENTS_TOTAL: &str = "sgate_scale_events_total";

    // Manifests
    pub const MANIFESTS_PUBLISHED_TOTAL: &str = "sgate_manifests_published_total";
    pub const MANIFEST_FAILURES_TOTAL: &str = "sgate_manifest_failures_total";
}

/// Install the Prometheus recorder.
pub fn init_prometheus() -> WorkerResult<PrometheusHandle> {
    PrometheusBuilder::new()
        .install_recorder()
        .map_err(|e| WorkerError::metrics(e.to_string()))
}

pub fn record_job_submitted(priority: u8) {
    counter!(names::JOBS_SUBMITTED_TOTAL, "priority" => priority.to_string()).increment(1);
}

pub fn record_job_started() {
    counter!(names::JOBS_STARTED_TOTAL).increment(1);
}

pub fn record_job_completed(duration: Duration) {
    counter!(names::JOBS_COMPLETED_TOTAL).increment(1);
    histogram!(names::JOB_DURATION_SECONDS).record(duration.as_secs_f64());
}

pub fn record_job_failed(kind: FailureKind) {
    counter!(names::JOBS_FAILED_TOTAL, "kind" => kind.as_str()).increment(1);
}

pub fn record_job_retried(kind: FailureKind) {
    counter!(names::JOBS_RETRIED_TOTAL, "kind" => kind.as_str()).increment(1);
}

pub fn record_job_cancelled() {
    counter!(names::JOBS_CANCELLED_TOTAL).increment(1);
}

pub fn record_rendition(profile: &str, duration: Duration) {
    histogram!(names::RENDITION_DURATION_SECONDS, "profile" => profile.to_string())
        .record(duration.as_secs_f64());
}

pub fn set_queue_depth(depth: usize) {
    gauge!(names::QUEUE_DEPTH).set(depth as f64);
}

pub fn set_workers(state: &'static str, count: usize) {
    gauge!(names::WORKERS, "state" => state).set(count as f64);
}

pub fn record_worker_dead() {
    counter!(names::WORKERS_DEAD_TOTAL).increment(1);
}

pub fn record_manifest_published(manifest_type: &'static str, partial: bool) {
    counter!(
        names::MANIFESTS_PUBLISHED_TOTAL,
        "type" => manifest_type,
        "partial" => if partial { "true" } else { "false" }
    )
    .increment(1);
}

pub fn record_manifest_failure() {
    counter!(names::MANIFEST_FAILURES_TOTAL).increment(1);
}

pub fn record_scale(direction: &'static str) {
    counter!(names::SCALE_EVENTS_TOTAL, "direction" => direction).increment(1);
}
