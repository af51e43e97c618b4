//! Transcode workers for the StreamGate scheduler.
//!
//! This crate provides:
//! - The encoder contract and the per-job transcode worker
//! - Assignment leases that fence off writes from reclaimed workers
//! - The autoscaling worker pool with heartbeat-based failure detection
//! - Progress aggregation and throttling
//! - Structured logging and Prometheus metrics setup

pub mod config;
pub mod encoder;
pub mod error;
pub mod lease;
pub mod logging;
pub mod metrics;
pub mod pool;
pub mod progress;
pub mod retry;
pub mod worker;

#[cfg(test)]
mod testing;

pub use config::{PoolConfig, WorkerConfig};
pub use encoder::{Encoder, EncoderError, ProgressCallback};
pub use error::{WorkerError, WorkerResult};
pub use lease::{Lease, LeaseGuard};
pub use logging::{init_tracing, init_tracing_with, JobLogger, LogFormat};
pub use metrics::init_prometheus;
pub use pool::{PoolMetrics, WorkerPoolManager};
pub use progress::{ProgressAggregator, ProgressThrottle};
pub use retry::{backoff_delay, retry_async, FailureTracker, RetryConfig, RetryResult};
pub use worker::{Assignment, JobOutcome, TranscodeWorker, WorkerContext, WorkerReport, WorkerRuntime};
