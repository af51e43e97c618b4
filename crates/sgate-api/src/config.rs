//! Scheduler configuration.

use std::time::Duration;

use sgate_manifest::ManifestConfig;
use sgate_queue::QueueConfig;
use sgate_worker::{PoolConfig, WorkerConfig};

/// Complete configuration of one scheduler instance.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub queue: QueueConfig,
    pub worker: WorkerConfig,
    pub pool: PoolConfig,
    pub manifest: ManifestConfig,
    /// How long terminal jobs stay queryable before archival
    pub retention: Duration,
    pub retention_sweep_interval: Duration,
    /// Period of the scan for jobs owned by workers outside this process
    pub orphan_scan_interval: Duration,
    /// Retry budget given to new jobs that do not ask for one
    pub default_max_retries: u32,
    /// Grace period for running jobs when the scheduler stops
    pub shutdown_timeout: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            queue: QueueConfig::default(),
            worker: WorkerConfig::default(),
            pool: PoolConfig::default(),
            manifest: ManifestConfig::default(),
            retention: Duration::from_secs(24 * 60 * 60),
            retention_sweep_interval: Duration::from_secs(300),
            orphan_scan_interval: Duration::from_secs(30),
            default_max_retries: 3,
            shutdown_timeout: Duration::from_secs(30),
        }
    }
}

fn env_secs(key: &str, default: Duration) -> Duration {
    std::env::var(key)
        .ok()
        .and_then(|s| s.parse::<u64>().ok())
        .map(Duration::from_secs)
        .unwrap_or(default)
}

impl SchedulerConfig {
    /// Create config from environment variables.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            queue: QueueConfig::from_env(),
            worker: WorkerConfig::from_env(),
            pool: PoolConfig::from_env(),
            manifest: ManifestConfig::from_env(),
            retention: env_secs("SCHEDULER_RETENTION_SECS", defaults.retention),
            retention_sweep_interval: env_secs(
                "SCHEDULER_RETENTION_SWEEP_SECS",
                defaults.retention_sweep_interval,
            ),
            orphan_scan_interval: env_secs("SCHEDULER_ORPHAN_SCAN_SECS", defaults.orphan_scan_interval),
            default_max_retries: std::env::var("SCHEDULER_DEFAULT_MAX_RETRIES")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.default_max_retries),
            shutdown_timeout: env_secs("SCHEDULER_SHUTDOWN_TIMEOUT_SECS", defaults.shutdown_timeout),
        }
        .normalized()
    }

    /// Workers and manifests must agree on partial success.
    pub fn normalized(mut self) -> Self {
        self.worker.partial_success = self.manifest.partial_success;
        self.pool = self.pool.normalized();
        self
    }

    pub fn with_partial_success(mut self, enabled: bool) -> Self {
        self.manifest.partial_success = enabled;
        self.worker.partial_success = enabled;
        self
    }
}
