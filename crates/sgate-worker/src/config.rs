//! Worker and pool configuration.

use std::time::Duration;

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|s| s.parse().ok())
}

fn env_millis(key: &str, default: Duration) -> Duration {
    env_parse::<u64>(key)
        .map(Duration::from_millis)
        .unwrap_or(default)
}

/// Per-worker configuration.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Interval between worker heartbeats
    pub heartbeat_interval: Duration,
    /// Consecutive missed heartbeats before a worker is declared dead
    pub missed_heartbeats: u32,
    /// Retry backoff base (doubles per retry)
    pub retry_base_backoff: Duration,
    /// Retry backoff ceiling
    pub max_backoff: Duration,
    /// Job timeout = multiplier x sum of expected profile durations
    pub timeout_multiplier: f64,
    /// Expected duration assumed for profiles that declare none
    pub default_profile_duration: Duration,
    /// Minimum progress change (percentage points) that triggers an event
    pub progress_min_delta: f64,
    /// Maximum silence between progress events while progress changes
    pub progress_min_interval: Duration,
    /// Keep encoding other renditions when one fails
    pub partial_success: bool,
    /// Attempts for state writes before giving up
    pub store_write_retries: u32,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(5),
            missed_heartbeats: 3,
            retry_base_backoff: Duration::from_secs(2),
            max_backoff: Duration::from_secs(60),
            timeout_multiplier: 4.0,
            default_profile_duration: Duration::from_secs(600),
            progress_min_delta: 1.0,
            progress_min_interval: Duration::from_secs(2),
            partial_success: false,
            store_write_retries: 3,
        }
    }
}

impl WorkerConfig {
    /// Create config from environment variables.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            heartbeat_interval: env_millis("WORKER_HEARTBEAT_INTERVAL_MS", defaults.heartbeat_interval),
            missed_heartbeats: env_parse("WORKER_MISSED_HEARTBEATS")
                .filter(|n: &u32| *n > 0)
                .unwrap_or(defaults.missed_heartbeats),
            retry_base_backoff: env_millis("WORKER_RETRY_BASE_MS", defaults.retry_base_backoff),
            max_backoff: env_millis("WORKER_MAX_BACKOFF_MS", defaults.max_backoff),
            timeout_multiplier: env_parse("WORKER_TIMEOUT_MULTIPLIER")
                .filter(|m: &f64| *m > 0.0)
                .unwrap_or(defaults.timeout_multiplier),
            default_profile_duration: Duration::from_secs(
                env_parse("WORKER_DEFAULT_PROFILE_DURATION_SECS").unwrap_or(600),
            ),
            progress_min_delta: env_parse("WORKER_PROGRESS_MIN_DELTA")
                .unwrap_or(defaults.progress_min_delta),
            progress_min_interval: env_millis("WORKER_PROGRESS_MIN_INTERVAL_MS", defaults.progress_min_interval),
            partial_success: env_parse("MANIFEST_PARTIAL_SUCCESS").unwrap_or(false),
            store_write_retries: env_parse("WORKER_STORE_WRITE_RETRIES")
                .unwrap_or(defaults.store_write_retries),
        }
    }

    /// How long a worker may stay silent before it is declared dead.
    pub fn heartbeat_timeout(&self) -> Duration {
        self.heartbeat_interval * self.missed_heartbeats.max(1)
    }
}

/// Pool sizing and autoscaling configuration.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub min_workers: usize,
    pub max_workers: usize,
    /// Autoscaler sampling period
    pub scale_interval: Duration,
    /// Scale up while `queue_depth > threshold * live_workers`
    pub scale_up_threshold: f64,
    /// Scale down while mean utilization is below this ratio
    pub scale_down_threshold: f64,
    /// Consecutive samples required before scaling up; also the averaging window
    pub scale_sustain_samples: usize,
    /// Grace period for a draining worker's current job
    pub drain_timeout: Duration,
    /// Dispatcher wait per dequeue attempt
    pub dispatch_poll_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            min_workers: 2,
            max_workers: 10,
            scale_interval: Duration::from_secs(5),
            scale_up_threshold: 2.0,
            scale_down_threshold: 0.25,
            scale_sustain_samples: 3,
            drain_timeout: Duration::from_secs(60),
            dispatch_poll_timeout: Duration::from_millis(500),
        }
    }
}

impl PoolConfig {
    /// Create config from environment variables.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            min_workers: env_parse("WORKER_MIN_WORKERS").unwrap_or(defaults.min_workers),
            max_workers: env_parse("WORKER_MAX_WORKERS").unwrap_or(defaults.max_workers),
            scale_interval: env_millis("WORKER_SCALE_INTERVAL_MS", defaults.scale_interval),
            scale_up_threshold: env_parse("WORKER_SCALE_UP_THRESHOLD")
                .filter(|t: &f64| *t > 0.0)
                .unwrap_or(defaults.scale_up_threshold),
            scale_down_threshold: env_parse("WORKER_SCALE_DOWN_THRESHOLD")
                .unwrap_or(defaults.scale_down_threshold),
            scale_sustain_samples: env_parse("WORKER_SCALE_SUSTAIN_SAMPLES")
                .unwrap_or(defaults.scale_sustain_samples),
            drain_timeout: env_millis("WORKER_DRAIN_TIMEOUT_MS", defaults.drain_timeout),
            dispatch_poll_timeout: env_millis("QUEUE_POLL_TIMEOUT_MS", defaults.dispatch_poll_timeout),
        }
        .normalized()
    }

    /// Enforce `1 <= min <= max` and a non-empty sample window.
    pub fn normalized(mut self) -> Self {
        self.max_workers = self.max_workers.max(1);
        self.min_workers = self.min_workers.min(self.max_workers);
        self.scale_sustain_samples = self.scale_sustain_samples.max(1);
        self
    }
}
