//! Job progress aggregation and event throttling.

use std::time::{Duration, Instant};

use sgate_models::RenditionProfile;

/// Maps per-rendition fractions to overall job progress.
///
/// Renditions are weighted by `expected_duration_secs` when every profile
/// declares a positive value, otherwise uniformly.
#[derive(Debug, Clone)]
pub struct ProgressAggregator {
    weights: Vec<f64>,
}

impl ProgressAggregator {
    pub fn new(profiles: &[RenditionProfile]) -> Self {
        let declared: Option<Vec<f64>> = profiles
            .iter()
            .map(|p| p.expected_duration_secs.filter(|d| *d > 0.0))
            .collect();

        let raw = match declared {
            Some(durations) if !durations.is_empty() => durations,
            _ => vec![1.0; profiles.len()],
        };
        let total: f64 = raw.iter().sum();
        let weights = if total > 0.0 {
            raw.iter().map(|w| w / total).collect()
        } else {
            raw
        };
        Self { weights }
    }

    pub fn weights(&self) -> &[f64] {
        &self.weights
    }

    /// Overall percentage with renditions before `index` complete and
    /// `fraction` of rendition `index` done.
    pub fn overall(&self, index: usize, fraction: f64) -> f64 {
        let done: f64 = self.weights.iter().take(index).sum();
        let current = self.weights.get(index).copied().unwrap_or(0.0);
        ((done + current * fraction.clamp(0.0, 1.0)) * 100.0).clamp(0.0, 100.0)
    }
}

/// Decides whether a progress value is worth an event.
///
/// Emits when the value moved by at least `min_delta` points, or when
/// `min_interval` has passed since the last emission and the value changed.
#[derive(Debug, Clone)]
pub struct ProgressThrottle {
    min_delta: f64,
    min_interval: Duration,
    last_value: Option<f64>,
    last_at: Option<Instant>,
}

impl ProgressThrottle {
    pub fn new(min_delta: f64, min_interval: Duration) -> Self {
        Self {
            min_delta,
            min_interval,
            last_value: None,
            last_at: None,
        }
    }

    /// Returns `true` and records the emission when `value` should be sent.
    pub fn should_emit(&mut self, value: f64, now: Instant) -> bool {
        let emit = match (self.last_value, self.last_at) {
            (Some(last), Some(at)) => {
                let delta = (value - last).abs();
                delta >= self.min_delta
                    || (delta > f64::EPSILON && now.duration_since(at) >= self.min_interval)
            }
            _ => true,
        };
        if emit {
            self.last_value = Some(value);
            self.last_at = Some(now);
        }
        emit
    }

    pub fn last_value(&self) -> Option<f64> {
        self.last_value
    }
}
