//! Scheduler counters fed from the event stream.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;

use sgate_models::{EventPayload, JobEvent};
use sgate_queue::{EventBus, QueueResult};

use crate::views::SchedulerStats;

#[derive(Debug, Default)]
pub(crate) struct StatsCounters {
    submitted: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
    cancelled: AtomicU64,
    retried: AtomicU64,
    manifests: AtomicU64,
}

impl StatsCounters {
    pub(crate) fn record_submitted(&self) {
        self.submitted.fetch_add(1, Ordering::Relaxed);
    }

    /// Counted once manifests are out, not on `JobCompleted`.
    pub(crate) fn record_completed(&self) {
        self.completed.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_manual_retry(&self) {
        self.retried.fetch_add(1, Ordering::Relaxed);
    }

    fn observe(&self, event: &JobEvent) {
        let counter = match &event.payload {
            EventPayload::JobQueued { retry_count, .. } if *retry_count > 0 => &self.retried,
            EventPayload::JobFailed { .. } => &self.failed,
            EventPayload::JobCancelled => &self.cancelled,
            EventPayload::ManifestGenerated { .. } => &self.manifests,
            _ => return,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn snapshot(&self, queue_depth: usize) -> SchedulerStats {
        SchedulerStats {
            submitted: self.submitted.load(Ordering::Relaxed),
            completed: self.completed.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            cancelled: self.cancelled.load(Ordering::Relaxed),
            retried: self.retried.load(Ordering::Relaxed),
            manifests: self.manifests.load(Ordering::Relaxed),
            queue_depth,
        }
    }
}

/// Bus decorator that updates [`StatsCounters`] before forwarding.
pub(crate) struct CountingBus {
    inner: Arc<dyn EventBus>,
    counters: Arc<StatsCounters>,
}

impl CountingBus {
    pub(crate) fn new(inner: Arc<dyn EventBus>, counters: Arc<StatsCounters>) -> Self {
        Self { inner, counters }
    }
}

#[async_trait]
impl EventBus for CountingBus {
    async fn publish(&self, event: &JobEvent) -> QueueResult<()> {
        self.counters.observe(event);
        self.inner.publish(event).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sgate_models::{FailureKind, JobId};
    use sgate_queue::BroadcastEventBus;

    #[tokio::test]
    async fn test_counts_by_kind() {
        let inner = BroadcastEventBus::default();
        let mut rx = inner.subscribe();
        let counters = Arc::new(StatsCounters::default());
        let bus = CountingBus::new(Arc::new(inner), counters.clone());

        let id = JobId::new();
        bus.publish(&JobEvent::queued(id.clone(), 3, 0)).await.unwrap();
        bus.publish(&JobEvent::queued(id.clone(), 3, 1)).await.unwrap();
        bus.publish(&JobEvent::failed(id.clone(), FailureKind::Timeout, "slow", 1))
            .await
            .unwrap();
        bus.publish(&JobEvent::cancelled(id.clone())).await.unwrap();
        counters.record_submitted();

        let stats = counters.snapshot(4);
        assert_eq!(stats.submitted, 1);
        assert_eq!(stats.retried, 1);
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.cancelled, 1);
        assert_eq!(stats.completed, 0);
        assert_eq!(stats.queue_depth, 4);

        assert_eq!(rx.recv().await.unwrap().job_id, id);
    }
}
