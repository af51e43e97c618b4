//! Scheduler event bus.
//!
//! Publishing never fails a state transition: callers log and move on.

use std::pin::Pin;

use async_trait::async_trait;
use futures_util::Stream;
use redis::AsyncCommands;
use tokio::sync::broadcast;
use tracing::{debug, warn};

use sgate_models::{JobEvent, JobId};

use crate::error::QueueResult;

/// Firehose channel carrying every event.
pub const EVENTS_CHANNEL: &str = "sgate:events";

/// Stream of decoded events.
pub type EventStream = Pin<Box<dyn Stream<Item = JobEvent> + Send>>;

#[async_trait]
pub trait EventBus: Send + Sync {
    async fn publish(&self, event: &JobEvent) -> QueueResult<()>;
}

/// Publish and log failures instead of propagating them.
pub async fn publish_or_log(bus: &dyn EventBus, event: JobEvent) {
    if let Err(e) = bus.publish(&event).await {
        warn!(
            job_id = %event.job_id,
            kind = event.kind().as_str(),
            "Failed to publish event: {}",
            e
        );
    }
}

/// In-process bus backed by a tokio broadcast channel.
#[derive(Clone)]
pub struct BroadcastEventBus {
    sender: broadcast::Sender<JobEvent>,
}

impl BroadcastEventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<JobEvent> {
        self.sender.subscribe()
    }
}

impl Default for BroadcastEventBus {
    fn default() -> Self {
        Self::new(1024)
    }
}

#[async_trait]
impl EventBus for BroadcastEventBus {
    async fn publish(&self, event: &JobEvent) -> QueueResult<()> {
        // No subscribers is not an error.
        if self.sender.send(event.clone()).is_err() {
            debug!(job_id = %event.job_id, "No event subscribers");
        }
        Ok(())
    }
}

/// Redis Pub/Sub bus: per-job channel plus the firehose.
pub struct RedisEventBus {
    client: redis::Client,
}

impl RedisEventBus {
    pub fn new(redis_url: &str) -> QueueResult<Self> {
        let client = redis::Client::open(redis_url)?;
        Ok(Self { client })
    }

    /// Channel name for a job.
    pub fn channel_name(job_id: &JobId) -> String {
        format!("{}:{}", EVENTS_CHANNEL, job_id)
    }

    /// Subscribe to one job's events.
    pub async fn subscribe(&self, job_id: &JobId) -> QueueResult<EventStream> {
        self.subscribe_channel(Self::channel_name(job_id)).await
    }

    /// Subscribe to every event.
    pub async fn subscribe_all(&self) -> QueueResult<EventStream> {
        self.subscribe_channel(EVENTS_CHANNEL.to_string()).await
    }

    async fn subscribe_channel(&self, channel: String) -> QueueResult<EventStream> {
        use futures_util::StreamExt;

        let mut pubsub = self.client.get_async_pubsub().await?;
        pubsub.subscribe(&channel).await?;

        let stream = pubsub.into_on_message().filter_map(|msg| async move {
            let payload: String = msg.get_payload().ok()?;
            serde_json::from_str(&payload).ok()
        });
        Ok(Box::pin(stream))
    }
}

#[async_trait]
impl EventBus for RedisEventBus {
    async fn publish(&self, event: &JobEvent) -> QueueResult<()> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let payload = serde_json::to_string(event)?;

        conn.publish::<_, _, ()>(Self::channel_name(&event.job_id), &payload)
            .await?;
        conn.publish::<_, _, ()>(EVENTS_CHANNEL, &payload).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_broadcast_delivers_to_subscribers() {
        let bus = BroadcastEventBus::new(16);
        let mut rx = bus.subscribe();
        let job_id = JobId::new();

        bus.publish(&JobEvent::cancelled(job_id.clone())).await.unwrap();

        let ev = rx.recv().await.unwrap();
        assert_eq!(ev.job_id, job_id);
    }

    #[tokio::test]
    async fn test_broadcast_without_subscribers_is_ok() {
        let bus = BroadcastEventBus::default();
        assert!(bus.publish(&JobEvent::cancelled(JobId::new())).await.is_ok());
    }

    #[test]
    fn test_channel_name() {
        let id = JobId::from_string("job-9");
        assert_eq!(RedisEventBus::channel_name(&id), "sgate:events:job-9");
    }
}
