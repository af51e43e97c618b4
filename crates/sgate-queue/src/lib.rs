//! Priority job queue for the StreamGate scheduler.
//!
//! This crate provides:
//! - An aging priority queue with backpressure
//! - Clock abstraction for deterministic aging tests
//! - Event bus adapters (tokio broadcast, Redis Pub/Sub)
//! - Startup recovery from the job store

pub mod clock;
pub mod error;
pub mod events;
pub mod queue;
pub mod recovery;

pub use clock::{Clock, ManualClock, SystemClock};
pub use error::{QueueError, QueueResult};
pub use events::{publish_or_log, BroadcastEventBus, EventBus, EventStream, RedisEventBus, EVENTS_CHANNEL};
pub use queue::{PriorityJobQueue, QueueConfig, QueueEntry};
pub use recovery::{JobRecovery, RecoveryReport};
