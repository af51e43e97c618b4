//! Job state store for the StreamGate scheduler.
//!
//! This crate provides:
//! - The `JobStore` and `ManifestStore` contracts
//! - An in-process `MemoryStore`
//! - A Redis-backed `RedisStore`

pub mod error;
pub mod memory;
pub mod metrics;
pub mod redis_store;
pub mod traits;

pub use error::{StoreError, StoreResult};
pub use memory::MemoryStore;
pub use redis_store::{RedisStore, RedisStoreConfig};
pub use traits::{JobFilter, JobStore, ManifestStore, DEFAULT_RETAINED_VERSIONS};
