//! Shared counter store backends

pub mod memory;
#[cfg(feature = "redis-store")]
pub mod redis_store;
pub mod timeout;
pub mod traits;

pub use memory::InMemoryCounterStore;
#[cfg(feature = "redis-store")]
pub use redis_store::{RedisCounterStore, RedisStoreConfig};
pub use timeout::TimeoutStore;
pub use traits::{BoundedAdd, BucketOutcome, BucketRequest, BucketState, CounterStore, LimitedIncrement};
