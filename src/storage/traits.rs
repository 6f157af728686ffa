//! Abstract counter store interface for pluggable backends
//!
//! Every method is one atomic operation against the shared state. Components
//! above this layer never read a value and then write a decision back; the
//! decision and the mutation happen inside the store.

use async_trait::async_trait;
use std::sync::Arc;

use crate::error::Result;

/// Outcome of an increment guarded by an upper bound
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LimitedIncrement {
    /// Whether the counter was below the limit and has been incremented
    pub incremented: bool,
    /// Counter value after the operation
    pub value: i64,
}

/// Outcome of adding a member to a capacity-bounded set
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BoundedAdd {
    /// True if the member is in the set after the call
    pub added: bool,
    /// Set size after the operation
    pub size: usize,
}

/// Parameters of one token-bucket consumption
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BucketRequest {
    pub capacity: f64,
    /// Tokens added per second
    pub refill_per_sec: f64,
    pub cost: f64,
    /// Caller's clock, milliseconds since the Unix epoch
    pub now_ms: u64,
    /// Lifetime of the bucket state after this access
    pub ttl_ms: u64,
}

/// Result of one token-bucket consumption
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BucketOutcome {
    pub allowed: bool,
    /// 0 when allowed
    pub retry_after_ms: u64,
    /// Tokens left after the operation
    pub tokens: f64,
}

/// Persisted state of one bucket
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BucketState {
    pub tokens: f64,
    pub last_refill_ms: u64,
}

impl BucketRequest {
    /// Refill and try to consume. `None` means the bucket does not exist yet
    /// and starts full.
    ///
    /// Backends that run the computation themselves (Lua on Redis) must keep
    /// the same arithmetic.
    ///
    /// `cost` must not exceed `capacity`: such a request is never allowed and
    /// its `retry_after_ms` is meaningless. `TokenBucketLimiter` refuses it
    /// before calling the store.
    pub fn apply(&self, state: Option<BucketState>) -> (BucketState, BucketOutcome) {
        let (tokens, last_refill_ms) = match state {
            Some(s) => (s.tokens, s.last_refill_ms),
            None => (self.capacity, self.now_ms),
        };

        // Clocks across processes can disagree; never refill negatively
        let elapsed_ms = self.now_ms.saturating_sub(last_refill_ms);
        let refilled = (tokens + elapsed_ms as f64 / 1000.0 * self.refill_per_sec)
            .min(self.capacity)
            .max(0.0);
        let last_refill_ms = last_refill_ms.max(self.now_ms);

        if refilled >= self.cost {
            let tokens = refilled - self.cost;
            (
                BucketState { tokens, last_refill_ms },
                BucketOutcome {
                    allowed: true,
                    retry_after_ms: 0,
                    tokens,
                },
            )
        } else {
            let retry_after_ms =
                ((self.cost - refilled) / self.refill_per_sec * 1000.0).ceil() as u64;
            (
                BucketState {
                    tokens: refilled,
                    last_refill_ms,
                },
                BucketOutcome {
                    allowed: false,
                    retry_after_ms,
                    tokens: refilled,
                },
            )
        }
    }
}

/// Shared, atomic key-value primitives used by every enforcement component
#[async_trait]
pub trait CounterStore: Send + Sync {
    /// Increment a counter, returning the new value
    async fn increment(&self, key: &str) -> Result<i64>;

    /// Decrement a counter, floored at 0, returning the new value
    async fn decrement(&self, key: &str) -> Result<i64>;

    /// Current counter value, 0 if absent
    async fn get(&self, key: &str) -> Result<i64>;

    /// Increment only if the current value is strictly below `limit`
    async fn increment_below(&self, key: &str, limit: i64) -> Result<LimitedIncrement>;

    /// Add `member` to the set at `key` only if it holds fewer than
    /// `max_members` entries. Re-adding an existing member succeeds without
    /// changing the size.
    async fn set_add_bounded(&self, key: &str, member: &str, max_members: usize) -> Result<BoundedAdd>;

    /// Remove a member; returns whether it was present
    async fn set_remove(&self, key: &str, member: &str) -> Result<bool>;

    /// Number of members in the set, 0 if absent
    async fn set_size(&self, key: &str) -> Result<usize>;

    /// Refill and consume from the bucket at `key` in one step
    async fn token_bucket(&self, key: &str, request: &BucketRequest) -> Result<BucketOutcome>;

    /// Health check for the store backend
    async fn health_check(&self) -> Result<bool>;
}

#[async_trait]
impl<T: CounterStore + ?Sized> CounterStore for Arc<T> {
    async fn increment(&self, key: &str) -> Result<i64> {
        (**self).increment(key).await
    }

    async fn decrement(&self, key: &str) -> Result<i64> {
        (**self).decrement(key).await
    }

    async fn get(&self, key: &str) -> Result<i64> {
        (**self).get(key).await
    }

    async fn increment_below(&self, key: &str, limit: i64) -> Result<LimitedIncrement> {
        (**self).increment_below(key, limit).await
    }

    async fn set_add_bounded(&self, key: &str, member: &str, max_members: usize) -> Result<BoundedAdd> {
        (**self).set_add_bounded(key, member, max_members).await
    }

    async fn set_remove(&self, key: &str, member: &str) -> Result<bool> {
        (**self).set_remove(key, member).await
    }

    async fn set_size(&self, key: &str) -> Result<usize> {
        (**self).set_size(key).await
    }

    async fn token_bucket(&self, key: &str, request: &BucketRequest) -> Result<BucketOutcome> {
        (**self).token_bucket(key, request).await
    }

    async fn health_check(&self) -> Result<bool> {
        (**self).health_check().await
    }
}
