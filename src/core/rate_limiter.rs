//! Token bucket limiter for in-flight messages

use std::sync::Arc;

use crate::config::EnforcementConfig;
use crate::constants::{BUCKET_TTL_MARGIN_MS, NS_BUCKET};
use crate::core::clock::Clock;
use crate::core::identity::Identity;
use crate::error::{Result, RustyGateError};
use crate::storage::traits::{BucketRequest, CounterStore};

/// Burst capacity and refill rate of one bucket
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BucketLimits {
    pub capacity: u32,
    pub refill_per_sec: f64,
}

impl BucketLimits {
    pub fn new(capacity: u32, refill_per_sec: f64) -> Self {
        Self {
            capacity,
            refill_per_sec,
        }
    }

    /// Idle lifetime: one full refill plus a margin
    pub fn ttl_ms(&self) -> u64 {
        let refill_ms = (self.capacity as f64 / self.refill_per_sec * 1000.0).ceil() as u64;
        refill_ms.saturating_add(BUCKET_TTL_MARGIN_MS)
    }
}

impl From<&EnforcementConfig> for BucketLimits {
    fn from(config: &EnforcementConfig) -> Self {
        Self::new(config.msg_burst, config.msg_rps)
    }
}

/// Outcome of one consumption attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateDecision {
    pub allowed: bool,
    /// 0 when allowed
    pub retry_after_ms: u64,
}

/// Per-identity message-rate enforcement on top of the shared store.
///
/// Holds no state of its own; two limiters sharing a store see the same buckets.
#[derive(Clone)]
pub struct TokenBucketLimiter {
    store: Arc<dyn CounterStore>,
    clock: Arc<dyn Clock>,
}

impl TokenBucketLimiter {
    pub fn new(store: Arc<dyn CounterStore>, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    /// Refill the identity's bucket and try to take `cost` tokens.
    ///
    /// The whole read-modify-write is one store call, so concurrent checks
    /// for the same identity can never both spend the last token. A `cost`
    /// above the bucket capacity can never be paid and is refused with
    /// `ConfigInvalid` before the store is touched.
    pub async fn check_and_consume(
        &self,
        identity: &Identity,
        cost: u32,
        limits: BucketLimits,
    ) -> Result<RateDecision> {
        if cost > limits.capacity {
            return Err(RustyGateError::ConfigInvalid(format!(
                "message cost {} exceeds bucket capacity {}",
                cost, limits.capacity
            )));
        }

        let key = format!("{}:{}", NS_BUCKET, identity.bucket_key());
        let request = BucketRequest {
            capacity: limits.capacity as f64,
            refill_per_sec: limits.refill_per_sec,
            cost: cost as f64,
            now_ms: self.clock.now_millis(),
            ttl_ms: limits.ttl_ms(),
        };

        let outcome = self.store.token_bucket(&key, &request).await?;
        if !outcome.allowed {
            log::debug!(
                "Rate limit hit for {}: retry in {}ms",
                identity,
                outcome.retry_after_ms
            );
        }

        Ok(RateDecision {
            allowed: outcome.allowed,
            retry_after_ms: outcome.retry_after_ms,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::clock::MockClock;
    use crate::storage::memory::InMemoryCounterStore;
    use std::time::Duration;

    fn limiter() -> (TokenBucketLimiter, MockClock) {
        let clock = MockClock::new(1_700_000_000_000);
        let limiter = TokenBucketLimiter::new(
            Arc::new(InMemoryCounterStore::new()),
            Arc::new(clock.clone()),
        );
        (limiter, clock)
    }

    #[tokio::test]
    async fn test_burst_then_retry_hint_then_refill() {
        let (limiter, clock) = limiter();
        let user = Identity::user(1, "10.0.0.1").unwrap();
        let limits = BucketLimits::new(3, 2.0);

        for _ in 0..3 {
            assert!(limiter.check_and_consume(&user, 1, limits).await.unwrap().allowed);
        }

        let fourth = limiter.check_and_consume(&user, 1, limits).await.unwrap();
        assert!(!fourth.allowed);
        assert_eq!(fourth.retry_after_ms, 500);

        clock.advance(Duration::from_millis(fourth.retry_after_ms));
        let retried = limiter.check_and_consume(&user, 1, limits).await.unwrap();
        assert!(retried.allowed);
        assert_eq!(retried.retry_after_ms, 0);
    }

    #[tokio::test]
    async fn test_identities_have_separate_buckets() {
        let (limiter, _clock) = limiter();
        let a = Identity::user(1, "10.0.0.1").unwrap();
        let b = Identity::user(2, "10.0.0.1").unwrap();
        let limits = BucketLimits::new(1, 1.0);

        assert!(limiter.check_and_consume(&a, 1, limits).await.unwrap().allowed);
        assert!(!limiter.check_and_consume(&a, 1, limits).await.unwrap().allowed);
        assert!(limiter.check_and_consume(&b, 1, limits).await.unwrap().allowed);
    }

    #[tokio::test]
    async fn test_cost_larger_than_available_is_rejected() {
        let (limiter, _clock) = limiter();
        let user = Identity::anonymous("10.0.0.9").unwrap();
        let limits = BucketLimits::new(4, 1.0);

        assert!(limiter.check_and_consume(&user, 3, limits).await.unwrap().allowed);
        let decision = limiter.check_and_consume(&user, 3, limits).await.unwrap();
        assert!(!decision.allowed);
        assert_eq!(decision.retry_after_ms, 2_000);
    }

    #[tokio::test]
    async fn test_concurrent_consumers_share_one_burst() {
        let (limiter, _clock) = limiter();
        let user = Identity::user(5, "10.0.0.5").unwrap();
        let limits = BucketLimits::new(3, 0.5);

        let mut handles = Vec::new();
        for _ in 0..20 {
            let limiter = limiter.clone();
            let user = user.clone();
            handles.push(tokio::spawn(async move {
                limiter.check_and_consume(&user, 1, limits).await.unwrap().allowed
            }));
        }

        let mut allowed = 0;
        for handle in handles {
            if handle.await.unwrap() {
                allowed += 1;
            }
        }
        assert_eq!(allowed, 3);
    }

    #[test]
    fn test_ttl_covers_a_full_refill() {
        let limits = BucketLimits::new(3, 2.0);
        assert_eq!(limits.ttl_ms(), 1_500 + BUCKET_TTL_MARGIN_MS);
    }

    #[tokio::test]
    async fn test_cost_above_capacity_is_refused() {
        let (limiter, _clock) = limiter();
        let identity = Identity::user(3, "10.0.0.3").unwrap();
        let limits = BucketLimits {
            capacity: 4,
            refill_per_sec: 1.0,
        };

        let err = limiter
            .check_and_consume(&identity, 5, limits)
            .await
            .unwrap_err();
        assert!(matches!(err, RustyGateError::ConfigInvalid(_)));

        // The bucket was never touched
        let decision = limiter.check_and_consume(&identity, 4, limits).await.unwrap();
        assert!(decision.allowed);
    }
}
