//! Bounded-latency wrapper around any counter store
//!
//! A store call that does not answer within the configured timeout is reported
//! as `StoreTimeout`, never left pending. The abandoned call may still have
//! been applied by the backend.

use async_trait::async_trait;
use std::future::Future;
use std::time::Duration;

use super::traits::*;
use crate::error::{Result, RustyGateError};

pub struct TimeoutStore<S> {
    inner: S,
    timeout: Duration,
}

impl<S: CounterStore> TimeoutStore<S> {
    pub fn new(inner: S, timeout: Duration) -> Self {
        Self { inner, timeout }
    }

    pub fn inner(&self) -> &S {
        &self.inner
    }

    async fn bounded<T>(&self, op: &str, fut: impl Future<Output = Result<T>>) -> Result<T> {
        match tokio::time::timeout(self.timeout, fut).await {
            Ok(result) => result,
            Err(_) => Err(RustyGateError::StoreTimeout(format!(
                "{} timed out after {}ms",
                op,
                self.timeout.as_millis()
            ))),
        }
    }
}

#[async_trait]
impl<S: CounterStore> CounterStore for TimeoutStore<S> {
    async fn increment(&self, key: &str) -> Result<i64> {
        self.bounded("increment", self.inner.increment(key)).await
    }

    async fn decrement(&self, key: &str) -> Result<i64> {
        self.bounded("decrement", self.inner.decrement(key)).await
    }

    async fn get(&self, key: &str) -> Result<i64> {
        self.bounded("get", self.inner.get(key)).await
    }

    async fn increment_below(&self, key: &str, limit: i64) -> Result<LimitedIncrement> {
        self.bounded("increment_below", self.inner.increment_below(key, limit))
            .await
    }

    async fn set_add_bounded(&self, key: &str, member: &str, max_members: usize) -> Result<BoundedAdd> {
        self.bounded(
            "set_add_bounded",
            self.inner.set_add_bounded(key, member, max_members),
        )
        .await
    }

    async fn set_remove(&self, key: &str, member: &str) -> Result<bool> {
        self.bounded("set_remove", self.inner.set_remove(key, member))
            .await
    }

    async fn set_size(&self, key: &str) -> Result<usize> {
        self.bounded("set_size", self.inner.set_size(key)).await
    }

    async fn token_bucket(&self, key: &str, request: &BucketRequest) -> Result<BucketOutcome> {
        self.bounded("token_bucket", self.inner.token_bucket(key, request))
            .await
    }

    async fn health_check(&self) -> Result<bool> {
        self.bounded("health_check", self.inner.health_check()).await
    }
}
