//! In-memory counter store for single-process deployments and testing
//!
//! Each primitive takes the write lock of the map it touches for its whole
//! duration, so check and mutation are indivisible within this process.

use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;

use super::traits::*;
use crate::core::clock::{Clock, SystemClock};
use crate::error::{Result, RustyGateError};

#[derive(Debug, Clone, Copy)]
struct BucketEntry {
    state: BucketState,
    expires_at_ms: u64,
}

/// In-memory implementation of [`CounterStore`]
pub struct InMemoryCounterStore {
    counters: RwLock<HashMap<String, i64>>,
    sets: RwLock<HashMap<String, HashSet<String>>>,
    buckets: RwLock<HashMap<String, BucketEntry>>,
    /// When set every call fails with `StoreUnavailable`
    offline: AtomicBool,
    clock: Arc<dyn Clock>,
}

impl InMemoryCounterStore {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock::new()))
    }

    /// Use a specific clock for bucket expiry sweeps
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            counters: RwLock::new(HashMap::new()),
            sets: RwLock::new(HashMap::new()),
            buckets: RwLock::new(HashMap::new()),
            offline: AtomicBool::new(false),
            clock,
        }
    }

    /// Make every subsequent call fail as if the store were unreachable.
    /// Used by outage drills and tests.
    pub fn simulate_outage(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
        if offline {
            log::warn!("In-memory counter store switched to simulated outage");
        }
    }

    fn ensure_online(&self) -> Result<()> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(RustyGateError::StoreUnavailable(
                "simulated outage".to_string(),
            ));
        }
        Ok(())
    }

    /// Drop idle buckets whose TTL has passed, returning how many were removed
    pub async fn purge_expired(&self) -> usize {
        let now_ms = self.clock.now_millis();
        let mut buckets = self.buckets.write().await;
        let before = buckets.len();
        buckets.retain(|_, entry| entry.expires_at_ms > now_ms);
        before - buckets.len()
    }

    /// Number of live token buckets (expired ones may linger until purged)
    pub async fn bucket_count(&self) -> usize {
        self.buckets.read().await.len()
    }

    /// Start a periodic sweep of expired buckets
    pub fn start_cleanup_task(self: Arc<Self>, every: Duration) {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(every);
            loop {
                interval.tick().await;
                let removed = self.purge_expired().await;
                if removed > 0 {
                    log::debug!("Purged {} idle token buckets", removed);
                }
            }
        });
    }
}

impl Default for InMemoryCounterStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CounterStore for InMemoryCounterStore {
    async fn increment(&self, key: &str) -> Result<i64> {
        self.ensure_online()?;
        let mut counters = self.counters.write().await;
        let value = counters.entry(key.to_string()).or_insert(0);
        *value += 1;
        Ok(*value)
    }

    async fn decrement(&self, key: &str) -> Result<i64> {
        self.ensure_online()?;
        let mut counters = self.counters.write().await;
        let value = match counters.get_mut(key) {
            Some(count) => {
                *count = (*count - 1).max(0);
                *count
            }
            None => 0,
        };
        if value == 0 {
            counters.remove(key);
        }
        Ok(value)
    }

    async fn get(&self, key: &str) -> Result<i64> {
        self.ensure_online()?;
        Ok(*self.counters.read().await.get(key).unwrap_or(&0))
    }

    async fn increment_below(&self, key: &str, limit: i64) -> Result<LimitedIncrement> {
        self.ensure_online()?;
        let mut counters = self.counters.write().await;
        let current = *counters.get(key).unwrap_or(&0);
        if current < limit {
            counters.insert(key.to_string(), current + 1);
            Ok(LimitedIncrement {
                incremented: true,
                value: current + 1,
            })
        } else {
            Ok(LimitedIncrement {
                incremented: false,
                value: current,
            })
        }
    }

    async fn set_add_bounded(&self, key: &str, member: &str, max_members: usize) -> Result<BoundedAdd> {
        self.ensure_online()?;
        let mut sets = self.sets.write().await;
        let members = sets.entry(key.to_string()).or_default();

        if members.contains(member) {
            return Ok(BoundedAdd {
                added: true,
                size: members.len(),
            });
        }

        if members.len() < max_members {
            members.insert(member.to_string());
            Ok(BoundedAdd {
                added: true,
                size: members.len(),
            })
        } else {
            Ok(BoundedAdd {
                added: false,
                size: members.len(),
            })
        }
    }

    async fn set_remove(&self, key: &str, member: &str) -> Result<bool> {
        self.ensure_online()?;
        let mut sets = self.sets.write().await;
        let removed = match sets.get_mut(key) {
            Some(members) => {
                let removed = members.remove(member);
                if members.is_empty() {
                    sets.remove(key);
                }
                removed
            }
            None => false,
        };
        Ok(removed)
    }

    async fn set_size(&self, key: &str) -> Result<usize> {
        self.ensure_online()?;
        Ok(self.sets.read().await.get(key).map_or(0, HashSet::len))
    }

    async fn token_bucket(&self, key: &str, request: &BucketRequest) -> Result<BucketOutcome> {
        self.ensure_online()?;
        let mut buckets = self.buckets.write().await;

        let existing = buckets
            .get(key)
            .filter(|entry| entry.expires_at_ms > request.now_ms)
            .map(|entry| entry.state);

        let (state, outcome) = request.apply(existing);
        buckets.insert(
            key.to_string(),
            BucketEntry {
                state,
                expires_at_ms: request.now_ms.saturating_add(request.ttl_ms),
            },
        );

        Ok(outcome)
    }

    async fn health_check(&self) -> Result<bool> {
        Ok(!self.offline.load(Ordering::SeqCst))
    }
}
