//! Admission gate: decides whether a new connection may proceed
//!
//! Checks run in order and stop at the first failure:
//! 1. per-user connection count (skipped for anonymous identities)
//! 2. per-IP connection count
//! 3. room capacity
//!
//! Each check is an atomic increment-if-below or add-if-under-capacity in the
//! store, so deciding and recording happen together. When a later check fails
//! the slots taken by earlier checks are handed back before returning.

use serde::Serialize;
use std::fmt;
use std::sync::Arc;

use crate::config::EnforcementConfig;
use crate::constants::NS_CONN;
use crate::core::identity::Identity;
use crate::core::room::RoomRegistry;
use crate::error::{Result, RustyGateError};
use crate::storage::traits::CounterStore;

/// Why a connection or message was refused
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectReason {
    UserConnectionLimit,
    IpConnectionLimit,
    RoomFull,
    RateLimited,
    PayloadTooLarge,
    /// Fail-closed rejection during a store outage
    StoreUnavailable,
}

impl RejectReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::UserConnectionLimit => "user_connection_limit",
            Self::IpConnectionLimit => "ip_connection_limit",
            Self::RoomFull => "room_full",
            Self::RateLimited => "rate_limited",
            Self::PayloadTooLarge => "payload_too_large",
            Self::StoreUnavailable => "store_unavailable",
        }
    }
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Transient answer of the gate, never persisted
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AdmissionDecision {
    pub admitted: bool,
    pub reason: Option<RejectReason>,
    pub retry_after_ms: Option<u64>,
}

impl AdmissionDecision {
    pub fn admit() -> Self {
        Self {
            admitted: true,
            reason: None,
            retry_after_ms: None,
        }
    }

    pub fn reject(reason: RejectReason) -> Self {
        Self {
            admitted: false,
            reason: Some(reason),
            retry_after_ms: None,
        }
    }
}

/// Slots a connection holds in the shared store
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AcquiredResources {
    pub user_slot: bool,
    pub ip_slot: bool,
    pub room_slot: bool,
}

impl AcquiredResources {
    const USER: u8 = 0b001;
    const IP: u8 = 0b010;
    const ROOM: u8 = 0b100;

    pub fn none() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        !self.user_slot && !self.ip_slot && !self.room_slot
    }

    pub(crate) fn to_bits(self) -> u8 {
        let mut bits = 0;
        if self.user_slot {
            bits |= Self::USER;
        }
        if self.ip_slot {
            bits |= Self::IP;
        }
        if self.room_slot {
            bits |= Self::ROOM;
        }
        bits
    }

    pub(crate) fn from_bits(bits: u8) -> Self {
        Self {
            user_slot: bits & Self::USER != 0,
            ip_slot: bits & Self::IP != 0,
            room_slot: bits & Self::ROOM != 0,
        }
    }
}

/// Decision plus the resources it already recorded
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Admission {
    pub decision: AdmissionDecision,
    pub acquired: AcquiredResources,
}

/// A store error together with the slots the store may still hold because of it.
///
/// `outstanding` covers slots whose release failed and acquisitions that timed
/// out, since a timed-out call may have been applied. The caller owns handing
/// them back once the store recovers.
#[derive(Debug)]
pub struct StoreFailure {
    pub error: RustyGateError,
    pub outstanding: AcquiredResources,
}

impl From<StoreFailure> for RustyGateError {
    fn from(failure: StoreFailure) -> Self {
        failure.error
    }
}

impl fmt::Display for StoreFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (outstanding: {:?})", self.error, self.outstanding)
    }
}

pub type GateResult<T> = std::result::Result<T, StoreFailure>;

/// Add the slot a failed call was taking when its outcome is unknown
fn possibly_held(
    mut held: AcquiredResources,
    error: &RustyGateError,
    mark: impl FnOnce(&mut AcquiredResources),
) -> AcquiredResources {
    if error.is_indeterminate() {
        mark(&mut held);
    }
    held
}

#[derive(Clone)]
pub struct AdmissionGate {
    store: Arc<dyn CounterStore>,
    rooms: RoomRegistry,
}

impl AdmissionGate {
    pub fn new(store: Arc<dyn CounterStore>) -> Self {
        let rooms = RoomRegistry::new(store.clone());
        Self { store, rooms }
    }

    pub fn rooms(&self) -> &RoomRegistry {
        &self.rooms
    }

    fn counter_key(identity_key: &str) -> String {
        format!("{}:{}", NS_CONN, identity_key)
    }

    /// Evaluate a connection attempt, recording every slot it takes.
    ///
    /// On `Ok`, the returned resources are exactly what the store now holds for
    /// this connection. On `Err` the slots taken so far have been handed back,
    /// except the ones listed in `StoreFailure::outstanding`.
    pub async fn evaluate(
        &self,
        identity: &Identity,
        room_id: &str,
        connection_id: &str,
        config: &EnforcementConfig,
    ) -> GateResult<Admission> {
        let mut acquired = AcquiredResources::none();

        if let Some(user_key) = identity.user_key() {
            let step = match self
                .store
                .increment_below(&Self::counter_key(&user_key), config.conn_per_user as i64)
                .await
            {
                Ok(step) => step,
                Err(e) => {
                    let held = possibly_held(acquired, &e, |h| h.user_slot = true);
                    return Err(self.abort(identity, room_id, connection_id, held, e).await);
                }
            };
            if !step.incremented {
                return Ok(Admission {
                    decision: AdmissionDecision::reject(RejectReason::UserConnectionLimit),
                    acquired,
                });
            }
            acquired.user_slot = true;
        }

        if let Some(ip_key) = identity.ip_key() {
            let step = match self
                .store
                .increment_below(&Self::counter_key(&ip_key), config.conn_per_ip as i64)
                .await
            {
                Ok(step) => step,
                Err(e) => {
                    let held = possibly_held(acquired, &e, |h| h.ip_slot = true);
                    return Err(self.abort(identity, room_id, connection_id, held, e).await);
                }
            };
            if !step.incremented {
                self.rollback(identity, room_id, connection_id, acquired).await?;
                return Ok(Admission {
                    decision: AdmissionDecision::reject(RejectReason::IpConnectionLimit),
                    acquired: AcquiredResources::none(),
                });
            }
            acquired.ip_slot = true;
        }

        let join = match self
            .rooms
            .try_join(room_id, connection_id, config.room_max_members as usize)
            .await
        {
            Ok(join) => join,
            Err(e) => {
                let held = possibly_held(acquired, &e, |h| h.room_slot = true);
                return Err(self.abort(identity, room_id, connection_id, held, e).await);
            }
        };
        if !join.joined {
            self.rollback(identity, room_id, connection_id, acquired).await?;
            return Ok(Admission {
                decision: AdmissionDecision::reject(RejectReason::RoomFull),
                acquired: AcquiredResources::none(),
            });
        }
        acquired.room_slot = true;

        Ok(Admission {
            decision: AdmissionDecision::admit(),
            acquired,
        })
    }

    /// Hand back every listed slot. Each step is attempted even when an
    /// earlier one fails; the first failure is returned along with the slots
    /// that are still held.
    pub async fn release(
        &self,
        identity: &Identity,
        room_id: &str,
        connection_id: &str,
        acquired: AcquiredResources,
    ) -> GateResult<()> {
        let mut outstanding = acquired;
        let mut first_error = None;

        if acquired.user_slot {
            let result = match identity.user_key() {
                Some(user_key) => self
                    .store
                    .decrement(&Self::counter_key(&user_key))
                    .await
                    .map(|_| ()),
                None => Ok(()),
            };
            match result {
                Ok(()) => outstanding.user_slot = false,
                Err(e) => {
                    log::error!("Failed to release user slot for {}: {}", identity, e);
                    first_error.get_or_insert(e);
                }
            }
        }

        if acquired.ip_slot {
            let result = match identity.ip_key() {
                Some(ip_key) => self
                    .store
                    .decrement(&Self::counter_key(&ip_key))
                    .await
                    .map(|_| ()),
                None => Ok(()),
            };
            match result {
                Ok(()) => outstanding.ip_slot = false,
                Err(e) => {
                    log::error!("Failed to release IP slot for {}: {}", identity, e);
                    first_error.get_or_insert(e);
                }
            }
        }

        if acquired.room_slot {
            match self.rooms.leave(room_id, connection_id).await {
                Ok(_) => outstanding.room_slot = false,
                Err(e) => {
                    log::error!(
                        "Failed to remove {} from room {}: {}",
                        connection_id,
                        room_id,
                        e
                    );
                    first_error.get_or_insert(e);
                }
            }
        }

        match first_error {
            Some(error) => Err(StoreFailure { error, outstanding }),
            None => Ok(()),
        }
    }

    /// Current admitted connections for the identity's user, 0 if anonymous
    pub async fn user_connections(&self, identity: &Identity) -> Result<i64> {
        match identity.user_key() {
            Some(key) => self.store.get(&Self::counter_key(&key)).await,
            None => Ok(0),
        }
    }

    /// Current admitted connections for the identity's address
    pub async fn ip_connections(&self, identity: &Identity) -> Result<i64> {
        match identity.ip_key() {
            Some(key) => self.store.get(&Self::counter_key(&key)).await,
            None => Ok(0),
        }
    }

    async fn rollback(
        &self,
        identity: &Identity,
        room_id: &str,
        connection_id: &str,
        acquired: AcquiredResources,
    ) -> GateResult<()> {
        if acquired.is_empty() {
            return Ok(());
        }
        self.release(identity, room_id, connection_id, acquired)
            .await
            .map_err(|failure| {
                log::warn!(
                    "Rollback of {} was incomplete: {}",
                    connection_id,
                    failure
                );
                failure
            })
    }

    async fn abort(
        &self,
        identity: &Identity,
        room_id: &str,
        connection_id: &str,
        held: AcquiredResources,
        error: RustyGateError,
    ) -> StoreFailure {
        let outstanding = match self.rollback(identity, room_id, connection_id, held).await {
            Ok(()) => AcquiredResources::none(),
            Err(failure) => failure.outstanding,
        };
        StoreFailure { error, outstanding }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::memory::InMemoryCounterStore;
    use crate::storage::timeout::TimeoutStore;
    use crate::storage::traits::{BoundedAdd, BucketOutcome, BucketRequest, LimitedIncrement};
    use async_trait::async_trait;
    use std::time::Duration;

    /// Applies every call, but answers `late_op` only after the caller gave up.
    /// With `go_dark` the store also stops answering right after applying it.
    struct LateStore {
        inner: Arc<InMemoryCounterStore>,
        late_op: &'static str,
        go_dark: bool,
    }

    impl LateStore {
        async fn answer(&self, op: &str) {
            if op == self.late_op {
                if self.go_dark {
                    self.inner.simulate_outage(true);
                }
                tokio::time::sleep(Duration::from_millis(200)).await;
            }
        }
    }

    #[async_trait]
    impl CounterStore for LateStore {
        async fn increment(&self, key: &str) -> Result<i64> {
            self.inner.increment(key).await
        }
        async fn decrement(&self, key: &str) -> Result<i64> {
            self.inner.decrement(key).await
        }
        async fn get(&self, key: &str) -> Result<i64> {
            self.inner.get(key).await
        }
        async fn increment_below(&self, key: &str, limit: i64) -> Result<LimitedIncrement> {
            let step = self.inner.increment_below(key, limit).await?;
            self.answer("increment_below").await;
            Ok(step)
        }
        async fn set_add_bounded(&self, key: &str, member: &str, max: usize) -> Result<BoundedAdd> {
            let add = self.inner.set_add_bounded(key, member, max).await?;
            self.answer("set_add_bounded").await;
            Ok(add)
        }
        async fn set_remove(&self, key: &str, member: &str) -> Result<bool> {
            self.inner.set_remove(key, member).await
        }
        async fn set_size(&self, key: &str) -> Result<usize> {
            self.inner.set_size(key).await
        }
        async fn token_bucket(&self, key: &str, request: &BucketRequest) -> Result<BucketOutcome> {
            self.inner.token_bucket(key, request).await
        }
        async fn health_check(&self) -> Result<bool> {
            self.inner.health_check().await
        }
    }

    fn late_gate(late_op: &'static str, go_dark: bool) -> (AdmissionGate, Arc<InMemoryCounterStore>) {
        let inner = Arc::new(InMemoryCounterStore::new());
        let late = LateStore {
            inner: inner.clone(),
            late_op,
            go_dark,
        };
        let store = TimeoutStore::new(late, Duration::from_millis(20));
        (AdmissionGate::new(Arc::new(store)), inner)
    }

    fn limits(conn_per_user: u32, conn_per_ip: u32, room_max_members: u32) -> EnforcementConfig {
        EnforcementConfig {
            conn_per_user,
            conn_per_ip,
            room_max_members,
            ..EnforcementConfig::default()
        }
    }

    #[tokio::test]
    async fn test_user_limit_then_release_frees_slot() {
        let gate = AdmissionGate::new(Arc::new(InMemoryCounterStore::new()));
        let config = limits(2, 10, 10);
        let user = Identity::user(7, "10.0.0.1").unwrap();

        let first = gate.evaluate(&user, "r", "c1", &config).await.unwrap();
        let second = gate.evaluate(&user, "r", "c2", &config).await.unwrap();
        assert!(first.decision.admitted && second.decision.admitted);

        let third = gate.evaluate(&user, "r", "c3", &config).await.unwrap();
        assert_eq!(third.decision.reason, Some(RejectReason::UserConnectionLimit));
        assert!(third.acquired.is_empty());

        gate.release(&user, "r", "c1", first.acquired).await.unwrap();
        let fourth = gate.evaluate(&user, "r", "c4", &config).await.unwrap();
        assert!(fourth.decision.admitted);
        assert_eq!(gate.user_connections(&user).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_ip_rejection_rolls_back_user_slot() {
        let gate = AdmissionGate::new(Arc::new(InMemoryCounterStore::new()));
        let config = limits(5, 1, 10);

        let a = Identity::user(1, "10.0.0.1").unwrap();
        let b = Identity::user(2, "10.0.0.1").unwrap();

        assert!(gate.evaluate(&a, "r", "c1", &config).await.unwrap().decision.admitted);
        let rejected = gate.evaluate(&b, "r", "c2", &config).await.unwrap();
        assert_eq!(rejected.decision.reason, Some(RejectReason::IpConnectionLimit));
        assert_eq!(gate.user_connections(&b).await.unwrap(), 0);
        assert_eq!(gate.ip_connections(&b).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_room_full_rolls_back_counters() {
        let gate = AdmissionGate::new(Arc::new(InMemoryCounterStore::new()));
        let config = limits(5, 5, 1);

        let a = Identity::user(1, "10.0.0.1").unwrap();
        let b = Identity::user(2, "10.0.0.2").unwrap();

        assert!(gate.evaluate(&a, "tiny", "c1", &config).await.unwrap().decision.admitted);
        let rejected = gate.evaluate(&b, "tiny", "c2", &config).await.unwrap();
        assert_eq!(rejected.decision.reason, Some(RejectReason::RoomFull));
        assert_eq!(gate.user_connections(&b).await.unwrap(), 0);
        assert_eq!(gate.ip_connections(&b).await.unwrap(), 0);
        assert_eq!(gate.rooms().member_count("tiny").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_anonymous_identity_skips_user_check() {
        let gate = AdmissionGate::new(Arc::new(InMemoryCounterStore::new()));
        let config = limits(1, 3, 10);
        let anon = Identity::anonymous("10.0.0.3").unwrap();

        for i in 0..3 {
            let admission = gate.evaluate(&anon, "r", &format!("c{}", i), &config).await.unwrap();
            assert!(admission.decision.admitted);
            assert!(!admission.acquired.user_slot);
        }
        let rejected = gate.evaluate(&anon, "r", "c3", &config).await.unwrap();
        assert_eq!(rejected.decision.reason, Some(RejectReason::IpConnectionLimit));
    }

    #[tokio::test]
    async fn test_outage_mid_evaluation_leaves_nothing_behind() {
        let store = Arc::new(InMemoryCounterStore::new());
        let gate = AdmissionGate::new(store.clone());
        let user = Identity::user(9, "10.0.0.9").unwrap();

        store.simulate_outage(true);
        let err = gate
            .evaluate(&user, "r", "c1", &limits(2, 2, 2))
            .await
            .unwrap_err();
        assert!(err.error.is_store_unavailable());
        assert!(err.outstanding.is_empty());

        store.simulate_outage(false);
        assert_eq!(gate.user_connections(&user).await.unwrap(), 0);
        assert_eq!(gate.ip_connections(&user).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_concurrent_connects_respect_user_limit() {
        let gate = AdmissionGate::new(Arc::new(InMemoryCounterStore::new()));
        let config = limits(3, 100, 100);
        let user = Identity::user(11, "10.0.0.11").unwrap();

        let mut handles = Vec::new();
        for i in 0..25 {
            let gate = gate.clone();
            let user = user.clone();
            let config = config.clone();
            handles.push(tokio::spawn(async move {
                gate.evaluate(&user, "r", &format!("c{}", i), &config)
                    .await
                    .unwrap()
                    .decision
                    .admitted
            }));
        }

        let mut admitted = 0;
        for handle in handles {
            if handle.await.unwrap() {
                admitted += 1;
            }
        }
        assert_eq!(admitted, 3);
        assert_eq!(gate.user_connections(&user).await.unwrap(), 3);
        assert_eq!(gate.ip_connections(&user).await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_timed_out_increment_is_compensated() {
        let (gate, inner) = late_gate("increment_below", false);
        let user = Identity::user(21, "10.0.0.21").unwrap();

        let err = gate
            .evaluate(&user, "r", "c1", &limits(1, 5, 5))
            .await
            .unwrap_err();
        assert!(err.error.is_indeterminate());
        assert!(err.outstanding.is_empty());
        assert_eq!(inner.get("conn:user:21").await.unwrap(), 0);
        assert_eq!(inner.get("conn:ip:10.0.0.21").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_timed_out_room_join_is_compensated() {
        let (gate, inner) = late_gate("set_add_bounded", false);
        let user = Identity::user(22, "10.0.0.22").unwrap();

        let err = gate
            .evaluate(&user, "stage", "c1", &limits(1, 1, 1))
            .await
            .unwrap_err();
        assert!(err.error.is_indeterminate());
        assert!(err.outstanding.is_empty());
        assert_eq!(inner.get("conn:user:22").await.unwrap(), 0);
        assert_eq!(inner.get("conn:ip:10.0.0.22").await.unwrap(), 0);
        assert_eq!(inner.set_size("room:stage").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_uncompensated_slots_are_reported_outstanding() {
        let (gate, inner) = late_gate("increment_below", true);
        let user = Identity::user(23, "10.0.0.23").unwrap();

        let err = gate
            .evaluate(&user, "r", "c1", &limits(1, 5, 5))
            .await
            .unwrap_err();
        assert!(err.error.is_indeterminate());
        assert_eq!(
            err.outstanding,
            AcquiredResources {
                user_slot: true,
                ..AcquiredResources::none()
            }
        );

        inner.simulate_outage(false);
        assert_eq!(inner.get("conn:user:23").await.unwrap(), 1);
        gate.release(&user, "r", "c1", err.outstanding).await.unwrap();
        assert_eq!(inner.get("conn:user:23").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_partial_release_keeps_failed_slots() {
        let store = Arc::new(InMemoryCounterStore::new());
        let gate = AdmissionGate::new(store.clone());
        let user = Identity::user(24, "10.0.0.24").unwrap();
        let admission = gate.evaluate(&user, "r", "c1", &limits(2, 2, 2)).await.unwrap();

        store.simulate_outage(true);
        let failure = gate
            .release(&user, "r", "c1", admission.acquired)
            .await
            .unwrap_err();
        assert_eq!(failure.outstanding, admission.acquired);

        store.simulate_outage(false);
        gate.release(&user, "r", "c1", failure.outstanding).await.unwrap();
        assert_eq!(gate.user_connections(&user).await.unwrap(), 0);
        assert_eq!(gate.rooms().member_count("r").await.unwrap(), 0);
    }

    #[test]
    fn test_resource_bits_preserve_slots() {
        let acquired = AcquiredResources {
            user_slot: true,
            ip_slot: false,
            room_slot: true,
        };
        assert_eq!(AcquiredResources::from_bits(acquired.to_bits()), acquired);
        assert_eq!(AcquiredResources::none().to_bits(), 0);
    }
}
