//! Lifecycle supervisor: the transport-facing entry point
//!
//! Runs admission on connect, payload and rate checks per message, and hands
//! back every slot a connection holds when it ends. The transport owns one
//! [`ConnectionHandle`] per admitted connection; closing it or dropping it
//! triggers the release, and the reaper catches connections whose handler
//! stopped sending heartbeats.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::config::{EnforcementConfig, EnforcementConfigProvider, FailurePolicy};
use crate::constants::DEFAULT_HEARTBEAT_TIMEOUT_SECS;
use crate::core::admission::{AcquiredResources, AdmissionGate, RejectReason};
use crate::core::clock::{Clock, SystemClock};
use crate::core::connection::{CloseReason, ConnectionLease, ConnectionState};
use crate::core::identity::Identity;
use crate::core::message::{Rejection, RejectionStage};
use crate::core::payload_guard;
use crate::core::rate_limiter::{BucketLimits, TokenBucketLimiter};
use crate::error::{Result, RustyGateError};
use crate::events::{EnforcementEvent, EventSink};
use crate::storage::traits::CounterStore;

/// Answer to a connection attempt
pub enum ConnectOutcome {
    Proceed(ConnectionHandle),
    Deny(Rejection),
}

/// Answer to one inbound message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageVerdict {
    Proceed,
    Deny(Rejection),
}

struct SupervisorInner {
    gate: AdmissionGate,
    limiter: TokenBucketLimiter,
    configs: Arc<dyn EnforcementConfigProvider>,
    events: Arc<dyn EventSink>,
    policy: FailurePolicy,
    clock: Arc<dyn Clock>,
    heartbeat_timeout: Duration,
    connections: RwLock<HashMap<String, Arc<ConnectionLease>>>,
}

impl SupervisorInner {
    async fn store_unavailable(&self, operation: &'static str, error: &RustyGateError) {
        log::warn!("Store failure during {}: {}", operation, error);
        self.events
            .emit(EnforcementEvent::StoreUnavailable {
                operation,
                failed_open: self.policy == FailurePolicy::FailOpen,
            })
            .await;
    }

    /// Hand back the lease's outstanding slots. On failure the remainder stays
    /// on the lease and is flagged for the next retry sweep.
    async fn hand_back(&self, lease: &ConnectionLease) -> bool {
        let outstanding = lease.outstanding();
        if outstanding.is_empty() {
            return true;
        }

        match self
            .gate
            .release(&lease.identity, &lease.room_id, &lease.id, outstanding)
            .await
        {
            Ok(()) => {
                lease.set_outstanding(AcquiredResources::none());
                true
            }
            Err(failure) => {
                lease.set_outstanding(failure.outstanding);
                if failure.error.is_store_unavailable() {
                    self.store_unavailable("release", &failure.error).await;
                }
                lease.mark_retry_pending();
                false
            }
        }
    }

    /// Release everything the lease holds. Returns `false` if an earlier call
    /// already did.
    async fn release(&self, lease: &ConnectionLease, reason: CloseReason) -> bool {
        if !lease.claim_release() {
            return false;
        }

        if let Err(e) = lease.transition(ConnectionState::Closed) {
            log::debug!("Closing connection {}: {}", lease.id, e);
        }

        let complete = self.hand_back(lease).await;

        self.events
            .emit(EnforcementEvent::ConnectionClosed {
                connection_id: lease.id.clone(),
                reason,
            })
            .await;

        // Last, so an empty registry means every release has finished. A lease
        // with slots still held stays registered until a retry hands them back.
        if complete {
            self.connections.write().await.remove(&lease.id);
        } else {
            log::warn!(
                "Connection {} closed with {:?} still held; retrying on the next sweep",
                lease.id,
                lease.outstanding()
            );
        }
        true
    }

    /// Retry every release that failed earlier. Returns how many completed.
    async fn retry_pending_releases(&self) -> usize {
        let pending: Vec<Arc<ConnectionLease>> = self
            .connections
            .read()
            .await
            .values()
            .filter(|lease| lease.is_released())
            .cloned()
            .collect();

        let mut completed = 0;
        for lease in pending {
            if !lease.claim_retry() {
                continue;
            }
            if self.hand_back(&lease).await {
                log::info!("Handed back the remaining slots of connection {}", lease.id);
                self.connections.write().await.remove(&lease.id);
                completed += 1;
            }
        }
        completed
    }

    /// Keep slots a failed admission could not hand back, so the retry sweep
    /// eventually does
    async fn track_unreleased(
        &self,
        connection_id: String,
        identity: Identity,
        room_id: &str,
        config: EnforcementConfig,
        outstanding: AcquiredResources,
    ) {
        if outstanding.is_empty() {
            return;
        }
        let lease = Arc::new(ConnectionLease::new(
            connection_id,
            identity,
            room_id.to_string(),
            config,
            outstanding,
            self.clock.now_millis(),
        ));
        if let Err(e) = lease.transition(ConnectionState::Rejected) {
            log::debug!("Rejecting connection {}: {}", lease.id, e);
        }
        lease.claim_release();
        lease.mark_retry_pending();
        log::warn!(
            "Admission of {} left {:?} in the store; retrying on the next sweep",
            lease.id,
            outstanding
        );
        self.connections
            .write()
            .await
            .insert(lease.id.clone(), lease);
    }
}

/// Held by the transport for the life of one admitted connection.
///
/// Dropping the handle without [`LifecycleSupervisor::on_close`] still
/// releases the connection's slots, on the current tokio runtime.
pub struct ConnectionHandle {
    lease: Arc<ConnectionLease>,
    inner: Arc<SupervisorInner>,
}

impl ConnectionHandle {
    pub fn id(&self) -> &str {
        &self.lease.id
    }

    pub fn identity(&self) -> &Identity {
        &self.lease.identity
    }

    pub fn room_id(&self) -> &str {
        &self.lease.room_id
    }

    pub fn config(&self) -> &EnforcementConfig {
        &self.lease.config
    }

    pub fn state(&self) -> ConnectionState {
        self.lease.state()
    }

    pub fn acquired(&self) -> AcquiredResources {
        self.lease.acquired
    }
}

impl Drop for ConnectionHandle {
    fn drop(&mut self) {
        if self.lease.is_released() {
            return;
        }
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                let inner = self.inner.clone();
                let lease = self.lease.clone();
                runtime.spawn(async move {
                    inner.release(&lease, CloseReason::HandlerDropped).await;
                });
            }
            Err(_) => log::error!(
                "Connection {} dropped outside a tokio runtime; leaving it to the reaper",
                self.lease.id
            ),
        }
    }
}

/// Builds a [`LifecycleSupervisor`]
pub struct SupervisorBuilder {
    store: Arc<dyn CounterStore>,
    configs: Arc<dyn EnforcementConfigProvider>,
    events: Arc<dyn EventSink>,
    policy: FailurePolicy,
    clock: Arc<dyn Clock>,
    heartbeat_timeout: Duration,
}

impl SupervisorBuilder {
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn heartbeat_timeout(mut self, timeout: Duration) -> Self {
        self.heartbeat_timeout = timeout;
        self
    }

    pub fn build(self) -> LifecycleSupervisor {
        LifecycleSupervisor {
            inner: Arc::new(SupervisorInner {
                gate: AdmissionGate::new(self.store.clone()),
                limiter: TokenBucketLimiter::new(self.store, self.clock.clone()),
                configs: self.configs,
                events: self.events,
                policy: self.policy,
                clock: self.clock,
                heartbeat_timeout: self.heartbeat_timeout,
                connections: RwLock::new(HashMap::new()),
            }),
        }
    }
}

/// Stateless over the shared store: several supervisors (in one process or
/// many) can enforce the same limits as long as they share the store.
#[derive(Clone)]
pub struct LifecycleSupervisor {
    inner: Arc<SupervisorInner>,
}

impl LifecycleSupervisor {
    pub fn builder(
        store: Arc<dyn CounterStore>,
        configs: Arc<dyn EnforcementConfigProvider>,
        events: Arc<dyn EventSink>,
        policy: FailurePolicy,
    ) -> SupervisorBuilder {
        SupervisorBuilder {
            store,
            configs,
            events,
            policy,
            clock: Arc::new(SystemClock::new()),
            heartbeat_timeout: Duration::from_secs(DEFAULT_HEARTBEAT_TIMEOUT_SECS),
        }
    }

    pub fn policy(&self) -> FailurePolicy {
        self.inner.policy
    }

    pub fn gate(&self) -> &AdmissionGate {
        &self.inner.gate
    }

    /// Run admission for a new connection
    pub async fn on_connect(&self, identity: Identity, room_id: &str) -> Result<ConnectOutcome> {
        let inner = &self.inner;
        let connection_id = Uuid::new_v4().to_string();
        let config = inner.configs.config_for_room(room_id);

        let evaluated = inner
            .gate
            .evaluate(&identity, room_id, &connection_id, &config)
            .await;
        let acquired = match evaluated {
            Ok(admission) if admission.decision.admitted => admission.acquired,
            Ok(admission) => {
                let reason = admission
                    .decision
                    .reason
                    .unwrap_or(RejectReason::StoreUnavailable);
                return Ok(self.deny_connect(room_id, reason, admission.decision.retry_after_ms).await);
            }
            Err(failure) if failure.error.is_store_unavailable() => {
                inner.store_unavailable("admission", &failure.error).await;
                match inner.policy {
                    // Whatever the store may still hold becomes this connection's
                    FailurePolicy::FailOpen => failure.outstanding,
                    FailurePolicy::FailClosed => {
                        inner
                            .track_unreleased(connection_id, identity, room_id, config, failure.outstanding)
                            .await;
                        return Ok(self
                            .deny_connect(room_id, RejectReason::StoreUnavailable, None)
                            .await);
                    }
                }
            }
            Err(failure) => {
                inner
                    .track_unreleased(connection_id, identity, room_id, config, failure.outstanding)
                    .await;
                return Err(failure.error);
            }
        };

        let lease = Arc::new(ConnectionLease::new(
            connection_id,
            identity,
            room_id.to_string(),
            config,
            acquired,
            inner.clock.now_millis(),
        ));
        lease.transition(ConnectionState::Admitted)?;

        inner
            .connections
            .write()
            .await
            .insert(lease.id.clone(), lease.clone());

        inner
            .events
            .emit(EnforcementEvent::ConnectionAdmitted {
                connection_id: lease.id.clone(),
                room_id: lease.room_id.clone(),
            })
            .await;

        Ok(ConnectOutcome::Proceed(ConnectionHandle {
            lease,
            inner: self.inner.clone(),
        }))
    }

    async fn deny_connect(&self, room_id: &str, reason: RejectReason, retry_after_ms: Option<u64>) -> ConnectOutcome {
        self.inner
            .events
            .emit(EnforcementEvent::ConnectionRejected {
                room_id: room_id.to_string(),
                reason,
            })
            .await;
        ConnectOutcome::Deny(Rejection::from_reason(reason, retry_after_ms, RejectionStage::Connect))
    }

    /// Check one raw inbound frame: size first, then the message rate
    pub async fn on_message(&self, handle: &ConnectionHandle, payload: &[u8]) -> Result<MessageVerdict> {
        let inner = &self.inner;
        let lease = &handle.lease;

        if lease.is_released() || lease.state().is_terminal() {
            return Err(RustyGateError::ConnectionClosed);
        }
        lease.touch(inner.clock.now_millis());

        if !payload_guard::check(payload.len(), lease.config.max_payload_bytes) {
            inner
                .events
                .emit(EnforcementEvent::PayloadRejected {
                    connection_id: lease.id.clone(),
                    size: payload.len(),
                    max_bytes: lease.config.max_payload_bytes,
                })
                .await;
            return Ok(MessageVerdict::Deny(Rejection::from_reason(
                RejectReason::PayloadTooLarge,
                None,
                RejectionStage::Message,
            )));
        }

        match inner
            .limiter
            .check_and_consume(&lease.identity, 1, BucketLimits::from(&lease.config))
            .await
        {
            Ok(decision) if decision.allowed => {}
            Ok(decision) => {
                inner
                    .events
                    .emit(EnforcementEvent::MessageRateLimited {
                        connection_id: lease.id.clone(),
                        retry_after_ms: decision.retry_after_ms,
                    })
                    .await;
                return Ok(MessageVerdict::Deny(Rejection::from_reason(
                    RejectReason::RateLimited,
                    Some(decision.retry_after_ms),
                    RejectionStage::Message,
                )));
            }
            Err(e) if e.is_store_unavailable() => {
                inner.store_unavailable("rate_limit", &e).await;
                if inner.policy == FailurePolicy::FailClosed {
                    return Ok(MessageVerdict::Deny(Rejection::from_reason(
                        RejectReason::StoreUnavailable,
                        None,
                        RejectionStage::Message,
                    )));
                }
            }
            Err(e) => return Err(e),
        }

        lease
            .transition(ConnectionState::Active)
            .map_err(|_| RustyGateError::ConnectionClosed)?;
        Ok(MessageVerdict::Proceed)
    }

    /// Mark an admitted connection as fully set up by the transport
    pub fn mark_active(&self, handle: &ConnectionHandle) -> Result<()> {
        handle.lease.transition(ConnectionState::Active)
    }

    /// Refresh the connection's liveness without sending a message
    pub fn heartbeat(&self, handle: &ConnectionHandle) {
        handle.lease.touch(self.inner.clock.now_millis());
    }

    /// End a connection and release its slots. Returns `false` if it had
    /// already been released.
    ///
    /// The release always goes through the supervisor that admitted the
    /// handle, whichever clone it is called on.
    pub async fn on_close(&self, handle: ConnectionHandle, reason: CloseReason) -> bool {
        handle.inner.release(&handle.lease, reason).await
    }

    /// Release a connection by id, for reconciliation when the transport
    /// lost track of it
    pub async fn release_connection(&self, connection_id: &str, reason: CloseReason) -> bool {
        let lease = self.inner.connections.read().await.get(connection_id).cloned();
        match lease {
            Some(lease) => self.inner.release(&lease, reason).await,
            None => false,
        }
    }

    /// Release every connection whose heartbeat expired. Releases that failed
    /// on an earlier attempt are retried first.
    pub async fn reap_expired(&self) -> usize {
        let retried = self.inner.retry_pending_releases().await;
        if retried > 0 {
            log::info!("Completed {} pending releases", retried);
        }

        let now_ms = self.inner.clock.now_millis();
        let timeout_ms = self.inner.heartbeat_timeout.as_millis() as u64;

        let stale: Vec<Arc<ConnectionLease>> = self
            .inner
            .connections
            .read()
            .await
            .values()
            .filter(|lease| !lease.is_released() && lease.is_stale(now_ms, timeout_ms))
            .cloned()
            .collect();

        let mut reaped = 0;
        for lease in stale {
            if self.inner.release(&lease, CloseReason::HeartbeatExpired).await {
                log::warn!(
                    "Reaped connection {} in room {}: no heartbeat for {}ms",
                    lease.id,
                    lease.room_id,
                    now_ms.saturating_sub(lease.last_seen_ms())
                );
                reaped += 1;
            }
        }
        reaped
    }

    /// Start the periodic reaper
    pub fn start_reaper_task(&self, every: Duration) -> JoinHandle<()> {
        let supervisor = self.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(every);
            loop {
                interval.tick().await;
                let reaped = supervisor.reap_expired().await;
                if reaped > 0 {
                    log::info!("Reaper released {} expired connections", reaped);
                }
            }
        })
    }

    /// Connections tracked by this supervisor: admitted and not yet released,
    /// plus released ones whose slots are still held
    pub async fn active_connections(&self) -> usize {
        self.inner.connections.read().await.len()
    }

    /// Released connections still waiting to hand slots back to the store
    pub async fn pending_releases(&self) -> usize {
        self.inner
            .connections
            .read()
            .await
            .values()
            .filter(|lease| lease.is_released() && !lease.outstanding().is_empty())
            .count()
    }
}
