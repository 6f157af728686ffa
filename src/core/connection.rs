//! Connection state tracking
//! Holds what a connection acquired at admission and where it is in its life

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};

use crate::config::EnforcementConfig;
use crate::core::admission::{AcquiredResources, RejectReason};
use crate::core::identity::Identity;
use crate::error::{Result, RustyGateError};

/// Lifecycle states. `Closed` and `Rejected` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Pending = 0,
    Admitted = 1,
    Active = 2,
    Closed = 3,
    Rejected = 4,
}

impl ConnectionState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Closed | Self::Rejected)
    }

    pub fn can_transition_to(&self, next: ConnectionState) -> bool {
        use ConnectionState::*;
        matches!(
            (self, next),
            (Pending, Admitted)
                | (Pending, Rejected)
                | (Admitted, Active)
                | (Admitted, Closed)
                | (Active, Closed)
        )
    }
}

impl From<u8> for ConnectionState {
    fn from(value: u8) -> Self {
        match value {
            0 => ConnectionState::Pending,
            1 => ConnectionState::Admitted,
            2 => ConnectionState::Active,
            3 => ConnectionState::Closed,
            _ => ConnectionState::Rejected,
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Pending => "pending",
            Self::Admitted => "admitted",
            Self::Active => "active",
            Self::Closed => "closed",
            Self::Rejected => "rejected",
        };
        f.write_str(name)
    }
}

/// Why a connection ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    Graceful,
    ProtocolError,
    Timeout,
    /// Closed after a policy violation on an admitted connection
    Enforcement(RejectReason),
    /// No heartbeat within the supervision timeout
    HeartbeatExpired,
    /// The transport dropped its handle without closing
    HandlerDropped,
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Graceful => f.write_str("graceful"),
            Self::ProtocolError => f.write_str("protocol_error"),
            Self::Timeout => f.write_str("timeout"),
            Self::Enforcement(reason) => write!(f, "enforcement:{}", reason),
            Self::HeartbeatExpired => f.write_str("heartbeat_expired"),
            Self::HandlerDropped => f.write_str("handler_dropped"),
        }
    }
}

/// Everything the supervisor must hand back when a connection ends
#[derive(Debug)]
pub struct ConnectionLease {
    pub id: String,
    pub identity: Identity,
    pub room_id: String,
    /// Limits resolved at admission, fixed for the connection's life
    pub config: EnforcementConfig,
    pub acquired: AcquiredResources,
    pub connected_at_ms: u64,
    state: AtomicU8,
    last_seen_ms: AtomicU64,
    released: AtomicBool,
    /// Slots still held in the store, as `AcquiredResources` bits
    outstanding: AtomicU8,
    retry_pending: AtomicBool,
}

impl ConnectionLease {
    pub fn new(
        id: String,
        identity: Identity,
        room_id: String,
        config: EnforcementConfig,
        acquired: AcquiredResources,
        now_ms: u64,
    ) -> Self {
        Self {
            id,
            identity,
            room_id,
            config,
            acquired,
            connected_at_ms: now_ms,
            state: AtomicU8::new(ConnectionState::Pending as u8),
            last_seen_ms: AtomicU64::new(now_ms),
            released: AtomicBool::new(false),
            outstanding: AtomicU8::new(acquired.to_bits()),
            retry_pending: AtomicBool::new(false),
        }
    }

    pub fn state(&self) -> ConnectionState {
        ConnectionState::from(self.state.load(Ordering::Acquire))
    }

    /// Move to `next` if the lifecycle allows it from the current state
    pub fn transition(&self, next: ConnectionState) -> Result<()> {
        let mut current = self.state();
        loop {
            if current == next {
                return Ok(());
            }
            if !current.can_transition_to(next) {
                return Err(RustyGateError::InvalidTransition {
                    from: current.to_string(),
                    to: next.to_string(),
                });
            }
            match self.state.compare_exchange(
                current as u8,
                next as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return Ok(()),
                Err(actual) => current = ConnectionState::from(actual),
            }
        }
    }

    /// Claim the one-time release. Only the first caller gets `true`.
    pub fn claim_release(&self) -> bool {
        !self.released.swap(true, Ordering::AcqRel)
    }

    pub fn is_released(&self) -> bool {
        self.released.load(Ordering::Acquire)
    }

    /// Slots not yet handed back to the store
    pub fn outstanding(&self) -> AcquiredResources {
        AcquiredResources::from_bits(self.outstanding.load(Ordering::Acquire))
    }

    pub fn set_outstanding(&self, outstanding: AcquiredResources) {
        self.outstanding.store(outstanding.to_bits(), Ordering::Release);
    }

    /// Flag a failed hand-back for the next retry sweep
    pub fn mark_retry_pending(&self) {
        self.retry_pending.store(true, Ordering::Release);
    }

    /// Claim a pending retry. Only one caller gets `true` per failure.
    pub fn claim_retry(&self) -> bool {
        self.retry_pending.swap(false, Ordering::AcqRel)
    }

    pub fn touch(&self, now_ms: u64) {
        self.last_seen_ms.fetch_max(now_ms, Ordering::AcqRel);
    }

    pub fn last_seen_ms(&self) -> u64 {
        self.last_seen_ms.load(Ordering::Acquire)
    }

    /// Check if the connection is stale (no heartbeat for a while)
    pub fn is_stale(&self, now_ms: u64, timeout_ms: u64) -> bool {
        now_ms.saturating_sub(self.last_seen_ms()) > timeout_ms
    }
}
