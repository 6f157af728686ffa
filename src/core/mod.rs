//! Admission control and rate limiting core

pub mod admission;
pub mod clock;
pub mod connection;
pub mod identity;
pub mod message;
pub mod payload_guard;
pub mod rate_limiter;
pub mod room;
pub mod supervisor;

// Re-export main components for convenience
pub use admission::{AcquiredResources, Admission, AdmissionDecision, AdmissionGate, RejectReason};
pub use clock::{Clock, MockClock, SystemClock};
pub use connection::{CloseReason, ConnectionLease, ConnectionState};
pub use identity::Identity;
pub use message::{Rejection, RejectionCode, RejectionStage};
pub use rate_limiter::{BucketLimits, RateDecision, TokenBucketLimiter};
pub use room::{JoinOutcome, RoomRegistry};
pub use supervisor::{ConnectOutcome, ConnectionHandle, LifecycleSupervisor, MessageVerdict, SupervisorBuilder};
