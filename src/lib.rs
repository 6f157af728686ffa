//! Rusty Gate - Admission control and rate limiting for realtime gateways
//!
//! This library decides whether a connection may join a room and whether
//! each of its messages may pass, enforcing per-user, per-IP and per-room
//! limits through a shared counter store so several gateway processes see
//! the same counts.

pub mod config;
pub mod constants;
pub mod core;
pub mod error;
pub mod events;
pub mod handlers;
pub mod storage;

// Re-export main components
pub use config::*;
pub use constants::*;
pub use error::{Result, RustyGateError};
