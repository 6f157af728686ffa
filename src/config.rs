//! Gate configuration module
//! Handles deployment settings and the per-room enforcement limits

use crate::constants::{
    DEFAULT_CONN_PER_IP, DEFAULT_CONN_PER_USER, DEFAULT_HEARTBEAT_TIMEOUT_SECS, DEFAULT_HOST,
    DEFAULT_KEY_PREFIX, DEFAULT_MAX_PAYLOAD_BYTES, DEFAULT_MSG_BURST, DEFAULT_MSG_RPS,
    DEFAULT_PORT, DEFAULT_REAP_INTERVAL_SECS, DEFAULT_ROOM_MAX_MEMBERS, DEFAULT_STORE_TIMEOUT_MS,
};
use crate::error::{Result, RustyGateError};
use std::collections::HashMap;
use std::env;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// Behaviour when the shared counter store cannot be reached.
///
/// Applied uniformly to every primitive (connection counters, room registry,
/// token buckets) for the lifetime of the process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailurePolicy {
    /// Admit / allow and skip enforcement, emitting a warning event
    FailOpen,
    /// Reject, protecting backend capacity
    FailClosed,
}

impl FromStr for FailurePolicy {
    type Err = RustyGateError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "open" | "fail-open" | "fail_open" => Ok(Self::FailOpen),
            "closed" | "fail-closed" | "fail_closed" => Ok(Self::FailClosed),
            other => Err(RustyGateError::ConfigError(format!(
                "Unknown failure policy '{}', expected 'open' or 'closed'",
                other
            ))),
        }
    }
}

impl fmt::Display for FailurePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::FailOpen => write!(f, "fail-open"),
            Self::FailClosed => write!(f, "fail-closed"),
        }
    }
}

/// Quantitative limits applied to one connection.
///
/// Resolved once when the connection is evaluated and never changed while it
/// is alive. Rooms may carry different values.
#[derive(Debug, Clone, PartialEq)]
pub struct EnforcementConfig {
    pub conn_per_user: u32,
    pub conn_per_ip: u32,
    pub room_max_members: u32,
    /// Refill rate of the message bucket, in messages per second
    pub msg_rps: f64,
    /// Capacity of the message bucket
    pub msg_burst: u32,
    pub max_payload_bytes: usize,
}

impl Default for EnforcementConfig {
    fn default() -> Self {
        Self {
            conn_per_user: DEFAULT_CONN_PER_USER,
            conn_per_ip: DEFAULT_CONN_PER_IP,
            room_max_members: DEFAULT_ROOM_MAX_MEMBERS,
            msg_rps: DEFAULT_MSG_RPS,
            msg_burst: DEFAULT_MSG_BURST,
            max_payload_bytes: DEFAULT_MAX_PAYLOAD_BYTES,
        }
    }
}

impl EnforcementConfig {
    /// Reject limits that could never admit anything
    pub fn validate(&self) -> Result<()> {
        let positive = [
            ("conn_per_user", self.conn_per_user as u64),
            ("conn_per_ip", self.conn_per_ip as u64),
            ("room_max_members", self.room_max_members as u64),
            ("msg_burst", self.msg_burst as u64),
            ("max_payload_bytes", self.max_payload_bytes as u64),
        ];

        for (name, value) in positive {
            if value == 0 {
                return Err(RustyGateError::ConfigInvalid(format!(
                    "{} must be greater than zero",
                    name
                )));
            }
        }

        if !self.msg_rps.is_finite() || self.msg_rps <= 0.0 {
            return Err(RustyGateError::ConfigInvalid(format!(
                "msg_rps must be a positive number, got {}",
                self.msg_rps
            )));
        }

        Ok(())
    }
}

/// Supplies the enforcement limits for a room
pub trait EnforcementConfigProvider: Send + Sync {
    fn config_for_room(&self, room_id: &str) -> EnforcementConfig;
}

/// Static per-room configuration with a validated default
#[derive(Debug, Clone)]
pub struct RoomConfigTable {
    default: EnforcementConfig,
    rooms: HashMap<String, EnforcementConfig>,
}

impl RoomConfigTable {
    pub fn new(default: EnforcementConfig) -> Result<Self> {
        default.validate()?;
        Ok(Self {
            default,
            rooms: HashMap::new(),
        })
    }

    /// Override limits for one room
    pub fn with_room(mut self, room_id: impl Into<String>, config: EnforcementConfig) -> Result<Self> {
        self.set_room(room_id, config)?;
        Ok(self)
    }

    pub fn set_room(&mut self, room_id: impl Into<String>, config: EnforcementConfig) -> Result<()> {
        let room_id = room_id.into();
        config.validate().map_err(|e| {
            RustyGateError::ConfigInvalid(format!("room '{}': {}", room_id, e))
        })?;
        self.rooms.insert(room_id, config);
        Ok(())
    }

    pub fn default_config(&self) -> &EnforcementConfig {
        &self.default
    }
}

impl EnforcementConfigProvider for RoomConfigTable {
    fn config_for_room(&self, room_id: &str) -> EnforcementConfig {
        self.rooms
            .get(room_id)
            .cloned()
            .unwrap_or_else(|| self.default.clone())
    }
}

/// Deployment configuration for the gate
#[derive(Debug, Clone)]
pub struct GateConfig {
    pub host: String,
    pub port: u16,
    /// `memory` or a `redis://` URL
    pub store_url: String,
    pub key_prefix: String,
    /// Upper bound on a single store round trip
    pub store_timeout: Duration,
    pub failure_policy: FailurePolicy,
    /// Connections silent for longer than this are reaped
    pub heartbeat_timeout: Duration,
    pub reap_interval: Duration,
    /// Limits for rooms without an explicit override
    pub default_limits: EnforcementConfig,
}

impl GateConfig {
    /// Create a test configuration - only for unit tests
    #[cfg(test)]
    pub fn for_testing() -> Self {
        Self {
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_PORT,
            store_url: "memory".to_string(),
            key_prefix: DEFAULT_KEY_PREFIX.to_string(),
            store_timeout: Duration::from_millis(DEFAULT_STORE_TIMEOUT_MS),
            failure_policy: FailurePolicy::FailClosed,
            heartbeat_timeout: Duration::from_secs(DEFAULT_HEARTBEAT_TIMEOUT_SECS),
            reap_interval: Duration::from_secs(DEFAULT_REAP_INTERVAL_SECS),
            default_limits: EnforcementConfig::default(),
        }
    }

    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        let host = env::var("RUSTY_GATE_HOST").unwrap_or(DEFAULT_HOST.to_string());
        let port = env_or("RUSTY_GATE_PORT", DEFAULT_PORT)?;

        let store_url = env::var("RUSTY_GATE_STORE_URL").unwrap_or("memory".to_string());
        let key_prefix =
            env::var("RUSTY_GATE_KEY_PREFIX").unwrap_or(DEFAULT_KEY_PREFIX.to_string());
        let store_timeout_ms = env_or("RUSTY_GATE_STORE_TIMEOUT_MS", DEFAULT_STORE_TIMEOUT_MS)?;
        if store_timeout_ms == 0 {
            return Err(RustyGateError::ConfigError(
                "RUSTY_GATE_STORE_TIMEOUT_MS must be greater than zero".to_string(),
            ));
        }

        // No implicit default: an outage policy is an operational decision
        let failure_policy = env::var("RUSTY_GATE_FAILURE_POLICY")
            .map_err(|_| {
                RustyGateError::ConfigError(
                    "RUSTY_GATE_FAILURE_POLICY environment variable is required. \
                     Set it to 'open' (admit during store outages) or 'closed' (reject)."
                        .to_string(),
                )
            })?
            .parse::<FailurePolicy>()?;

        let heartbeat_secs = env_or("RUSTY_GATE_HEARTBEAT_TIMEOUT", DEFAULT_HEARTBEAT_TIMEOUT_SECS)?;
        let reap_secs = env_or("RUSTY_GATE_REAP_INTERVAL", DEFAULT_REAP_INTERVAL_SECS)?;

        let default_limits = EnforcementConfig {
            conn_per_user: env_or("RUSTY_GATE_CONN_PER_USER", DEFAULT_CONN_PER_USER)?,
            conn_per_ip: env_or("RUSTY_GATE_CONN_PER_IP", DEFAULT_CONN_PER_IP)?,
            room_max_members: env_or("RUSTY_GATE_ROOM_MAX_MEMBERS", DEFAULT_ROOM_MAX_MEMBERS)?,
            msg_rps: env_or("RUSTY_GATE_MSG_RPS", DEFAULT_MSG_RPS)?,
            msg_burst: env_or("RUSTY_GATE_MSG_BURST", DEFAULT_MSG_BURST)?,
            max_payload_bytes: env_or("RUSTY_GATE_MAX_PAYLOAD_BYTES", DEFAULT_MAX_PAYLOAD_BYTES)?,
        };
        default_limits.validate()?;

        Ok(Self {
            host,
            port,
            store_url,
            key_prefix,
            store_timeout: Duration::from_millis(store_timeout_ms),
            failure_policy,
            heartbeat_timeout: Duration::from_secs(heartbeat_secs),
            reap_interval: Duration::from_secs(reap_secs),
            default_limits,
        })
    }
}

/// Read and parse an environment variable, falling back when it is unset
fn env_or<T: FromStr>(name: &str, default: T) -> Result<T> {
    match env::var(name) {
        Ok(raw) => raw.trim().parse().map_err(|_| {
            RustyGateError::ConfigError(format!("{} has an unparsable value '{}'", name, raw))
        }),
        Err(_) => Ok(default),
    }
}
