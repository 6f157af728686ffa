use std::error::Error;
use std::fmt;

#[derive(Debug)]
pub enum RustyGateError {
    // Shared store errors
    StoreUnavailable(String),
    /// No answer in time; the call may still have been applied
    StoreTimeout(String),

    // Configuration errors
    ConfigInvalid(String),
    ConfigError(String),

    // Identity errors
    InvalidIdentity(String),

    // Connection lifecycle errors
    InvalidTransition { from: String, to: String },
    ConnectionClosed,

    // Serialization errors
    SerializationError(String),
}

impl RustyGateError {
    /// True when the shared store could not be reached or timed out
    pub fn is_store_unavailable(&self) -> bool {
        matches!(self, Self::StoreUnavailable(_) | Self::StoreTimeout(_))
    }

    /// True when the failed call may have reached the store anyway
    pub fn is_indeterminate(&self) -> bool {
        matches!(self, Self::StoreTimeout(_))
    }
}

impl fmt::Display for RustyGateError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::StoreUnavailable(msg) => write!(f, "Counter store unavailable: {}", msg),
            Self::StoreTimeout(msg) => write!(f, "Counter store timed out: {}", msg),
            Self::ConfigInvalid(msg) => write!(f, "Invalid enforcement configuration: {}", msg),
            Self::ConfigError(msg) => write!(f, "Configuration error: {}", msg),
            Self::InvalidIdentity(msg) => write!(f, "Invalid identity: {}", msg),
            Self::InvalidTransition { from, to } => {
                write!(f, "Invalid connection state transition: {} -> {}", from, to)
            }
            Self::ConnectionClosed => write!(f, "Connection already closed"),
            Self::SerializationError(msg) => write!(f, "Serialization error: {}", msg),
        }
    }
}

impl Error for RustyGateError {}

impl From<serde_json::Error> for RustyGateError {
    fn from(err: serde_json::Error) -> Self {
        RustyGateError::SerializationError(err.to_string())
    }
}

// Redis failures all mean the shared store cannot answer; the fallback policy
// decides what happens next. A timeout or a connection dropped mid-call leaves
// the outcome unknown.
#[cfg(feature = "redis-store")]
impl From<redis::RedisError> for RustyGateError {
    fn from(err: redis::RedisError) -> Self {
        if err.is_timeout() || err.is_connection_dropped() {
            RustyGateError::StoreTimeout(err.to_string())
        } else {
            RustyGateError::StoreUnavailable(err.to_string())
        }
    }
}

// Generic result type for RustyGate
pub type Result<T> = std::result::Result<T, RustyGateError>;
