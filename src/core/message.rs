//! Rejection payload sent to clients before a policy-violation close

use serde::{Deserialize, Serialize};

use crate::constants::{CLOSE_CONNECTION_LIMIT, CLOSE_PAYLOAD_TOO_LARGE, CLOSE_RATE_LIMIT};
use crate::core::admission::RejectReason;
use crate::error::Result;

/// Machine-readable rejection code on the wire
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectionCode {
    ConnectionLimitExceeded,
    RoomFull,
    RateLimitExceeded,
    PayloadTooLarge,
    ServiceUnavailable,
}

/// Where the rejection happened; picks the close code for outages
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectionStage {
    Connect,
    Message,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Rejection {
    pub code: RejectionCode,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_after_ms: Option<u64>,
    pub message: String,
    /// Transport close code; not part of the JSON body
    #[serde(skip)]
    pub close_code: u16,
    /// Internal reason the rejection was built from
    #[serde(skip)]
    pub reason: RejectReason,
}

impl Rejection {
    /// Client-facing rejection for an internal reason. Never carries store
    /// details.
    pub fn from_reason(reason: RejectReason, retry_after_ms: Option<u64>, stage: RejectionStage) -> Self {
        let (code, message, close_code) = match reason {
            RejectReason::UserConnectionLimit => (
                RejectionCode::ConnectionLimitExceeded,
                "Too many concurrent connections for this account",
                CLOSE_CONNECTION_LIMIT,
            ),
            RejectReason::IpConnectionLimit => (
                RejectionCode::ConnectionLimitExceeded,
                "Too many concurrent connections from this address",
                CLOSE_CONNECTION_LIMIT,
            ),
            RejectReason::RoomFull => (
                RejectionCode::RoomFull,
                "Room is full",
                CLOSE_CONNECTION_LIMIT,
            ),
            RejectReason::RateLimited => (
                RejectionCode::RateLimitExceeded,
                "Too many messages, slow down",
                CLOSE_RATE_LIMIT,
            ),
            RejectReason::PayloadTooLarge => (
                RejectionCode::PayloadTooLarge,
                "Message exceeds the maximum allowed size",
                CLOSE_PAYLOAD_TOO_LARGE,
            ),
            RejectReason::StoreUnavailable => (
                RejectionCode::ServiceUnavailable,
                "Service temporarily unavailable, try again later",
                match stage {
                    RejectionStage::Connect => CLOSE_CONNECTION_LIMIT,
                    RejectionStage::Message => CLOSE_RATE_LIMIT,
                },
            ),
        };

        // Retry hints only make sense for rate limiting
        let retry_after_ms = match code {
            RejectionCode::RateLimitExceeded => Some(retry_after_ms.unwrap_or(0)),
            _ => None,
        };

        Self {
            code,
            retry_after_ms,
            message: message.to_string(),
            close_code,
            reason,
        }
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}
