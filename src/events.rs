//! Structured enforcement events for the observability collaborator
//!
//! The core only emits events; persisting logs or metrics is the sink's job.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{HashMap, VecDeque};
use std::time::Duration;
use tokio::sync::RwLock;

use crate::core::admission::RejectReason;
use crate::core::connection::CloseReason;

/// Events emitted by the admission and rate-limiting core
#[derive(Debug, Clone, PartialEq)]
pub enum EnforcementEvent {
    ConnectionAdmitted {
        connection_id: String,
        room_id: String,
    },
    ConnectionRejected {
        room_id: String,
        reason: RejectReason,
    },
    MessageRateLimited {
        connection_id: String,
        retry_after_ms: u64,
    },
    PayloadRejected {
        connection_id: String,
        size: usize,
        max_bytes: usize,
    },
    StoreUnavailable {
        operation: &'static str,
        failed_open: bool,
    },
    ConnectionClosed {
        connection_id: String,
        reason: CloseReason,
    },
}

impl EnforcementEvent {
    /// Stable event name
    pub fn kind(&self) -> &'static str {
        match self {
            Self::ConnectionAdmitted { .. } => "connection_admitted",
            Self::ConnectionRejected { .. } => "connection_rejected",
            Self::MessageRateLimited { .. } => "message_rate_limited",
            Self::PayloadRejected { .. } => "payload_rejected",
            Self::StoreUnavailable { .. } => "store_unavailable",
            Self::ConnectionClosed { .. } => "connection_closed",
        }
    }
}

/// Receiver of enforcement events
#[async_trait]
pub trait EventSink: Send + Sync {
    async fn emit(&self, event: EnforcementEvent);
}

/// Event with timestamp
#[derive(Debug, Clone)]
pub struct RecordedEvent {
    pub event: EnforcementEvent,
    pub at: DateTime<Utc>,
}

/// Logs every event and keeps a bounded history with per-kind counts
pub struct EventRecorder {
    events: RwLock<VecDeque<RecordedEvent>>,
    event_counts: RwLock<HashMap<&'static str, usize>>,
    max_events: usize,
    alert_thresholds: HashMap<&'static str, usize>,
}

impl EventRecorder {
    pub fn new() -> Self {
        Self::with_capacity(10_000)
    }

    pub fn with_capacity(max_events: usize) -> Self {
        let mut alert_thresholds = HashMap::new();
        alert_thresholds.insert("store_unavailable", 10);
        alert_thresholds.insert("message_rate_limited", 100);
        alert_thresholds.insert("payload_rejected", 20);

        Self {
            events: RwLock::new(VecDeque::new()),
            event_counts: RwLock::new(HashMap::new()),
            max_events,
            alert_thresholds,
        }
    }

    /// Events recorded so far, oldest first
    pub async fn events(&self) -> Vec<EnforcementEvent> {
        self.events
            .read()
            .await
            .iter()
            .map(|recorded| recorded.event.clone())
            .collect()
    }

    /// Events recorded within the last `window`
    pub async fn recent_events(&self, window: Duration) -> Vec<RecordedEvent> {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(window).unwrap_or_else(|_| chrono::Duration::zero());
        self.events
            .read()
            .await
            .iter()
            .filter(|recorded| recorded.at >= cutoff)
            .cloned()
            .collect()
    }

    /// Total events of one kind since creation
    pub async fn count(&self, kind: &str) -> usize {
        *self.event_counts.read().await.get(kind).unwrap_or(&0)
    }

    pub async fn event_stats(&self) -> HashMap<&'static str, usize> {
        self.event_counts.read().await.clone()
    }

    fn log(event: &EnforcementEvent) {
        match event {
            EnforcementEvent::ConnectionAdmitted {
                connection_id,
                room_id,
            } => {
                log::info!("Connection admitted - Connection: {}, Room: {}", connection_id, room_id);
            }
            EnforcementEvent::ConnectionRejected { room_id, reason } => {
                log::warn!("Connection rejected - Room: {}, Reason: {}", room_id, reason);
            }
            EnforcementEvent::MessageRateLimited {
                connection_id,
                retry_after_ms,
            } => {
                log::warn!(
                    "Message rate limited - Connection: {}, Retry after: {}ms",
                    connection_id,
                    retry_after_ms
                );
            }
            EnforcementEvent::PayloadRejected {
                connection_id,
                size,
                max_bytes,
            } => {
                log::warn!(
                    "Payload rejected - Connection: {}, Size: {} bytes, Limit: {} bytes",
                    connection_id,
                    size,
                    max_bytes
                );
            }
            EnforcementEvent::StoreUnavailable {
                operation,
                failed_open,
            } => {
                let outcome = if *failed_open {
                    "enforcement skipped (fail-open)"
                } else {
                    "request rejected (fail-closed)"
                };
                log::error!("Counter store unavailable during {} - {}", operation, outcome);
            }
            EnforcementEvent::ConnectionClosed {
                connection_id,
                reason,
            } => {
                log::info!("Connection closed - Connection: {}, Reason: {}", connection_id, reason);
            }
        }
    }
}

impl Default for EventRecorder {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl EventSink for EventRecorder {
    async fn emit(&self, event: EnforcementEvent) {
        Self::log(&event);
        let kind = event.kind();

        {
            let mut counts = self.event_counts.write().await;
            let count = counts.entry(kind).or_insert(0);
            *count += 1;

            if let Some(&threshold) = self.alert_thresholds.get(kind) {
                if *count % threshold == 0 {
                    log::error!("ALERT: {} '{}' events recorded", count, kind);
                }
            }
        }

        let mut events = self.events.write().await;
        events.push_back(RecordedEvent {
            event,
            at: Utc::now(),
        });
        while events.len() > self.max_events {
            events.pop_front();
        }
    }
}
