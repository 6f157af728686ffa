use std::sync::Arc;

use crate::constants::NS_ROOM;
use crate::error::Result;
use crate::storage::traits::CounterStore;

/// Result of a join attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JoinOutcome {
    pub joined: bool,
    pub current_size: usize,
}

/// Bounded membership sets per room, kept in the shared store
#[derive(Clone)]
pub struct RoomRegistry {
    store: Arc<dyn CounterStore>,
}

impl RoomRegistry {
    pub fn new(store: Arc<dyn CounterStore>) -> Self {
        Self { store }
    }

    fn key(room_id: &str) -> String {
        format!("{}:{}", NS_ROOM, room_id)
    }

    /// Adds a connection to a room if the room holds fewer than `max_members`.
    ///
    /// Capacity check and insertion are one store operation (TOCTOU-safe).
    pub async fn try_join(&self, room_id: &str, connection_id: &str, max_members: usize) -> Result<JoinOutcome> {
        let outcome = self
            .store
            .set_add_bounded(&Self::key(room_id), connection_id, max_members)
            .await?;

        if !outcome.added {
            log::debug!(
                "Room {} is full ({}/{}), rejected {}",
                room_id,
                outcome.size,
                max_members,
                connection_id
            );
        }

        Ok(JoinOutcome {
            joined: outcome.added,
            current_size: outcome.size,
        })
    }

    /// Removes a connection from a room. Safe to call repeatedly, and for
    /// connections that never joined.
    pub async fn leave(&self, room_id: &str, connection_id: &str) -> Result<bool> {
        self.store.set_remove(&Self::key(room_id), connection_id).await
    }

    /// Returns the number of members in the room
    pub async fn member_count(&self, room_id: &str) -> Result<usize> {
        self.store.set_size(&Self::key(room_id)).await
    }
}
