//! Presence and typing fan-out for Courier.
//!
//! Online/offline status is never stored here; it is derived from the
//! connection registry at the moment a transition is observed, and this
//! tracker only decides who hears about it: connections joined to a room
//! shared with the transitioning user. Typing state is ephemeral, held in
//! memory per (from, to) pair, and force-cleared when the typing user's
//! last connection drops.

use crate::error::ChatError;
use crate::registry::ConnectionRegistry;
use crate::room::{RoomKey, RoomManager};
use courier_protocol::{ServerEvent, UserId};
use dashmap::DashSet;
use std::sync::Arc;
use tracing::debug;

/// Broadcasts presence transitions and typing signals to room peers.
pub struct PresenceTracker {
    registry: Arc<ConnectionRegistry>,
    rooms: Arc<RoomManager>,
    /// Outstanding typing pairs, (typing user, counterpart).
    typing: DashSet<(UserId, UserId)>,
}

impl PresenceTracker {
    /// Create a presence tracker over the given registry and rooms.
    #[must_use]
    pub fn new(registry: Arc<ConnectionRegistry>, rooms: Arc<RoomManager>) -> Self {
        Self {
            registry,
            rooms,
            typing: DashSet::new(),
        }
    }

    /// Announce that a user came online to all of their active room peers.
    pub fn user_online(&self, user_id: &str) {
        self.broadcast_presence(
            user_id,
            ServerEvent::UserOnline {
                user_id: user_id.to_string(),
            },
        );
    }

    /// Announce that a user went offline to all of their active room peers.
    pub fn user_offline(&self, user_id: &str) {
        self.broadcast_presence(
            user_id,
            ServerEvent::UserOffline {
                user_id: user_id.to_string(),
            },
        );
    }

    /// Mark `from` as typing toward `to` and notify `to`'s room connections.
    ///
    /// Repeated typing signals are delivered again; clients treat them as
    /// level, not edge. The sender never receives its own typing echo.
    ///
    /// # Errors
    ///
    /// Returns `ChatError::Validation` for a self-typing pair.
    pub fn set_typing(&self, from: &str, to: &str) -> Result<(), ChatError> {
        let key = RoomKey::new(from, to)?;
        self.typing.insert((from.to_string(), to.to_string()));
        self.notify_peer(&key, to, ServerEvent::UserTyping {});
        Ok(())
    }

    /// Clear a typing pair and notify `to`'s room connections.
    ///
    /// Stop signals are edge-triggered: clearing a pair that was not typing
    /// emits nothing.
    ///
    /// # Errors
    ///
    /// Returns `ChatError::Validation` for a self-typing pair.
    pub fn clear_typing(&self, from: &str, to: &str) -> Result<(), ChatError> {
        let key = RoomKey::new(from, to)?;
        if self
            .typing
            .remove(&(from.to_string(), to.to_string()))
            .is_some()
        {
            self.notify_peer(&key, to, ServerEvent::UserStopTyping {});
        }
        Ok(())
    }

    /// Clear every outstanding typing pair held by a user.
    ///
    /// Called when the user's last connection drops, so a disconnect can
    /// never leave a stuck typing indicator on the peer's side.
    pub fn clear_user_typing(&self, user_id: &str) {
        let pairs: Vec<(UserId, UserId)> = self
            .typing
            .iter()
            .filter(|pair| pair.0 == user_id)
            .map(|pair| pair.clone())
            .collect();

        for (from, to) in pairs {
            if let Err(e) = self.clear_typing(&from, &to) {
                debug!(user = %user_id, error = %e, "Skipped invalid typing pair");
            }
        }
    }

    /// Whether `from` is currently marked as typing toward `to`.
    #[must_use]
    pub fn is_typing(&self, from: &str, to: &str) -> bool {
        self.typing
            .contains(&(from.to_string(), to.to_string()))
    }

    /// Deliver a presence event to every connection joined to a room that
    /// contains `user_id`, excluding that user's own connections.
    fn broadcast_presence(&self, user_id: &str, event: ServerEvent) {
        let mut delivered = 0usize;
        for key in self.rooms.rooms_with_member(user_id) {
            for connection_id in self.rooms.joined_connections(&key) {
                if self.registry.owner_of(&connection_id).as_deref() == Some(user_id) {
                    continue;
                }
                if self.registry.send_to(&connection_id, event.clone()) {
                    delivered += 1;
                }
            }
        }
        debug!(user = %user_id, delivered, "Presence transition broadcast");
    }

    /// Deliver a typing event to `peer`'s connections joined to the room.
    fn notify_peer(&self, key: &RoomKey, peer: &str, event: ServerEvent) {
        for connection_id in self.rooms.joined_connections(key) {
            if self.registry.owner_of(&connection_id).as_deref() == Some(peer) {
                self.registry.send_to(&connection_id, event.clone());
            }
        }
    }
}
