//! Pairwise room management for Courier.
//!
//! A room is the conversation surface between exactly two users. Room keys
//! are canonical: the member pair is sorted before combining, so the room
//! derived from (A, B) and (B, A) is the same room.

use crate::error::ChatError;
use crate::registry::{ConnectionId, ConnectionRegistry};
use dashmap::{DashMap, DashSet};
use std::fmt;
use std::sync::Arc;
use tracing::debug;

/// Canonical identifier for a pairwise conversation.
///
/// Invariant: `lo < hi`, both non-empty. Constructing a key from a user and
/// themselves is rejected; there are no self-chat rooms.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RoomKey {
    lo: String,
    hi: String,
}

impl RoomKey {
    /// Derive the canonical key for the unordered pair `{a, b}`.
    ///
    /// # Errors
    ///
    /// Returns `ChatError::Validation` for a self-chat pair or empty ids.
    pub fn new(a: &str, b: &str) -> Result<Self, ChatError> {
        if a.is_empty() || b.is_empty() {
            return Err(ChatError::Validation("user id cannot be empty"));
        }
        if a == b {
            return Err(ChatError::Validation("cannot open a room with yourself"));
        }
        let (lo, hi) = if a < b { (a, b) } else { (b, a) };
        Ok(Self {
            lo: lo.to_string(),
            hi: hi.to_string(),
        })
    }

    /// Whether `user_id` is one of the two members.
    #[must_use]
    pub fn contains(&self, user_id: &str) -> bool {
        self.lo == user_id || self.hi == user_id
    }

    /// The two member user ids, in canonical order.
    #[must_use]
    pub fn members(&self) -> (&str, &str) {
        (&self.lo, &self.hi)
    }

    /// The other member of the room, if `user_id` is a member.
    #[must_use]
    pub fn counterpart_of(&self, user_id: &str) -> Option<&str> {
        if self.lo == user_id {
            Some(&self.hi)
        } else if self.hi == user_id {
            Some(&self.lo)
        } else {
            None
        }
    }
}

impl fmt::Display for RoomKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.lo, self.hi)
    }
}

/// Room manager configuration.
#[derive(Debug, Clone)]
pub struct RoomManagerConfig {
    /// Maximum rooms a single connection may be joined to.
    pub max_rooms_per_connection: usize,
}

impl Default for RoomManagerConfig {
    fn default() -> Self {
        Self {
            max_rooms_per_connection: 100,
        }
    }
}

/// Tracks which connections are joined to which pairwise rooms.
pub struct RoomManager {
    registry: Arc<ConnectionRegistry>,
    /// Joined connection ids per room.
    rooms: DashMap<RoomKey, DashSet<ConnectionId>>,
    /// Reverse index: rooms joined per connection.
    joined: DashMap<ConnectionId, DashSet<RoomKey>>,
    config: RoomManagerConfig,
}

impl RoomManager {
    /// Create a room manager with default configuration.
    #[must_use]
    pub fn new(registry: Arc<ConnectionRegistry>) -> Self {
        Self::with_config(registry, RoomManagerConfig::default())
    }

    /// Create a room manager with custom configuration.
    #[must_use]
    pub fn with_config(registry: Arc<ConnectionRegistry>, config: RoomManagerConfig) -> Self {
        Self {
            registry,
            rooms: DashMap::new(),
            joined: DashMap::new(),
            config,
        }
    }

    /// Join the room for `{current_user, other_user}`.
    ///
    /// Returns the counterpart's derived online status, which feeds the
    /// `room_joined` handshake. Joining an already-joined room refreshes
    /// nothing and is not an error.
    ///
    /// # Errors
    ///
    /// Returns an error for self-chat pairs or when the connection's room
    /// limit is reached.
    pub fn join(
        &self,
        current_user: &str,
        other_user: &str,
        connection_id: &str,
    ) -> Result<bool, ChatError> {
        let key = RoomKey::new(current_user, other_user)?;

        let joined = self.joined.entry(connection_id.to_string()).or_default();
        if !joined.contains(&key) && joined.len() >= self.config.max_rooms_per_connection {
            return Err(ChatError::Limit("joined room limit reached"));
        }
        joined.insert(key.clone());
        drop(joined);

        self.rooms
            .entry(key.clone())
            .or_default()
            .insert(connection_id.to_string());

        debug!(room = %key, connection = %connection_id, "Joined room");

        Ok(self.registry.is_online(other_user))
    }

    /// Remove a connection from every room it joined.
    ///
    /// Rooms left without any joined connection are dropped.
    pub fn remove_connection(&self, connection_id: &str) {
        if let Some((_, keys)) = self.joined.remove(connection_id) {
            for key in keys.iter() {
                if let Some(members) = self.rooms.get(key.key()) {
                    members.remove(connection_id);
                }
                self.rooms.remove_if(key.key(), |_, members| members.is_empty());
            }
            debug!(connection = %connection_id, "Left all rooms");
        }
    }

    /// The connections currently joined to a room. May be empty.
    #[must_use]
    pub fn joined_connections(&self, key: &RoomKey) -> Vec<ConnectionId> {
        self.rooms
            .get(key)
            .map(|members| members.iter().map(|c| c.clone()).collect())
            .unwrap_or_default()
    }

    /// Whether a connection is joined to a room.
    #[must_use]
    pub fn is_joined(&self, connection_id: &str, key: &RoomKey) -> bool {
        self.rooms
            .get(key)
            .map(|members| members.contains(connection_id))
            .unwrap_or(false)
    }

    /// Every active room that has `user_id` as a member.
    #[must_use]
    pub fn rooms_with_member(&self, user_id: &str) -> Vec<RoomKey> {
        self.rooms
            .iter()
            .filter(|entry| entry.key().contains(user_id))
            .map(|entry| entry.key().clone())
            .collect()
    }

    /// Number of active rooms.
    #[must_use]
    pub fn room_count(&self) -> usize {
        self.rooms.len()
    }
}
