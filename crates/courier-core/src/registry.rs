//! Connection registry for Courier.
//!
//! The registry owns every live connection: its user binding and the
//! outbound event channel used for fan-out. Presence is derived from the
//! registry rather than stored separately, so "user is online" is always
//! exactly "the registry holds at least one connection for them".

use courier_protocol::{ServerEvent, UserId};
use dashmap::{DashMap, DashSet};
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::sync::mpsc;
use tracing::debug;

/// A connection identifier.
pub type ConnectionId = String;

/// Outbound event channel for a single connection.
///
/// Unbounded so that fan-out never blocks the sending side; backpressure is
/// handled at the socket, where a closed receiver simply drops deliveries.
pub type Outbound = mpsc::UnboundedSender<ServerEvent>;

/// A connection removed from the registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Unregistered {
    /// The user the connection belonged to.
    pub user_id: UserId,
    /// Whether this was the user's last connection.
    pub went_offline: bool,
}

/// Result of a register call.
#[derive(Debug, Default)]
pub struct Registration {
    /// Whether the user transitioned offline to online.
    pub came_online: bool,
    /// A previous binding of the same connection that was displaced.
    pub displaced: Option<Unregistered>,
}

struct ConnectionHandle {
    user_id: UserId,
    connected_at: u64,
    outbound: Outbound,
}

/// The process-scoped connection registry.
pub struct ConnectionRegistry {
    /// Live connections indexed by connection id.
    connections: DashMap<ConnectionId, ConnectionHandle>,
    /// Connection ids grouped per user (multi-device / multi-tab).
    by_user: DashMap<UserId, DashSet<ConnectionId>>,
}

impl ConnectionRegistry {
    /// Create a new, empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self {
            connections: DashMap::new(),
            by_user: DashMap::new(),
        }
    }

    /// Bind a connection to a user, storing its outbound channel.
    ///
    /// Idempotent: re-registering an existing binding is a no-op with no
    /// presence transition. Re-registering under a different user displaces
    /// the previous binding first; the caller is responsible for acting on
    /// both transitions.
    pub fn register(
        &self,
        connection_id: &str,
        user_id: &str,
        outbound: Outbound,
    ) -> Registration {
        let mut displaced = None;
        if let Some(existing) = self.connections.get(connection_id) {
            if existing.user_id == user_id {
                return Registration::default();
            }
            drop(existing);
            displaced = self.unregister(connection_id);
        }

        let connected_at = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as u64;

        self.connections.insert(
            connection_id.to_string(),
            ConnectionHandle {
                user_id: user_id.to_string(),
                connected_at,
                outbound,
            },
        );

        let users = self.by_user.entry(user_id.to_string()).or_default();
        let came_online = users.is_empty();
        users.insert(connection_id.to_string());
        drop(users);

        debug!(connection = %connection_id, user = %user_id, came_online, "Connection registered");

        Registration {
            came_online,
            displaced,
        }
    }

    /// Remove a connection.
    ///
    /// Unknown connection ids are a no-op, which absorbs duplicate
    /// disconnect events.
    pub fn unregister(&self, connection_id: &str) -> Option<Unregistered> {
        let (_, handle) = self.connections.remove(connection_id)?;
        let user_id = handle.user_id;

        if let Some(users) = self.by_user.get(&user_id) {
            users.remove(connection_id);
        }
        let went_offline = self
            .by_user
            .remove_if(&user_id, |_, users| users.is_empty())
            .is_some();

        debug!(connection = %connection_id, user = %user_id, went_offline, "Connection unregistered");

        Some(Unregistered {
            user_id,
            went_offline,
        })
    }

    /// Whether a user has at least one live connection.
    #[must_use]
    pub fn is_online(&self, user_id: &str) -> bool {
        self.by_user
            .get(user_id)
            .map(|users| !users.is_empty())
            .unwrap_or(false)
    }

    /// The current set of live connections for a user. May be empty.
    #[must_use]
    pub fn connections_for(&self, user_id: &str) -> Vec<ConnectionId> {
        self.by_user
            .get(user_id)
            .map(|users| users.iter().map(|c| c.clone()).collect())
            .unwrap_or_default()
    }

    /// The user a connection is bound to.
    #[must_use]
    pub fn owner_of(&self, connection_id: &str) -> Option<UserId> {
        self.connections
            .get(connection_id)
            .map(|handle| handle.user_id.clone())
    }

    /// When a connection was registered, in unix milliseconds.
    #[must_use]
    pub fn connected_at(&self, connection_id: &str) -> Option<u64> {
        self.connections
            .get(connection_id)
            .map(|handle| handle.connected_at)
    }

    /// Deliver an event to a single connection.
    ///
    /// Returns `false` when the connection is unknown or its channel has
    /// closed; that is a delivery gap, not an error.
    pub fn send_to(&self, connection_id: &str, event: ServerEvent) -> bool {
        match self.connections.get(connection_id) {
            Some(handle) => handle.outbound.send(event).is_ok(),
            None => false,
        }
    }

    /// Registry statistics.
    #[must_use]
    pub fn stats(&self) -> RegistryStats {
        RegistryStats {
            connection_count: self.connections.len(),
            online_users: self.by_user.len(),
        }
    }
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Registry statistics.
#[derive(Debug, Clone)]
pub struct RegistryStats {
    /// Number of live connections.
    pub connection_count: usize,
    /// Number of users with at least one connection.
    pub online_users: usize,
}
