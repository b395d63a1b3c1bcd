//! Event types for the Courier protocol.
//!
//! Events are the fundamental unit of communication between chat clients and
//! the server. Each event is serialized using MessagePack for efficient
//! binary encoding.

use crate::version::{Version, PROTOCOL_VERSION};
use serde::{Deserialize, Serialize};

/// An opaque user identifier, issued by the identity collaborator.
pub type UserId = String;

/// Error codes carried by [`ServerEvent::Error`].
pub mod code {
    /// Frame could not be decoded into a known event.
    pub const MALFORMED: u16 = 1001;
    /// Request rejected before any state mutation.
    pub const VALIDATION: u16 = 1002;
    /// Referenced room or user pairing is unknown.
    pub const NOT_FOUND: u16 = 1003;
    /// Message store write failed; nothing was broadcast.
    pub const PERSISTENCE: u16 = 1004;
    /// A per-connection limit was exceeded.
    pub const LIMIT: u16 = 1005;
}

/// Attachment media kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AttachmentKind {
    Image,
    Video,
}

/// Metadata for an already-hosted attachment.
///
/// Uploads happen out of band through the file-upload collaborator; the chat
/// core only ever sees the resulting hosted location.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attachment {
    /// Media kind.
    #[serde(rename = "type")]
    pub kind: AttachmentKind,
    /// Hosted URL of the uploaded file.
    pub url: String,
    /// Original filename.
    pub filename: String,
}

impl Attachment {
    /// Create attachment metadata.
    #[must_use]
    pub fn new(kind: AttachmentKind, url: impl Into<String>, filename: impl Into<String>) -> Self {
        Self {
            kind,
            url: url.into(),
            filename: filename.into(),
        }
    }
}

/// A persisted direct message.
///
/// `id` is the server-assigned ordering key: within one conversation,
/// ascending ids are persisted order. `read` is the only mutable field and is
/// flipped exclusively by the read-state synchronizer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Monotonically increasing message identifier.
    pub id: u64,
    /// Sending user.
    pub from: UserId,
    /// Receiving user.
    pub to: UserId,
    /// Text content, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    /// Hosted attachment, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub attachment: Option<Attachment>,
    /// Whether the recipient has read the message.
    pub read: bool,
    /// Creation time in unix milliseconds.
    pub created_at: u64,
}

/// An event sent by a client to the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ClientEvent {
    /// Bind this connection to a user, establishing presence.
    #[serde(rename = "register_user")]
    RegisterUser {
        /// Claimed user identity (trusted, see identity collaborator notes).
        user_id: UserId,
        /// Client protocol version, checked against [`PROTOCOL_VERSION`].
        /// Clients that omit it are assumed compatible.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        version: Option<Version>,
    },

    /// Join the pairwise room shared with another user.
    #[serde(rename = "join_room")]
    JoinRoom {
        /// The joining user.
        current_user_id: UserId,
        /// The conversation counterpart.
        other_user_id: UserId,
    },

    /// Send a direct message.
    #[serde(rename = "send_message")]
    SendMessage {
        /// Sending user.
        from: UserId,
        /// Receiving user.
        to: UserId,
        /// Text content.
        #[serde(skip_serializing_if = "Option::is_none")]
        content: Option<String>,
        /// Already-hosted attachment metadata.
        #[serde(skip_serializing_if = "Option::is_none")]
        attachment: Option<Attachment>,
    },

    /// The sender started typing toward `to`.
    #[serde(rename = "typing")]
    Typing {
        /// Typing user.
        from: UserId,
        /// Conversation counterpart.
        to: UserId,
    },

    /// The sender stopped typing toward `to`.
    #[serde(rename = "stop_typing")]
    StopTyping {
        /// Formerly typing user.
        from: UserId,
        /// Conversation counterpart.
        to: UserId,
    },

    /// Keepalive ping.
    #[serde(rename = "ping")]
    Ping {
        /// Optional timestamp echoed back in the pong.
        #[serde(skip_serializing_if = "Option::is_none")]
        timestamp: Option<u64>,
    },
}

/// An event sent by the server to a client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ServerEvent {
    /// Connection established handshake.
    #[serde(rename = "connected")]
    Connected {
        /// Unique connection identifier.
        connection_id: String,
        /// Recommended heartbeat interval in milliseconds.
        heartbeat: u32,
        /// Server protocol version.
        version: Version,
    },

    /// Confirmation of a `join_room` request.
    #[serde(rename = "room_joined")]
    RoomJoined {
        /// Whether the conversation counterpart is currently reachable.
        other_user_online: bool,
    },

    /// A message was persisted and is being fanned out to the room.
    #[serde(rename = "new_message")]
    NewMessage {
        /// The persisted message.
        message: Message,
    },

    /// The room peer started typing.
    #[serde(rename = "user_typing")]
    UserTyping {},

    /// The room peer stopped typing.
    #[serde(rename = "user_stop_typing")]
    UserStopTyping {},

    /// A user sharing an active room came online.
    #[serde(rename = "user_online")]
    UserOnline {
        /// The user that came online.
        user_id: UserId,
    },

    /// A user sharing an active room went offline.
    #[serde(rename = "user_offline")]
    UserOffline {
        /// The user that went offline.
        user_id: UserId,
    },

    /// A request from this connection failed.
    #[serde(rename = "error")]
    Error {
        /// Error code, see [`code`].
        code: u16,
        /// Human-readable error message.
        message: String,
    },

    /// Keepalive pong.
    #[serde(rename = "pong")]
    Pong {
        /// Echoed timestamp from the ping.
        #[serde(skip_serializing_if = "Option::is_none")]
        timestamp: Option<u64>,
    },
}

impl ServerEvent {
    /// Create a new Connected handshake event carrying the server's
    /// protocol version.
    #[must_use]
    pub fn connected(connection_id: impl Into<String>, heartbeat: u32) -> Self {
        ServerEvent::Connected {
            connection_id: connection_id.into(),
            heartbeat,
            version: PROTOCOL_VERSION,
        }
    }

    /// Create a new RoomJoined event.
    #[must_use]
    pub fn room_joined(other_user_online: bool) -> Self {
        ServerEvent::RoomJoined { other_user_online }
    }

    /// Create a new NewMessage event.
    #[must_use]
    pub fn new_message(message: Message) -> Self {
        ServerEvent::NewMessage { message }
    }

    /// Create a new Error event.
    #[must_use]
    pub fn error(code: u16, message: impl Into<String>) -> Self {
        ServerEvent::Error {
            code,
            message: message.into(),
        }
    }

    /// Create a new Pong event.
    #[must_use]
    pub fn pong(timestamp: Option<u64>) -> Self {
        ServerEvent::Pong { timestamp }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_attachment_kind_wire_names() {
        let att = Attachment::new(AttachmentKind::Image, "/files/x.png", "x.png");
        let json = serde_json::to_value(&att).unwrap();
        assert_eq!(json["type"], "image");
        assert_eq!(json["url"], "/files/x.png");
    }

    #[test]
    fn test_send_message_omits_absent_fields() {
        let event = ClientEvent::SendMessage {
            from: "a".into(),
            to: "b".into(),
            content: Some("hi".into()),
            attachment: None,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "send_message");
        assert!(json.get("attachment").is_none());
    }

    #[test]
    fn test_connected_carries_protocol_version() {
        let event = ServerEvent::connected("conn-1", 30_000);
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["version"]["major"], PROTOCOL_VERSION.major);
        assert_eq!(json["version"]["minor"], PROTOCOL_VERSION.minor);
    }

    #[test]
    fn test_register_user_version_is_optional() {
        // Older clients omit the field entirely.
        let json = serde_json::json!({
            "type": "register_user",
            "user_id": "user-a",
        });
        let event: ClientEvent = serde_json::from_value(json).unwrap();
        assert_eq!(
            event,
            ClientEvent::RegisterUser {
                user_id: "user-a".into(),
                version: None,
            }
        );
    }

    #[test]
    fn test_server_event_constructors() {
        assert_eq!(
            ServerEvent::room_joined(true),
            ServerEvent::RoomJoined {
                other_user_online: true
            }
        );
        match ServerEvent::error(code::VALIDATION, "empty message") {
            ServerEvent::Error { code: c, .. } => assert_eq!(c, code::VALIDATION),
            other => panic!("unexpected event: {other:?}"),
        }
    }
}
