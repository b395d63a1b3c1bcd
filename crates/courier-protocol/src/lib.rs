//! # courier-protocol
//!
//! Wire protocol definitions for the Courier realtime chat core.
//!
//! This crate defines the binary protocol used between chat clients and
//! servers: typed client/server events, the shared message model, the
//! length-prefixed MessagePack codec, and protocol versioning.
//!
//! ## Event Types
//!
//! - `RegisterUser` / `JoinRoom` - Presence and room membership
//! - `SendMessage` / `NewMessage` - Direct message delivery
//! - `Typing` / `StopTyping` - Typing indicators
//! - `UserOnline` / `UserOffline` - Presence transitions
//!
//! ## Example
//!
//! ```rust
//! use courier_protocol::{codec, ClientEvent};
//!
//! let event = ClientEvent::RegisterUser {
//!     user_id: "user-a".into(),
//!     version: None,
//! };
//!
//! // Encode and decode
//! let encoded = codec::encode(&event).unwrap();
//! let decoded: ClientEvent = codec::decode(&encoded).unwrap();
//! assert_eq!(event, decoded);
//! ```

pub mod codec;
pub mod events;
pub mod version;

pub use codec::{decode, encode, ProtocolError};
pub use events::{Attachment, AttachmentKind, ClientEvent, Message, ServerEvent, UserId};
pub use version::{Version, PROTOCOL_VERSION};
