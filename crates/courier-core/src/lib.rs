//! # courier-core
//!
//! Connection registry, rooms, presence, and message delivery for the
//! Courier realtime chat core.
//!
//! This crate provides the fundamental building blocks:
//!
//! - **ConnectionRegistry** - Live connections per user; presence is derived
//!   from it, never stored separately
//! - **RoomManager** - Canonical pairwise rooms and joined connections
//! - **PresenceTracker** - Online/offline and typing fan-out to room peers
//! - **DeliveryPipeline** - Validate, persist, then broadcast messages
//! - **ReadStateSync** / **ConversationAggregator** - Read flags and the
//!   derived inbox view
//! - **MessageStore** - Persistence boundary with an in-memory reference
//!   implementation
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐     ┌──────────────┐     ┌─────────────┐
//! │  Connection │────▶│ RoomManager  │────▶│  Delivery   │
//! │  Registry   │     │              │     │  Pipeline   │
//! └─────────────┘     └──────────────┘     └──────┬──────┘
//!        │                   │                    ▼
//!        ▼                   ▼             ┌─────────────┐
//! ┌──────────────────────────────┐         │ MessageStore│
//! │       PresenceTracker        │         └─────────────┘
//! └──────────────────────────────┘
//! ```

pub mod conversation;
pub mod error;
pub mod pipeline;
pub mod presence;
pub mod read_state;
pub mod registry;
pub mod room;
pub mod store;

pub use conversation::{ConversationAggregator, ConversationSummary};
pub use error::ChatError;
pub use pipeline::DeliveryPipeline;
pub use presence::PresenceTracker;
pub use read_state::ReadStateSync;
pub use registry::{ConnectionId, ConnectionRegistry, Outbound, Registration, Unregistered};
pub use room::{RoomKey, RoomManager, RoomManagerConfig};
pub use store::{MemoryStore, MessageDraft, MessageStore, StoreError};
