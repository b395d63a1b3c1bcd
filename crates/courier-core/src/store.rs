//! Message persistence boundary for Courier.
//!
//! The store is the single source of truth for messages and must provide
//! read-your-writes: an acknowledged append is visible to every subsequent
//! read. [`MemoryStore`] is the in-process reference implementation; a
//! database-backed store plugs in behind the same trait.

use async_trait::async_trait;
use courier_protocol::{Attachment, Message, UserId};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;
use tokio::sync::RwLock;

/// Store errors.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The backing store failed.
    #[error("Store backend error: {0}")]
    Backend(String),
}

/// A message about to be persisted.
///
/// The store assigns `id`, `read = false`, and `created_at`.
#[derive(Debug, Clone)]
pub struct MessageDraft {
    /// Sending user.
    pub from: UserId,
    /// Receiving user.
    pub to: UserId,
    /// Text content, already validated non-empty if present.
    pub content: Option<String>,
    /// Hosted attachment metadata.
    pub attachment: Option<Attachment>,
}

/// Persistence contract for the chat core.
#[async_trait]
pub trait MessageStore: Send + Sync {
    /// Persist a new message, assigning its ordering key.
    ///
    /// The returned message is durable before this call resolves; the
    /// delivery pipeline relies on that for its persist-then-broadcast
    /// guarantee.
    async fn append(&self, draft: MessageDraft) -> Result<Message, StoreError>;

    /// All messages between `a` and `b`, in persisted order.
    async fn conversation(&self, a: &str, b: &str) -> Result<Vec<Message>, StoreError>;

    /// All messages sent or received by `user`, in persisted order.
    async fn messages_for(&self, user: &str) -> Result<Vec<Message>, StoreError>;

    /// Mark every unread message from `other` to `current` as read.
    ///
    /// Returns the number of messages updated. Idempotent.
    async fn mark_read(&self, current: &str, other: &str) -> Result<usize, StoreError>;

    /// Count of unread messages from `counterpart` to `user`.
    async fn unread_count(&self, user: &str, counterpart: &str) -> Result<u64, StoreError>;
}

/// In-memory message store.
///
/// Append-only; `read` is the only field ever mutated.
pub struct MemoryStore {
    messages: RwLock<Vec<Message>>,
    next_id: AtomicU64,
}

impl MemoryStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self {
            messages: RwLock::new(Vec::new()),
            next_id: AtomicU64::new(1),
        }
    }

    fn now_millis() -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as u64
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MessageStore for MemoryStore {
    async fn append(&self, draft: MessageDraft) -> Result<Message, StoreError> {
        let mut messages = self.messages.write().await;
        // Id assignment happens inside the write critical section so that
        // id order always equals append order.
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let message = Message {
            id,
            from: draft.from,
            to: draft.to,
            content: draft.content,
            attachment: draft.attachment,
            read: false,
            created_at: Self::now_millis(),
        };
        messages.push(message.clone());
        Ok(message)
    }

    async fn conversation(&self, a: &str, b: &str) -> Result<Vec<Message>, StoreError> {
        let messages = self.messages.read().await;
        Ok(messages
            .iter()
            .filter(|m| (m.from == a && m.to == b) || (m.from == b && m.to == a))
            .cloned()
            .collect())
    }

    async fn messages_for(&self, user: &str) -> Result<Vec<Message>, StoreError> {
        let messages = self.messages.read().await;
        Ok(messages
            .iter()
            .filter(|m| m.from == user || m.to == user)
            .cloned()
            .collect())
    }

    async fn mark_read(&self, current: &str, other: &str) -> Result<usize, StoreError> {
        let mut messages = self.messages.write().await;
        let mut updated = 0;
        for message in messages.iter_mut() {
            if message.from == other && message.to == current && !message.read {
                message.read = true;
                updated += 1;
            }
        }
        Ok(updated)
    }

    async fn unread_count(&self, user: &str, counterpart: &str) -> Result<u64, StoreError> {
        let messages = self.messages.read().await;
        Ok(messages
            .iter()
            .filter(|m| m.from == counterpart && m.to == user && !m.read)
            .count() as u64)
    }
}
