//! Message delivery pipeline for Courier.
//!
//! The pipeline validates a message, persists it, and only then fans it out
//! to every connection joined to the pairwise room. Persist-then-broadcast
//! is a hard ordering guarantee: no client may observe a message that is not
//! durably recorded.

use crate::error::ChatError;
use crate::registry::ConnectionRegistry;
use crate::room::{RoomKey, RoomManager};
use crate::store::{MessageDraft, MessageStore};
use courier_protocol::{Attachment, Message, ServerEvent};
use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::debug;

/// Validates, persists, and fans out direct messages.
pub struct DeliveryPipeline {
    registry: Arc<ConnectionRegistry>,
    rooms: Arc<RoomManager>,
    store: Arc<dyn MessageStore>,
    /// Per-room send locks. Serializing persist + fan-out per room makes the
    /// order both sides observe equal to persisted order; sends in unrelated
    /// rooms never contend. Entries are dropped once the last sender in the
    /// room releases them, so the map tracks rooms with sends in flight, not
    /// every room ever used.
    send_locks: DashMap<RoomKey, Arc<Mutex<()>>>,
}

impl DeliveryPipeline {
    /// Create a delivery pipeline.
    #[must_use]
    pub fn new(
        registry: Arc<ConnectionRegistry>,
        rooms: Arc<RoomManager>,
        store: Arc<dyn MessageStore>,
    ) -> Self {
        Self {
            registry,
            rooms,
            store,
            send_locks: DashMap::new(),
        }
    }

    /// Send a direct message from `from` to `to`.
    ///
    /// Content is trimmed; a message with neither trimmed content nor an
    /// attachment is rejected before any state mutation. On success the
    /// persisted message is returned and has been offered to every joined
    /// connection of both users. A recipient with no live joined connection
    /// simply picks the message up on its next history fetch.
    ///
    /// # Errors
    ///
    /// `ChatError::Validation` for empty messages or self-sends,
    /// `ChatError::Persistence` if the store write fails (nothing is
    /// broadcast in that case).
    pub async fn send(
        &self,
        from: &str,
        to: &str,
        content: Option<String>,
        attachment: Option<Attachment>,
    ) -> Result<Message, ChatError> {
        let key = RoomKey::new(from, to)?;

        let content = content
            .map(|c| c.trim().to_string())
            .filter(|c| !c.is_empty());
        if content.is_none() && attachment.is_none() {
            return Err(ChatError::Validation(
                "message needs content or an attachment",
            ));
        }

        let lock = self
            .send_locks
            .entry(key.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        let guard = lock.lock().await;

        let result = self
            .store
            .append(MessageDraft {
                from: from.to_string(),
                to: to.to_string(),
                content,
                attachment,
            })
            .await;

        let delivered = match &result {
            Ok(message) => self.fan_out(&key, message),
            Err(_) => 0,
        };

        drop(guard);
        drop(lock);
        // A strong count of one means only the map still holds the mutex:
        // no other sender has it and none can grab it mid-removal, because
        // cloning requires the same shard the removal locks.
        self.send_locks
            .remove_if(&key, |_, lock| Arc::strong_count(lock) == 1);

        let message = result?;
        debug!(room = %key, id = message.id, recipients = delivered, "Message delivered");

        Ok(message)
    }

    /// Offer a persisted message to every connection joined to the room.
    ///
    /// Covers multi-device senders and recipients alike. Returns how many
    /// connections accepted the event; the rest are delivery gaps.
    fn fan_out(&self, key: &RoomKey, message: &Message) -> usize {
        let mut delivered = 0;
        for connection_id in self.rooms.joined_connections(key) {
            let event = ServerEvent::new_message(message.clone());
            if self.registry.send_to(&connection_id, event) {
                delivered += 1;
            } else {
                debug!(room = %key, connection = %connection_id, "Delivery gap");
            }
        }
        delivered
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{MemoryStore, StoreError};
    use async_trait::async_trait;
    use courier_protocol::AttachmentKind;
    use tokio::sync::mpsc;

    struct Harness {
        registry: Arc<ConnectionRegistry>,
        rooms: Arc<RoomManager>,
        store: Arc<MemoryStore>,
        pipeline: DeliveryPipeline,
    }

    impl Harness {
        fn new() -> Self {
            let registry = Arc::new(ConnectionRegistry::new());
            let rooms = Arc::new(RoomManager::new(registry.clone()));
            let store = Arc::new(MemoryStore::new());
            let pipeline =
                DeliveryPipeline::new(registry.clone(), rooms.clone(), store.clone());
            Self {
                registry,
                rooms,
                store,
                pipeline,
            }
        }

        fn connect_and_join(
            &self,
            conn: &str,
            user: &str,
            other: &str,
        ) -> mpsc::UnboundedReceiver<ServerEvent> {
            let (tx, rx) = mpsc::unbounded_channel();
            self.registry.register(conn, user, tx);
            self.rooms.join(user, other, conn).unwrap();
            rx
        }
    }

    fn received_message(event: ServerEvent) -> Message {
        match event {
            ServerEvent::NewMessage { message } => message,
            other => panic!("expected new_message, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_send_delivers_to_both_sides() {
        let h = Harness::new();
        let mut rx_a = h.connect_and_join("conn-a", "user-a", "user-b");
        let mut rx_b = h.connect_and_join("conn-b", "user-b", "user-a");

        let sent = h
            .pipeline
            .send("user-a", "user-b", Some("Hello".into()), None)
            .await
            .unwrap();

        let got_a = received_message(rx_a.try_recv().unwrap());
        let got_b = received_message(rx_b.try_recv().unwrap());
        assert_eq!(got_a, sent);
        assert_eq!(got_b, sent);
        assert_eq!(got_b.content.as_deref(), Some("Hello"));
        assert!(!got_b.read);
    }

    #[tokio::test]
    async fn test_empty_message_rejected_without_side_effects() {
        let h = Harness::new();
        let mut rx_b = h.connect_and_join("conn-b", "user-b", "user-a");

        let err = h
            .pipeline
            .send("user-a", "user-b", None, None)
            .await
            .unwrap_err();
        assert!(matches!(err, ChatError::Validation(_)));

        // Whitespace-only content counts as empty.
        let err = h
            .pipeline
            .send("user-a", "user-b", Some("   ".into()), None)
            .await
            .unwrap_err();
        assert!(matches!(err, ChatError::Validation(_)));

        assert!(h
            .store
            .conversation("user-a", "user-b")
            .await
            .unwrap()
            .is_empty());
        assert!(rx_b.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_attachment_only_message_delivers() {
        let h = Harness::new();
        let mut rx_b = h.connect_and_join("conn-b", "user-b", "user-a");

        let attachment = Attachment::new(AttachmentKind::Image, "/files/x.png", "x.png");
        let sent = h
            .pipeline
            .send("user-a", "user-b", None, Some(attachment.clone()))
            .await
            .unwrap();

        assert!(sent.content.is_none());
        let got = received_message(rx_b.try_recv().unwrap());
        assert_eq!(got.attachment, Some(attachment));
    }

    #[tokio::test]
    async fn test_offline_recipient_still_persists() {
        let h = Harness::new();

        // Nobody is connected at all; send still succeeds.
        let sent = h
            .pipeline
            .send("user-a", "user-b", Some("catch up later".into()), None)
            .await
            .unwrap();

        let stored = h.store.conversation("user-a", "user-b").await.unwrap();
        assert_eq!(stored, vec![sent]);
    }

    #[tokio::test]
    async fn test_both_sides_observe_persisted_order() {
        let h = Harness::new();
        let mut rx_a = h.connect_and_join("conn-a", "user-a", "user-b");
        let mut rx_b = h.connect_and_join("conn-b", "user-b", "user-a");

        for text in ["one", "two", "three", "four"] {
            let (from, to) = if text.len() % 2 == 0 {
                ("user-a", "user-b")
            } else {
                ("user-b", "user-a")
            };
            h.pipeline
                .send(from, to, Some(text.into()), None)
                .await
                .unwrap();
        }

        let order_a: Vec<u64> = std::iter::from_fn(|| rx_a.try_recv().ok())
            .map(|e| received_message(e).id)
            .collect();
        let order_b: Vec<u64> = std::iter::from_fn(|| rx_b.try_recv().ok())
            .map(|e| received_message(e).id)
            .collect();

        let persisted: Vec<u64> = h
            .store
            .conversation("user-a", "user-b")
            .await
            .unwrap()
            .iter()
            .map(|m| m.id)
            .collect();

        assert_eq!(order_a, persisted);
        assert_eq!(order_b, persisted);
    }

    #[tokio::test]
    async fn test_self_send_rejected() {
        let h = Harness::new();
        let err = h
            .pipeline
            .send("user-a", "user-a", Some("hi me".into()), None)
            .await
            .unwrap_err();
        assert!(matches!(err, ChatError::Validation(_)));
    }

    struct FailingStore;

    #[async_trait]
    impl MessageStore for FailingStore {
        async fn append(&self, _draft: MessageDraft) -> Result<Message, StoreError> {
            Err(StoreError::Backend("disk on fire".into()))
        }

        async fn conversation(&self, _a: &str, _b: &str) -> Result<Vec<Message>, StoreError> {
            Ok(Vec::new())
        }

        async fn messages_for(&self, _user: &str) -> Result<Vec<Message>, StoreError> {
            Ok(Vec::new())
        }

        async fn mark_read(&self, _current: &str, _other: &str) -> Result<usize, StoreError> {
            Ok(0)
        }

        async fn unread_count(&self, _user: &str, _counterpart: &str) -> Result<u64, StoreError> {
            Ok(0)
        }
    }

    #[tokio::test]
    async fn test_store_failure_broadcasts_nothing() {
        let registry = Arc::new(ConnectionRegistry::new());
        let rooms = Arc::new(RoomManager::new(registry.clone()));
        let pipeline = DeliveryPipeline::new(registry.clone(), rooms.clone(), Arc::new(FailingStore));

        let (tx, mut rx) = mpsc::unbounded_channel();
        registry.register("conn-b", "user-b", tx);
        rooms.join("user-b", "user-a", "conn-b").unwrap();

        let err = pipeline
            .send("user-a", "user-b", Some("Hello".into()), None)
            .await
            .unwrap_err();
        assert!(matches!(err, ChatError::Persistence(_)));
        assert!(rx.try_recv().is_err());
        // A failed send does not leave its lock entry behind either.
        assert!(pipeline.send_locks.is_empty());
    }

    #[tokio::test]
    async fn test_send_locks_are_released_per_room() {
        let h = Harness::new();

        for other in ["user-b", "user-c", "user-d"] {
            h.pipeline
                .send("user-a", other, Some("hi".into()), None)
                .await
                .unwrap();
        }

        // Once no send is in flight the map holds nothing, however many
        // rooms have seen traffic.
        assert!(h.pipeline.send_locks.is_empty());
    }

    #[tokio::test]
    async fn test_multi_device_sender_sees_own_message() {
        let h = Harness::new();
        let mut rx_a1 = h.connect_and_join("conn-a1", "user-a", "user-b");
        let mut rx_a2 = h.connect_and_join("conn-a2", "user-a", "user-b");

        h.pipeline
            .send("user-a", "user-b", Some("from my phone".into()), None)
            .await
            .unwrap();

        // Both of A's devices see the send, keeping them consistent.
        assert!(rx_a1.try_recv().is_ok());
        assert!(rx_a2.try_recv().is_ok());
    }
}
