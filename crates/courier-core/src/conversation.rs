//! Conversation aggregation for Courier.
//!
//! Builds the inbox view: one entry per counterpart with the most recent
//! message and the unread count. A conversation is a derived projection over
//! the message history, never a stored entity, so it reflects the store
//! immediately after any send or mark-read commits.

use crate::error::ChatError;
use crate::store::MessageStore;
use courier_protocol::{Message, UserId};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

/// Inbox entry for a single counterpart.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationSummary {
    /// The other participant.
    pub counterpart: UserId,
    /// Most recent message in the conversation.
    pub last_message: Message,
    /// Unread messages from the counterpart.
    pub unread_count: u64,
}

/// Computes conversation summaries from the message store.
pub struct ConversationAggregator {
    store: Arc<dyn MessageStore>,
}

impl ConversationAggregator {
    /// Create an aggregator over the given store.
    #[must_use]
    pub fn new(store: Arc<dyn MessageStore>) -> Self {
        Self { store }
    }

    /// List all conversations touching `user_id`, most recent first.
    ///
    /// # Errors
    ///
    /// Returns `ChatError::Persistence` if the store fails.
    pub async fn list(&self, user_id: &str) -> Result<Vec<ConversationSummary>, ChatError> {
        let messages = self.store.messages_for(user_id).await?;

        let mut by_counterpart: HashMap<UserId, ConversationSummary> = HashMap::new();
        for message in messages {
            let counterpart = if message.from == user_id {
                message.to.clone()
            } else {
                message.from.clone()
            };
            let unread = u64::from(message.to == user_id && !message.read);

            match by_counterpart.get_mut(&counterpart) {
                Some(summary) => {
                    summary.unread_count += unread;
                    // messages_for returns persisted order, so the latest
                    // message always wins.
                    summary.last_message = message;
                }
                None => {
                    by_counterpart.insert(
                        counterpart.clone(),
                        ConversationSummary {
                            counterpart,
                            last_message: message,
                            unread_count: unread,
                        },
                    );
                }
            }
        }

        let mut summaries: Vec<ConversationSummary> = by_counterpart.into_values().collect();
        summaries.sort_by(|a, b| b.last_message.id.cmp(&a.last_message.id));
        Ok(summaries)
    }
}
