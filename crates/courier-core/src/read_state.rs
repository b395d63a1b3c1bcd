//! Read-state synchronization for Courier.
//!
//! Thin layer over the message store that flips `read` flags and answers
//! unread counts. It is the only writer of the `read` field.

use crate::error::ChatError;
use crate::store::MessageStore;
use std::sync::Arc;
use tracing::debug;

/// Marks messages read and computes unread counts.
pub struct ReadStateSync {
    store: Arc<dyn MessageStore>,
}

impl ReadStateSync {
    /// Create a synchronizer over the given store.
    #[must_use]
    pub fn new(store: Arc<dyn MessageStore>) -> Self {
        Self { store }
    }

    /// Mark every unread message from `other_user` to `current_user` as
    /// read. Idempotent; returns the number of messages updated.
    ///
    /// # Errors
    ///
    /// Returns `ChatError::Persistence` if the store fails.
    pub async fn mark_read(
        &self,
        current_user: &str,
        other_user: &str,
    ) -> Result<usize, ChatError> {
        let updated = self.store.mark_read(current_user, other_user).await?;
        if updated > 0 {
            debug!(user = %current_user, counterpart = %other_user, updated, "Marked messages read");
        }
        Ok(updated)
    }

    /// Count of unread messages from `counterpart` to `user`.
    ///
    /// # Errors
    ///
    /// Returns `ChatError::Persistence` if the store fails.
    pub async fn unread_count(&self, user: &str, counterpart: &str) -> Result<u64, ChatError> {
        Ok(self.store.unread_count(user, counterpart).await?)
    }
}
