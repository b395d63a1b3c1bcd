//! Error taxonomy shared by the chat core.

use crate::store::StoreError;
use courier_protocol::events::code;
use thiserror::Error;

/// Chat core errors.
///
/// Every error is reported to the originating connection only; none of them
/// disturb registry or room state held for other connections.
#[derive(Debug, Error)]
pub enum ChatError {
    /// Request rejected before any state mutation.
    #[error("Validation failed: {0}")]
    Validation(&'static str),

    /// Operation referenced an unknown room or user pairing.
    #[error("Not found: {0}")]
    NotFound(String),

    /// A per-connection limit was exceeded.
    #[error("Limit exceeded: {0}")]
    Limit(&'static str),

    /// Message store failure. Nothing was broadcast.
    #[error("Persistence failure: {0}")]
    Persistence(#[from] StoreError),
}

impl ChatError {
    /// The wire error code for this error.
    #[must_use]
    pub fn code(&self) -> u16 {
        match self {
            ChatError::Validation(_) => code::VALIDATION,
            ChatError::NotFound(_) => code::NOT_FOUND,
            ChatError::Limit(_) => code::LIMIT,
            ChatError::Persistence(_) => code::PERSISTENCE,
        }
    }
}
