//! Service error types.

use thiserror::Error;

use veil_proto::IdentityId;

/// Errors returned by the routing service.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ServiceError {
    /// A referenced identity, group, or stored key does not exist.
    #[error("{what} not found: {id}")]
    NotFound {
        /// What kind of thing was looked up.
        what: &'static str,
        /// The id that missed.
        id: String,
    },

    /// The recipient's mailbox is at capacity. The item was rejected;
    /// nothing was dropped from the queue.
    #[error("mailbox full: {id}")]
    MailboxFull {
        /// Owner of the full mailbox.
        id: IdentityId,
    },

    /// The caller asked for something the service cannot be configured
    /// to do, such as a pseudonymous chatbot outside the external
    /// key-agreement path.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// The caller violated the service protocol, such as subscribing to
    /// the same stream twice.
    #[error("protocol error: {0}")]
    Protocol(String),
}

impl ServiceError {
    /// Shorthand for a [`ServiceError::NotFound`] over an identity id.
    pub(crate) fn not_found(what: &'static str, id: &IdentityId) -> Self {
        Self::NotFound { what, id: id.as_str().to_owned() }
    }
}
