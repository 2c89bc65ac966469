//! Errors shared by the group session drivers.

use thiserror::Error;
use veil_crypto::{KemError, PairwiseError, SenderKeyError};
use veil_proto::{IdentityId, ProtoError};

/// Errors from group session operations.
///
/// Failed operations leave the session state unchanged, so callers may
/// retry or surface the error without tearing the session down.
#[derive(Debug, Error)]
pub enum SessionError {
    /// The named identity is not a member of this group.
    #[error("member not found: {id}")]
    MemberNotFound {
        /// The identity that was looked up.
        id: IdentityId,
    },

    /// A ciphertext arrived from a sender we hold no key material for.
    #[error("no session for sender: {id}")]
    SenderUnknown {
        /// The sending identity.
        id: IdentityId,
    },

    /// The named chatbot has no node in the external tree.
    #[error("chatbot not found: {id}")]
    ChatbotNotFound {
        /// The chatbot identity.
        id: IdentityId,
    },

    /// A chatbot node with this identity already exists.
    #[error("chatbot already joined: {id}")]
    DuplicateChatbot {
        /// The chatbot identity.
        id: IdentityId,
    },

    /// The operation requires an external tree that was never set up.
    #[error("external tree not initialized")]
    TreeMissing,

    /// A cryptographic operation failed.
    #[error("crypto error: {0}")]
    Crypto(String),

    /// Wire encoding or decoding failed.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Symmetric ratchet failure.
    #[error(transparent)]
    Ratchet(#[from] SenderKeyError),

    /// Pairwise session failure.
    #[error(transparent)]
    Pairwise(#[from] PairwiseError),

    /// KEM failure in the external tree layer.
    #[error(transparent)]
    Kem(#[from] KemError),

    /// Wire codec failure.
    #[error(transparent)]
    Proto(#[from] ProtoError),
}
