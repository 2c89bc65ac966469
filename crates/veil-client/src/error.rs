//! Client error types.

use thiserror::Error;

use veil_core::SessionError;
use veil_crypto::{KemError, PairwiseError, SealedError};
use veil_proto::ProtoError;

/// Errors surfaced by the client orchestrator.
#[derive(Debug, Error)]
pub enum ClientError {
    /// A referenced peer, group, or key was never seen by this client.
    #[error("{what} not found: {id}")]
    NotFound {
        /// What kind of thing was looked up.
        what: &'static str,
        /// The id that missed.
        id: String,
    },

    /// A group session driver failed.
    #[error(transparent)]
    Session(#[from] SessionError),

    /// A pairwise session failed.
    #[error(transparent)]
    Pairwise(#[from] PairwiseError),

    /// A sealed chatbot envelope failed to open or verify.
    #[error(transparent)]
    Sealed(#[from] SealedError),

    /// A KEM handshake failed.
    #[error(transparent)]
    Kem(#[from] KemError),

    /// Wire encoding or decoding failed.
    #[error(transparent)]
    Proto(#[from] ProtoError),

    /// A lookup through the directory capability failed.
    #[error("directory error: {0}")]
    Directory(String),

    /// The outbox capability could not accept an envelope.
    #[error("transport error: {0}")]
    Transport(String),

    /// An inbound message or event violated the protocol this client
    /// expects, such as a welcome with no pending join.
    #[error("protocol error: {0}")]
    Protocol(String),
}

impl ClientError {
    pub(crate) fn not_found(what: &'static str, id: impl std::fmt::Display) -> Self {
        Self::NotFound { what, id: id.to_string() }
    }
}
