//! Sender key error types.

use thiserror::Error;

/// Errors from sender key ratchets and sessions.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum SenderKeyError {
    /// The ratchet generation counter would overflow.
    #[error("ratchet generation overflow at {current}")]
    GenerationOverflow {
        /// Current generation when overflow was detected.
        current: u32,
    },

    /// The requested generation is behind the ratchet or too far ahead.
    #[error("ratchet at generation {current} cannot produce key for {requested}")]
    RatchetOutOfRange {
        /// Current ratchet generation.
        current: u32,
        /// Requested generation.
        requested: u32,
    },

    /// A message key for this generation was already handed out and used.
    #[error("message key for generation {generation} already consumed")]
    KeyConsumed {
        /// The consumed generation.
        generation: u32,
    },

    /// AEAD authentication failed.
    #[error("decryption failed: {reason}")]
    DecryptionFailed {
        /// Human-readable failure reason.
        reason: String,
    },
}
