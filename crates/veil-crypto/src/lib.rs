//! Veil Cryptographic Primitives
//!
//! Cryptographic building blocks for Veil. Pure functions with
//! deterministic outputs. Callers provide random bytes for deterministic
//! testing.
//!
//! # Components
//!
//! - [`sealed`]: the fixed-wire-format AEAD envelope (AES-GCM plus
//!   optional detached Ed25519 signature) used for external-tree and
//!   chatbot traffic.
//! - [`sender_keys`]: forward-secure symmetric ratchets and the
//!   sending/receiving sessions behind sender-key fanout groups.
//! - [`pairwise`]: prekey-bundle session establishment and two-chain
//!   pairwise sessions with out-of-order tolerance.
//! - [`kem`]: ephemeral x25519 KEM and deterministic node keypair
//!   derivation for the external tree layer.
//!
//! # Security
//!
//! Forward Secrecy:
//! - Ratchet advancement: old chain keys are zeroized after deriving the
//!   next key
//! - Message key disposal: keys are zeroized after single use
//!
//! Authenticity:
//! - AEAD everywhere; failed authentication tags reject the message
//! - Sealed envelopes verify their detached signature before decrypting

#![forbid(unsafe_code)]
#![deny(missing_docs)]

mod error;
pub mod kem;
pub mod pairwise;
pub mod sealed;
pub mod sender_keys;

pub use error::{KemError, PairwiseError, SealedError};
pub use kem::{KemCiphertext, KemKeyPair, kem_open, kem_seal, signing_keypair_from_secret};
pub use pairwise::{PairwiseHandshake, PairwiseSession, PreKeyBundle};
pub use sealed::{IV_SIZE, SIG_FIELD_SIZE, SealedMessage, open, seal};
pub use sender_keys::{
    NONCE_RANDOM_SIZE, RatchetCiphertext, ReceivingSession, SenderKey, SenderKeyError,
    SendingSession, SymmetricRatchet,
};
