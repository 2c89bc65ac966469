//! Symmetric hash ratchet for forward-secure message key derivation.
//!
//! # Security Properties
//!
//! - Forward Secrecy: old chain keys are overwritten when advancing
//! - Key Uniqueness: each generation produces a unique message key
//! - Determinism: same seed always produces same key sequence

use hmac::{Hmac, Mac};
use sha2::Sha256;
use zeroize::Zeroize;

use super::error::SenderKeyError;

type HmacSha256 = Hmac<Sha256>;

/// Label for deriving the next chain key
const CHAIN_LABEL: &[u8] = b"chain";

/// Label for deriving a message key
const MESSAGE_LABEL: &[u8] = b"message";

/// A message key derived from the ratchet.
///
/// Used for a single message encryption or decryption, then discarded.
#[derive(Clone)]
pub struct MessageKey {
    /// The 32-byte symmetric key for XChaCha20-Poly1305
    key: [u8; 32],
    /// The generation (ratchet step) this key was derived from
    generation: u32,
}

impl MessageKey {
    /// 32-byte symmetric key for XChaCha20-Poly1305 AEAD.
    pub fn key(&self) -> &[u8; 32] {
        &self.key
    }

    /// Ratchet generation this key was derived from.
    pub fn generation(&self) -> u32 {
        self.generation
    }
}

impl Drop for MessageKey {
    fn drop(&mut self) {
        self.key.zeroize();
    }
}

/// Forward-secure symmetric ratchet.
///
/// Derives a sequence of message keys from an initial chain key. Each
/// [`advance()`](Self::advance) call:
/// 1. Derives a message key from the current chain key
/// 2. Derives the next chain key
/// 3. Overwrites the old chain key (forward secrecy)
pub struct SymmetricRatchet {
    /// Current chain key (32 bytes)
    chain_key: [u8; 32],
    /// Current generation (number of `advance()` calls)
    generation: u32,
}

impl SymmetricRatchet {
    /// Create a new ratchet from a seed.
    ///
    /// The seed becomes the initial chain key (generation 0).
    pub fn new(seed: &[u8; 32]) -> Self {
        Self { chain_key: *seed, generation: 0 }
    }

    /// Resume a ratchet from an exported chain key and generation.
    ///
    /// Used by receivers initializing from a distributed sender key whose
    /// chain had already advanced past generation 0.
    pub fn resume(chain_key: &[u8; 32], generation: u32) -> Self {
        Self { chain_key: *chain_key, generation }
    }

    /// Current generation number.
    pub fn generation(&self) -> u32 {
        self.generation
    }

    /// Current chain key, for exporting a distributable sender key.
    pub(crate) fn chain_key(&self) -> &[u8; 32] {
        &self.chain_key
    }

    /// Advance the ratchet and derive the next message key.
    ///
    /// Returns the message key for the current generation.
    pub fn advance(&mut self) -> Result<MessageKey, SenderKeyError> {
        if self.generation == u32::MAX {
            return Err(SenderKeyError::GenerationOverflow { current: self.generation });
        }

        let message_key = self.derive_message_key();
        let next_chain_key = self.derive_next_chain_key();

        // Zeroize and replace the old chain key for forward secrecy
        self.chain_key.zeroize();
        self.chain_key = next_chain_key;

        let current_gen = self.generation;
        self.generation = self.generation.wrapping_add(1);

        Ok(MessageKey { key: message_key, generation: current_gen })
    }

    /// Derive the message key from the current chain key.
    fn derive_message_key(&self) -> [u8; 32] {
        let Ok(mut mac) = HmacSha256::new_from_slice(&self.chain_key) else {
            unreachable!("HMAC-SHA256 accepts any key size");
        };
        mac.update(MESSAGE_LABEL);
        let result = mac.finalize().into_bytes();

        let mut key = [0u8; 32];
        key.copy_from_slice(&result);
        key
    }

    /// Derive the next chain key from the current chain key.
    fn derive_next_chain_key(&self) -> [u8; 32] {
        let Ok(mut mac) = HmacSha256::new_from_slice(&self.chain_key) else {
            unreachable!("HMAC-SHA256 accepts any key size");
        };
        mac.update(CHAIN_LABEL);
        let result = mac.finalize().into_bytes();

        let mut key = [0u8; 32];
        key.copy_from_slice(&result);
        key
    }
}

impl Drop for SymmetricRatchet {
    fn drop(&mut self) {
        self.chain_key.zeroize();
    }
}
