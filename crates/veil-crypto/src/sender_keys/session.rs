//! Sender key sessions: one sending chain per sender, one receiving chain
//! per observed sender.
//!
//! The sending session encrypts with its own ratchet and can export a
//! [`SenderKey`] snapshot for distribution. Receivers resume a ratchet
//! from that snapshot; skipped message keys are cached so messages can be
//! decrypted out of order within a bounded window.

use std::collections::HashMap;

use chacha20poly1305::{
    XChaCha20Poly1305, XNonce,
    aead::{Aead, KeyInit},
};
use serde::{Deserialize, Serialize};

use super::{
    error::SenderKeyError,
    ratchet::{MessageKey, SymmetricRatchet},
};

/// Size of the random suffix in the nonce (20 bytes after the generation).
pub const NONCE_RANDOM_SIZE: usize = 20;

/// Maximum number of generations a receiver will skip ahead.
const MAX_SKIP: u32 = 1000;

/// A distributable snapshot of a sending chain.
///
/// Receivers resume a ratchet from the chain key at the given generation;
/// messages older than the snapshot stay undecryptable (joining late does
/// not grant access to history).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SenderKey {
    /// Chain key at `generation`.
    pub chain_key: [u8; 32],
    /// Generation the chain key corresponds to.
    pub generation: u32,
}

/// A ciphertext produced by a ratchet session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RatchetCiphertext {
    /// Ratchet generation of the message key.
    pub generation: u32,
    /// 24-byte XChaCha20 nonce.
    pub nonce: [u8; 24],
    /// Ciphertext including the 16-byte Poly1305 tag.
    pub ciphertext: Vec<u8>,
}

/// Encrypting half of a sender key session.
pub struct SendingSession {
    ratchet: SymmetricRatchet,
}

impl SendingSession {
    /// Create a sending session from a fresh random seed.
    pub fn new(seed: &[u8; 32]) -> Self {
        Self { ratchet: SymmetricRatchet::new(seed) }
    }

    /// Export the current chain state for distribution to receivers.
    pub fn sender_key(&self) -> SenderKey {
        SenderKey {
            chain_key: *self.ratchet.chain_key(),
            generation: self.ratchet.generation(),
        }
    }

    /// Encrypt a message, advancing the ratchet.
    ///
    /// The caller provides the random nonce suffix (cryptographically
    /// secure in production, fixed in deterministic tests).
    pub fn encrypt(
        &mut self,
        plaintext: &[u8],
        random_suffix: [u8; NONCE_RANDOM_SIZE],
    ) -> Result<RatchetCiphertext, SenderKeyError> {
        let message_key = self.ratchet.advance()?;
        Ok(encrypt_with_key(plaintext, &message_key, random_suffix))
    }
}

/// Decrypting half of a sender key session, one per observed sender.
///
/// Caches message keys for skipped generations so out-of-order messages
/// decrypt without requiring their predecessors.
pub struct ReceivingSession {
    ratchet: SymmetricRatchet,
    skipped: HashMap<u32, MessageKey>,
}

impl ReceivingSession {
    /// Create a receiving session from a distributed sender key.
    pub fn new(sender_key: &SenderKey) -> Self {
        Self {
            ratchet: SymmetricRatchet::resume(&sender_key.chain_key, sender_key.generation),
            skipped: HashMap::new(),
        }
    }

    /// Decrypt a message at any generation within the skip window.
    ///
    /// # Errors
    ///
    /// - `KeyConsumed` if the generation's key was already used
    /// - `RatchetOutOfRange` if the generation is beyond the skip window
    /// - `DecryptionFailed` on authentication failure
    pub fn decrypt(&mut self, message: &RatchetCiphertext) -> Result<Vec<u8>, SenderKeyError> {
        let message_key = self.key_for(message.generation)?;
        decrypt_with_key(message, &message_key)
    }

    /// Produce the message key for `generation`, advancing and caching
    /// intermediate keys as needed.
    fn key_for(&mut self, generation: u32) -> Result<MessageKey, SenderKeyError> {
        if let Some(key) = self.skipped.remove(&generation) {
            return Ok(key);
        }

        if generation < self.ratchet.generation() {
            return Err(SenderKeyError::KeyConsumed { generation });
        }

        let skip_count = generation.wrapping_sub(self.ratchet.generation());
        if skip_count > MAX_SKIP {
            return Err(SenderKeyError::RatchetOutOfRange {
                current: self.ratchet.generation(),
                requested: generation,
            });
        }

        while self.ratchet.generation() < generation {
            let key = self.ratchet.advance()?;
            self.skipped.insert(key.generation(), key);
        }

        self.ratchet.advance()
    }
}

/// Encrypt with a specific message key using XChaCha20-Poly1305.
fn encrypt_with_key(
    plaintext: &[u8],
    message_key: &MessageKey,
    random_suffix: [u8; NONCE_RANDOM_SIZE],
) -> RatchetCiphertext {
    let nonce = build_nonce(message_key.generation(), random_suffix);
    let cipher = XChaCha20Poly1305::new(message_key.key().into());

    let Ok(ciphertext) = cipher.encrypt(XNonce::from_slice(&nonce), plaintext) else {
        unreachable!("XChaCha20-Poly1305 encryption cannot fail with valid inputs");
    };

    RatchetCiphertext { generation: message_key.generation(), nonce, ciphertext }
}

/// Decrypt with a specific message key.
fn decrypt_with_key(
    message: &RatchetCiphertext,
    message_key: &MessageKey,
) -> Result<Vec<u8>, SenderKeyError> {
    if message_key.generation() != message.generation {
        return Err(SenderKeyError::DecryptionFailed {
            reason: format!(
                "generation mismatch: key is {}, message is {}",
                message_key.generation(),
                message.generation
            ),
        });
    }

    let cipher = XChaCha20Poly1305::new(message_key.key().into());
    cipher
        .decrypt(XNonce::from_slice(&message.nonce), message.ciphertext.as_slice())
        .map_err(|_| SenderKeyError::DecryptionFailed {
            reason: "authentication failed".to_string(),
        })
}

/// Build a 24-byte nonce: generation (4 bytes, big-endian) then the
/// caller-provided random suffix.
fn build_nonce(generation: u32, random_suffix: [u8; NONCE_RANDOM_SIZE]) -> [u8; 24] {
    let mut nonce = [0u8; 24];
    nonce[0..4].copy_from_slice(&generation.to_be_bytes());
    nonce[4..24].copy_from_slice(&random_suffix);
    nonce
}
