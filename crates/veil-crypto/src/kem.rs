//! Ephemeral KEM: encrypt a value to an x25519 public key.
//!
//! An ephemeral keypair performs a Diffie-Hellman agreement against the
//! recipient's public key; the shared secret is expanded with HKDF-SHA256
//! into an XChaCha20-Poly1305 key. This is the asymmetric building block
//! of the external tree layer: tree nodes are keyed by deriving keypairs
//! deterministically from node secrets.
//!
//! All functions take caller-provided randomness (ephemeral seeds and
//! nonces), matching the rest of this crate.

use hkdf::Hkdf;
use sha2::{Digest, Sha256};

use chacha20poly1305::{
    XChaCha20Poly1305, XNonce,
    aead::{Aead, KeyInit},
};
use ed25519_dalek::SigningKey;
use serde::{Deserialize, Serialize};
use x25519_dalek::{PublicKey, StaticSecret};

use super::error::KemError;

/// Domain separation for the KEM AEAD key.
const KEM_INFO: &[u8] = b"veil-kem-v1";

/// Domain separation prefix for signing keypair derivation.
const SIGNING_PREFIX: &[u8] = b"signing-";

/// An x25519 keypair derived from or generated for tree nodes.
#[derive(Clone)]
pub struct KemKeyPair {
    secret: StaticSecret,
    public: PublicKey,
}

impl KemKeyPair {
    /// Derive a keypair deterministically from a node secret.
    ///
    /// The secret is hashed so arbitrary-length secrets map onto valid
    /// scalars, and so the DH key is independent of the raw secret.
    pub fn from_secret(secret: &[u8]) -> Self {
        let digest: [u8; 32] = Sha256::digest(secret).into();
        let secret = StaticSecret::from(digest);
        let public = PublicKey::from(&secret);
        Self { secret, public }
    }

    /// Construct from raw private key bytes.
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        let secret = StaticSecret::from(bytes);
        let public = PublicKey::from(&secret);
        Self { secret, public }
    }

    /// Public key bytes.
    pub fn public_bytes(&self) -> [u8; 32] {
        self.public.to_bytes()
    }

    /// Private key bytes.
    pub fn private_bytes(&self) -> [u8; 32] {
        self.secret.to_bytes()
    }
}

/// Derive an Ed25519 signing keypair deterministically from a node secret.
///
/// Uses a domain-separated hash so the signing key is unrelated to the
/// node's DH keypair.
pub fn signing_keypair_from_secret(secret: &[u8]) -> SigningKey {
    let mut hasher = Sha256::new();
    hasher.update(SIGNING_PREFIX);
    hasher.update(secret);
    let digest: [u8; 32] = hasher.finalize().into();
    SigningKey::from_bytes(&digest)
}

/// A KEM ciphertext: ephemeral public key, nonce, and sealed value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KemCiphertext {
    /// Ephemeral x25519 public key.
    pub ephemeral_pub: [u8; 32],
    /// 24-byte XChaCha20 nonce.
    pub nonce: [u8; 24],
    /// Sealed value including the Poly1305 tag.
    pub ciphertext: Vec<u8>,
}

/// Seal a value to a recipient public key.
///
/// `ephemeral_seed` and `nonce` are caller-provided randomness.
pub fn kem_seal(
    value: &[u8],
    recipient_pub: &[u8; 32],
    ephemeral_seed: [u8; 32],
    nonce: [u8; 24],
) -> KemCiphertext {
    let ephemeral = StaticSecret::from(ephemeral_seed);
    let ephemeral_pub = PublicKey::from(&ephemeral).to_bytes();

    let shared = ephemeral.diffie_hellman(&PublicKey::from(*recipient_pub));
    let cipher = XChaCha20Poly1305::new(&aead_key(shared.as_bytes()).into());

    let Ok(ciphertext) = cipher.encrypt(XNonce::from_slice(&nonce), value) else {
        unreachable!("XChaCha20-Poly1305 encryption cannot fail with valid inputs");
    };

    KemCiphertext { ephemeral_pub, nonce, ciphertext }
}

/// Open a KEM ciphertext with the recipient keypair.
///
/// # Errors
///
/// Fails with `DecryptionFailed` if the ciphertext was not sealed to
/// this keypair or was tampered with.
pub fn kem_open(ciphertext: &KemCiphertext, recipient: &KemKeyPair) -> Result<Vec<u8>, KemError> {
    let shared = recipient.secret.diffie_hellman(&PublicKey::from(ciphertext.ephemeral_pub));
    let cipher = XChaCha20Poly1305::new(&aead_key(shared.as_bytes()).into());

    cipher
        .decrypt(XNonce::from_slice(&ciphertext.nonce), ciphertext.ciphertext.as_slice())
        .map_err(|_| KemError::DecryptionFailed)
}

/// Expand a DH shared secret into an AEAD key.
fn aead_key(shared: &[u8; 32]) -> [u8; 32] {
    let hkdf = Hkdf::<Sha256>::new(None, shared);
    let mut key = [0u8; 32];
    let Ok(()) = hkdf.expand(KEM_INFO, &mut key) else {
        unreachable!("32 bytes is a valid HKDF-SHA256 output length");
    };
    key
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seal_open_roundtrip() {
        let recipient = KemKeyPair::from_secret(b"node secret");
        let ct = kem_seal(b"tree leaf", &recipient.public_bytes(), [1u8; 32], [2u8; 24]);

        assert_eq!(kem_open(&ct, &recipient).unwrap(), b"tree leaf");
    }

    #[test]
    fn wrong_recipient_fails() {
        let recipient = KemKeyPair::from_secret(b"node secret");
        let other = KemKeyPair::from_secret(b"other secret");

        let ct = kem_seal(b"tree leaf", &recipient.public_bytes(), [1u8; 32], [2u8; 24]);
        assert_eq!(kem_open(&ct, &other), Err(KemError::DecryptionFailed));
    }

    #[test]
    fn keypair_derivation_is_deterministic() {
        let a = KemKeyPair::from_secret(b"same secret");
        let b = KemKeyPair::from_secret(b"same secret");
        assert_eq!(a.public_bytes(), b.public_bytes());

        let c = KemKeyPair::from_secret(b"different secret");
        assert_ne!(a.public_bytes(), c.public_bytes());
    }

    #[test]
    fn signing_keypair_is_domain_separated() {
        let dh = KemKeyPair::from_secret(b"secret");
        let signing = signing_keypair_from_secret(b"secret");

        assert_ne!(dh.public_bytes(), signing.verifying_key().to_bytes());
    }

    #[test]
    fn signing_keypair_is_deterministic() {
        let a = signing_keypair_from_secret(b"secret");
        let b = signing_keypair_from_secret(b"secret");
        assert_eq!(a.verifying_key(), b.verifying_key());
    }

    #[test]
    fn tampered_ciphertext_fails() {
        let recipient = KemKeyPair::from_secret(b"node secret");
        let mut ct = kem_seal(b"tree leaf", &recipient.public_bytes(), [1u8; 32], [2u8; 24]);
        ct.ciphertext[0] ^= 0xFF;

        assert_eq!(kem_open(&ct, &recipient), Err(KemError::DecryptionFailed));
    }
}
