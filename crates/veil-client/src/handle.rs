//! Capabilities the orchestrator depends on.
//!
//! Both are injected at construction. The client never talks to a
//! transport directly; it hands finished envelopes to an [`Outbox`] and
//! fetches peer key material through a [`DirectoryHandle`]. Tests bind
//! these straight to an in-process service.

use serde::{Deserialize, Serialize};

use veil_crypto::PreKeyBundle;
use veil_proto::{IdentityId, MessageEnvelope};

use crate::error::ClientError;

/// An identity's registered public keys: one x25519 key for agreement,
/// one Ed25519 key for signatures. This pair is what `set_user` and
/// `set_chatbot` register as the identity key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentityKeys {
    /// x25519 public key, for KEM and pairwise agreement.
    pub dh_public: [u8; 32],
    /// Ed25519 verifying key, for prekey and envelope signatures.
    pub sign_public: [u8; 32],
}

impl IdentityKeys {
    /// Flatten to the 64-byte registration blob.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(64);
        out.extend_from_slice(&self.dh_public);
        out.extend_from_slice(&self.sign_public);
        out
    }

    /// Parse a 64-byte registration blob.
    ///
    /// # Errors
    ///
    /// Fails with [`ClientError::Protocol`] on any other length.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, ClientError> {
        if bytes.len() != 64 {
            return Err(ClientError::Protocol(format!(
                "identity key blob must be 64 bytes, got {}",
                bytes.len()
            )));
        }
        let mut dh_public = [0u8; 32];
        let mut sign_public = [0u8; 32];
        dh_public.copy_from_slice(&bytes[..32]);
        sign_public.copy_from_slice(&bytes[32..]);
        Ok(Self { dh_public, sign_public })
    }
}

/// Read access to the server's key directory.
pub trait DirectoryHandle {
    /// A peer's registered identity keys.
    ///
    /// # Errors
    ///
    /// Fails if the peer is not registered.
    fn identity_keys(&self, id: &IdentityId) -> Result<IdentityKeys, ClientError>;

    /// Assemble a prekey bundle for a peer, consuming one of its
    /// one-time prekeys when available.
    ///
    /// # Errors
    ///
    /// Fails if the peer is not registered or has no signed prekey.
    fn pre_key_bundle(&self, id: &IdentityId) -> Result<PreKeyBundle, ClientError>;

    /// Consume a key package for a tree-group add.
    ///
    /// # Errors
    ///
    /// Fails if the peer has no key package left.
    fn key_package(&self, id: &IdentityId) -> Result<Vec<u8>, ClientError>;
}

/// Where finished envelopes go.
pub trait Outbox {
    /// Hand an envelope to the routing layer.
    ///
    /// # Errors
    ///
    /// Fails when the routing layer rejects the envelope.
    fn send(&self, envelope: MessageEnvelope) -> Result<(), ClientError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identity_keys_roundtrip_through_the_blob() {
        let keys = IdentityKeys { dh_public: [7u8; 32], sign_public: [9u8; 32] };
        let parsed = IdentityKeys::from_bytes(&keys.to_bytes()).expect("parse");
        assert_eq!(parsed, keys);
    }

    #[test]
    fn short_blob_is_rejected() {
        assert!(IdentityKeys::from_bytes(&[0u8; 63]).is_err());
    }
}
