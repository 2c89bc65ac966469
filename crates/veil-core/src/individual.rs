//! One-to-one sessions established from prekey bundles.
//!
//! Wraps a pairwise double-chain session with the bookkeeping the
//! messaging layer needs: which peer the session is with, and the
//! handshake that must ride on the first outgoing message so the peer
//! can derive its side.

use x25519_dalek::StaticSecret;

use veil_crypto::{PairwiseHandshake, PairwiseSession, PreKeyBundle, RatchetCiphertext};
use veil_proto::{IdentityId, codec};

use crate::{error::SessionError, rng::random_array};

/// An established session with one peer.
pub struct PeerSession {
    peer: IdentityId,
    session: PairwiseSession,
    /// Handshake not yet delivered to the peer. Attached to the next
    /// outgoing message and cleared.
    pending_handshake: Option<PairwiseHandshake>,
}

impl PeerSession {
    /// Initiate a session against a peer's prekey bundle.
    pub fn initiate(peer: IdentityId, self_identity: &StaticSecret, bundle: &PreKeyBundle) -> Self {
        let (session, handshake) =
            PairwiseSession::initiate(self_identity, bundle, random_array());
        Self { peer, session, pending_handshake: Some(handshake) }
    }

    /// Derive the responder side from a received handshake.
    pub fn respond(
        peer: IdentityId,
        self_identity: &StaticSecret,
        signed_prekey: &StaticSecret,
        one_time_prekey: Option<&StaticSecret>,
        handshake: &PairwiseHandshake,
    ) -> Self {
        let session =
            PairwiseSession::respond(self_identity, signed_prekey, one_time_prekey, handshake);
        Self { peer, session, pending_handshake: None }
    }

    /// The peer this session is with.
    pub fn peer(&self) -> &IdentityId {
        &self.peer
    }

    /// Take the handshake for the first outgoing message, if it has not
    /// been sent yet. The caller marks the envelope accordingly.
    pub fn take_handshake(&mut self) -> Option<PairwiseHandshake> {
        self.pending_handshake.take()
    }

    /// Encrypt a payload for the peer.
    ///
    /// # Errors
    ///
    /// Fails if the sending chain is exhausted.
    pub fn encrypt(&mut self, plaintext: &[u8]) -> Result<Vec<u8>, SessionError> {
        let ciphertext = self.session.encrypt(plaintext, random_array())?;
        Ok(codec::encode(&ciphertext)?)
    }

    /// Decrypt a payload from the peer.
    ///
    /// Out-of-order messages within the skip window succeed.
    ///
    /// # Errors
    ///
    /// Fails if the bytes do not decode or do not decrypt on this
    /// session's receiving chain.
    pub fn decrypt(&mut self, bytes: &[u8]) -> Result<Vec<u8>, SessionError> {
        let ciphertext: RatchetCiphertext = codec::decode(bytes)?;
        Ok(self.session.decrypt(&ciphertext)?)
    }
}

#[cfg(test)]
mod tests {
    use ed25519_dalek::{Signer, SigningKey};
    use x25519_dalek::PublicKey;

    use super::*;

    struct Keys {
        identity: StaticSecret,
        signed_prekey: StaticSecret,
        signing: SigningKey,
    }

    fn keys(tag: u8) -> Keys {
        Keys {
            identity: StaticSecret::from([tag; 32]),
            signed_prekey: StaticSecret::from([tag.wrapping_add(1); 32]),
            signing: SigningKey::from_bytes(&[tag.wrapping_add(2); 32]),
        }
    }

    fn bundle_for(keys: &Keys) -> PreKeyBundle {
        let spk_pub = PublicKey::from(&keys.signed_prekey).to_bytes();
        PreKeyBundle {
            identity_pub: PublicKey::from(&keys.identity).to_bytes(),
            signed_prekey_id: 1,
            signed_prekey_pub: spk_pub,
            signed_prekey_signature: keys.signing.sign(&spk_pub).to_bytes().to_vec(),
            one_time_id: None,
            one_time_pub: None,
        }
    }

    #[test]
    fn handshake_rides_first_message_only() {
        let alice_keys = keys(1);
        let bob_keys = keys(100);

        let mut alice =
            PeerSession::initiate(IdentityId::new("bob"), &alice_keys.identity, &bundle_for(&bob_keys));

        let handshake = alice.take_handshake().expect("first message carries handshake");
        assert!(alice.take_handshake().is_none());

        let mut bob = PeerSession::respond(
            IdentityId::new("alice"),
            &bob_keys.identity,
            &bob_keys.signed_prekey,
            None,
            &handshake,
        );
        assert!(bob.take_handshake().is_none());

        let ciphertext = alice.encrypt(b"first").expect("encrypt");
        assert_eq!(bob.decrypt(&ciphertext).expect("decrypt"), b"first");

        let reply = bob.encrypt(b"second").expect("encrypt");
        assert_eq!(alice.decrypt(&reply).expect("decrypt"), b"second");
    }

    #[test]
    fn garbage_ciphertext_is_an_error() {
        let alice_keys = keys(1);
        let bob_keys = keys(100);
        let mut alice =
            PeerSession::initiate(IdentityId::new("bob"), &alice_keys.identity, &bundle_for(&bob_keys));

        assert!(alice.decrypt(&[0xFF, 0x13, 0x37]).is_err());
    }
}
