//! Pairwise sessions established from prekey bundles.
//!
//! An initiator fetches the peer's prekey bundle and performs a set of
//! x25519 agreements (identity, signed prekey, optional one-time prekey,
//! fresh ephemeral) whose outputs are expanded into two independent
//! symmetric chains, one per direction. The first message carries a
//! [`PairwiseHandshake`] so the responder can derive the same chains.
//!
//! Each direction is a forward-secure hash ratchet with a bounded skip
//! window, so messages tolerate out-of-order delivery.

use hkdf::Hkdf;
use sha2::Sha256;

use ed25519_dalek::{Signature, Verifier, VerifyingKey};
use serde::{Deserialize, Serialize};
use x25519_dalek::{PublicKey, StaticSecret};

use super::{
    error::PairwiseError,
    sender_keys::{NONCE_RANDOM_SIZE, RatchetCiphertext, ReceivingSession, SenderKey, SendingSession},
};

/// Domain separation for session key derivation.
const SESSION_INFO: &[u8] = b"veil-pairwise-v1";

/// Public prekey material enabling asynchronous session establishment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PreKeyBundle {
    /// Peer's long-term x25519 identity public key.
    pub identity_pub: [u8; 32],
    /// Signed prekey id.
    pub signed_prekey_id: u32,
    /// Signed prekey public key.
    pub signed_prekey_pub: [u8; 32],
    /// Ed25519 signature over the signed prekey public key.
    pub signed_prekey_signature: Vec<u8>,
    /// One-time prekey id, if one was available.
    pub one_time_id: Option<u32>,
    /// One-time prekey public key.
    pub one_time_pub: Option<[u8; 32]>,
}

impl PreKeyBundle {
    /// Verify the signed prekey signature against the peer's identity
    /// verification key.
    ///
    /// # Errors
    ///
    /// Fails with `BundleSignatureInvalid` if the signature does not
    /// parse or verify.
    pub fn verify(&self, identity_verifier: &VerifyingKey) -> Result<(), PairwiseError> {
        let signature = Signature::from_slice(&self.signed_prekey_signature)
            .map_err(|_| PairwiseError::BundleSignatureInvalid)?;
        identity_verifier
            .verify(&self.signed_prekey_pub, &signature)
            .map_err(|_| PairwiseError::BundleSignatureInvalid)
    }
}

/// Handshake carried on the first message of a new session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PairwiseHandshake {
    /// Initiator's x25519 identity public key.
    pub initiator_identity_pub: [u8; 32],
    /// Initiator's ephemeral public key.
    pub ephemeral_pub: [u8; 32],
    /// Signed prekey id the initiator used.
    pub signed_prekey_id: u32,
    /// One-time prekey id the initiator consumed, if any.
    pub one_time_id: Option<u32>,
}

/// A pairwise session: one sending chain, one receiving chain.
pub struct PairwiseSession {
    sending: SendingSession,
    receiving: ReceivingSession,
}

impl PairwiseSession {
    /// Initiate a session against a peer's prekey bundle.
    ///
    /// `ephemeral_seed` is caller-provided randomness for the ephemeral
    /// keypair. Returns the session and the handshake the first message
    /// must carry.
    pub fn initiate(
        self_identity: &StaticSecret,
        bundle: &PreKeyBundle,
        ephemeral_seed: [u8; 32],
    ) -> (Self, PairwiseHandshake) {
        let ephemeral = StaticSecret::from(ephemeral_seed);

        let spk = PublicKey::from(bundle.signed_prekey_pub);
        let idk = PublicKey::from(bundle.identity_pub);

        let mut ikm = Vec::with_capacity(128);
        ikm.extend_from_slice(self_identity.diffie_hellman(&spk).as_bytes());
        ikm.extend_from_slice(ephemeral.diffie_hellman(&idk).as_bytes());
        ikm.extend_from_slice(ephemeral.diffie_hellman(&spk).as_bytes());
        if let Some(otp) = bundle.one_time_pub {
            ikm.extend_from_slice(ephemeral.diffie_hellman(&PublicKey::from(otp)).as_bytes());
        }

        let (initiator_seed, responder_seed) = derive_chain_seeds(&ikm);

        let handshake = PairwiseHandshake {
            initiator_identity_pub: PublicKey::from(self_identity).to_bytes(),
            ephemeral_pub: PublicKey::from(&ephemeral).to_bytes(),
            signed_prekey_id: bundle.signed_prekey_id,
            one_time_id: bundle.one_time_id,
        };

        let session = Self {
            sending: SendingSession::new(&initiator_seed),
            receiving: ReceivingSession::new(&SenderKey {
                chain_key: responder_seed,
                generation: 0,
            }),
        };

        (session, handshake)
    }

    /// Derive the responder side of a session from a received handshake.
    pub fn respond(
        self_identity: &StaticSecret,
        signed_prekey: &StaticSecret,
        one_time_prekey: Option<&StaticSecret>,
        handshake: &PairwiseHandshake,
    ) -> Self {
        let initiator_idk = PublicKey::from(handshake.initiator_identity_pub);
        let ephemeral = PublicKey::from(handshake.ephemeral_pub);

        let mut ikm = Vec::with_capacity(128);
        ikm.extend_from_slice(signed_prekey.diffie_hellman(&initiator_idk).as_bytes());
        ikm.extend_from_slice(self_identity.diffie_hellman(&ephemeral).as_bytes());
        ikm.extend_from_slice(signed_prekey.diffie_hellman(&ephemeral).as_bytes());
        if let Some(otp) = one_time_prekey {
            ikm.extend_from_slice(otp.diffie_hellman(&ephemeral).as_bytes());
        }

        let (initiator_seed, responder_seed) = derive_chain_seeds(&ikm);

        Self {
            sending: SendingSession::new(&responder_seed),
            receiving: ReceivingSession::new(&SenderKey {
                chain_key: initiator_seed,
                generation: 0,
            }),
        }
    }

    /// Encrypt a message on the sending chain.
    pub fn encrypt(
        &mut self,
        plaintext: &[u8],
        random_suffix: [u8; NONCE_RANDOM_SIZE],
    ) -> Result<RatchetCiphertext, PairwiseError> {
        Ok(self.sending.encrypt(plaintext, random_suffix)?)
    }

    /// Decrypt a message on the receiving chain.
    ///
    /// Out-of-order messages within the skip window succeed.
    pub fn decrypt(&mut self, message: &RatchetCiphertext) -> Result<Vec<u8>, PairwiseError> {
        Ok(self.receiving.decrypt(message)?)
    }
}

/// Expand the agreement outputs into (initiator chain, responder chain).
fn derive_chain_seeds(ikm: &[u8]) -> ([u8; 32], [u8; 32]) {
    let hkdf = Hkdf::<Sha256>::new(None, ikm);
    let mut okm = [0u8; 64];
    let Ok(()) = hkdf.expand(SESSION_INFO, &mut okm) else {
        unreachable!("64 bytes is a valid HKDF-SHA256 output length");
    };

    let mut initiator = [0u8; 32];
    let mut responder = [0u8; 32];
    initiator.copy_from_slice(&okm[..32]);
    responder.copy_from_slice(&okm[32..]);
    (initiator, responder)
}
