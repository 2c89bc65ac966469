//! Client-level wire structs.
//!
//! Everything here rides inside opaque fields of [`MessageEnvelope`]s
//! and [`ServerEvent`] piggybacks: the server routes them without ever
//! decoding them. CBOR throughout, via the shared codec.
//!
//! [`MessageEnvelope`]: veil_proto::MessageEnvelope
//! [`ServerEvent`]: veil_proto::ServerEvent

use serde::{Deserialize, Serialize};

use veil_core::{ExternalNodeUpdate, MemberJoin};
use veil_crypto::{KemCiphertext, PairwiseHandshake, SenderKey};
use veil_proto::{GroupId, GroupPlaintext, IdentityId, codec};

use crate::error::ClientError;

/// The ciphertext field of a one-to-one envelope: the ratchet message
/// plus, on the first message only, the session handshake.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PairwiseWire {
    /// Session handshake, present on the initiator's first message.
    pub handshake: Option<PairwiseHandshake>,
    /// Encrypted [`DirectMessage`].
    pub body: Vec<u8>,
}

/// A sender key snapshot distributed over a pairwise session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyDistribution {
    /// Group the key belongs to.
    pub group_id: GroupId,
    /// The sender's chain snapshot.
    pub sender_key: SenderKey,
    /// When set, the receiver replies with its own sender key so both
    /// directions are established from one exchange.
    pub bounce_back: bool,
}

/// What a decrypted pairwise body contains.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum DirectMessage {
    /// Application text between two identities.
    Text(Vec<u8>),
    /// Sender key control message for a server-side group.
    SenderKeyDistribution(KeyDistribution),
    /// A group message delivered over the pairwise fanout path.
    GroupMessage {
        /// Group the message belongs to.
        group_id: GroupId,
        /// The group payload, identical for every recipient.
        message: GroupPlaintext,
    },
}

/// Key material piggybacked on a `GroupInvitation`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvitePiggyback {
    /// Tree-group welcome for the invitee.
    pub welcome: Option<Vec<u8>>,
    /// External tree state, sealed to the invitee's identity key.
    pub member_join: Option<MemberJoin>,
}

/// One chatbot's share of a members' tree rotation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeUpdate {
    /// New root secret, sealed to the chatbot's node key.
    pub ciphertext: KemCiphertext,
    /// Members' tree root public key after the rotation.
    pub new_root_public: [u8; 32],
    /// Members' tree root signing public key after the rotation.
    pub new_root_sign_public: [u8; 32],
}

/// A per-chatbot sub-message as routed to a chatbot mailbox.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatbotEnvelope {
    /// The sender as the chatbot should see it: the real identity, or a
    /// group pseudonym.
    pub sender: IdentityId,
    /// Tree rotation to apply before opening `sealed`.
    pub update: Option<NodeUpdate>,
    /// Sealed [`GroupPlaintext`], keyed by the shared root secret.
    pub sealed: Vec<u8>,
}

/// A chatbot's message to the group's participants.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatbotGroupMessage {
    /// The sending chatbot.
    pub chatbot: IdentityId,
    /// Node rotation to apply before opening `sealed`.
    pub node_update: Option<ExternalNodeUpdate>,
    /// Sealed [`GroupPlaintext`], keyed by the shared root secret and
    /// signed with its signing key.
    pub sealed: Vec<u8>,
}

/// Registration of a group pseudonym with a chatbot. Travels sealed on
/// the external path, so only the chatbot learns the binding.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PseudonymRegistration {
    /// The pseudonym this member will send under.
    pub pseudonym: IdentityId,
    /// Verifying key for the pseudonym's signatures.
    pub sign_public: [u8; 32],
}

/// A fresh external tree secret, distributed to members inside an
/// encrypted group message of kind `TreeKeyUpdate`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TreeSecretRotation {
    /// The new shared tree secret.
    pub secret: [u8; 32],
}

/// Parse a decrypted pairwise body as a sender key distribution.
///
/// # Errors
///
/// Fails with [`ClientError::Protocol`] if the body decodes to any
/// other [`DirectMessage`] variant.
pub fn parse_sender_key_distribution(bytes: &[u8]) -> Result<KeyDistribution, ClientError> {
    match codec::decode(bytes)? {
        DirectMessage::SenderKeyDistribution(distribution) => Ok(distribution),
        _ => Err(ClientError::Protocol("not a sender key distribution".to_owned())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sender_key_distribution_roundtrip_keeps_bounce_back() {
        let message = DirectMessage::SenderKeyDistribution(KeyDistribution {
            group_id: GroupId::new("groupAAAA0001"),
            sender_key: SenderKey { chain_key: [5u8; 32], generation: 3 },
            bounce_back: true,
        });

        let bytes = codec::encode(&message).expect("encode");
        let parsed = parse_sender_key_distribution(&bytes).expect("parse");
        assert!(parsed.bounce_back);
        assert_eq!(parsed.sender_key.generation, 3);
    }

    #[test]
    fn text_body_is_not_a_distribution() {
        let bytes = codec::encode(&DirectMessage::Text(b"hello".to_vec())).expect("encode");
        assert!(matches!(
            parse_sender_key_distribution(&bytes),
            Err(ClientError::Protocol(_))
        ));
    }
}
