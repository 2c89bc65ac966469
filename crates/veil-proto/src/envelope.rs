//! Message envelopes and the plaintext unit group drivers encrypt.
//!
//! Envelopes are opaque to the server: routing uses `recipient` only.
//! Payloads are CBOR because it is self-describing, compact, and needs
//! no code generation; the server never deserializes ciphertexts, only
//! clients do.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::{
    error::ProtoError,
    id::{GroupId, IdentityId},
};

/// The group-encryption strategy a group was created with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum GroupType {
    /// Sender-key fanout: the server delivers one ciphertext to all.
    ServerSide,
    /// Pairwise fanout: the sender encrypts once per recipient.
    ClientSide,
    /// Tree-based continuous group key agreement.
    Mls,
}

/// How a chatbot participates in a group.
///
/// Pseudonymous participation requires the independent key-agreement
/// path, so the invalid combination is unrepresentable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChatbotVisibility {
    /// Addressed through the core group path; sees sender identities.
    Visible,
    /// Addressed through the external key-agreement path.
    IgaVisible,
    /// Addressed through the external path; senders use pseudonyms.
    IgaPseudonymous,
}

impl ChatbotVisibility {
    /// Whether the chatbot is addressed via the external path.
    pub fn is_iga(self) -> bool {
        matches!(self, Self::IgaVisible | Self::IgaPseudonymous)
    }

    /// Whether senders address this chatbot under pseudonyms.
    pub fn is_pseudonymous(self) -> bool {
        matches!(self, Self::IgaPseudonymous)
    }

    /// Validate an untyped flag pair from an external caller.
    ///
    /// # Errors
    ///
    /// Fails with `InvalidVisibilityFlags` for pseudonymous-without-IGA.
    pub fn from_flags(is_iga: bool, is_pseudonymous: bool) -> Result<Self, ProtoError> {
        match (is_iga, is_pseudonymous) {
            (false, false) => Ok(Self::Visible),
            (true, false) => Ok(Self::IgaVisible),
            (true, true) => Ok(Self::IgaPseudonymous),
            (false, true) => Err(ProtoError::InvalidVisibilityFlags),
        }
    }
}

/// What a decrypted group payload contains.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MessageKind {
    /// Application text.
    Text,
    /// A sender key snapshot for this sender.
    SenderKeyDistribution,
    /// A member's external-tree key update.
    TreeKeyUpdate,
    /// A chatbot's external-node key update.
    ChatbotKeyUpdate,
    /// Registration of a pseudonymous sender identity.
    PseudonymRegistration,
    /// Dummy traffic; receivers discard it.
    Skip,
}

/// The plaintext unit a group driver encrypts: payload, kind, and the
/// chatbots this message addresses.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupPlaintext {
    /// Application or control payload.
    pub payload: Vec<u8>,
    /// Payload discriminator.
    pub kind: MessageKind,
    /// Chatbots that should act on this message.
    pub chatbot_ids: Vec<IdentityId>,
}

impl GroupPlaintext {
    /// Encode to CBOR.
    pub fn to_bytes(&self) -> Result<Vec<u8>, ProtoError> {
        crate::codec::encode(self)
    }

    /// Decode from CBOR.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, ProtoError> {
        crate::codec::decode(bytes)
    }
}

/// An opaque routed message. Immutable once constructed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageEnvelope {
    /// Sending identity.
    pub sender: IdentityId,
    /// Recipient identity or group id (as a raw string namespace).
    pub recipient: String,
    /// Main ciphertext.
    pub ciphertext: Vec<u8>,
    /// Whether the ciphertext carries a pairwise session handshake.
    pub has_pre_key: bool,
    /// Whether the ciphertext took the external key-agreement path.
    pub is_iga: bool,
    /// Per-chatbot sub-messages, routed to chatbot mailboxes.
    pub chatbot_messages: BTreeMap<IdentityId, Vec<u8>>,
    /// Piggybacked key-update bytes for the recipients' tree layer.
    pub key_update: Option<Vec<u8>>,
}

impl MessageEnvelope {
    /// An envelope with only sender, recipient, and ciphertext set.
    pub fn new(sender: IdentityId, recipient: impl Into<String>, ciphertext: Vec<u8>) -> Self {
        Self {
            sender,
            recipient: recipient.into(),
            ciphertext,
            has_pre_key: false,
            is_iga: false,
            chatbot_messages: BTreeMap::new(),
            key_update: None,
        }
    }
}

/// A group's full membership record as distributed to invitees.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupInfo {
    /// Group id.
    pub group_id: GroupId,
    /// Encryption strategy.
    pub group_type: GroupType,
    /// Participants in insertion order, no duplicates.
    pub participants: Vec<IdentityId>,
    /// Chatbots in insertion order.
    pub chatbots: Vec<IdentityId>,
    /// Per-chatbot visibility.
    pub visibility: BTreeMap<IdentityId, ChatbotVisibility>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn visibility_flags_validate() {
        assert_eq!(
            ChatbotVisibility::from_flags(false, false).unwrap(),
            ChatbotVisibility::Visible
        );
        assert_eq!(
            ChatbotVisibility::from_flags(true, false).unwrap(),
            ChatbotVisibility::IgaVisible
        );
        assert_eq!(
            ChatbotVisibility::from_flags(true, true).unwrap(),
            ChatbotVisibility::IgaPseudonymous
        );
        assert!(ChatbotVisibility::from_flags(false, true).is_err());
    }

    #[test]
    fn visibility_predicates() {
        assert!(!ChatbotVisibility::Visible.is_iga());
        assert!(ChatbotVisibility::IgaVisible.is_iga());
        assert!(ChatbotVisibility::IgaPseudonymous.is_pseudonymous());
        assert!(!ChatbotVisibility::IgaVisible.is_pseudonymous());
    }

    #[test]
    fn group_plaintext_roundtrip() {
        let plaintext = GroupPlaintext {
            payload: b"hello".to_vec(),
            kind: MessageKind::Text,
            chatbot_ids: vec![IdentityId::new("bot")],
        };

        let decoded = GroupPlaintext::from_bytes(&plaintext.to_bytes().unwrap()).unwrap();
        assert_eq!(decoded, plaintext);
    }

    #[test]
    fn group_plaintext_rejects_garbage() {
        assert!(GroupPlaintext::from_bytes(&[0xFF, 0x00, 0x13]).is_err());
    }
}
