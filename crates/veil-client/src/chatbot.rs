//! The chatbot side of the external key-agreement path.
//!
//! An agent never joins the members' group encryption. Each group hangs
//! one [`ExternalTree`] node off the members' tree; everything the agent
//! reads or writes is sealed under the root secret shared through that
//! node. Chatbots invited on the core path do not use an agent; they
//! run a [`Messenger`](crate::messenger::Messenger) like any member.

use std::{
    collections::HashMap,
    sync::{Mutex, MutexGuard, PoisonError},
};

use ed25519_dalek::{SigningKey, VerifyingKey};
use tracing::{debug, warn};
use x25519_dalek::{PublicKey, StaticSecret};

use veil_core::ExternalTree;
use veil_crypto::{KemCiphertext, KemKeyPair, SealedMessage, kem_open, open, seal};
use veil_proto::{
    ChatbotVisibility, GroupId, GroupPlaintext, IdentityId, MessageEnvelope, MessageKind,
    ServerEvent, codec,
};

use crate::{
    error::ClientError,
    handle::{IdentityKeys, Outbox},
    rng::random_array,
    wire::{ChatbotEnvelope, ChatbotGroupMessage, PseudonymRegistration},
};

/// A decrypted message surfaced to the chatbot application.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BotIncoming {
    /// Group the message arrived in.
    pub group_id: GroupId,
    /// The sender as this chatbot is allowed to see it: a real identity
    /// or a registered pseudonym.
    pub sender: IdentityId,
    /// Decrypted payload.
    pub payload: Vec<u8>,
}

struct BotGroup {
    tree: ExternalTree,
    visibility: ChatbotVisibility,
    /// Verifying keys of registered sender pseudonyms.
    pseudonyms: HashMap<IdentityId, VerifyingKey>,
}

/// One chatbot identity across its groups.
pub struct ChatbotAgent<O: Outbox> {
    self_id: IdentityId,
    identity: StaticSecret,
    signing: SigningKey,
    outbox: O,
    groups: Mutex<HashMap<GroupId, BotGroup>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl<O: Outbox> ChatbotAgent<O> {
    /// Create an agent with fresh identity key material.
    pub fn new(self_id: IdentityId, outbox: O) -> Self {
        Self {
            self_id,
            identity: StaticSecret::from(random_array::<32>()),
            signing: SigningKey::from_bytes(&random_array::<32>()),
            outbox,
            groups: Mutex::new(HashMap::new()),
        }
    }

    /// This chatbot's identity.
    pub fn self_id(&self) -> &IdentityId {
        &self.self_id
    }

    /// The public keys to register as this chatbot.
    pub fn identity_keys(&self) -> IdentityKeys {
        IdentityKeys {
            dh_public: PublicKey::from(&self.identity).to_bytes(),
            sign_public: self.signing.verifying_key().to_bytes(),
        }
    }

    /// Whether this agent holds a node in the given group.
    pub fn in_group(&self, group_id: &GroupId) -> bool {
        lock(&self.groups).contains_key(group_id)
    }

    /// Process a membership event from the event stream.
    ///
    /// # Errors
    ///
    /// Fails if an invitation piggyback is missing, does not decode, or
    /// was sealed to someone else's identity key.
    pub fn handle_event(&self, event: &ServerEvent) -> Result<(), ClientError> {
        match event {
            ServerEvent::ChatbotInvitation { group, visibility, piggyback } => {
                let sealed: KemCiphertext = piggyback
                    .as_deref()
                    .map(codec::decode)
                    .transpose()?
                    .ok_or_else(|| {
                        ClientError::Protocol("chatbot invitation without join material".to_owned())
                    })?;
                let keys = KemKeyPair::from_bytes(self.identity.to_bytes());
                let join = codec::decode(&kem_open(&sealed, &keys)?)?;

                debug!(group = %group.group_id, "joining group as external node");
                lock(&self.groups).insert(
                    group.group_id.clone(),
                    BotGroup {
                        tree: ExternalTree::new(&join),
                        visibility: *visibility,
                        pseudonyms: HashMap::new(),
                    },
                );
                Ok(())
            },
            ServerEvent::ChatbotRemoval { group_id, chatbot } if chatbot == &self.self_id => {
                debug!(group = %group_id, "removed from group");
                lock(&self.groups).remove(group_id);
                Ok(())
            },
            // Membership of the members' side is invisible to the
            // external path by construction.
            _ => Ok(()),
        }
    }

    /// Decrypt a sub-message routed to this chatbot's mailbox.
    ///
    /// Key rotations, pseudonym registrations, and dummy traffic are
    /// consumed internally and yield `None`.
    ///
    /// # Errors
    ///
    /// Fails if the group is unknown, the tree update does not apply,
    /// or the sealed payload does not open or verify.
    pub fn handle_envelope(
        &self,
        envelope: &MessageEnvelope,
    ) -> Result<Option<BotIncoming>, ClientError> {
        let group_id = GroupId::new(envelope.recipient.clone());
        let mut groups = lock(&self.groups);
        let group = groups
            .get_mut(&group_id)
            .ok_or_else(|| ClientError::not_found("group", &group_id))?;

        let message: ChatbotEnvelope = codec::decode(&envelope.ciphertext)?;
        if let Some(update) = &message.update {
            group.tree.handle_tree_update(
                &update.ciphertext,
                update.new_root_public,
                update.new_root_sign_public,
            )?;
        }

        // Pseudonymous senders sign under their registered key; plain
        // senders on this path seal unsigned.
        let verifier = group.pseudonyms.get(&message.sender);
        let sealed = SealedMessage::from_bytes(&message.sealed)?;
        let plaintext = GroupPlaintext::from_bytes(&open(
            &sealed,
            &group.tree.root_secret(),
            verifier,
        )?)?;

        match plaintext.kind {
            MessageKind::Text => Ok(Some(BotIncoming {
                group_id,
                sender: message.sender,
                payload: plaintext.payload,
            })),
            MessageKind::PseudonymRegistration => {
                let registration: PseudonymRegistration = codec::decode(&plaintext.payload)?;
                let key =
                    VerifyingKey::from_bytes(&registration.sign_public).map_err(|e| {
                        ClientError::Protocol(format!("bad pseudonym key: {e}"))
                    })?;
                debug!(group = %group_id, pseudonym = %registration.pseudonym, "pseudonym registered");
                group.pseudonyms.insert(registration.pseudonym, key);
                Ok(None)
            },
            MessageKind::ChatbotKeyUpdate | MessageKind::Skip => Ok(None),
            other => {
                warn!(?other, "unexpected kind on the external path");
                Ok(None)
            },
        }
    }

    /// Send a message to a group's participants, signed with the shared
    /// root so members can authenticate it.
    ///
    /// # Errors
    ///
    /// Fails if this agent holds no node in the group or the send is
    /// rejected.
    pub fn reply(&self, group_id: &GroupId, payload: &[u8]) -> Result<(), ClientError> {
        let sealed = {
            let groups = lock(&self.groups);
            let group = groups
                .get(group_id)
                .ok_or_else(|| ClientError::not_found("group", group_id))?;
            seal(
                &GroupPlaintext {
                    payload: payload.to_vec(),
                    kind: MessageKind::Text,
                    chatbot_ids: Vec::new(),
                }
                .to_bytes()?,
                &group.tree.root_secret(),
                random_array(),
                Some(group.tree.root_signing()),
            )?
            .to_bytes()?
        };

        self.send_group_message(group_id, ChatbotGroupMessage {
            chatbot: self.self_id.clone(),
            node_update: None,
            sealed,
        })
    }

    /// Rotate this chatbot's node and the shared root, notifying the
    /// members.
    ///
    /// # Errors
    ///
    /// Fails if this agent holds no node in the group or the send is
    /// rejected.
    pub fn rotate(&self, group_id: &GroupId) -> Result<(), ClientError> {
        let (update, sealed) = {
            let mut groups = lock(&self.groups);
            let group = groups
                .get_mut(group_id)
                .ok_or_else(|| ClientError::not_found("group", group_id))?;
            let update = group.tree.update();
            // Signed under the post-rotation root, which members derive
            // from the update before verifying.
            let sealed = seal(
                &GroupPlaintext {
                    payload: Vec::new(),
                    kind: MessageKind::ChatbotKeyUpdate,
                    chatbot_ids: Vec::new(),
                }
                .to_bytes()?,
                &group.tree.root_secret(),
                random_array(),
                Some(group.tree.root_signing()),
            )?
            .to_bytes()?;
            (update, sealed)
        };

        self.send_group_message(group_id, ChatbotGroupMessage {
            chatbot: self.self_id.clone(),
            node_update: Some(update),
            sealed,
        })
    }

    /// How this chatbot participates in a group, if it is in it.
    pub fn visibility(&self, group_id: &GroupId) -> Option<ChatbotVisibility> {
        lock(&self.groups).get(group_id).map(|group| group.visibility)
    }

    fn send_group_message(
        &self,
        group_id: &GroupId,
        message: ChatbotGroupMessage,
    ) -> Result<(), ClientError> {
        let mut envelope = MessageEnvelope::new(
            self.self_id.clone(),
            group_id.as_str(),
            codec::encode(&message)?,
        );
        envelope.is_iga = true;
        self.outbox.send(envelope)
    }
}
