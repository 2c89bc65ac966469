//! The client orchestrator.
//!
//! A [`Messenger`] owns one driver per peer and per group, dispatches
//! outbound sends to the right driver, and demultiplexes inbound
//! envelopes and membership events back to them. Drivers are created
//! lazily on first contact through atomic get-or-create registries.
//!
//! Chatbots on the core path run a `Messenger` of their own; chatbots
//! on the external key-agreement path run a
//! [`ChatbotAgent`](crate::chatbot::ChatbotAgent) instead.

use std::{
    collections::{HashMap, VecDeque},
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use ed25519_dalek::{Signer, SigningKey, VerifyingKey};
use tracing::{debug, warn};
use x25519_dalek::{PublicKey, StaticSecret};

use veil_core::{
    ClientSideSession, MlsSession, MultiTree, PeerSession, PendingJoin, Processed,
    ServerSideSession, SessionError,
};
use veil_crypto::{KemKeyPair, SealedMessage, open, seal};
use veil_proto::{
    ChatbotVisibility, GroupId, GroupInfo, GroupPlaintext, GroupType, IdentityId, MessageEnvelope,
    MessageKind, ServerEvent, codec,
};

use crate::{
    error::ClientError,
    handle::{DirectoryHandle, IdentityKeys, Outbox},
    registry::{Registry, lock_driver},
    rng::{random_array, random_bytes},
    wire::{
        ChatbotEnvelope, ChatbotGroupMessage, DirectMessage, InvitePiggyback, KeyDistribution,
        NodeUpdate, PairwiseWire, PseudonymRegistration, TreeSecretRotation,
    },
};

/// Tunables for a [`Messenger`].
#[derive(Debug, Clone, Default)]
pub struct MessengerConfig {
    /// When set, sends to external-path chatbots also send dummy
    /// traffic to the chatbots not addressed by the message, so the
    /// server cannot tell which message triggered which chatbot.
    pub hide_triggers: bool,
}

/// Artifacts a membership mutation produced for the server to fan out.
#[derive(Debug, Clone, Default)]
pub struct InviteArtifacts {
    /// Piggyback for the invited identity's invitation event.
    pub invitation: Option<Vec<u8>>,
    /// Piggyback for the addition event to everyone else.
    pub addition: Option<Vec<u8>>,
}

/// A decrypted inbound item surfaced to the application.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Incoming {
    /// A one-to-one message.
    Direct {
        /// Sending identity.
        sender: IdentityId,
        /// Decrypted payload.
        plaintext: Vec<u8>,
    },
    /// A group message from another member.
    Group {
        /// Group it arrived in.
        group_id: GroupId,
        /// Sending member.
        sender: IdentityId,
        /// Decrypted payload.
        plaintext: Vec<u8>,
    },
    /// A message from an external-path chatbot to the group.
    ChatbotMessage {
        /// Group it arrived in.
        group_id: GroupId,
        /// Sending chatbot.
        chatbot: IdentityId,
        /// Decrypted payload.
        plaintext: Vec<u8>,
    },
}

/// One group session driver, by group strategy.
enum GroupDriver {
    ServerSide(ServerSideSession),
    ClientSide(ClientSideSession),
    Mls(MlsSession),
}

impl GroupDriver {
    fn multi_tree(&self) -> Option<&MultiTree> {
        match self {
            Self::ServerSide(session) => session.multi_tree(),
            Self::ClientSide(session) => session.multi_tree(),
            Self::Mls(session) => session.multi_tree(),
        }
    }

    fn multi_tree_mut(&mut self) -> Option<&mut MultiTree> {
        match self {
            Self::ServerSide(session) => session.multi_tree_mut(),
            Self::ClientSide(session) => session.multi_tree_mut(),
            Self::Mls(session) => session.multi_tree_mut(),
        }
    }

    fn set_multi_tree(&mut self, tree: MultiTree) {
        match self {
            Self::ServerSide(session) => session.set_multi_tree(tree),
            Self::ClientSide(session) => session.set_multi_tree(tree),
            Self::Mls(session) => session.set_multi_tree(tree),
        }
    }
}

struct Pseudonym {
    id: IdentityId,
    signing: SigningKey,
}

/// The client orchestrator for one identity.
pub struct Messenger<D: DirectoryHandle, O: Outbox> {
    self_id: IdentityId,
    identity: StaticSecret,
    signing: SigningKey,
    signed_prekey: StaticSecret,
    signed_prekey_id: u32,
    directory: D,
    outbox: O,
    config: MessengerConfig,
    peers: Registry<IdentityId, PeerSession>,
    groups: Registry<GroupId, GroupDriver>,
    /// Mirror of server-side membership, maintained from events.
    rosters: Mutex<HashMap<GroupId, GroupInfo>>,
    /// Per-group sending pseudonyms for pseudonymous chatbots.
    pseudonyms: Mutex<HashMap<GroupId, Pseudonym>>,
    /// Join state for published key packages, consumed by welcomes in
    /// publication order.
    pending_joins: Mutex<VecDeque<PendingJoin>>,
    /// Secrets of uploaded one-time prekeys, consumed by handshakes.
    one_time_prekeys: Mutex<HashMap<u32, StaticSecret>>,
    next_prekey_id: Mutex<u32>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Chatbots addressed through the external key-agreement path.
fn iga_chatbots(info: &GroupInfo) -> Vec<IdentityId> {
    info.chatbots
        .iter()
        .filter(|bot| info.visibility.get(*bot).is_some_and(|v| v.is_iga()))
        .cloned()
        .collect()
}

impl<D: DirectoryHandle, O: Outbox> Messenger<D, O> {
    /// Create an orchestrator with fresh identity key material.
    pub fn new(self_id: IdentityId, directory: D, outbox: O, config: MessengerConfig) -> Self {
        Self {
            self_id,
            identity: StaticSecret::from(random_array::<32>()),
            signing: SigningKey::from_bytes(&random_array::<32>()),
            signed_prekey: StaticSecret::from(random_array::<32>()),
            signed_prekey_id: 1,
            directory,
            outbox,
            config,
            peers: Registry::new(),
            groups: Registry::new(),
            rosters: Mutex::new(HashMap::new()),
            pseudonyms: Mutex::new(HashMap::new()),
            pending_joins: Mutex::new(VecDeque::new()),
            one_time_prekeys: Mutex::new(HashMap::new()),
            next_prekey_id: Mutex::new(2),
        }
    }

    /// This client's identity.
    pub fn self_id(&self) -> &IdentityId {
        &self.self_id
    }

    /// The public keys to register as this identity.
    pub fn identity_keys(&self) -> IdentityKeys {
        IdentityKeys {
            dh_public: PublicKey::from(&self.identity).to_bytes(),
            sign_public: self.signing.verifying_key().to_bytes(),
        }
    }

    /// The signed prekey to upload: `(id, public, signature)`.
    pub fn signed_prekey_record(&self) -> (u32, [u8; 32], Vec<u8>) {
        let public = PublicKey::from(&self.signed_prekey).to_bytes();
        let signature = self.signing.sign(&public).to_bytes().to_vec();
        (self.signed_prekey_id, public, signature)
    }

    /// Generate one-time prekeys to upload, retaining the secrets for
    /// handshakes that consume them.
    pub fn generate_one_time_prekeys(&self, count: usize) -> Vec<(u32, [u8; 32])> {
        let mut next_id = lock(&self.next_prekey_id);
        let mut secrets = lock(&self.one_time_prekeys);
        let mut out = Vec::with_capacity(count);
        for _ in 0..count {
            let id = *next_id;
            *next_id += 1;
            let secret = StaticSecret::from(random_array::<32>());
            out.push((id, PublicKey::from(&secret).to_bytes()));
            secrets.insert(id, secret);
        }
        out
    }

    /// Generate a key package to upload for tree-group joins, retaining
    /// the join state for the matching welcome.
    ///
    /// # Errors
    ///
    /// Fails if key package generation fails.
    pub fn generate_key_package(&self) -> Result<Vec<u8>, ClientError> {
        let (bytes, pending) = MlsSession::generate_key_package(&self.self_id)?;
        lock(&self.pending_joins).push_back(pending);
        Ok(bytes)
    }

    /// Membership snapshot of a group this client is in.
    ///
    /// # Errors
    ///
    /// Fails with [`ClientError::NotFound`] for unknown groups.
    pub fn roster(&self, group_id: &GroupId) -> Result<GroupInfo, ClientError> {
        lock(&self.rosters)
            .get(group_id)
            .cloned()
            .ok_or_else(|| ClientError::not_found("group", group_id))
    }

    // ---- one-to-one path ----

    /// Send a text message to one peer, establishing the pairwise
    /// session first if this is the first contact.
    ///
    /// # Errors
    ///
    /// Fails if the peer's key material cannot be fetched or the send
    /// is rejected.
    pub fn send_individual(&self, peer: &IdentityId, plaintext: &[u8]) -> Result<(), ClientError> {
        self.send_direct(peer, &DirectMessage::Text(plaintext.to_vec()))
    }

    fn send_direct(&self, peer: &IdentityId, message: &DirectMessage) -> Result<(), ClientError> {
        let driver = self.peers.get_or_create(peer, || {
            let keys = self.directory.identity_keys(peer)?;
            let verifier = VerifyingKey::from_bytes(&keys.sign_public)
                .map_err(|e| ClientError::Protocol(format!("bad identity key: {e}")))?;
            let bundle = self.directory.pre_key_bundle(peer)?;
            bundle.verify(&verifier)?;
            debug!(peer = %peer, "initiating pairwise session");
            Ok(PeerSession::initiate(peer.clone(), &self.identity, &bundle))
        })?;
        let mut session = lock_driver(&driver);

        let handshake = session.take_handshake();
        let has_pre_key = handshake.is_some();
        let body = session.encrypt(&codec::encode(message)?)?;
        let wire = PairwiseWire { handshake, body };

        let mut envelope =
            MessageEnvelope::new(self.self_id.clone(), peer.as_str(), codec::encode(&wire)?);
        envelope.has_pre_key = has_pre_key;
        self.outbox.send(envelope)
    }

    fn receive_direct(
        &self,
        envelope: &MessageEnvelope,
    ) -> Result<Option<Incoming>, ClientError> {
        let wire: PairwiseWire = codec::decode(&envelope.ciphertext)?;
        let sender = envelope.sender.clone();

        let driver = match (self.peers.get(&sender), &wire.handshake) {
            (Some(driver), _) => driver,
            (None, Some(handshake)) => {
                let one_time = match handshake.one_time_id {
                    Some(id) => Some(lock(&self.one_time_prekeys).remove(&id).ok_or_else(
                        || ClientError::not_found("one-time prekey", id),
                    )?),
                    None => None,
                };
                let session = PeerSession::respond(
                    sender.clone(),
                    &self.identity,
                    &self.signed_prekey,
                    one_time.as_ref(),
                    handshake,
                );
                self.peers.insert(sender.clone(), session)
            },
            (None, None) => {
                return Err(ClientError::Protocol(format!(
                    "no session with {sender} and no handshake attached"
                )));
            },
        };

        let plaintext = lock_driver(&driver).decrypt(&wire.body)?;
        match codec::decode(&plaintext)? {
            DirectMessage::Text(text) => Ok(Some(Incoming::Direct { sender, plaintext: text })),
            DirectMessage::SenderKeyDistribution(distribution) => {
                self.install_sender_key(&sender, &distribution)?;
                Ok(None)
            },
            DirectMessage::GroupMessage { group_id, message } => {
                self.handle_group_plaintext(&group_id, &sender, message)
            },
        }
    }

    fn install_sender_key(
        &self,
        sender: &IdentityId,
        distribution: &KeyDistribution,
    ) -> Result<(), ClientError> {
        let driver = self
            .groups
            .get(&distribution.group_id)
            .ok_or_else(|| ClientError::not_found("group", &distribution.group_id))?;
        {
            let mut driver = lock_driver(&driver);
            match &mut *driver {
                GroupDriver::ServerSide(session) => {
                    session.add_sender_key(sender.clone(), &distribution.sender_key);
                },
                _ => {
                    return Err(ClientError::Protocol(
                        "sender key for a group without sender-key fanout".to_owned(),
                    ));
                },
            }
        }
        if distribution.bounce_back {
            self.distribute_sender_key(&distribution.group_id, &[sender.clone()], false)?;
        }
        Ok(())
    }

    /// Send our sender key to the given peers over pairwise sessions.
    fn distribute_sender_key(
        &self,
        group_id: &GroupId,
        peers: &[IdentityId],
        bounce_back: bool,
    ) -> Result<(), ClientError> {
        let driver = self
            .groups
            .get(group_id)
            .ok_or_else(|| ClientError::not_found("group", group_id))?;
        let sender_key = match &*lock_driver(&driver) {
            GroupDriver::ServerSide(session) => session.self_sender_key(),
            _ => return Ok(()),
        };
        let message = DirectMessage::SenderKeyDistribution(KeyDistribution {
            group_id: group_id.clone(),
            sender_key,
            bounce_back,
        });
        for peer in peers {
            if peer != &self.self_id {
                self.send_direct(peer, &message)?;
            }
        }
        Ok(())
    }

    // ---- group lifecycle ----

    /// Set up the local driver for a group this client just created on
    /// the server.
    ///
    /// # Errors
    ///
    /// Fails if the tree-group genesis fails.
    pub fn create_group(&self, group_id: GroupId, group_type: GroupType) -> Result<(), ClientError> {
        let driver = match group_type {
            GroupType::ServerSide => GroupDriver::ServerSide(ServerSideSession::new(
                group_id.clone(),
                self.self_id.clone(),
            )),
            GroupType::ClientSide => GroupDriver::ClientSide(ClientSideSession::new(
                group_id.clone(),
                self.self_id.clone(),
            )),
            GroupType::Mls => {
                GroupDriver::Mls(MlsSession::create(group_id.clone(), self.self_id.clone())?)
            },
        };
        self.groups.insert(group_id.clone(), driver);
        lock(&self.rosters).insert(
            group_id.clone(),
            GroupInfo {
                group_id,
                group_type,
                participants: vec![self.self_id.clone()],
                chatbots: Vec::new(),
                visibility: std::collections::BTreeMap::new(),
            },
        );
        Ok(())
    }

    /// Prepare the key material for inviting a user, mutating local
    /// group state. The returned artifacts go to the server's
    /// `invite_member` call as the event piggybacks.
    ///
    /// # Errors
    ///
    /// Fails if the invitee's key material cannot be fetched or the
    /// commit fails; local state is unchanged on failure.
    pub fn prepare_invite(
        &self,
        group_id: &GroupId,
        invitee: &IdentityId,
    ) -> Result<InviteArtifacts, ClientError> {
        let driver = self
            .groups
            .get(group_id)
            .ok_or_else(|| ClientError::not_found("group", group_id))?;
        let invitee_keys = self.directory.identity_keys(invitee)?;
        let mut driver = lock_driver(&driver);

        let mut artifacts = InviteArtifacts::default();
        let welcome = match &mut *driver {
            GroupDriver::Mls(session) => {
                let key_package = self.directory.key_package(invitee)?;
                let (welcome, commit) = session.add_member(&key_package)?;
                artifacts.addition = Some(commit);
                Some(welcome)
            },
            GroupDriver::ClientSide(session) => {
                session.add_member(invitee.clone());
                None
            },
            GroupDriver::ServerSide(_) => None,
        };

        let member_join =
            driver.multi_tree().map(|tree| tree.member_join(&invitee_keys.dh_public));
        artifacts.invitation =
            Some(codec::encode(&InvitePiggyback { welcome, member_join })?);

        if let Some(info) = lock(&self.rosters).get_mut(group_id) {
            if !info.participants.contains(invitee) {
                info.participants.push(invitee.clone());
            }
        }
        Ok(artifacts)
    }

    /// Remove a user from a group. Call before the server's
    /// `remove_member`.
    ///
    /// Only the tree-group driver re-keys on removal. Sender-key groups
    /// drop the departed chain and keep sending on the existing one,
    /// which the removed member can still follow.
    ///
    /// # Errors
    ///
    /// Fails if the member is unknown to the local driver.
    pub fn remove_member(
        &self,
        group_id: &GroupId,
        removed: &IdentityId,
    ) -> Result<(), ClientError> {
        let driver = self
            .groups
            .get(group_id)
            .ok_or_else(|| ClientError::not_found("group", group_id))?;

        let commit = {
            let mut driver = lock_driver(&driver);
            match &mut *driver {
                GroupDriver::Mls(session) => Some(session.remove_member(removed)?),
                GroupDriver::ClientSide(session) => {
                    session.remove_member(removed)?;
                    None
                },
                GroupDriver::ServerSide(session) => {
                    session.remove_sender(removed);
                    None
                },
            }
        };

        if let Some(info) = lock(&self.rosters).get_mut(group_id) {
            info.participants.retain(|p| p != removed);
        }

        // The commit travels as a group message; the removed member is
        // no longer a recipient of it.
        if let Some(commit) = commit {
            let envelope = MessageEnvelope::new(self.self_id.clone(), group_id.as_str(), commit);
            self.outbox.send(envelope)?;
        }
        Ok(())
    }

    /// Prepare the key material for inviting a chatbot. For external
    /// path chatbots this creates its tree node: the invitation carries
    /// the join secret sealed to the chatbot's identity key, and the
    /// addition carries the announcement other members decrypt with the
    /// shared tree root.
    ///
    /// # Errors
    ///
    /// Fails if the chatbot's keys cannot be fetched or the group has
    /// no driver.
    pub fn prepare_chatbot_invite(
        &self,
        group_id: &GroupId,
        chatbot: &IdentityId,
        visibility: ChatbotVisibility,
    ) -> Result<InviteArtifacts, ClientError> {
        let driver = self
            .groups
            .get(group_id)
            .ok_or_else(|| ClientError::not_found("group", group_id))?;
        if !visibility.is_iga() {
            // Core path chatbots get their keys pairwise, on addition.
            return Ok(InviteArtifacts::default());
        }

        let bot_keys = self.directory.identity_keys(chatbot)?;
        self.ensure_multi_tree(group_id, &driver)?;

        let mut driver = lock_driver(&driver);
        let tree = driver.multi_tree_mut().ok_or(SessionError::TreeMissing)?;
        let (join, announcement) = tree.external_node_join(chatbot);

        // The join holds the node secret; only the chatbot may read it.
        let sealed_join = veil_crypto::kem_seal(
            &codec::encode(&join)?,
            &bot_keys.dh_public,
            random_array(),
            random_array(),
        );

        Ok(InviteArtifacts {
            invitation: Some(codec::encode(&sealed_join)?),
            addition: Some(codec::encode(&announcement)?),
        })
    }

    /// Attach an external tree to a group that has none yet.
    ///
    /// Tree-based groups derive the secret from their own epoch, so
    /// every member arrives at the same tree independently. Other group
    /// types generate a random secret and distribute it through an
    /// encrypted rotation message.
    fn ensure_multi_tree(
        &self,
        group_id: &GroupId,
        driver: &Arc<Mutex<GroupDriver>>,
    ) -> Result<(), ClientError> {
        let rotation = {
            let mut driver = lock_driver(driver);
            if driver.multi_tree().is_some() {
                return Ok(());
            }
            match &mut *driver {
                GroupDriver::Mls(session) => {
                    session.init_multi_tree()?;
                    None
                },
                GroupDriver::ServerSide(session) => Some(session.init_multi_tree()),
                GroupDriver::ClientSide(session) => {
                    let secret: [u8; 32] = random_array();
                    session.set_multi_tree(MultiTree::new(secret));
                    Some(secret)
                },
            }
        };
        if let Some(secret) = rotation {
            let plaintext = GroupPlaintext {
                payload: codec::encode(&TreeSecretRotation { secret })?,
                kind: MessageKind::TreeKeyUpdate,
                chatbot_ids: Vec::new(),
            };
            self.send_group_plaintext(group_id, plaintext, &[])?;
        }
        Ok(())
    }

    // ---- sending into groups ----

    /// Send an application payload to a group, addressing the given
    /// chatbots.
    ///
    /// # Errors
    ///
    /// Fails if any addressed chatbot is not in the group, or any
    /// encryption or send step fails.
    pub fn send_group(
        &self,
        group_id: &GroupId,
        payload: &[u8],
        chatbots: &[IdentityId],
    ) -> Result<(), ClientError> {
        let info = self.roster(group_id)?;
        for bot in chatbots {
            if !info.chatbots.contains(bot) {
                return Err(ClientError::not_found("chatbot", bot));
            }
        }
        let plaintext = GroupPlaintext {
            payload: payload.to_vec(),
            kind: MessageKind::Text,
            chatbot_ids: chatbots.to_vec(),
        };
        self.send_group_plaintext(group_id, plaintext, chatbots)
    }

    fn send_group_plaintext(
        &self,
        group_id: &GroupId,
        plaintext: GroupPlaintext,
        addressed: &[IdentityId],
    ) -> Result<(), ClientError> {
        let info = self.roster(group_id)?;
        let driver = self
            .groups
            .get(group_id)
            .ok_or_else(|| ClientError::not_found("group", group_id))?;

        let mut envelope =
            MessageEnvelope::new(self.self_id.clone(), group_id.as_str(), Vec::new());

        // Main ciphertext for the members.
        let mut tree_update = None;
        {
            let mut driver = lock_driver(&driver);
            match &mut *driver {
                GroupDriver::ServerSide(session) => {
                    envelope.ciphertext = session.encrypt(&plaintext)?;
                },
                GroupDriver::Mls(session) => {
                    let (message, commit) = session.encrypt(&plaintext)?;
                    envelope.ciphertext = message;
                    envelope.key_update = Some(commit);
                    // The send advanced the epoch; rotate the chatbot
                    // roots to the new tree secret.
                    let iga = iga_chatbots(&info);
                    if !iga.is_empty() {
                        if let Some(tree) = session.multi_tree_mut() {
                            tree_update = Some(tree.update(&iga));
                        }
                    }
                },
                GroupDriver::ClientSide(_) => {
                    let message = DirectMessage::GroupMessage {
                        group_id: group_id.clone(),
                        message: plaintext.clone(),
                    };
                    // Core path chatbots receive the pairwise fanout
                    // like any member.
                    let core_bots = info.chatbots.iter().filter(|bot| {
                        addressed.contains(*bot)
                            && info.visibility.get(*bot).is_some_and(|v| !v.is_iga())
                    });
                    let peers =
                        info.participants.iter().filter(|p| *p != &self.self_id).chain(core_bots);
                    for peer in peers {
                        self.send_direct(peer, &message)?;
                    }
                },
            }
        }

        // Per-chatbot sub-messages.
        let any_iga_addressed =
            addressed.iter().any(|bot| info.visibility.get(bot).is_some_and(|v| v.is_iga()));
        for bot in &info.chatbots {
            let Some(visibility) = info.visibility.get(bot).copied() else { continue };
            let is_addressed = addressed.contains(bot);

            if !visibility.is_iga() {
                // Core path chatbots decrypt the same ciphertext the
                // members do.
                if is_addressed && !envelope.ciphertext.is_empty() {
                    envelope.chatbot_messages.insert(bot.clone(), envelope.ciphertext.clone());
                }
                continue;
            }
            if !is_addressed && !(self.config.hide_triggers && any_iga_addressed) {
                continue;
            }

            let bot_plaintext = if is_addressed {
                GroupPlaintext {
                    payload: plaintext.payload.clone(),
                    kind: plaintext.kind,
                    chatbot_ids: vec![bot.clone()],
                }
            } else {
                // Dummy of the same length, so size does not give the
                // real trigger away.
                GroupPlaintext {
                    payload: random_bytes(plaintext.payload.len()),
                    kind: MessageKind::Skip,
                    chatbot_ids: vec![bot.clone()],
                }
            };

            let sub = self.seal_for_chatbot(
                group_id,
                &driver,
                bot,
                visibility,
                &bot_plaintext,
                tree_update.as_ref(),
            )?;
            envelope.chatbot_messages.insert(bot.clone(), sub);
            envelope.is_iga = true;
        }

        if !envelope.ciphertext.is_empty()
            || !envelope.chatbot_messages.is_empty()
            || envelope.key_update.is_some()
        {
            self.outbox.send(envelope)?;
        }
        Ok(())
    }

    fn seal_for_chatbot(
        &self,
        group_id: &GroupId,
        driver: &Arc<Mutex<GroupDriver>>,
        bot: &IdentityId,
        visibility: ChatbotVisibility,
        plaintext: &GroupPlaintext,
        tree_update: Option<&veil_core::TreeUpdate>,
    ) -> Result<Vec<u8>, ClientError> {
        let driver = lock_driver(driver);
        let tree = driver.multi_tree().ok_or(SessionError::TreeMissing)?;
        let root_secret =
            tree.root_secret(bot).ok_or_else(|| ClientError::not_found("chatbot root", bot))?;

        let (sender, signer) = if visibility.is_pseudonymous() {
            let pseudonyms = lock(&self.pseudonyms);
            let pseudonym = pseudonyms
                .get(group_id)
                .ok_or_else(|| ClientError::not_found("pseudonym", group_id))?;
            (pseudonym.id.clone(), Some(pseudonym.signing.clone()))
        } else {
            (self.self_id.clone(), None)
        };

        let sealed = seal(
            &codec::encode(plaintext)?,
            &root_secret,
            random_array(),
            signer.as_ref(),
        )?
        .to_bytes()?;

        let update = tree_update.and_then(|update| {
            update.ciphertexts.get(bot).map(|ciphertext| NodeUpdate {
                ciphertext: ciphertext.clone(),
                new_root_public: update.new_root_public,
                new_root_sign_public: update.new_root_sign_public,
            })
        });

        Ok(codec::encode(&ChatbotEnvelope { sender, update, sealed })?)
    }

    /// Rotate the external tree secret of a group whose strategy does
    /// not rotate it per send, pushing the new roots to members and
    /// chatbots.
    ///
    /// # Errors
    ///
    /// Fails if the group has no external tree.
    pub fn rotate_chatbot_keys(&self, group_id: &GroupId) -> Result<(), ClientError> {
        let info = self.roster(group_id)?;
        let driver = self
            .groups
            .get(group_id)
            .ok_or_else(|| ClientError::not_found("group", group_id))?;

        let secret: [u8; 32] = random_array();
        let update = {
            let mut driver = lock_driver(&driver);
            let tree = driver.multi_tree_mut().ok_or(SessionError::TreeMissing)?;
            tree.set_tree_secret(secret);
            tree.update(&iga_chatbots(&info))
        };

        // Members first, inside group encryption; then the chatbots,
        // each with its sealed share of the rotation.
        let plaintext = GroupPlaintext {
            payload: codec::encode(&TreeSecretRotation { secret })?,
            kind: MessageKind::TreeKeyUpdate,
            chatbot_ids: Vec::new(),
        };
        self.send_group_plaintext(group_id, plaintext, &[])?;

        let mut envelope =
            MessageEnvelope::new(self.self_id.clone(), group_id.as_str(), Vec::new());
        envelope.is_iga = true;
        for bot in iga_chatbots(&info) {
            let Some(visibility) = info.visibility.get(&bot).copied() else { continue };
            let sub = self.seal_for_chatbot(
                group_id,
                &driver,
                &bot,
                visibility,
                &GroupPlaintext {
                    payload: Vec::new(),
                    kind: MessageKind::ChatbotKeyUpdate,
                    chatbot_ids: vec![bot.clone()],
                },
                Some(&update),
            )?;
            envelope.chatbot_messages.insert(bot, sub);
        }
        if envelope.chatbot_messages.is_empty() {
            return Ok(());
        }
        self.outbox.send(envelope)
    }

    // ---- inbound ----

    /// Process a membership event from the event stream.
    ///
    /// # Errors
    ///
    /// Fails if a piggyback does not decode or the event references a
    /// group this client cannot reconcile.
    pub fn handle_event(&self, event: &ServerEvent) -> Result<(), ClientError> {
        match event {
            ServerEvent::GroupInvitation { group, inviter, piggyback } => {
                self.handle_invitation(group, inviter, piggyback.as_deref())
            },
            ServerEvent::GroupAddition { group_id, added, piggyback } => {
                self.handle_addition(group_id, added, piggyback.as_deref())
            },
            ServerEvent::GroupRemoval { group_id, removed } => {
                self.handle_removal(group_id, removed)
            },
            ServerEvent::ChatbotInvitation { group, visibility, piggyback: _ } => {
                // Arrives when this identity is itself a core path
                // chatbot; external path chatbots use a ChatbotAgent.
                if visibility.is_iga() {
                    return Err(ClientError::Protocol(
                        "external path chatbot events need a chatbot agent".to_owned(),
                    ));
                }
                self.handle_core_chatbot_invitation(group)
            },
            ServerEvent::ChatbotAddition { group_id, chatbot, visibility, piggyback } => {
                self.handle_chatbot_addition(group_id, chatbot, *visibility, piggyback.as_deref())
            },
            ServerEvent::ChatbotRemoval { group_id, chatbot } => {
                self.handle_chatbot_removal(group_id, chatbot)
            },
        }
    }

    fn handle_invitation(
        &self,
        group: &GroupInfo,
        inviter: &IdentityId,
        piggyback: Option<&[u8]>,
    ) -> Result<(), ClientError> {
        debug!(group = %group.group_id, inviter = %inviter, "joining group");
        let piggyback: Option<InvitePiggyback> =
            piggyback.map(codec::decode).transpose()?;

        let mut driver = match group.group_type {
            GroupType::ServerSide => GroupDriver::ServerSide(ServerSideSession::new(
                group.group_id.clone(),
                self.self_id.clone(),
            )),
            GroupType::ClientSide => GroupDriver::ClientSide(ClientSideSession::with_members(
                group.group_id.clone(),
                self.self_id.clone(),
                group.participants.clone(),
            )),
            GroupType::Mls => {
                let welcome = piggyback
                    .as_ref()
                    .and_then(|p| p.welcome.as_deref())
                    .ok_or_else(|| {
                        ClientError::Protocol("tree-group invitation without welcome".to_owned())
                    })?;
                let pending = lock(&self.pending_joins).pop_front().ok_or_else(|| {
                    ClientError::Protocol("welcome received with no pending join".to_owned())
                })?;
                GroupDriver::Mls(MlsSession::join_from_welcome(
                    group.group_id.clone(),
                    self.self_id.clone(),
                    welcome,
                    pending,
                )?)
            },
        };

        if let Some(member_join) = piggyback.as_ref().and_then(|p| p.member_join.as_ref()) {
            let self_keys = KemKeyPair::from_bytes(self.identity.to_bytes());
            driver.set_multi_tree(MultiTree::from_member_join(&self_keys, member_join)?);
        }

        self.groups.insert(group.group_id.clone(), driver);
        lock(&self.rosters).insert(group.group_id.clone(), group.clone());

        // In a sender-key group the new member announces its chain and
        // asks everyone to answer with theirs.
        if group.group_type == GroupType::ServerSide {
            let peers: Vec<IdentityId> = group.participants.clone();
            self.distribute_sender_key(&group.group_id, &peers, true)?;
        }
        Ok(())
    }

    fn handle_addition(
        &self,
        group_id: &GroupId,
        added: &IdentityId,
        piggyback: Option<&[u8]>,
    ) -> Result<(), ClientError> {
        if added == &self.self_id {
            // Our own addition is covered by the invitation event.
            return Ok(());
        }
        let Some(driver) = self.groups.get(group_id) else {
            return Ok(());
        };
        {
            let mut driver = lock_driver(&driver);
            match &mut *driver {
                GroupDriver::ClientSide(session) => session.add_member(added.clone()),
                GroupDriver::Mls(session) => {
                    if let Some(commit) = piggyback {
                        // Skip commits we produced ourselves as inviter.
                        if !session.member_ids().contains(added) {
                            session.process(commit)?;
                        }
                    }
                },
                GroupDriver::ServerSide(_) => {},
            }
            self.refresh_tree_roots(group_id, &mut driver)?;
        }
        if let Some(info) = lock(&self.rosters).get_mut(group_id) {
            if !info.participants.contains(added) {
                info.participants.push(added.clone());
            }
        }
        Ok(())
    }

    fn handle_removal(
        &self,
        group_id: &GroupId,
        removed: &IdentityId,
    ) -> Result<(), ClientError> {
        if removed == &self.self_id {
            debug!(group = %group_id, "removed from group");
            self.groups.remove(group_id);
            lock(&self.rosters).remove(group_id);
            lock(&self.pseudonyms).remove(group_id);
            return Ok(());
        }
        if let Some(info) = lock(&self.rosters).get_mut(group_id) {
            info.participants.retain(|p| p != removed);
        }
        let Some(driver) = self.groups.get(group_id) else {
            return Ok(());
        };
        let mut driver = lock_driver(&driver);
        match &mut *driver {
            // Membership changes do not rekey a sender-key group; only
            // the departed member's receiving chain is dropped.
            GroupDriver::ServerSide(session) => session.remove_sender(removed),
            GroupDriver::ClientSide(session) => {
                // Already gone when we initiated the removal.
                if session.members().contains(removed) {
                    session.remove_member(removed)?;
                }
            },
            // The remover's commit arrives as a group message.
            GroupDriver::Mls(_) => {},
        }
        Ok(())
    }

    /// This identity was invited into a group as a core path chatbot:
    /// it participates like a member, minus group sends.
    fn handle_core_chatbot_invitation(&self, group: &GroupInfo) -> Result<(), ClientError> {
        let driver = match group.group_type {
            GroupType::ServerSide => GroupDriver::ServerSide(ServerSideSession::new(
                group.group_id.clone(),
                self.self_id.clone(),
            )),
            GroupType::ClientSide => GroupDriver::ClientSide(ClientSideSession::with_members(
                group.group_id.clone(),
                self.self_id.clone(),
                group.participants.clone(),
            )),
            GroupType::Mls => {
                return Err(ClientError::Protocol(
                    "core path chatbots are not supported in tree groups".to_owned(),
                ));
            },
        };
        self.groups.insert(group.group_id.clone(), driver);
        lock(&self.rosters).insert(group.group_id.clone(), group.clone());
        Ok(())
    }

    fn handle_chatbot_addition(
        &self,
        group_id: &GroupId,
        chatbot: &IdentityId,
        visibility: ChatbotVisibility,
        piggyback: Option<&[u8]>,
    ) -> Result<(), ClientError> {
        {
            let mut rosters = lock(&self.rosters);
            let Some(info) = rosters.get_mut(group_id) else {
                // As a fellow chatbot in a tree group we only need to
                // know the node exists, which the tree tracks below.
                return Ok(());
            };
            if !info.chatbots.contains(chatbot) {
                info.chatbots.push(chatbot.clone());
            }
            info.visibility.insert(chatbot.clone(), visibility);
        }
        let Some(driver) = self.groups.get(group_id) else {
            return Ok(());
        };

        if visibility.is_iga() {
            self.ensure_multi_tree(group_id, &driver)?;
            let mut driver = lock_driver(&driver);
            let tree = driver.multi_tree_mut().ok_or(SessionError::TreeMissing)?;
            if !tree.has_external_node(chatbot) {
                let announcement = piggyback
                    .map(codec::decode)
                    .transpose()?
                    .ok_or_else(|| {
                        ClientError::Protocol("chatbot addition without announcement".to_owned())
                    })?;
                tree.add_external_node(chatbot, &announcement)?;
            }
            drop(driver);

            if visibility.is_pseudonymous() {
                self.register_pseudonym(group_id, chatbot)?;
            }
        } else {
            // Core path chatbot: hand it our sender key so it can read
            // the group's ciphertexts.
            self.distribute_sender_key(group_id, std::slice::from_ref(chatbot), false)?;
        }
        Ok(())
    }

    /// Create this member's pseudonym for a group (once) and register
    /// it with a pseudonymous chatbot over the external path.
    fn register_pseudonym(
        &self,
        group_id: &GroupId,
        chatbot: &IdentityId,
    ) -> Result<(), ClientError> {
        let registration = {
            let mut pseudonyms = lock(&self.pseudonyms);
            let pseudonym = pseudonyms.entry(group_id.clone()).or_insert_with(|| Pseudonym {
                id: IdentityId::new(format!("{}{}-pseudonym", self.self_id, group_id)),
                signing: SigningKey::from_bytes(&random_array::<32>()),
            });
            PseudonymRegistration {
                pseudonym: pseudonym.id.clone(),
                sign_public: pseudonym.signing.verifying_key().to_bytes(),
            }
        };

        let driver = self
            .groups
            .get(group_id)
            .ok_or_else(|| ClientError::not_found("group", group_id))?;
        let (root_secret, pseudonym_id) = {
            let driver = lock_driver(&driver);
            let tree = driver.multi_tree().ok_or(SessionError::TreeMissing)?;
            let secret = tree
                .root_secret(chatbot)
                .ok_or_else(|| ClientError::not_found("chatbot root", chatbot))?;
            (secret, registration.pseudonym.clone())
        };

        // The registration travels under the pseudonym itself; the
        // chatbot learns the binding, the server learns nothing.
        let sealed = seal(
            &codec::encode(&GroupPlaintext {
                payload: codec::encode(&registration)?,
                kind: MessageKind::PseudonymRegistration,
                chatbot_ids: vec![chatbot.clone()],
            })?,
            &root_secret,
            random_array(),
            None,
        )?
        .to_bytes()?;

        let mut envelope =
            MessageEnvelope::new(pseudonym_id, group_id.as_str(), Vec::new());
        envelope.is_iga = true;
        envelope.chatbot_messages.insert(
            chatbot.clone(),
            codec::encode(&ChatbotEnvelope {
                sender: registration.pseudonym,
                update: None,
                sealed,
            })?,
        );
        self.outbox.send(envelope)
    }

    fn handle_chatbot_removal(
        &self,
        group_id: &GroupId,
        chatbot: &IdentityId,
    ) -> Result<(), ClientError> {
        if let Some(info) = lock(&self.rosters).get_mut(group_id) {
            info.chatbots.retain(|bot| bot != chatbot);
            info.visibility.remove(chatbot);
        }
        if let Some(driver) = self.groups.get(group_id) {
            let mut driver = lock_driver(&driver);
            if let Some(tree) = driver.multi_tree_mut() {
                tree.remove_external_node(chatbot);
            }
        }
        Ok(())
    }

    /// Decrypt an envelope from the message stream.
    ///
    /// Control messages (key distributions, tree rotations, commits,
    /// dummy traffic) are consumed internally and yield `None`.
    ///
    /// # Errors
    ///
    /// Fails if the envelope cannot be attributed to a session or does
    /// not decrypt; the caller should treat the message as lost.
    pub fn handle_envelope(
        &self,
        envelope: &MessageEnvelope,
    ) -> Result<Option<Incoming>, ClientError> {
        if envelope.recipient == self.self_id.as_str() {
            return self.receive_direct(envelope);
        }

        let group_id = GroupId::new(envelope.recipient.clone());
        let info = self.roster(&group_id)?;

        if info.chatbots.contains(&envelope.sender) {
            return self.receive_chatbot_message(&group_id, envelope);
        }
        // Sub-messages addressed to us as a core path chatbot carry the
        // members' ciphertext directly.
        self.receive_group_ciphertext(&group_id, envelope)
    }

    fn receive_group_ciphertext(
        &self,
        group_id: &GroupId,
        envelope: &MessageEnvelope,
    ) -> Result<Option<Incoming>, ClientError> {
        let driver = self
            .groups
            .get(group_id)
            .ok_or_else(|| ClientError::not_found("group", group_id))?;
        let mut driver = lock_driver(&driver);

        let plaintext = match &mut *driver {
            GroupDriver::ServerSide(session) => {
                if envelope.ciphertext.is_empty() {
                    None
                } else {
                    Some(session.decrypt(&envelope.sender, &envelope.ciphertext)?)
                }
            },
            GroupDriver::Mls(session) => {
                let mut plaintext = None;
                if !envelope.ciphertext.is_empty() {
                    if let Processed::Message { plaintext: message, .. } =
                        session.process(&envelope.ciphertext)?
                    {
                        plaintext = Some(message);
                    }
                }
                if let Some(commit) = &envelope.key_update {
                    session.process(commit)?;
                }
                plaintext
            },
            // Client-side group traffic arrives on the pairwise path;
            // a group envelope only carried chatbot sub-messages.
            GroupDriver::ClientSide(_) => None,
        };
        self.refresh_tree_roots(group_id, &mut driver)?;
        drop(driver);

        match plaintext {
            Some(plaintext) => self.handle_group_plaintext(group_id, &envelope.sender, plaintext),
            None => Ok(None),
        }
    }

    /// After any epoch or membership change, re-derive per-chatbot
    /// roots from the driver's current tree secret.
    fn refresh_tree_roots(
        &self,
        group_id: &GroupId,
        driver: &mut GroupDriver,
    ) -> Result<(), ClientError> {
        if let GroupDriver::Mls(_) = driver {
            let iga = iga_chatbots(&self.roster(group_id)?);
            if !iga.is_empty() {
                if let Some(tree) = driver.multi_tree_mut() {
                    tree.handle_update(&iga);
                }
            }
        }
        Ok(())
    }

    fn handle_group_plaintext(
        &self,
        group_id: &GroupId,
        sender: &IdentityId,
        plaintext: GroupPlaintext,
    ) -> Result<Option<Incoming>, ClientError> {
        match plaintext.kind {
            MessageKind::Text => Ok(Some(Incoming::Group {
                group_id: group_id.clone(),
                sender: sender.clone(),
                plaintext: plaintext.payload,
            })),
            MessageKind::TreeKeyUpdate => {
                let rotation: TreeSecretRotation = codec::decode(&plaintext.payload)?;
                let driver = self
                    .groups
                    .get(group_id)
                    .ok_or_else(|| ClientError::not_found("group", group_id))?;
                let mut driver = lock_driver(&driver);
                let iga = iga_chatbots(&self.roster(group_id)?);
                match driver.multi_tree_mut() {
                    Some(tree) => {
                        tree.set_tree_secret(rotation.secret);
                        tree.handle_update(&iga);
                    },
                    None => driver.set_multi_tree(MultiTree::new(rotation.secret)),
                }
                Ok(None)
            },
            MessageKind::Skip => Ok(None),
            other => {
                warn!(?other, "unexpected control kind on the member path");
                Ok(None)
            },
        }
    }

    fn receive_chatbot_message(
        &self,
        group_id: &GroupId,
        envelope: &MessageEnvelope,
    ) -> Result<Option<Incoming>, ClientError> {
        let message: ChatbotGroupMessage = codec::decode(&envelope.ciphertext)?;
        let driver = self
            .groups
            .get(group_id)
            .ok_or_else(|| ClientError::not_found("group", group_id))?;
        let mut driver = lock_driver(&driver);
        let tree = driver.multi_tree_mut().ok_or(SessionError::TreeMissing)?;

        if let Some(update) = &message.node_update {
            tree.handle_external_node_update(&message.chatbot, update)?;
        }

        let root_secret = tree
            .root_secret(&message.chatbot)
            .ok_or_else(|| ClientError::not_found("chatbot root", &message.chatbot))?;
        let verifier = tree
            .root_signing(&message.chatbot)
            .ok_or_else(|| ClientError::not_found("chatbot root", &message.chatbot))?
            .verifying_key();

        let sealed = SealedMessage::from_bytes(&message.sealed)?;
        let plaintext = open(&sealed, &root_secret, Some(&verifier))?;
        let plaintext = GroupPlaintext::from_bytes(&plaintext)?;

        match plaintext.kind {
            MessageKind::Text => Ok(Some(Incoming::ChatbotMessage {
                group_id: group_id.clone(),
                chatbot: message.chatbot,
                plaintext: plaintext.payload,
            })),
            _ => Ok(None),
        }
    }
}
