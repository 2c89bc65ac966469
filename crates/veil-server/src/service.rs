//! The routing service.
//!
//! Ties the key directory, group registry, and mailboxes together. The
//! service never sees plaintext: envelopes are routed by recipient id
//! only, and all key material it stores is public. Membership events
//! carry opaque piggyback bytes the inviting client packed for the
//! recipient.

use rand::{Rng, distributions::Alphanumeric};
use tracing::debug;

use veil_proto::{
    ChatbotVisibility, GroupId, GroupInfo, GroupType, IdentityId, MessageEnvelope, ServerEvent,
};

use crate::{
    directory::{Directory, IdentityRecord, MemoryDirectory, SignedPreKeyRecord},
    error::ServiceError,
    mailbox::{DEFAULT_MAILBOX_CAPACITY, MailboxRegistry},
};

/// Tunables for a [`ChatService`].
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    /// Bound of each per-identity mailbox queue.
    pub mailbox_capacity: usize,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self { mailbox_capacity: DEFAULT_MAILBOX_CAPACITY }
    }
}

/// The mailbox-and-routing service, generic over the key directory so
/// tests can inject their own store.
pub struct ChatService<D = MemoryDirectory> {
    directory: D,
    mailboxes: MailboxRegistry,
}

impl ChatService<MemoryDirectory> {
    /// A service over a fresh in-memory directory with default config.
    pub fn new() -> Self {
        Self::with_config(ServiceConfig::default())
    }

    /// A service over a fresh in-memory directory.
    pub fn with_config(config: ServiceConfig) -> Self {
        Self::with_directory(MemoryDirectory::new(), config)
    }
}

impl Default for ChatService<MemoryDirectory> {
    fn default() -> Self {
        Self::new()
    }
}

impl<D: Directory> ChatService<D> {
    /// A service over an injected directory.
    pub fn with_directory(directory: D, config: ServiceConfig) -> Self {
        Self { directory, mailboxes: MailboxRegistry::new(config.mailbox_capacity) }
    }

    /// The underlying directory.
    pub fn directory(&self) -> &D {
        &self.directory
    }

    /// Register a user, creating its mailboxes on first registration.
    /// Re-registration updates the record and keeps the mailboxes.
    pub fn register_user(&self, id: &IdentityId, record: IdentityRecord) {
        debug!(user = %id, "register user");
        self.directory.upsert_user(id, record);
        self.mailboxes.ensure(id);
    }

    /// Register a chatbot, creating its mailboxes on first registration.
    pub fn register_chatbot(&self, id: &IdentityId, record: IdentityRecord) {
        debug!(chatbot = %id, "register chatbot");
        self.directory.upsert_chatbot(id, record);
        self.mailboxes.ensure(id);
    }

    /// A user's registered key material.
    ///
    /// # Errors
    ///
    /// [`ServiceError::NotFound`] if the user is not registered.
    pub fn user(&self, id: &IdentityId) -> Result<IdentityRecord, ServiceError> {
        self.directory.user(id).ok_or_else(|| ServiceError::not_found("user", id))
    }

    /// A chatbot's registered key material.
    ///
    /// # Errors
    ///
    /// [`ServiceError::NotFound`] if the chatbot is not registered.
    pub fn chatbot(&self, id: &IdentityId) -> Result<IdentityRecord, ServiceError> {
        self.directory.chatbot(id).ok_or_else(|| ServiceError::not_found("chatbot", id))
    }

    /// The identity key of a registered user or chatbot.
    ///
    /// # Errors
    ///
    /// [`ServiceError::NotFound`] if the identity is not registered.
    pub fn fetch_identity_key(&self, id: &IdentityId) -> Result<Vec<u8>, ServiceError> {
        self.directory.identity_key(id).ok_or_else(|| ServiceError::not_found("identity", id))
    }

    /// Upload a one-time prekey.
    ///
    /// # Errors
    ///
    /// [`ServiceError::NotFound`] if the identity is not registered.
    pub fn upload_pre_key(
        &self,
        id: &IdentityId,
        key_id: u32,
        public: Vec<u8>,
    ) -> Result<(), ServiceError> {
        self.directory.add_pre_key(id, key_id, public)
    }

    /// Consume a one-time prekey. `None` when the pool is empty; the
    /// handshake then falls back to the signed prekey alone.
    ///
    /// # Errors
    ///
    /// [`ServiceError::NotFound`] if the identity is not registered.
    pub fn fetch_pre_key(&self, id: &IdentityId) -> Result<Option<(u32, Vec<u8>)>, ServiceError> {
        self.directory.take_pre_key(id)
    }

    /// Upload or replace the signed prekey.
    ///
    /// # Errors
    ///
    /// [`ServiceError::NotFound`] if the identity is not registered.
    pub fn upload_signed_pre_key(
        &self,
        id: &IdentityId,
        record: SignedPreKeyRecord,
    ) -> Result<(), ServiceError> {
        self.directory.set_signed_pre_key(id, record)
    }

    /// Fetch the signed prekey. Unlike one-time prekeys it is served to
    /// every fetcher.
    ///
    /// # Errors
    ///
    /// [`ServiceError::NotFound`] if the identity is not registered or
    /// never uploaded a signed prekey.
    pub fn fetch_signed_pre_key(
        &self,
        id: &IdentityId,
    ) -> Result<SignedPreKeyRecord, ServiceError> {
        self.directory
            .signed_pre_key(id)?
            .ok_or_else(|| ServiceError::not_found("signed prekey", id))
    }

    /// Upload a key package for tree-group joins.
    ///
    /// # Errors
    ///
    /// [`ServiceError::NotFound`] if the identity is not registered.
    pub fn upload_key_package(&self, id: &IdentityId, bytes: Vec<u8>) -> Result<(), ServiceError> {
        self.directory.add_key_package(id, bytes)
    }

    /// Consume a key package. Like one-time prekeys, each package is
    /// handed out at most once.
    ///
    /// # Errors
    ///
    /// [`ServiceError::NotFound`] if the identity is not registered or
    /// the pool is empty.
    pub fn fetch_key_package(&self, id: &IdentityId) -> Result<Vec<u8>, ServiceError> {
        self.directory
            .take_key_package(id)?
            .ok_or_else(|| ServiceError::not_found("key package", id))
    }

    /// Create a group with a server-generated id, the initiator as its
    /// only participant.
    ///
    /// # Errors
    ///
    /// [`ServiceError::NotFound`] if the initiator is not a registered
    /// user.
    pub fn create_group(
        &self,
        initiator: &IdentityId,
        group_type: GroupType,
    ) -> Result<GroupId, ServiceError> {
        if self.directory.user(initiator).is_none() {
            return Err(ServiceError::not_found("user", initiator));
        }
        // Ids are short, so retry until an unused one comes up.
        loop {
            let group_id = random_group_id();
            let inserted = self.directory.insert_group(GroupInfo {
                group_id: group_id.clone(),
                group_type,
                participants: vec![initiator.clone()],
                chatbots: Vec::new(),
                visibility: std::collections::BTreeMap::new(),
            });
            if inserted {
                debug!(group = %group_id, initiator = %initiator, ?group_type, "create group");
                return Ok(group_id);
            }
        }
    }

    /// A snapshot of a group's membership.
    ///
    /// # Errors
    ///
    /// [`ServiceError::NotFound`] if the group does not exist.
    pub fn group(&self, id: &GroupId) -> Result<GroupInfo, ServiceError> {
        self.directory
            .group(id)
            .ok_or_else(|| ServiceError::NotFound { what: "group", id: id.as_str().to_owned() })
    }

    /// Add a user to a group and fan out the membership change.
    ///
    /// The invitee receives a `GroupInvitation` with the full group
    /// state and `invite_piggyback`. Every other participant, and every
    /// chatbot on the core path, receives a `GroupAddition` carrying
    /// `addition_piggyback`.
    ///
    /// # Errors
    ///
    /// [`ServiceError::NotFound`] if the group or the invitee does not
    /// exist. Nothing is mutated or delivered on error.
    pub fn invite_member(
        &self,
        group_id: &GroupId,
        inviter: &IdentityId,
        invitee: &IdentityId,
        invite_piggyback: Option<Vec<u8>>,
        addition_piggyback: Option<Vec<u8>>,
    ) -> Result<(), ServiceError> {
        if self.directory.user(invitee).is_none() {
            return Err(ServiceError::not_found("user", invitee));
        }
        let info = self.directory.add_participant(group_id, invitee)?;
        debug!(group = %group_id, invitee = %invitee, "invite member");

        self.mailboxes.push_event(
            invitee,
            ServerEvent::GroupInvitation {
                group: info.clone(),
                inviter: inviter.clone(),
                piggyback: invite_piggyback,
            },
        )?;

        let addition = ServerEvent::GroupAddition {
            group_id: group_id.clone(),
            added: invitee.clone(),
            piggyback: addition_piggyback,
        };
        for participant in info.participants.iter().filter(|p| *p != invitee) {
            self.mailboxes.push_event(participant, addition.clone())?;
        }
        // Chatbots on the external path never learn the member list.
        for bot in core_path_chatbots(&info) {
            self.mailboxes.push_event(bot, addition.clone())?;
        }
        Ok(())
    }

    /// Remove a user from a group and fan out the membership change.
    ///
    /// Every remaining participant, every chatbot on the core path,
    /// and the removed identity itself receive a `GroupRemoval`.
    ///
    /// # Errors
    ///
    /// [`ServiceError::NotFound`] if the group does not exist or the
    /// identity is not a participant.
    pub fn remove_member(
        &self,
        group_id: &GroupId,
        removed: &IdentityId,
    ) -> Result<(), ServiceError> {
        let info = self.directory.remove_participant(group_id, removed)?;
        debug!(group = %group_id, removed = %removed, "remove member");

        let removal =
            ServerEvent::GroupRemoval { group_id: group_id.clone(), removed: removed.clone() };
        for participant in &info.participants {
            self.mailboxes.push_event(participant, removal.clone())?;
        }
        for bot in core_path_chatbots(&info) {
            self.mailboxes.push_event(bot, removal.clone())?;
        }
        // The removed member learns it was removed.
        self.mailboxes.push_event(removed, removal)
    }

    /// Add a chatbot to a group and fan out the membership change.
    ///
    /// The visibility flags are validated before anything is mutated.
    /// The chatbot receives a `ChatbotInvitation`; when it sits on the
    /// external path the participant list in its copy of the group
    /// state is withheld. All participants receive a `ChatbotAddition`,
    /// and in tree-based groups so does every other chatbot, since
    /// their external nodes hang off the same tree.
    ///
    /// # Errors
    ///
    /// [`ServiceError::Configuration`] for pseudonymous-without-IGA,
    /// [`ServiceError::NotFound`] if the group or chatbot does not
    /// exist.
    pub fn invite_chatbot(
        &self,
        group_id: &GroupId,
        chatbot: &IdentityId,
        is_iga: bool,
        is_pseudonymous: bool,
        invitation_piggyback: Option<Vec<u8>>,
        addition_piggyback: Option<Vec<u8>>,
    ) -> Result<(), ServiceError> {
        let visibility = ChatbotVisibility::from_flags(is_iga, is_pseudonymous)
            .map_err(|e| ServiceError::Configuration(e.to_string()))?;
        if self.directory.chatbot(chatbot).is_none() {
            return Err(ServiceError::not_found("chatbot", chatbot));
        }
        let info = self.directory.add_chatbot(group_id, chatbot, visibility)?;
        debug!(group = %group_id, chatbot = %chatbot, ?visibility, "invite chatbot");

        let mut chatbot_view = info.clone();
        if visibility.is_iga() {
            chatbot_view.participants.clear();
        }
        self.mailboxes.push_event(
            chatbot,
            ServerEvent::ChatbotInvitation {
                group: chatbot_view,
                visibility,
                piggyback: invitation_piggyback,
            },
        )?;

        let addition = ServerEvent::ChatbotAddition {
            group_id: group_id.clone(),
            chatbot: chatbot.clone(),
            visibility,
            piggyback: addition_piggyback,
        };
        for participant in &info.participants {
            self.mailboxes.push_event(participant, addition.clone())?;
        }
        if info.group_type == GroupType::Mls {
            for bot in info.chatbots.iter().filter(|b| *b != chatbot) {
                self.mailboxes.push_event(bot, addition.clone())?;
            }
        }
        Ok(())
    }

    /// Remove a chatbot from a group and fan out the membership change.
    ///
    /// Every participant and the removed chatbot itself receive a
    /// `ChatbotRemoval`.
    ///
    /// # Errors
    ///
    /// [`ServiceError::NotFound`] if the group does not exist or the
    /// chatbot is not in it.
    pub fn remove_chatbot(
        &self,
        group_id: &GroupId,
        chatbot: &IdentityId,
    ) -> Result<(), ServiceError> {
        let info = self.directory.remove_chatbot(group_id, chatbot)?;
        debug!(group = %group_id, chatbot = %chatbot, "remove chatbot");

        let removal =
            ServerEvent::ChatbotRemoval { group_id: group_id.clone(), chatbot: chatbot.clone() };
        for participant in &info.participants {
            self.mailboxes.push_event(participant, removal.clone())?;
        }
        self.mailboxes.push_event(chatbot, removal)
    }

    /// Route a message envelope.
    ///
    /// A user recipient gets the envelope as-is. A group recipient
    /// fans out: every participant except the sender gets a copy with
    /// the per-chatbot sub-messages stripped, and each sub-message goes
    /// to its chatbot's mailbox as an envelope of its own. All chatbot
    /// targets are validated before anything is enqueued, so a bad
    /// target rejects the whole send.
    ///
    /// # Errors
    ///
    /// [`ServiceError::NotFound`] if the recipient is neither a
    /// registered identity nor a group, or any addressed chatbot is not
    /// registered and in the group. [`ServiceError::MailboxFull`] stops
    /// the fanout at the first full mailbox.
    pub fn send_message(&self, envelope: MessageEnvelope) -> Result<(), ServiceError> {
        let recipient = IdentityId::new(envelope.recipient.clone());
        if self.directory.identity_key(&recipient).is_some() {
            return self.mailboxes.push_message(&recipient, envelope);
        }

        let group_id = GroupId::new(envelope.recipient.clone());
        let Some(info) = self.directory.group(&group_id) else {
            return Err(ServiceError::NotFound {
                what: "recipient",
                id: envelope.recipient.clone(),
            });
        };

        // Validate every chatbot target before the first delivery.
        for bot in envelope.chatbot_messages.keys() {
            if self.directory.chatbot(bot).is_none() || !info.chatbots.contains(bot) {
                return Err(ServiceError::not_found("chatbot", bot));
            }
        }

        let mut member_copy = envelope.clone();
        member_copy.chatbot_messages.clear();
        for participant in info.participants.iter().filter(|p| *p != &envelope.sender) {
            self.mailboxes.push_message(participant, member_copy.clone())?;
        }

        for (bot, ciphertext) in &envelope.chatbot_messages {
            let mut sub = MessageEnvelope::new(
                envelope.sender.clone(),
                envelope.recipient.clone(),
                ciphertext.clone(),
            );
            sub.is_iga = envelope.is_iga;
            self.mailboxes.push_message(bot, sub)?;
        }
        Ok(())
    }

    /// Claim the message stream for an identity. Each stream can be
    /// claimed once.
    ///
    /// # Errors
    ///
    /// [`ServiceError::NotFound`] if the identity has no mailbox,
    /// [`ServiceError::Protocol`] if the stream was already claimed.
    pub fn subscribe_messages(
        &self,
        id: &IdentityId,
    ) -> Result<tokio::sync::mpsc::Receiver<MessageEnvelope>, ServiceError> {
        self.mailboxes.take_messages(id)
    }

    /// Claim the event stream for an identity.
    ///
    /// # Errors
    ///
    /// Same conditions as [`ChatService::subscribe_messages`].
    pub fn subscribe_events(
        &self,
        id: &IdentityId,
    ) -> Result<tokio::sync::mpsc::Receiver<ServerEvent>, ServiceError> {
        self.mailboxes.take_events(id)
    }
}

/// Chatbots addressed through the core group path, which see
/// membership events like participants do.
fn core_path_chatbots(info: &GroupInfo) -> impl Iterator<Item = &IdentityId> {
    info.chatbots.iter().filter(|bot| {
        info.visibility.get(*bot).is_some_and(|visibility| !visibility.is_iga())
    })
}

fn random_group_id() -> GroupId {
    let suffix: String =
        rand::thread_rng().sample_iter(&Alphanumeric).take(8).map(char::from).collect();
    GroupId::new(format!("group{suffix}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn group_ids_carry_the_expected_shape() {
        let id = random_group_id();
        let suffix = id.as_str().strip_prefix("group").expect("prefix");
        assert_eq!(suffix.len(), 8);
        assert!(suffix.chars().all(|c| c.is_ascii_alphanumeric()));
    }
}
