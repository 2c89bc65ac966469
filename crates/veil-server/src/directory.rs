//! Key directory and group registry.
//!
//! The directory stores the public half of every identity's key
//! material: identity key, one-time prekeys (consumed on fetch), the
//! current signed prekey (served repeatedly), and tree-group key
//! packages (consumed on fetch, like one-time prekeys). It also owns
//! the group membership records. All state sits behind one repository
//! abstraction so tests can inject a pre-seeded or failing store.

use std::{
    collections::{HashMap, VecDeque},
    sync::{Mutex, PoisonError},
};

use veil_proto::{ChatbotVisibility, GroupId, GroupInfo, IdentityId};

use crate::error::ServiceError;

/// The public key material an identity registers with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdentityRecord {
    /// Long-term identity public key.
    pub identity_key: Vec<u8>,
    /// Registration id chosen by the client.
    pub registration_id: u32,
}

impl Default for IdentityRecord {
    fn default() -> Self {
        Self { identity_key: Vec::new(), registration_id: 0 }
    }
}

/// A signed prekey as uploaded: served to fetchers, never consumed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignedPreKeyRecord {
    /// Key id, for handshake bookkeeping on the owner's side.
    pub id: u32,
    /// Public key bytes.
    pub public: Vec<u8>,
    /// Signature over the public key by the owner's identity key.
    pub signature: Vec<u8>,
}

/// Repository of identities, key material, and groups.
///
/// Implementations must make each method atomic; callers compose them
/// without holding any lock of their own.
pub trait Directory: Send + Sync {
    /// Insert or update a user's identity record.
    fn upsert_user(&self, id: &IdentityId, record: IdentityRecord);

    /// Look up a user's identity record.
    fn user(&self, id: &IdentityId) -> Option<IdentityRecord>;

    /// Insert or update a chatbot's identity record.
    fn upsert_chatbot(&self, id: &IdentityId, record: IdentityRecord);

    /// Look up a chatbot's identity record.
    fn chatbot(&self, id: &IdentityId) -> Option<IdentityRecord>;

    /// The identity key of a user or chatbot.
    fn identity_key(&self, id: &IdentityId) -> Option<Vec<u8>>;

    /// Append a one-time prekey to an identity's pool.
    ///
    /// # Errors
    ///
    /// Fails if the identity is not registered.
    fn add_pre_key(&self, id: &IdentityId, key_id: u32, public: Vec<u8>)
    -> Result<(), ServiceError>;

    /// Pop the oldest one-time prekey, if any remain. Each prekey is
    /// handed out at most once.
    ///
    /// # Errors
    ///
    /// Fails if the identity is not registered.
    fn take_pre_key(&self, id: &IdentityId) -> Result<Option<(u32, Vec<u8>)>, ServiceError>;

    /// Replace an identity's signed prekey.
    ///
    /// # Errors
    ///
    /// Fails if the identity is not registered.
    fn set_signed_pre_key(
        &self,
        id: &IdentityId,
        record: SignedPreKeyRecord,
    ) -> Result<(), ServiceError>;

    /// The identity's current signed prekey, if one was uploaded.
    ///
    /// # Errors
    ///
    /// Fails if the identity is not registered.
    fn signed_pre_key(&self, id: &IdentityId) -> Result<Option<SignedPreKeyRecord>, ServiceError>;

    /// Append a key package to an identity's pool.
    ///
    /// # Errors
    ///
    /// Fails if the identity is not registered.
    fn add_key_package(&self, id: &IdentityId, bytes: Vec<u8>) -> Result<(), ServiceError>;

    /// Pop the oldest key package, if any remain.
    ///
    /// # Errors
    ///
    /// Fails if the identity is not registered.
    fn take_key_package(&self, id: &IdentityId) -> Result<Option<Vec<u8>>, ServiceError>;

    /// Insert a new group record. Returns `false` when the id is
    /// already taken and the record was not inserted.
    fn insert_group(&self, info: GroupInfo) -> bool;

    /// A snapshot of a group's membership record.
    fn group(&self, id: &GroupId) -> Option<GroupInfo>;

    /// Add a participant, ignoring duplicates. Returns the updated
    /// snapshot.
    ///
    /// # Errors
    ///
    /// Fails if the group does not exist.
    fn add_participant(
        &self,
        group: &GroupId,
        id: &IdentityId,
    ) -> Result<GroupInfo, ServiceError>;

    /// Remove a participant. Returns the updated snapshot.
    ///
    /// # Errors
    ///
    /// Fails if the group does not exist or the identity is not a
    /// participant.
    fn remove_participant(
        &self,
        group: &GroupId,
        id: &IdentityId,
    ) -> Result<GroupInfo, ServiceError>;

    /// Add a chatbot with its visibility, ignoring duplicate ids but
    /// updating visibility. Returns the updated snapshot.
    ///
    /// # Errors
    ///
    /// Fails if the group does not exist.
    fn add_chatbot(
        &self,
        group: &GroupId,
        id: &IdentityId,
        visibility: ChatbotVisibility,
    ) -> Result<GroupInfo, ServiceError>;

    /// Remove a chatbot. Returns the updated snapshot.
    ///
    /// # Errors
    ///
    /// Fails if the group does not exist or the chatbot is not in it.
    fn remove_chatbot(&self, group: &GroupId, id: &IdentityId)
    -> Result<GroupInfo, ServiceError>;
}

#[derive(Default)]
struct Entry {
    record: IdentityRecord,
    pre_keys: VecDeque<(u32, Vec<u8>)>,
    signed_pre_key: Option<SignedPreKeyRecord>,
    key_packages: VecDeque<Vec<u8>>,
}

#[derive(Default)]
struct State {
    users: HashMap<IdentityId, Entry>,
    chatbots: HashMap<IdentityId, Entry>,
    groups: HashMap<GroupId, GroupInfo>,
}

impl State {
    /// Key-material entry for a user or chatbot.
    fn entry_mut(&mut self, id: &IdentityId) -> Result<&mut Entry, ServiceError> {
        if self.users.contains_key(id) {
            return self.users.get_mut(id).ok_or_else(|| ServiceError::not_found("identity", id));
        }
        self.chatbots.get_mut(id).ok_or_else(|| ServiceError::not_found("identity", id))
    }

    fn group_mut(&mut self, id: &GroupId) -> Result<&mut GroupInfo, ServiceError> {
        self.groups
            .get_mut(id)
            .ok_or_else(|| ServiceError::NotFound { what: "group", id: id.as_str().to_owned() })
    }
}

/// In-memory [`Directory`] behind a single mutex.
#[derive(Default)]
pub struct MemoryDirectory {
    inner: Mutex<State>,
}

impl MemoryDirectory {
    /// Create an empty directory.
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Directory for MemoryDirectory {
    fn upsert_user(&self, id: &IdentityId, record: IdentityRecord) {
        let mut state = self.lock();
        state.users.entry(id.clone()).or_default().record = record;
    }

    fn user(&self, id: &IdentityId) -> Option<IdentityRecord> {
        self.lock().users.get(id).map(|entry| entry.record.clone())
    }

    fn upsert_chatbot(&self, id: &IdentityId, record: IdentityRecord) {
        let mut state = self.lock();
        state.chatbots.entry(id.clone()).or_default().record = record;
    }

    fn chatbot(&self, id: &IdentityId) -> Option<IdentityRecord> {
        self.lock().chatbots.get(id).map(|entry| entry.record.clone())
    }

    fn identity_key(&self, id: &IdentityId) -> Option<Vec<u8>> {
        let state = self.lock();
        state
            .users
            .get(id)
            .or_else(|| state.chatbots.get(id))
            .map(|entry| entry.record.identity_key.clone())
    }

    fn add_pre_key(
        &self,
        id: &IdentityId,
        key_id: u32,
        public: Vec<u8>,
    ) -> Result<(), ServiceError> {
        let mut state = self.lock();
        state.entry_mut(id)?.pre_keys.push_back((key_id, public));
        Ok(())
    }

    fn take_pre_key(&self, id: &IdentityId) -> Result<Option<(u32, Vec<u8>)>, ServiceError> {
        let mut state = self.lock();
        Ok(state.entry_mut(id)?.pre_keys.pop_front())
    }

    fn set_signed_pre_key(
        &self,
        id: &IdentityId,
        record: SignedPreKeyRecord,
    ) -> Result<(), ServiceError> {
        let mut state = self.lock();
        state.entry_mut(id)?.signed_pre_key = Some(record);
        Ok(())
    }

    fn signed_pre_key(&self, id: &IdentityId) -> Result<Option<SignedPreKeyRecord>, ServiceError> {
        let mut state = self.lock();
        Ok(state.entry_mut(id)?.signed_pre_key.clone())
    }

    fn add_key_package(&self, id: &IdentityId, bytes: Vec<u8>) -> Result<(), ServiceError> {
        let mut state = self.lock();
        state.entry_mut(id)?.key_packages.push_back(bytes);
        Ok(())
    }

    fn take_key_package(&self, id: &IdentityId) -> Result<Option<Vec<u8>>, ServiceError> {
        let mut state = self.lock();
        Ok(state.entry_mut(id)?.key_packages.pop_front())
    }

    fn insert_group(&self, info: GroupInfo) -> bool {
        let mut state = self.lock();
        if state.groups.contains_key(&info.group_id) {
            return false;
        }
        state.groups.insert(info.group_id.clone(), info);
        true
    }

    fn group(&self, id: &GroupId) -> Option<GroupInfo> {
        self.lock().groups.get(id).cloned()
    }

    fn add_participant(
        &self,
        group: &GroupId,
        id: &IdentityId,
    ) -> Result<GroupInfo, ServiceError> {
        let mut state = self.lock();
        let info = state.group_mut(group)?;
        if !info.participants.contains(id) {
            info.participants.push(id.clone());
        }
        Ok(info.clone())
    }

    fn remove_participant(
        &self,
        group: &GroupId,
        id: &IdentityId,
    ) -> Result<GroupInfo, ServiceError> {
        let mut state = self.lock();
        let info = state.group_mut(group)?;
        let index = info
            .participants
            .iter()
            .position(|member| member == id)
            .ok_or_else(|| ServiceError::not_found("participant", id))?;
        info.participants.remove(index);
        Ok(info.clone())
    }

    fn add_chatbot(
        &self,
        group: &GroupId,
        id: &IdentityId,
        visibility: ChatbotVisibility,
    ) -> Result<GroupInfo, ServiceError> {
        let mut state = self.lock();
        let info = state.group_mut(group)?;
        if !info.chatbots.contains(id) {
            info.chatbots.push(id.clone());
        }
        info.visibility.insert(id.clone(), visibility);
        Ok(info.clone())
    }

    fn remove_chatbot(
        &self,
        group: &GroupId,
        id: &IdentityId,
    ) -> Result<GroupInfo, ServiceError> {
        let mut state = self.lock();
        let info = state.group_mut(group)?;
        let index = info
            .chatbots
            .iter()
            .position(|bot| bot == id)
            .ok_or_else(|| ServiceError::not_found("chatbot", id))?;
        info.chatbots.remove(index);
        info.visibility.remove(id);
        Ok(info.clone())
    }
}

#[cfg(test)]
mod tests {
    use veil_proto::GroupType;

    use super::*;

    fn record(tag: u8) -> IdentityRecord {
        IdentityRecord { identity_key: vec![tag; 32], registration_id: u32::from(tag) }
    }

    fn seeded_group(directory: &MemoryDirectory) -> GroupId {
        let group_id = GroupId::new("groupTEST0001");
        assert!(directory.insert_group(GroupInfo {
            group_id: group_id.clone(),
            group_type: GroupType::ServerSide,
            participants: vec![IdentityId::new("alice")],
            chatbots: Vec::new(),
            visibility: std::collections::BTreeMap::new(),
        }));
        group_id
    }

    #[test]
    fn one_time_prekeys_are_consumed_in_order() {
        let directory = MemoryDirectory::new();
        let alice = IdentityId::new("alice");
        directory.upsert_user(&alice, record(1));

        directory.add_pre_key(&alice, 10, vec![0xAA]).expect("upload");
        directory.add_pre_key(&alice, 11, vec![0xBB]).expect("upload");

        assert_eq!(directory.take_pre_key(&alice).expect("fetch"), Some((10, vec![0xAA])));
        assert_eq!(directory.take_pre_key(&alice).expect("fetch"), Some((11, vec![0xBB])));
        assert_eq!(directory.take_pre_key(&alice).expect("fetch"), None);
    }

    #[test]
    fn signed_prekey_is_served_repeatedly() {
        let directory = MemoryDirectory::new();
        let alice = IdentityId::new("alice");
        directory.upsert_user(&alice, record(1));

        let signed = SignedPreKeyRecord { id: 7, public: vec![1, 2], signature: vec![3, 4] };
        directory.set_signed_pre_key(&alice, signed.clone()).expect("upload");

        assert_eq!(directory.signed_pre_key(&alice).expect("fetch"), Some(signed.clone()));
        assert_eq!(directory.signed_pre_key(&alice).expect("fetch"), Some(signed));
    }

    #[test]
    fn prekey_upload_requires_registration() {
        let directory = MemoryDirectory::new();
        assert!(matches!(
            directory.add_pre_key(&IdentityId::new("ghost"), 1, vec![]),
            Err(ServiceError::NotFound { .. })
        ));
    }

    #[test]
    fn chatbots_hold_key_material_too() {
        let directory = MemoryDirectory::new();
        let bot = IdentityId::new("weatherbot");
        directory.upsert_chatbot(&bot, record(9));

        directory.add_key_package(&bot, vec![0xC0]).expect("upload");
        assert_eq!(directory.take_key_package(&bot).expect("fetch"), Some(vec![0xC0]));
        assert_eq!(directory.take_key_package(&bot).expect("fetch"), None);
    }

    #[test]
    fn duplicate_group_id_is_rejected() {
        let directory = MemoryDirectory::new();
        let group_id = seeded_group(&directory);
        assert!(!directory.insert_group(GroupInfo {
            group_id,
            group_type: GroupType::Mls,
            participants: Vec::new(),
            chatbots: Vec::new(),
            visibility: std::collections::BTreeMap::new(),
        }));
    }

    #[test]
    fn membership_mutations_return_updated_snapshots() {
        let directory = MemoryDirectory::new();
        let group_id = seeded_group(&directory);
        let bob = IdentityId::new("bob");

        let info = directory.add_participant(&group_id, &bob).expect("add");
        assert_eq!(info.participants, vec![IdentityId::new("alice"), bob.clone()]);

        let info = directory.remove_participant(&group_id, &bob).expect("remove");
        assert_eq!(info.participants, vec![IdentityId::new("alice")]);

        assert!(matches!(
            directory.remove_participant(&group_id, &bob),
            Err(ServiceError::NotFound { .. })
        ));
    }

    #[test]
    fn chatbot_membership_tracks_visibility() {
        let directory = MemoryDirectory::new();
        let group_id = seeded_group(&directory);
        let bot = IdentityId::new("weatherbot");

        let info = directory
            .add_chatbot(&group_id, &bot, ChatbotVisibility::IgaPseudonymous)
            .expect("add");
        assert_eq!(info.visibility.get(&bot), Some(&ChatbotVisibility::IgaPseudonymous));

        let info = directory.remove_chatbot(&group_id, &bot).expect("remove");
        assert!(info.chatbots.is_empty());
        assert!(info.visibility.is_empty());
    }
}
