//! Tree-based group sessions on top of `OpenMLS`.
//!
//! Each session wraps one `OpenMLS` group. Credentials carry the member's
//! identity string, so group membership maps directly onto directory
//! identities. Every application message is followed by a self-update
//! commit, giving post-compromise security at the cost of one commit per
//! send; receivers process the message and the commit as a pair.
//!
//! Chatbots never hold leaves in the tree. When a group has chatbots on
//! the independent key-agreement path, a [`MultiTree`] hangs off the
//! session and its shared secret is re-derived from the group's exporter
//! secret after every merged commit.

use openmls::{
    key_packages::KeyPackageIn,
    prelude::{MlsMessageIn, *},
};
use openmls_basic_credential::SignatureKeyPair;
use tls_codec::{Deserialize, Serialize};

use veil_proto::{GroupId, GroupPlaintext, IdentityId};

use super::provider::MlsSessionProvider;
use crate::{error::SessionError, multi_tree::MultiTree};

/// Ciphersuite used for all groups.
const CIPHERSUITE: Ciphersuite = Ciphersuite::MLS_128_DHKEMX25519_AES128GCM_SHA256_Ed25519;

/// Exporter label for the external tree shared secret.
const TREE_EXPORT_LABEL: &str = "veil multi tree";

/// Opaque state needed to process a Welcome message.
///
/// Returned by [`MlsSession::generate_key_package`] and consumed by
/// [`MlsSession::join_from_welcome`] when the Welcome arrives. It holds
/// the private key material the Welcome is encrypted to.
pub struct PendingJoin {
    provider: MlsSessionProvider,
    signer: SignatureKeyPair,
}

/// Result of decrypting one unit of group traffic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Processed {
    /// An application message from the given member.
    Message {
        /// The sending member.
        sender: IdentityId,
        /// Decrypted payload.
        plaintext: GroupPlaintext,
    },
    /// A commit was merged; the epoch advanced.
    EpochAdvanced,
    /// A proposal was stored for a later commit.
    ProposalStored,
}

/// A member's view of one tree-based group.
pub struct MlsSession {
    group_id: GroupId,
    self_id: IdentityId,
    mls_group: openmls::group::MlsGroup,
    signer: SignatureKeyPair,
    provider: MlsSessionProvider,
    multi_tree: Option<MultiTree>,
}

/// Build a credential for an identity.
fn credential_for(id: &IdentityId) -> BasicCredential {
    BasicCredential::new(id.as_str().as_bytes().to_vec())
}

/// Extract the identity from an MLS credential.
///
/// Our credentials store the identity as UTF-8 bytes.
fn identity_from_credential(credential: &Credential) -> Result<IdentityId, SessionError> {
    let bytes = credential.serialized_content();
    let id = std::str::from_utf8(bytes)
        .map_err(|_| SessionError::Crypto("Credential is not valid UTF-8".to_string()))?;
    Ok(IdentityId::new(id))
}

impl MlsSession {
    /// Create a new single-member group.
    ///
    /// # Errors
    ///
    /// Fails if keypair generation or group creation fails.
    pub fn create(group_id: GroupId, self_id: IdentityId) -> Result<Self, SessionError> {
        let provider = MlsSessionProvider::new();

        let signer = SignatureKeyPair::new(CIPHERSUITE.signature_algorithm())
            .map_err(|e| SessionError::Crypto(format!("Failed to generate keypair: {e}")))?;

        let credential_with_key = CredentialWithKey {
            credential: credential_for(&self_id).into(),
            signature_key: signer.public().into(),
        };

        let config = MlsGroupCreateConfig::builder()
            .ciphersuite(CIPHERSUITE)
            .use_ratchet_tree_extension(true)
            .build();

        let mls_group =
            openmls::group::MlsGroup::new(&provider, &signer, &config, credential_with_key)
                .map_err(|e| SessionError::Crypto(format!("Failed to create group: {e}")))?;

        Ok(Self { group_id, self_id, mls_group, signer, provider, multi_tree: None })
    }

    /// Generate a KeyPackage for joining a group.
    ///
    /// The serialized KeyPackage is published to the directory; the
    /// returned [`PendingJoin`] must be kept to process the Welcome.
    ///
    /// # Errors
    ///
    /// Fails if keypair generation or KeyPackage construction fails.
    pub fn generate_key_package(
        self_id: &IdentityId,
    ) -> Result<(Vec<u8>, PendingJoin), SessionError> {
        let provider = MlsSessionProvider::new();

        let signer = SignatureKeyPair::new(CIPHERSUITE.signature_algorithm())
            .map_err(|e| SessionError::Crypto(format!("Failed to generate keypair: {e}")))?;

        let credential_with_key = CredentialWithKey {
            credential: credential_for(self_id).into(),
            signature_key: signer.public().into(),
        };

        let bundle = KeyPackage::builder()
            .build(CIPHERSUITE, &provider, &signer, credential_with_key)
            .map_err(|e| SessionError::Crypto(format!("Failed to build KeyPackage: {e}")))?;

        let bytes = bundle
            .key_package()
            .tls_serialize_detached()
            .map_err(|e| SessionError::Serialization(format!("Failed to serialize: {e}")))?;

        Ok((bytes, PendingJoin { provider, signer }))
    }

    /// Join a group from a Welcome message.
    ///
    /// `pending` must be the state returned by the `generate_key_package`
    /// call whose KeyPackage this Welcome was addressed to.
    ///
    /// # Errors
    ///
    /// Fails if the Welcome does not parse or was not encrypted to the
    /// pending KeyPackage.
    pub fn join_from_welcome(
        group_id: GroupId,
        self_id: IdentityId,
        welcome_bytes: &[u8],
        pending: PendingJoin,
    ) -> Result<Self, SessionError> {
        let PendingJoin { provider, signer } = pending;

        let message = MlsMessageIn::tls_deserialize(&mut welcome_bytes.as_ref())
            .map_err(|e| SessionError::Serialization(format!("Failed to parse Welcome: {e}")))?;

        let MlsMessageBodyIn::Welcome(welcome) = message.extract() else {
            return Err(SessionError::Serialization("Message is not a Welcome".to_string()));
        };

        let join_config = MlsGroupJoinConfig::builder().use_ratchet_tree_extension(true).build();

        let mls_group = StagedWelcome::new_from_welcome(&provider, &join_config, welcome, None)
            .map_err(|e| SessionError::Crypto(format!("Failed to stage Welcome: {e}")))?
            .into_group(&provider)
            .map_err(|e| SessionError::Crypto(format!("Failed to join group: {e}")))?;

        let mut session =
            Self { group_id, self_id, mls_group, signer, provider, multi_tree: None };
        session.refresh_tree_secret()?;
        Ok(session)
    }

    /// Group this session belongs to.
    pub fn group_id(&self) -> &GroupId {
        &self.group_id
    }

    /// This member's identity.
    pub fn self_id(&self) -> &IdentityId {
        &self.self_id
    }

    /// Current epoch.
    pub fn epoch(&self) -> u64 {
        self.mls_group.epoch().as_u64()
    }

    /// Identities of all current members.
    pub fn member_ids(&self) -> Vec<IdentityId> {
        self.mls_group
            .members()
            .filter_map(|m| identity_from_credential(&m.credential).ok())
            .collect()
    }

    /// Add a member from their serialized KeyPackage.
    ///
    /// Returns `(welcome, commit)`: the Welcome goes to the new member,
    /// the commit to everyone else. The add is merged locally before
    /// returning, so both blobs always describe the same epoch change.
    ///
    /// # Errors
    ///
    /// Fails if the KeyPackage does not validate or the commit cannot be
    /// built; the group state is unchanged on failure.
    pub fn add_member(&mut self, key_package_bytes: &[u8]) -> Result<(Vec<u8>, Vec<u8>), SessionError> {
        let key_package_in = KeyPackageIn::tls_deserialize_exact(key_package_bytes)
            .map_err(|e| SessionError::Serialization(format!("Failed to parse KeyPackage: {e}")))?;

        let key_package = key_package_in
            .validate(self.provider.crypto(), ProtocolVersion::Mls10)
            .map_err(|e| SessionError::Crypto(format!("Invalid KeyPackage: {e}")))?;

        let (commit_out, welcome_out, _group_info) = self
            .mls_group
            .add_members(&self.provider, &self.signer, &[key_package])
            .map_err(|e| SessionError::Crypto(format!("Failed to add member: {e}")))?;

        self.mls_group
            .merge_pending_commit(&self.provider)
            .map_err(|e| SessionError::Crypto(format!("Failed to merge commit: {e}")))?;
        self.refresh_tree_secret()?;

        let welcome = welcome_out
            .tls_serialize_detached()
            .map_err(|e| SessionError::Serialization(format!("Failed to serialize: {e}")))?;
        let commit = commit_out
            .tls_serialize_detached()
            .map_err(|e| SessionError::Serialization(format!("Failed to serialize: {e}")))?;

        Ok((welcome, commit))
    }

    /// Remove a member by identity.
    ///
    /// Returns the commit to distribute. The removal is merged locally
    /// before returning.
    ///
    /// # Errors
    ///
    /// Fails with [`SessionError::MemberNotFound`] if the identity holds
    /// no leaf in this group; the group state is unchanged on failure.
    pub fn remove_member(&mut self, member: &IdentityId) -> Result<Vec<u8>, SessionError> {
        let leaf_index = self
            .mls_group
            .members()
            .find_map(|m| {
                (identity_from_credential(&m.credential).ok().as_ref() == Some(member))
                    .then_some(m.index)
            })
            .ok_or_else(|| SessionError::MemberNotFound { id: member.clone() })?;

        let (commit_out, _welcome_option, _group_info) = self
            .mls_group
            .remove_members(&self.provider, &self.signer, &[leaf_index])
            .map_err(|e| SessionError::Crypto(format!("Failed to remove member: {e}")))?;

        self.mls_group
            .merge_pending_commit(&self.provider)
            .map_err(|e| SessionError::Crypto(format!("Failed to merge commit: {e}")))?;
        self.refresh_tree_secret()?;

        commit_out
            .tls_serialize_detached()
            .map_err(|e| SessionError::Serialization(format!("Failed to serialize: {e}")))
    }

    /// Encrypt an application message.
    ///
    /// Returns `(message, commit)`. The commit is a self-update created
    /// and merged immediately after the message, so each send ratchets
    /// the sender's leaf. Receivers must process both, message first.
    ///
    /// # Errors
    ///
    /// Fails if encryption or the self-update commit fails.
    pub fn encrypt(
        &mut self,
        plaintext: &GroupPlaintext,
    ) -> Result<(Vec<u8>, Vec<u8>), SessionError> {
        let payload = plaintext.to_bytes()?;

        let message_out = self
            .mls_group
            .create_message(&self.provider, &self.signer, &payload)
            .map_err(|e| SessionError::Crypto(format!("Failed to encrypt message: {e}")))?;

        let message = message_out
            .tls_serialize_detached()
            .map_err(|e| SessionError::Serialization(format!("Failed to serialize: {e}")))?;

        let bundle = self
            .mls_group
            .self_update(&self.provider, &self.signer, LeafNodeParameters::default())
            .map_err(|e| SessionError::Crypto(format!("Failed to self-update: {e}")))?;

        let commit = bundle
            .commit()
            .tls_serialize_detached()
            .map_err(|e| SessionError::Serialization(format!("Failed to serialize: {e}")))?;

        self.mls_group
            .merge_pending_commit(&self.provider)
            .map_err(|e| SessionError::Crypto(format!("Failed to merge commit: {e}")))?;
        self.refresh_tree_secret()?;

        Ok((message, commit))
    }

    /// Process one unit of incoming group traffic.
    ///
    /// Handles application messages, commits, and proposals. Commits are
    /// merged immediately and advance the epoch.
    ///
    /// # Errors
    ///
    /// Fails if the message does not parse, does not decrypt, or a
    /// staged commit cannot be merged.
    pub fn process(&mut self, bytes: &[u8]) -> Result<Processed, SessionError> {
        let message = MlsMessageIn::tls_deserialize_exact(bytes)
            .map_err(|e| SessionError::Serialization(format!("Failed to parse message: {e}")))?;

        let protocol_message: ProtocolMessage = message
            .try_into()
            .map_err(|_| SessionError::Serialization("Not a protocol message".to_string()))?;

        let processed = self
            .mls_group
            .process_message(&self.provider, protocol_message)
            .map_err(|e| SessionError::Crypto(format!("Failed to process message: {e}")))?;

        let sender = identity_from_credential(processed.credential())?;

        match processed.into_content() {
            ProcessedMessageContent::ApplicationMessage(app) => {
                let plaintext = GroupPlaintext::from_bytes(&app.into_bytes())?;
                Ok(Processed::Message { sender, plaintext })
            },
            ProcessedMessageContent::StagedCommitMessage(staged) => {
                self.mls_group
                    .merge_staged_commit(&self.provider, *staged)
                    .map_err(|e| SessionError::Crypto(format!("Failed to merge commit: {e}")))?;
                self.refresh_tree_secret()?;
                Ok(Processed::EpochAdvanced)
            },
            ProcessedMessageContent::ProposalMessage(proposal) => {
                self.mls_group
                    .store_pending_proposal(self.provider.storage(), *proposal)
                    .map_err(|e| SessionError::Crypto(format!("Failed to store proposal: {e}")))?;
                Ok(Processed::ProposalStored)
            },
            ProcessedMessageContent::ExternalJoinProposalMessage(proposal) => {
                self.mls_group
                    .store_pending_proposal(self.provider.storage(), *proposal)
                    .map_err(|e| SessionError::Crypto(format!("Failed to store proposal: {e}")))?;
                Ok(Processed::ProposalStored)
            },
        }
    }

    /// Set up the external tree for chatbots.
    ///
    /// The tree's shared secret is derived from the group's exporter
    /// secret, so all members compute the same tree without exchanging
    /// additional key material.
    ///
    /// # Errors
    ///
    /// Fails if the exporter secret cannot be derived.
    pub fn init_multi_tree(&mut self) -> Result<(), SessionError> {
        let secret = self.exporter_tree_secret()?;
        self.multi_tree = Some(MultiTree::new(secret));
        Ok(())
    }

    /// Attach an externally constructed tree (from a membership join).
    pub fn set_multi_tree(&mut self, tree: MultiTree) {
        self.multi_tree = Some(tree);
    }

    /// The external tree, if one is attached.
    pub fn multi_tree(&self) -> Option<&MultiTree> {
        self.multi_tree.as_ref()
    }

    /// Mutable access to the external tree.
    pub fn multi_tree_mut(&mut self) -> Option<&mut MultiTree> {
        self.multi_tree.as_mut()
    }

    /// Derive the current epoch's external tree secret.
    fn exporter_tree_secret(&self) -> Result<[u8; 32], SessionError> {
        let exported = self
            .mls_group
            .export_secret(self.provider.crypto(), TREE_EXPORT_LABEL, &[], 32)
            .map_err(|e| SessionError::Crypto(format!("Failed to export secret: {e}")))?;
        exported
            .try_into()
            .map_err(|_| SessionError::Crypto("Exporter returned wrong length".to_string()))
    }

    /// Re-key the external tree after an epoch change.
    fn refresh_tree_secret(&mut self) -> Result<(), SessionError> {
        if self.multi_tree.is_some() {
            let secret = self.exporter_tree_secret()?;
            if let Some(tree) = self.multi_tree.as_mut() {
                tree.set_tree_secret(secret);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use veil_proto::MessageKind;

    use super::*;

    fn plaintext(payload: &[u8]) -> GroupPlaintext {
        GroupPlaintext { payload: payload.to_vec(), kind: MessageKind::Text, chatbot_ids: vec![] }
    }

    fn two_member_group() -> (MlsSession, MlsSession) {
        let group_id = GroupId::new("groupAAAA0001");
        let alice = IdentityId::new("alice");
        let bob = IdentityId::new("bob");

        let mut alice_session =
            MlsSession::create(group_id.clone(), alice).expect("create group");

        let (bob_kp, bob_pending) =
            MlsSession::generate_key_package(&bob).expect("generate key package");

        let (welcome, _commit) = alice_session.add_member(&bob_kp).expect("add bob");

        let bob_session = MlsSession::join_from_welcome(group_id, bob, &welcome, bob_pending)
            .expect("join via welcome");

        (alice_session, bob_session)
    }

    #[test]
    fn create_group_starts_at_epoch_zero() {
        let session = MlsSession::create(GroupId::new("groupAAAA0002"), IdentityId::new("alice"))
            .expect("create group");

        assert_eq!(session.epoch(), 0);
        assert_eq!(session.member_ids(), vec![IdentityId::new("alice")]);
    }

    #[test]
    fn welcome_joins_at_matching_epoch() {
        let (alice, bob) = two_member_group();

        assert_eq!(alice.epoch(), bob.epoch());
        assert_eq!(alice.member_ids().len(), 2);
        assert_eq!(bob.member_ids().len(), 2);
    }

    #[test]
    fn message_roundtrip_with_per_send_commit() {
        let (mut alice, mut bob) = two_member_group();

        let (message, commit) = alice.encrypt(&plaintext(b"hello bob")).expect("encrypt");

        let received = bob.process(&message).expect("process message");
        assert_eq!(
            received,
            Processed::Message {
                sender: IdentityId::new("alice"),
                plaintext: plaintext(b"hello bob"),
            }
        );

        assert_eq!(bob.process(&commit).expect("process commit"), Processed::EpochAdvanced);
        assert_eq!(alice.epoch(), bob.epoch());

        // Traffic still flows in the new epoch, in the other direction.
        let (message, commit) = bob.encrypt(&plaintext(b"hello alice")).expect("encrypt");
        let received = alice.process(&message).expect("process message");
        assert!(matches!(received, Processed::Message { .. }));
        alice.process(&commit).expect("process commit");
    }

    #[test]
    fn remove_unknown_member_fails_without_state_change() {
        let (mut alice, _bob) = two_member_group();
        let epoch_before = alice.epoch();

        let result = alice.remove_member(&IdentityId::new("mallory"));
        assert!(matches!(result, Err(SessionError::MemberNotFound { .. })));
        assert_eq!(alice.epoch(), epoch_before);
    }

    #[test]
    fn remove_member_shrinks_membership() {
        let (mut alice, mut bob) = two_member_group();

        let (carol_kp, _carol_pending) =
            MlsSession::generate_key_package(&IdentityId::new("carol")).expect("key package");
        let (_welcome, commit) = alice.add_member(&carol_kp).expect("add carol");
        bob.process(&commit).expect("bob merges add");

        let commit = alice.remove_member(&IdentityId::new("bob")).expect("remove bob");
        assert_eq!(alice.member_ids().len(), 2);
        assert!(!alice.member_ids().contains(&IdentityId::new("bob")));

        // The removed member learns of the removal from the same commit.
        bob.process(&commit).expect("bob processes removal");
    }

    #[test]
    fn tree_secret_matches_across_members() {
        let (mut alice, mut bob) = two_member_group();

        alice.init_multi_tree().expect("init tree");
        bob.init_multi_tree().expect("init tree");

        let alice_pub = alice.multi_tree().expect("tree").tree_root_public();
        let bob_pub = bob.multi_tree().expect("tree").tree_root_public();
        assert_eq!(alice_pub, bob_pub);
    }
}
