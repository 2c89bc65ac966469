//! External tree key agreement for chatbots.
//!
//! Chatbots are never members of the core group. Instead, each chatbot
//! holds an *external node* hanging off the members' shared tree root.
//! Members and a chatbot agree on a per-chatbot root secret that both
//! sides can rotate:
//!
//! - Members rotate by hashing the shared tree secret and sealing the
//!   result to each chatbot node ([`MultiTree::update`]).
//! - A chatbot rotates by generating a fresh leaf and sealing the hash
//!   of it to the members' tree root ([`ExternalTree::update`]).
//!
//! Either rotation replaces the per-chatbot root on both sides, so a
//! chatbot only ever learns root secrets, never the group's own key
//! material, and members can cut a chatbot off by rotating without it.
//!
//! All keypairs are derived deterministically from node secrets, so the
//! two sides only ever exchange sealed 32-byte secrets and public keys.

use std::collections::{BTreeMap, HashMap};

use ed25519_dalek::SigningKey;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use veil_crypto::{KemCiphertext, KemKeyPair, kem_open, kem_seal, signing_keypair_from_secret};
use veil_proto::IdentityId;

use crate::{error::SessionError, rng::random_array};

/// Hash step between tree secrets and per-chatbot root secrets.
fn hash32(input: &[u8]) -> [u8; 32] {
    Sha256::digest(input).into()
}

/// Seal a value to a public key with fresh randomness.
fn seal_to(value: &[u8], recipient: &[u8; 32]) -> KemCiphertext {
    kem_seal(value, recipient, random_array(), random_array())
}

/// A node keyed by a secret: DH keypair plus signing keypair.
#[derive(Clone)]
struct TreeRoot {
    secret: [u8; 32],
    keys: KemKeyPair,
    signing: SigningKey,
}

impl TreeRoot {
    fn from_secret(secret: [u8; 32]) -> Self {
        Self {
            keys: KemKeyPair::from_secret(&secret),
            signing: signing_keypair_from_secret(&secret),
            secret,
        }
    }

    fn public(&self) -> [u8; 32] {
        self.keys.public_bytes()
    }

    fn sign_public(&self) -> [u8; 32] {
        self.signing.verifying_key().to_bytes()
    }
}

/// A chatbot's public node keys as seen by members.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExternalNode {
    /// Node DH public key.
    pub public: [u8; 32],
    /// Node signing public key.
    pub sign_public: [u8; 32],
}

/// Join material handed to a chatbot when it is invited.
///
/// Must travel over a confidential channel; `init_leaf` is the chatbot's
/// initial node secret.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExternalJoin {
    /// The chatbot's initial node secret.
    pub init_leaf: [u8; 32],
    /// Members' tree root public key.
    pub tree_root_public: [u8; 32],
    /// Members' tree root signing public key.
    pub tree_root_sign_public: [u8; 32],
}

/// Members' tree update, fanned out to chatbot nodes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TreeUpdate {
    /// New per-chatbot root secret, sealed to each chatbot node.
    pub ciphertexts: BTreeMap<IdentityId, KemCiphertext>,
    /// Members' tree root public key after the update.
    pub new_root_public: [u8; 32],
    /// Members' tree root signing public key after the update.
    pub new_root_sign_public: [u8; 32],
}

/// A chatbot's node update, addressed to the members' tree root.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExternalNodeUpdate {
    /// New root secret, sealed to the members' tree root.
    pub ciphertext: KemCiphertext,
    /// The chatbot's new node public key.
    pub new_public: [u8; 32],
    /// The chatbot's new node signing public key.
    pub new_sign_public: [u8; 32],
}

/// Tree state handed to a member joining an existing group.
///
/// Carries everything a new member needs to participate in the external
/// tree without rotating any chatbot node: the shared tree secret plus,
/// per chatbot, the node public keys and the tree root secret in effect
/// when that chatbot was last updated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemberJoin {
    /// Shared tree secret, sealed to the new member's key.
    pub tree_root_ciphertext: KemCiphertext,
    /// Chatbot node public keys.
    pub chatbot_nodes: BTreeMap<IdentityId, ExternalNode>,
    /// Per-chatbot last tree root secret, sealed to the new member.
    pub last_root_ciphertexts: BTreeMap<IdentityId, KemCiphertext>,
}

/// Members' side of the external tree.
pub struct MultiTree {
    /// Root shared by all members.
    tree_root: TreeRoot,
    /// Chatbot node public keys.
    external_nodes: HashMap<IdentityId, ExternalNode>,
    /// Current per-chatbot root, shared with that chatbot.
    roots: HashMap<IdentityId, TreeRoot>,
    /// Tree root in effect at each chatbot's last update; chatbot node
    /// updates are sealed to this.
    last_roots: HashMap<IdentityId, TreeRoot>,
}

impl MultiTree {
    /// A tree with no chatbot nodes.
    pub fn new(tree_secret: [u8; 32]) -> Self {
        Self {
            tree_root: TreeRoot::from_secret(tree_secret),
            external_nodes: HashMap::new(),
            roots: HashMap::new(),
            last_roots: HashMap::new(),
        }
    }

    /// Members' tree root public key.
    pub fn tree_root_public(&self) -> [u8; 32] {
        self.tree_root.public()
    }

    /// Members' tree root signing public key.
    pub fn tree_root_sign_public(&self) -> [u8; 32] {
        self.tree_root.sign_public()
    }

    /// Replace the shared tree secret.
    ///
    /// Called when the owning group session re-keys (a merged commit, or
    /// an explicit tree key rotation). Per-chatbot roots are unchanged
    /// until the next [`update`](Self::update) or
    /// [`handle_update`](Self::handle_update).
    pub fn set_tree_secret(&mut self, tree_secret: [u8; 32]) {
        self.tree_root = TreeRoot::from_secret(tree_secret);
    }

    /// Create a node for a chatbot this member is inviting.
    ///
    /// Returns the join material for the chatbot and an announcement for
    /// the other members (the node secret sealed to the tree root, which
    /// every member can open).
    pub fn external_node_join(
        &mut self,
        id: &IdentityId,
    ) -> (ExternalJoin, KemCiphertext) {
        let init_leaf: [u8; 32] = random_array();
        let announcement = seal_to(&init_leaf, &self.tree_root.public());

        self.insert_node(id, init_leaf);

        let join = ExternalJoin {
            init_leaf,
            tree_root_public: self.tree_root.public(),
            tree_root_sign_public: self.tree_root.sign_public(),
        };
        (join, announcement)
    }

    /// Add a chatbot node announced by another member.
    ///
    /// # Errors
    ///
    /// Fails with [`SessionError::DuplicateChatbot`] if a node with this
    /// identity exists, or with a KEM error if the announcement was not
    /// sealed to the current tree root.
    pub fn add_external_node(
        &mut self,
        id: &IdentityId,
        announcement: &KemCiphertext,
    ) -> Result<(), SessionError> {
        if self.external_nodes.contains_key(id) {
            return Err(SessionError::DuplicateChatbot { id: id.clone() });
        }

        let init_leaf: [u8; 32] = kem_open(announcement, &self.tree_root.keys)?
            .try_into()
            .map_err(|_| SessionError::Crypto("Node secret has wrong length".to_string()))?;

        self.insert_node(id, init_leaf);
        Ok(())
    }

    fn insert_node(&mut self, id: &IdentityId, init_leaf: [u8; 32]) {
        let node_keys = KemKeyPair::from_secret(&init_leaf);
        let node_signing = signing_keypair_from_secret(&init_leaf);
        self.external_nodes.insert(
            id.clone(),
            ExternalNode {
                public: node_keys.public_bytes(),
                sign_public: node_signing.verifying_key().to_bytes(),
            },
        );
        self.roots.insert(id.clone(), TreeRoot::from_secret(hash32(&init_leaf)));
        self.last_roots.insert(id.clone(), self.tree_root.clone());
    }

    /// Export tree state for a member joining the group.
    pub fn member_join(&self, recipient_pub: &[u8; 32]) -> MemberJoin {
        let mut chatbot_nodes = BTreeMap::new();
        let mut last_root_ciphertexts = BTreeMap::new();
        for (id, node) in &self.external_nodes {
            chatbot_nodes.insert(id.clone(), node.clone());
            if let Some(last) = self.last_roots.get(id) {
                last_root_ciphertexts.insert(id.clone(), seal_to(&last.secret, recipient_pub));
            }
        }

        MemberJoin {
            tree_root_ciphertext: seal_to(&self.tree_root.secret, recipient_pub),
            chatbot_nodes,
            last_root_ciphertexts,
        }
    }

    /// Reconstruct tree state from a membership join.
    ///
    /// Per-chatbot roots start empty; the first tree update after the
    /// join establishes them.
    ///
    /// # Errors
    ///
    /// Fails if any sealed secret was not addressed to `self_keys`.
    pub fn from_member_join(
        self_keys: &KemKeyPair,
        join: &MemberJoin,
    ) -> Result<Self, SessionError> {
        let tree_secret: [u8; 32] = kem_open(&join.tree_root_ciphertext, self_keys)?
            .try_into()
            .map_err(|_| SessionError::Crypto("Tree secret has wrong length".to_string()))?;

        let mut tree = Self::new(tree_secret);
        for (id, node) in &join.chatbot_nodes {
            tree.external_nodes.insert(id.clone(), node.clone());
            if let Some(ciphertext) = join.last_root_ciphertexts.get(id) {
                let last: [u8; 32] = kem_open(ciphertext, self_keys)?.try_into().map_err(|_| {
                    SessionError::Crypto("Last root secret has wrong length".to_string())
                })?;
                tree.last_roots.insert(id.clone(), TreeRoot::from_secret(last));
            }
        }
        Ok(tree)
    }

    /// Rotate per-chatbot roots and seal the new secret to each node.
    ///
    /// Chatbots without a node are skipped. The new per-chatbot root is
    /// the hash of the current shared tree secret.
    pub fn update(&mut self, chatbot_ids: &[IdentityId]) -> TreeUpdate {
        let root_secret = hash32(&self.tree_root.secret);
        let mut ciphertexts = BTreeMap::new();

        for id in chatbot_ids {
            let Some(node) = self.external_nodes.get(id) else {
                continue;
            };
            ciphertexts.insert(id.clone(), seal_to(&root_secret, &node.public));
            self.roots.insert(id.clone(), TreeRoot::from_secret(root_secret));
            self.last_roots.insert(id.clone(), self.tree_root.clone());
        }

        TreeUpdate {
            ciphertexts,
            new_root_public: self.tree_root.public(),
            new_root_sign_public: self.tree_root.sign_public(),
        }
    }

    /// Apply another member's tree update locally.
    ///
    /// Recomputes the same per-chatbot roots from the shared tree
    /// secret; call [`set_tree_secret`](Self::set_tree_secret) first if
    /// the update changed it.
    pub fn handle_update(&mut self, chatbot_ids: &[IdentityId]) {
        let root_secret = hash32(&self.tree_root.secret);
        for id in chatbot_ids {
            if !self.external_nodes.contains_key(id) {
                continue;
            }
            self.roots.insert(id.clone(), TreeRoot::from_secret(root_secret));
            self.last_roots.insert(id.clone(), self.tree_root.clone());
        }
    }

    /// Apply a chatbot's node update.
    ///
    /// # Errors
    ///
    /// Fails with [`SessionError::ChatbotNotFound`] for an unknown node,
    /// or with a KEM error if the update was sealed to a tree root this
    /// member never held.
    pub fn handle_external_node_update(
        &mut self,
        id: &IdentityId,
        update: &ExternalNodeUpdate,
    ) -> Result<(), SessionError> {
        if !self.external_nodes.contains_key(id) {
            return Err(SessionError::ChatbotNotFound { id: id.clone() });
        }
        let last = self
            .last_roots
            .get(id)
            .ok_or_else(|| SessionError::ChatbotNotFound { id: id.clone() })?;

        let root_secret: [u8; 32] = kem_open(&update.ciphertext, &last.keys)?
            .try_into()
            .map_err(|_| SessionError::Crypto("Root secret has wrong length".to_string()))?;

        self.roots.insert(id.clone(), TreeRoot::from_secret(root_secret));
        self.external_nodes.insert(
            id.clone(),
            ExternalNode { public: update.new_public, sign_public: update.new_sign_public },
        );
        Ok(())
    }

    /// Remove a chatbot's node.
    ///
    /// Subsequent updates exclude the chatbot, cutting it off from all
    /// future root secrets.
    pub fn remove_external_node(&mut self, id: &IdentityId) {
        self.external_nodes.remove(id);
        self.roots.remove(id);
        self.last_roots.remove(id);
    }

    /// Whether a chatbot holds a node in this tree.
    pub fn has_external_node(&self, id: &IdentityId) -> bool {
        self.external_nodes.contains_key(id)
    }

    /// Identities of all chatbot nodes.
    pub fn chatbot_ids(&self) -> Vec<IdentityId> {
        self.external_nodes.keys().cloned().collect()
    }

    /// Current root secret shared with a chatbot.
    pub fn root_secret(&self, id: &IdentityId) -> Option<[u8; 32]> {
        self.roots.get(id).map(|root| root.secret)
    }

    /// Signing key for the root shared with a chatbot.
    pub fn root_signing(&self, id: &IdentityId) -> Option<&SigningKey> {
        self.roots.get(id).map(|root| &root.signing)
    }

    /// Signing public key of a chatbot's node.
    pub fn external_node_sign_public(&self, id: &IdentityId) -> Option<[u8; 32]> {
        self.external_nodes.get(id).map(|node| node.sign_public)
    }
}

/// The chatbot's side of the external tree.
pub struct ExternalTree {
    /// Members' tree root public keys.
    tree_root_public: [u8; 32],
    tree_root_sign_public: [u8; 32],
    /// This chatbot's node.
    self_node: TreeRoot,
    /// Root shared with the members.
    root: TreeRoot,
}

impl ExternalTree {
    /// Construct from invitation join material.
    pub fn new(join: &ExternalJoin) -> Self {
        Self {
            tree_root_public: join.tree_root_public,
            tree_root_sign_public: join.tree_root_sign_public,
            self_node: TreeRoot::from_secret(join.init_leaf),
            root: TreeRoot::from_secret(hash32(&join.init_leaf)),
        }
    }

    /// Rotate this chatbot's node and the shared root.
    ///
    /// Seals the new root secret to the members' tree root so every
    /// member can follow the rotation.
    pub fn update(&mut self) -> ExternalNodeUpdate {
        let new_leaf: [u8; 32] = random_array();
        let root_secret = hash32(&new_leaf);

        self.self_node = TreeRoot::from_secret(new_leaf);
        self.root = TreeRoot::from_secret(root_secret);

        ExternalNodeUpdate {
            ciphertext: seal_to(&root_secret, &self.tree_root_public),
            new_public: self.self_node.public(),
            new_sign_public: self.self_node.sign_public(),
        }
    }

    /// Apply a members' tree update addressed to this node.
    ///
    /// # Errors
    ///
    /// Fails if the sealed secret was not addressed to this node.
    pub fn handle_tree_update(
        &mut self,
        ciphertext: &KemCiphertext,
        new_root_public: [u8; 32],
        new_root_sign_public: [u8; 32],
    ) -> Result<(), SessionError> {
        let root_secret: [u8; 32] = kem_open(ciphertext, &self.self_node.keys)?
            .try_into()
            .map_err(|_| SessionError::Crypto("Root secret has wrong length".to_string()))?;

        self.root = TreeRoot::from_secret(root_secret);
        self.tree_root_public = new_root_public;
        self.tree_root_sign_public = new_root_sign_public;
        Ok(())
    }

    /// Current root secret shared with the members.
    pub fn root_secret(&self) -> [u8; 32] {
        self.root.secret
    }

    /// Signing key for the shared root.
    pub fn root_signing(&self) -> &SigningKey {
        &self.root.signing
    }

    /// Members' tree root signing public key.
    pub fn tree_root_sign_public(&self) -> [u8; 32] {
        self.tree_root_sign_public
    }

    /// This node's public key.
    pub fn self_public(&self) -> [u8; 32] {
        self.self_node.public()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bot() -> IdentityId {
        IdentityId::new("weatherbot")
    }

    fn tree_with_bot() -> (MultiTree, ExternalTree) {
        let mut members = MultiTree::new([7u8; 32]);
        let (join, _announcement) = members.external_node_join(&bot());
        let chatbot = ExternalTree::new(&join);
        (members, chatbot)
    }

    #[test]
    fn join_establishes_shared_root() {
        let (members, chatbot) = tree_with_bot();
        assert_eq!(members.root_secret(&bot()), Some(chatbot.root_secret()));
    }

    #[test]
    fn announcement_lets_other_members_add_the_node() {
        let mut inviter = MultiTree::new([7u8; 32]);
        let mut other = MultiTree::new([7u8; 32]);

        let (join, announcement) = inviter.external_node_join(&bot());
        other.add_external_node(&bot(), &announcement).expect("add from announcement");

        let chatbot = ExternalTree::new(&join);
        assert_eq!(other.root_secret(&bot()), Some(chatbot.root_secret()));
    }

    #[test]
    fn duplicate_node_is_rejected() {
        let mut inviter = MultiTree::new([7u8; 32]);
        let (_join, announcement) = inviter.external_node_join(&bot());

        assert!(matches!(
            inviter.add_external_node(&bot(), &announcement),
            Err(SessionError::DuplicateChatbot { .. })
        ));
    }

    #[test]
    fn member_update_rotates_shared_root() {
        let (mut members, mut chatbot) = tree_with_bot();
        let before = chatbot.root_secret();

        let update = members.update(&[bot()]);
        let ciphertext = update.ciphertexts.get(&bot()).expect("ciphertext for node");
        chatbot
            .handle_tree_update(ciphertext, update.new_root_public, update.new_root_sign_public)
            .expect("handle update");

        assert_eq!(members.root_secret(&bot()), Some(chatbot.root_secret()));
        assert_ne!(chatbot.root_secret(), before);
    }

    #[test]
    fn chatbot_update_rotates_shared_root() {
        let (mut members, mut chatbot) = tree_with_bot();
        let before = members.root_secret(&bot());

        let update = chatbot.update();
        members.handle_external_node_update(&bot(), &update).expect("handle node update");

        assert_eq!(members.root_secret(&bot()), Some(chatbot.root_secret()));
        assert_ne!(members.root_secret(&bot()), before);
    }

    #[test]
    fn update_skips_unknown_chatbots() {
        let (mut members, _chatbot) = tree_with_bot();
        let update = members.update(&[bot(), IdentityId::new("nosuchbot")]);

        assert_eq!(update.ciphertexts.len(), 1);
        assert!(update.ciphertexts.contains_key(&bot()));
    }

    #[test]
    fn node_update_for_unknown_chatbot_fails() {
        let (mut members, mut chatbot) = tree_with_bot();
        let update = chatbot.update();

        assert!(matches!(
            members.handle_external_node_update(&IdentityId::new("nosuchbot"), &update),
            Err(SessionError::ChatbotNotFound { .. })
        ));
    }

    #[test]
    fn joining_member_follows_the_tree() {
        let (mut first, mut chatbot) = tree_with_bot();

        let second_keys = KemKeyPair::from_secret(b"second member leaf");
        let join = first.member_join(&second_keys.public_bytes());
        let mut second = MultiTree::from_member_join(&second_keys, &join).expect("join");

        // First member rotates; the new member recomputes the same root.
        let update = first.update(&[bot()]);
        second.handle_update(&[bot()]);
        let ciphertext = update.ciphertexts.get(&bot()).expect("ciphertext for node");
        chatbot
            .handle_tree_update(ciphertext, update.new_root_public, update.new_root_sign_public)
            .expect("handle update");

        assert_eq!(first.root_secret(&bot()), second.root_secret(&bot()));
        assert_eq!(second.root_secret(&bot()), Some(chatbot.root_secret()));

        // The chatbot rotates; both members can follow.
        let node_update = chatbot.update();
        first.handle_external_node_update(&bot(), &node_update).expect("first follows");
        second.handle_external_node_update(&bot(), &node_update).expect("second follows");
        assert_eq!(first.root_secret(&bot()), Some(chatbot.root_secret()));
        assert_eq!(second.root_secret(&bot()), Some(chatbot.root_secret()));
    }

    #[test]
    fn removed_node_is_excluded_from_updates() {
        let (mut members, _chatbot) = tree_with_bot();
        members.remove_external_node(&bot());

        let update = members.update(&[bot()]);
        assert!(update.ciphertexts.is_empty());
        assert!(!members.has_external_node(&bot()));
        assert_eq!(members.root_secret(&bot()), None);
    }

    #[test]
    fn rotation_after_removal_locks_out_stale_roots() {
        let (mut members, chatbot) = tree_with_bot();
        let stale = chatbot.root_secret();

        members.remove_external_node(&bot());
        members.set_tree_secret([9u8; 32]);
        let update = members.update(&[]);

        assert!(update.ciphertexts.is_empty());
        assert_ne!(hash32(&[9u8; 32]), stale);
    }
}
