//! Sender-key group sessions for server-side fanout.
//!
//! Each member owns one sending chain and keeps a receiving chain per
//! peer. A member encrypts once; the server delivers the one ciphertext
//! to every other member. Sender keys travel out-of-band (pairwise
//! sessions or invitation piggybacks), never through the server in the
//! clear.
//!
//! Membership removal provides no forward protection by itself: the
//! remaining members must reset their sending chains and redistribute
//! fresh sender keys.

use std::collections::HashMap;

use veil_crypto::{RatchetCiphertext, ReceivingSession, SenderKey, SendingSession};
use veil_proto::{GroupId, GroupPlaintext, IdentityId, codec};

use crate::{error::SessionError, multi_tree::MultiTree, rng::random_array};

/// A member's view of one sender-key group.
pub struct ServerSideSession {
    group_id: GroupId,
    self_id: IdentityId,
    sending: SendingSession,
    receiving: HashMap<IdentityId, ReceivingSession>,
    multi_tree: Option<MultiTree>,
}

impl ServerSideSession {
    /// Create a session with a fresh sending chain.
    ///
    /// The sending chain is created eagerly so the sender key can be
    /// distributed as soon as the group exists.
    pub fn new(group_id: GroupId, self_id: IdentityId) -> Self {
        let seed: [u8; 32] = random_array();
        Self {
            group_id,
            self_id,
            sending: SendingSession::new(&seed),
            receiving: HashMap::new(),
            multi_tree: None,
        }
    }

    /// Group this session belongs to.
    pub fn group_id(&self) -> &GroupId {
        &self.group_id
    }

    /// This member's identity.
    pub fn self_id(&self) -> &IdentityId {
        &self.self_id
    }

    /// Snapshot of our sender key, for distribution to peers.
    pub fn self_sender_key(&self) -> SenderKey {
        self.sending.sender_key()
    }

    /// Install a peer's sender key, replacing any previous chain.
    ///
    /// Replacement is deliberate: peers redistribute fresh keys after a
    /// membership change, and the new chain must win.
    pub fn add_sender_key(&mut self, sender: IdentityId, key: &SenderKey) {
        self.receiving.insert(sender, ReceivingSession::new(key));
    }

    /// Drop a departed member's receiving chain.
    pub fn remove_sender(&mut self, sender: &IdentityId) {
        self.receiving.remove(sender);
    }

    /// Encrypt a group payload on our sending chain.
    ///
    /// # Errors
    ///
    /// Fails if the chain is exhausted or the payload cannot be encoded.
    pub fn encrypt(&mut self, plaintext: &GroupPlaintext) -> Result<Vec<u8>, SessionError> {
        let payload = plaintext.to_bytes()?;
        let ciphertext = self.sending.encrypt(&payload, random_array())?;
        Ok(codec::encode(&ciphertext)?)
    }

    /// Decrypt a peer's ciphertext.
    ///
    /// # Errors
    ///
    /// Fails with [`SessionError::SenderUnknown`] if no sender key was
    /// installed for this peer; the message is lost until the peer's key
    /// arrives and the message is redelivered.
    pub fn decrypt(
        &mut self,
        sender: &IdentityId,
        bytes: &[u8],
    ) -> Result<GroupPlaintext, SessionError> {
        let session = self
            .receiving
            .get_mut(sender)
            .ok_or_else(|| SessionError::SenderUnknown { id: sender.clone() })?;

        let ciphertext: RatchetCiphertext = codec::decode(bytes)?;
        let payload = session.decrypt(&ciphertext)?;
        Ok(GroupPlaintext::from_bytes(&payload)?)
    }

    /// Set up the external tree with a fresh shared secret.
    ///
    /// The secret must then be distributed to the other members through
    /// a tree key update message.
    pub fn init_multi_tree(&mut self) -> [u8; 32] {
        let secret: [u8; 32] = random_array();
        self.multi_tree = Some(MultiTree::new(secret));
        secret
    }

    /// Attach a tree received through a membership join, or install a
    /// tree keyed by a peer-distributed secret.
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
}
