//! Client-side fanout groups.
//!
//! In a client-side group there is no group key at all: the sender
//! encrypts the payload once per recipient on the pairwise session it
//! already holds with that peer. This session type only tracks the
//! membership the fanout must cover and the external tree for chatbots;
//! the actual encryption happens on [`PeerSession`]s owned by the
//! messaging layer.
//!
//! Removal needs no re-keying: dropped members simply stop being fanout
//! targets, and pairwise chains with remaining members are unaffected.
//!
//! [`PeerSession`]: crate::individual::PeerSession

use veil_proto::{GroupId, IdentityId};

use crate::{error::SessionError, multi_tree::MultiTree};

/// A member's view of one client-side fanout group.
pub struct ClientSideSession {
    group_id: GroupId,
    self_id: IdentityId,
    /// Participants in insertion order, self included.
    members: Vec<IdentityId>,
    multi_tree: Option<MultiTree>,
}

impl ClientSideSession {
    /// Create a session containing only ourselves.
    pub fn new(group_id: GroupId, self_id: IdentityId) -> Self {
        let members = vec![self_id.clone()];
        Self { group_id, self_id, members, multi_tree: None }
    }

    /// Create a session from a known membership list.
    ///
    /// Used when joining an existing group from an invitation.
    pub fn with_members(group_id: GroupId, self_id: IdentityId, members: Vec<IdentityId>) -> Self {
        Self { group_id, self_id, members, multi_tree: None }
    }

    /// Group this session belongs to.
    pub fn group_id(&self) -> &GroupId {
        &self.group_id
    }

    /// This member's identity.
    pub fn self_id(&self) -> &IdentityId {
        &self.self_id
    }

    /// All participants, in insertion order.
    pub fn members(&self) -> &[IdentityId] {
        &self.members
    }

    /// Fanout targets: every member except ourselves.
    pub fn peers(&self) -> impl Iterator<Item = &IdentityId> {
        self.members.iter().filter(move |id| **id != self.self_id)
    }

    /// Record a new participant. Duplicates are ignored.
    pub fn add_member(&mut self, member: IdentityId) {
        if !self.members.contains(&member) {
            self.members.push(member);
        }
    }

    /// Drop a participant from the fanout.
    ///
    /// # Errors
    ///
    /// Fails with [`SessionError::MemberNotFound`] if the identity is
    /// not in the membership list.
    pub fn remove_member(&mut self, member: &IdentityId) -> Result<(), SessionError> {
        let index = self
            .members
            .iter()
            .position(|id| id == member)
            .ok_or_else(|| SessionError::MemberNotFound { id: member.clone() })?;
        self.members.remove(index);
        Ok(())
    }

    /// Set up the external tree with a fresh shared secret.
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

#[cfg(test)]
mod tests {
    use super::*;

    fn session() -> ClientSideSession {
        ClientSideSession::new(GroupId::new("groupCCCC0001"), IdentityId::new("alice"))
    }

    #[test]
    fn membership_preserves_insertion_order() {
        let mut session = session();
        session.add_member(IdentityId::new("bob"));
        session.add_member(IdentityId::new("carol"));
        session.add_member(IdentityId::new("bob"));

        assert_eq!(
            session.members(),
            &[IdentityId::new("alice"), IdentityId::new("bob"), IdentityId::new("carol")]
        );
    }

    #[test]
    fn removal_keeps_remaining_order() {
        let mut session = session();
        session.add_member(IdentityId::new("bob"));
        session.add_member(IdentityId::new("carol"));

        session.remove_member(&IdentityId::new("bob")).expect("remove");
        assert_eq!(session.members(), &[IdentityId::new("alice"), IdentityId::new("carol")]);
    }

    #[test]
    fn removing_unknown_member_fails() {
        let mut session = session();
        assert!(matches!(
            session.remove_member(&IdentityId::new("mallory")),
            Err(SessionError::MemberNotFound { .. })
        ));
    }

    #[test]
    fn peers_exclude_self() {
        let mut session = session();
        session.add_member(IdentityId::new("bob"));

        let peers: Vec<_> = session.peers().cloned().collect();
        assert_eq!(peers, vec![IdentityId::new("bob")]);
    }
}
