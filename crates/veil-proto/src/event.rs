//! Membership events fanned out by the server.
//!
//! Each event carries the membership delta plus any piggybacked
//! key-agreement handshake bytes the recipient needs to catch up. The
//! piggyback is opaque to the server; clients pack and unpack it.

use serde::{Deserialize, Serialize};

use crate::{
    envelope::{ChatbotVisibility, GroupInfo},
    id::{GroupId, IdentityId},
};

/// A membership event delivered through an identity's event mailbox.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ServerEvent {
    /// The recipient was invited into a group.
    GroupInvitation {
        /// Full group state at invitation time.
        group: GroupInfo,
        /// Who issued the invite.
        inviter: IdentityId,
        /// Opaque handshake bytes (welcome, tree join, sender keys).
        piggyback: Option<Vec<u8>>,
    },
    /// Another identity joined a group the recipient is in.
    GroupAddition {
        /// Affected group.
        group_id: GroupId,
        /// The new participant.
        added: IdentityId,
        /// Opaque handshake bytes for existing members.
        piggyback: Option<Vec<u8>>,
    },
    /// A participant left or was removed.
    GroupRemoval {
        /// Affected group.
        group_id: GroupId,
        /// The removed participant.
        removed: IdentityId,
    },
    /// The recipient chatbot was invited into a group.
    ChatbotInvitation {
        /// Group state as visible to the chatbot. Participant lists are
        /// withheld for chatbots on the external path.
        group: GroupInfo,
        /// The chatbot's visibility in this group.
        visibility: ChatbotVisibility,
        /// Opaque handshake bytes (external-node join material).
        piggyback: Option<Vec<u8>>,
    },
    /// A chatbot joined a group the recipient is in.
    ChatbotAddition {
        /// Affected group.
        group_id: GroupId,
        /// The new chatbot.
        chatbot: IdentityId,
        /// The chatbot's visibility.
        visibility: ChatbotVisibility,
        /// Opaque handshake bytes.
        piggyback: Option<Vec<u8>>,
    },
    /// A chatbot was removed.
    ChatbotRemoval {
        /// Affected group.
        group_id: GroupId,
        /// The removed chatbot.
        chatbot: IdentityId,
    },
}

impl ServerEvent {
    /// The group this event concerns.
    pub fn group_id(&self) -> &GroupId {
        match self {
            Self::GroupInvitation { group, .. } | Self::ChatbotInvitation { group, .. } => {
                &group.group_id
            },
            Self::GroupAddition { group_id, .. }
            | Self::GroupRemoval { group_id, .. }
            | Self::ChatbotAddition { group_id, .. }
            | Self::ChatbotRemoval { group_id, .. } => group_id,
        }
    }
}
