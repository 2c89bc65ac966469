//! Client orchestration for the veil messaging system.
//!
//! [`Messenger`] is the member-side driver: it owns the pairwise and
//! group sessions for one identity and turns application calls into
//! envelopes for the routing layer, and envelopes back into decrypted
//! messages. [`ChatbotAgent`] is the counterpart for chatbots on the
//! external key-agreement path.
//!
//! The orchestrator is transport-agnostic: key lookups go through an
//! injected [`DirectoryHandle`] and finished envelopes through an
//! injected [`Outbox`].

#![forbid(unsafe_code)]
#![deny(missing_docs)]

mod chatbot;
mod error;
mod handle;
mod messenger;
mod registry;
mod rng;
mod wire;

pub use chatbot::{BotIncoming, ChatbotAgent};
pub use error::ClientError;
pub use handle::{DirectoryHandle, IdentityKeys, Outbox};
pub use messenger::{Incoming, InviteArtifacts, Messenger, MessengerConfig};
pub use registry::Registry;
pub use wire::{
    ChatbotEnvelope, ChatbotGroupMessage, DirectMessage, InvitePiggyback, KeyDistribution,
    NodeUpdate, PairwiseWire, PseudonymRegistration, TreeSecretRotation,
    parse_sender_key_distribution,
};
