//! Veil group session drivers.
//!
//! A member's cryptographic state for one group, under one of three
//! interchangeable strategies:
//!
//! - [`server_side`]: sender-key chains, one ciphertext fanned out by
//!   the server
//! - [`client_side`]: pairwise fanout over [`individual`] sessions
//! - [`mls`]: tree-based continuous group key agreement
//!
//! Chatbots participate through the [`multi_tree`] layer regardless of
//! the group strategy: their key material hangs off the group as
//! external nodes and never mixes with member key material.

#![forbid(unsafe_code)]
#![deny(missing_docs)]

pub mod client_side;
pub mod error;
pub mod individual;
pub mod mls;
pub mod multi_tree;
mod rng;
pub mod server_side;

pub use client_side::ClientSideSession;
pub use error::SessionError;
pub use individual::PeerSession;
pub use mls::{MlsSession, PendingJoin, Processed};
pub use multi_tree::{
    ExternalJoin, ExternalNode, ExternalNodeUpdate, ExternalTree, MemberJoin, MultiTree,
    TreeUpdate,
};
pub use server_side::ServerSideSession;
