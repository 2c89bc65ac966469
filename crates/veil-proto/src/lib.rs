//! Veil wire types.
//!
//! The data model shared between clients and the routing server:
//! identifier newtypes, message envelopes, membership events, and the
//! CBOR codec they travel in. Envelopes are opaque to the server; only
//! the routing fields are inspected.

#![forbid(unsafe_code)]
#![deny(missing_docs)]

pub mod codec;
mod envelope;
mod error;
mod event;
mod id;

pub use envelope::{
    ChatbotVisibility, GroupInfo, GroupPlaintext, GroupType, MessageEnvelope, MessageKind,
};
pub use error::ProtoError;
pub use event::ServerEvent;
pub use id::{GroupId, IdentityId};
