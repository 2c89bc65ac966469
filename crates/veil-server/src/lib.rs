//! In-memory mailbox and routing service.
//!
//! The server is an untrusted router: it stores public key material,
//! tracks group membership, and queues opaque envelopes and membership
//! events in per-identity mailboxes. It never holds decryption keys
//! and never parses ciphertexts.
//!
//! - [`directory`]: key directory and group registry behind a
//!   repository trait
//! - [`mailbox`]: bounded per-identity queues, reject-on-full
//! - [`service`]: the routing operations and membership fanout
//! - [`stream`]: at-least-once pumps from mailboxes to consumers

#![forbid(unsafe_code)]
#![deny(missing_docs)]

pub mod directory;
pub mod error;
pub mod mailbox;
pub mod service;
pub mod stream;

pub use directory::{Directory, IdentityRecord, MemoryDirectory, SignedPreKeyRecord};
pub use error::ServiceError;
pub use mailbox::{DEFAULT_MAILBOX_CAPACITY, MailboxRegistry};
pub use service::{ChatService, ServiceConfig};
pub use stream::{Delivery, pump};
