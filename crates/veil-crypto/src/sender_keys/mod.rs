//! Sender keys: symmetric ratchets and fanout sessions.
//!
//! One sending chain per sender per group, distributed once to every
//! receiver, so group messages need a single encryption instead of one
//! per recipient.

mod error;
mod ratchet;
mod session;

pub use error::SenderKeyError;
pub use ratchet::{MessageKey, SymmetricRatchet};
pub use session::{
    NONCE_RANDOM_SIZE, RatchetCiphertext, ReceivingSession, SenderKey, SendingSession,
};
