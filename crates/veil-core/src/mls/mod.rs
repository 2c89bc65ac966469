//! Tree-based continuous group key agreement.
//!
//! # Components
//!
//! - [`session`]: A member's view of one group
//! - [`provider`]: `OpenMLS` provider wiring

pub mod provider;
pub mod session;

pub use provider::MlsSessionProvider;
pub use session::{MlsSession, PendingJoin, Processed};
