//! `OpenMLS` provider wiring.
//!
//! Bundles the rust-crypto backend with in-memory storage. Each group
//! session owns one provider; the storage holds that session's secrets
//! and nothing else, so dropping the session erases the group state.

use openmls_memory_storage::MemoryStorage;
use openmls_rust_crypto::RustCrypto;
use openmls_traits::OpenMlsProvider;

/// Per-session `OpenMLS` provider with in-memory storage.
#[derive(Default)]
pub struct MlsSessionProvider {
    /// Crypto backend; also serves as the RNG.
    crypto: RustCrypto,

    /// In-memory storage scoped to one group session.
    storage: MemoryStorage,
}

impl MlsSessionProvider {
    /// A fresh provider with empty storage.
    pub fn new() -> Self {
        Self::default()
    }
}

impl OpenMlsProvider for MlsSessionProvider {
    type CryptoProvider = RustCrypto;
    type RandProvider = RustCrypto;
    type StorageProvider = MemoryStorage;

    fn crypto(&self) -> &Self::CryptoProvider {
        &self.crypto
    }

    fn rand(&self) -> &Self::RandProvider {
        &self.crypto
    }

    fn storage(&self) -> &Self::StorageProvider {
        &self.storage
    }
}
