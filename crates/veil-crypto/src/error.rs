//! Crate-level error types for the sealed envelope, KEM, and pairwise
//! session primitives.

use thiserror::Error;

use crate::sender_keys::SenderKeyError;

/// Errors from the sealed envelope helper.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum SealedError {
    /// The AEAD key length does not select an AES variant.
    #[error("invalid key length {len}, expected 16, 24 or 32 bytes")]
    InvalidKeyLength {
        /// Provided key length.
        len: usize,
    },

    /// A signature is present without a verification key, or vice versa.
    #[error("signature and verification key presence must match")]
    SignaturePresenceMismatch,

    /// The detached signature failed to parse or verify.
    #[error("signature verification failed")]
    SignatureInvalid,

    /// AEAD authentication failed.
    #[error("decryption failed")]
    DecryptionFailed,

    /// The serialized input is shorter than the fixed header.
    #[error("sealed message truncated at {len} bytes")]
    Truncated {
        /// Input length.
        len: usize,
    },

    /// The signature pad byte exceeds the field width.
    #[error("malformed signature field, pad byte {pad}")]
    MalformedSignatureField {
        /// The offending pad byte.
        pad: usize,
    },

    /// The signature does not fit the fixed 72-byte wire field.
    #[error("signature length {len} exceeds the signature field")]
    SignatureTooLong {
        /// Provided signature length.
        len: usize,
    },
}

/// Errors from the ephemeral KEM primitive.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum KemError {
    /// AEAD authentication failed; the ciphertext was not produced for
    /// this keypair or was tampered with.
    #[error("KEM decryption failed")]
    DecryptionFailed,
}

/// Errors from pairwise session establishment and use.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum PairwiseError {
    /// The prekey bundle's signed prekey signature did not verify.
    #[error("prekey bundle signature verification failed")]
    BundleSignatureInvalid,

    /// The handshake references a one-time prekey the responder no
    /// longer holds.
    #[error("one-time prekey {id} not available")]
    MissingOneTimeKey {
        /// Referenced one-time prekey id.
        id: u32,
    },

    /// Ratchet failure while encrypting or decrypting.
    #[error(transparent)]
    Ratchet(#[from] SenderKeyError),
}
