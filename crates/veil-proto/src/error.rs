//! Wire codec error types.

use thiserror::Error;

/// Errors from encoding or decoding wire types.
#[derive(Debug, Error)]
pub enum ProtoError {
    /// CBOR encoding failed.
    #[error("encode failed: {0}")]
    Encode(String),

    /// CBOR decoding failed.
    #[error("decode failed: {0}")]
    Decode(String),

    /// A chatbot flag combination with no enum representation was
    /// received from an untyped source.
    #[error("pseudonymous chatbots require the independent key-agreement path")]
    InvalidVisibilityFlags,
}
