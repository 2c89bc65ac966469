//! CBOR encode/decode helpers shared by all wire types.

use serde::{Serialize, de::DeserializeOwned};

use crate::error::ProtoError;

/// Encode a value to CBOR bytes.
///
/// # Errors
///
/// Fails if the value cannot be represented in CBOR (practically only
/// on allocation failure).
pub fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, ProtoError> {
    let mut buf = Vec::new();
    ciborium::ser::into_writer(value, &mut buf).map_err(|e| ProtoError::Encode(e.to_string()))?;
    Ok(buf)
}

/// Decode a value from CBOR bytes.
///
/// # Errors
///
/// Fails with `Decode` on malformed or mismatched input. Decode
/// failures must be treated as a lost message, never a crash.
pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, ProtoError> {
    ciborium::de::from_reader(bytes).map_err(|e| ProtoError::Decode(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip_simple_value() {
        let bytes = encode(&(1u32, "two".to_string())).unwrap();
        let decoded: (u32, String) = decode(&bytes).unwrap();
        assert_eq!(decoded, (1, "two".to_string()));
    }

    #[test]
    fn decode_failure_is_an_error() {
        let result: Result<(u32, String), _> = decode(&[0x9F, 0x9F]);
        assert!(result.is_err());
    }
}
