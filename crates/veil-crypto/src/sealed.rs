//! Sealed envelope: AEAD encryption with an optional detached signature.
//!
//! This is the fixed wire format used for ciphertexts exchanged over the
//! external tree layer and for chatbot sub-messages. The AEAD is AES-GCM
//! with a 12-byte IV; the key length (16, 24 or 32 bytes) selects
//! AES-128/192/256. When a signing key is supplied, a detached Ed25519
//! signature over the ciphertext is attached and must verify before the
//! ciphertext is opened.
//!
//! Wire layout:
//!
//! ```text
//! IV (12 bytes)
//! ‖ pad byte = 72 - signature length
//! ‖ signature field (72 bytes, signature right-aligned, zero-padded left)
//! ‖ ciphertext (remaining bytes)
//! ```

use aes_gcm::{
    Aes128Gcm, Aes256Gcm, AesGcm, Nonce,
    aead::{Aead, KeyInit, consts::U12},
    aes::Aes192,
};
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};

use super::error::SealedError;

/// AES-192-GCM with a 12-byte nonce (no upstream alias exists for this one).
type Aes192Gcm = AesGcm<Aes192, U12>;

/// IV size in bytes.
pub const IV_SIZE: usize = 12;

/// Fixed width of the signature field on the wire.
pub const SIG_FIELD_SIZE: usize = 72;

/// Serialized size of everything preceding the ciphertext.
const HEADER_SIZE: usize = IV_SIZE + 1 + SIG_FIELD_SIZE;

/// A sealed message: IV, optional detached signature, and ciphertext.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SealedMessage {
    /// The 12-byte AES-GCM IV.
    pub iv: [u8; IV_SIZE],
    /// Detached signature over the ciphertext. Empty when unsigned.
    pub signature: Vec<u8>,
    /// The ciphertext including the 16-byte GCM tag.
    pub ciphertext: Vec<u8>,
}

impl SealedMessage {
    /// Serialize to the fixed wire layout.
    ///
    /// # Errors
    ///
    /// Fails if the signature does not fit the fixed field width.
    pub fn to_bytes(&self) -> Result<Vec<u8>, SealedError> {
        let Some(pad) = SIG_FIELD_SIZE.checked_sub(self.signature.len()) else {
            return Err(SealedError::SignatureTooLong { len: self.signature.len() });
        };
        let mut out = Vec::with_capacity(HEADER_SIZE + self.ciphertext.len());
        out.extend_from_slice(&self.iv);
        out.push(pad as u8);
        out.resize(out.len() + pad, 0);
        out.extend_from_slice(&self.signature);
        out.extend_from_slice(&self.ciphertext);
        Ok(out)
    }

    /// Parse from the fixed wire layout.
    ///
    /// # Errors
    ///
    /// Fails if the input is shorter than the fixed header or the pad byte
    /// exceeds the signature field width.
    pub fn from_bytes(data: &[u8]) -> Result<Self, SealedError> {
        if data.len() < HEADER_SIZE {
            return Err(SealedError::Truncated { len: data.len() });
        }

        let mut iv = [0u8; IV_SIZE];
        iv.copy_from_slice(&data[..IV_SIZE]);

        let pad = data[IV_SIZE] as usize;
        if pad > SIG_FIELD_SIZE {
            return Err(SealedError::MalformedSignatureField { pad });
        }

        let field = &data[IV_SIZE + 1..HEADER_SIZE];
        let signature = field[pad..].to_vec();
        let ciphertext = data[HEADER_SIZE..].to_vec();

        Ok(Self { iv, signature, ciphertext })
    }
}

/// Encrypt a plaintext into a [`SealedMessage`].
///
/// The key length selects the AES variant (16/24/32 bytes). The caller
/// provides the IV; it must be fresh random bytes in production. When
/// `signer` is present the ciphertext is signed.
///
/// # Errors
///
/// Fails with `InvalidKeyLength` for unsupported key sizes.
pub fn seal(
    plaintext: &[u8],
    key: &[u8],
    iv: [u8; IV_SIZE],
    signer: Option<&SigningKey>,
) -> Result<SealedMessage, SealedError> {
    let ciphertext = aead_encrypt(key, &iv, plaintext)?;

    let signature = match signer {
        Some(signer) => signer.sign(&ciphertext).to_bytes().to_vec(),
        None => Vec::new(),
    };

    Ok(SealedMessage { iv, signature, ciphertext })
}

/// Open a [`SealedMessage`], verifying the signature first when present.
///
/// Presence of a signature and of a verification key must match: a signed
/// message without a verifier, or an unsigned message with one, is
/// rejected rather than silently accepted.
///
/// # Errors
///
/// - `SignaturePresenceMismatch` when signature/verifier presence differ
/// - `SignatureInvalid` when the signature fails to parse or verify
/// - `DecryptionFailed` on authentication failure
pub fn open(
    sealed: &SealedMessage,
    key: &[u8],
    verifier: Option<&VerifyingKey>,
) -> Result<Vec<u8>, SealedError> {
    match (sealed.signature.is_empty(), verifier) {
        (false, Some(verifier)) => {
            let signature = Signature::from_slice(&sealed.signature)
                .map_err(|_| SealedError::SignatureInvalid)?;
            verifier
                .verify(&sealed.ciphertext, &signature)
                .map_err(|_| SealedError::SignatureInvalid)?;
        },
        (true, None) => {},
        _ => return Err(SealedError::SignaturePresenceMismatch),
    }

    aead_decrypt(key, &sealed.iv, &sealed.ciphertext)
}

fn aead_encrypt(key: &[u8], iv: &[u8; IV_SIZE], plaintext: &[u8]) -> Result<Vec<u8>, SealedError> {
    let nonce = Nonce::from_slice(iv);
    let result = match key.len() {
        16 => {
            let Ok(cipher) = Aes128Gcm::new_from_slice(key) else {
                unreachable!("key length checked");
            };
            cipher.encrypt(nonce, plaintext)
        },
        24 => {
            let Ok(cipher) = Aes192Gcm::new_from_slice(key) else {
                unreachable!("key length checked");
            };
            cipher.encrypt(nonce, plaintext)
        },
        32 => {
            let Ok(cipher) = Aes256Gcm::new_from_slice(key) else {
                unreachable!("key length checked");
            };
            cipher.encrypt(nonce, plaintext)
        },
        len => return Err(SealedError::InvalidKeyLength { len }),
    };

    let Ok(ciphertext) = result else {
        unreachable!("AES-GCM encryption cannot fail with valid inputs");
    };
    Ok(ciphertext)
}

fn aead_decrypt(key: &[u8], iv: &[u8; IV_SIZE], ciphertext: &[u8]) -> Result<Vec<u8>, SealedError> {
    let nonce = Nonce::from_slice(iv);
    let result = match key.len() {
        16 => {
            let Ok(cipher) = Aes128Gcm::new_from_slice(key) else {
                unreachable!("key length checked");
            };
            cipher.decrypt(nonce, ciphertext)
        },
        24 => {
            let Ok(cipher) = Aes192Gcm::new_from_slice(key) else {
                unreachable!("key length checked");
            };
            cipher.decrypt(nonce, ciphertext)
        },
        32 => {
            let Ok(cipher) = Aes256Gcm::new_from_slice(key) else {
                unreachable!("key length checked");
            };
            cipher.decrypt(nonce, ciphertext)
        },
        len => return Err(SealedError::InvalidKeyLength { len }),
    };

    result.map_err(|_| SealedError::DecryptionFailed)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_iv() -> [u8; IV_SIZE] {
        [0xA5; IV_SIZE]
    }

    fn test_signer() -> SigningKey {
        SigningKey::from_bytes(&[7u8; 32])
    }

    #[test]
    fn roundtrip_all_key_lengths() {
        for len in [16usize, 24, 32] {
            let key = vec![0x42u8; len];
            let sealed = seal(b"hello", &key, test_iv(), None).unwrap();
            let plaintext = open(&sealed, &key, None).unwrap();
            assert_eq!(plaintext, b"hello", "key length {len}");
        }
    }

    #[test]
    fn invalid_key_length_rejected() {
        let result = seal(b"hello", &[0u8; 17], test_iv(), None);
        assert!(matches!(result, Err(SealedError::InvalidKeyLength { len: 17 })));
    }

    #[test]
    fn signed_roundtrip() {
        let key = [0x11u8; 32];
        let signer = test_signer();

        let sealed = seal(b"signed payload", &key, test_iv(), Some(&signer)).unwrap();
        assert_eq!(sealed.signature.len(), 64);

        let plaintext = open(&sealed, &key, Some(&signer.verifying_key())).unwrap();
        assert_eq!(plaintext, b"signed payload");
    }

    #[test]
    fn wrong_verifier_fails_closed() {
        let key = [0x11u8; 32];
        let signer = test_signer();
        let other = SigningKey::from_bytes(&[9u8; 32]);

        let sealed = seal(b"payload", &key, test_iv(), Some(&signer)).unwrap();
        let result = open(&sealed, &key, Some(&other.verifying_key()));
        assert!(matches!(result, Err(SealedError::SignatureInvalid)));
    }

    #[test]
    fn signature_presence_must_match() {
        let key = [0x11u8; 32];
        let signer = test_signer();

        let signed = seal(b"payload", &key, test_iv(), Some(&signer)).unwrap();
        let unsigned = seal(b"payload", &key, test_iv(), None).unwrap();

        assert!(matches!(
            open(&signed, &key, None),
            Err(SealedError::SignaturePresenceMismatch)
        ));
        assert!(matches!(
            open(&unsigned, &key, Some(&signer.verifying_key())),
            Err(SealedError::SignaturePresenceMismatch)
        ));
    }

    #[test]
    fn tampered_ciphertext_fails() {
        let key = [0x11u8; 32];
        let mut sealed = seal(b"payload", &key, test_iv(), None).unwrap();
        sealed.ciphertext[0] ^= 0xFF;

        assert!(matches!(open(&sealed, &key, None), Err(SealedError::DecryptionFailed)));
    }

    #[test]
    fn serialization_roundtrip_unsigned() {
        let key = [0x22u8; 16];
        let sealed = seal(b"wire format", &key, test_iv(), None).unwrap();

        let parsed = SealedMessage::from_bytes(&sealed.to_bytes().unwrap()).unwrap();
        assert_eq!(parsed, sealed);
        assert!(parsed.signature.is_empty());
    }

    #[test]
    fn serialization_roundtrip_signed() {
        let key = [0x22u8; 32];
        let sealed = seal(b"wire format", &key, test_iv(), Some(&test_signer())).unwrap();

        let parsed = SealedMessage::from_bytes(&sealed.to_bytes().unwrap()).unwrap();
        assert_eq!(parsed, sealed);
        assert_eq!(parsed.signature.len(), 64);
    }

    #[test]
    fn serialization_layout() {
        let sealed = SealedMessage {
            iv: test_iv(),
            signature: vec![0xCC; 64],
            ciphertext: vec![0xDD; 5],
        };
        let bytes = sealed.to_bytes().unwrap();

        assert_eq!(&bytes[..12], &[0xA5; 12]);
        assert_eq!(bytes[12], 8, "pad byte is 72 - 64");
        assert_eq!(&bytes[13..21], &[0u8; 8], "left padding is zero");
        assert_eq!(&bytes[21..85], &[0xCC; 64]);
        assert_eq!(&bytes[85..], &[0xDD; 5]);
    }

    #[test]
    fn deserialize_rejects_truncated_input() {
        let result = SealedMessage::from_bytes(&[0u8; 84]);
        assert!(matches!(result, Err(SealedError::Truncated { len: 84 })));
    }

    #[test]
    fn deserialize_rejects_oversized_pad() {
        let mut bytes = vec![0u8; 90];
        bytes[12] = 73;
        let result = SealedMessage::from_bytes(&bytes);
        assert!(matches!(result, Err(SealedError::MalformedSignatureField { pad: 73 })));
    }

    #[test]
    fn empty_ciphertext_roundtrips() {
        let sealed =
            SealedMessage { iv: test_iv(), signature: Vec::new(), ciphertext: Vec::new() };
        let parsed = SealedMessage::from_bytes(&sealed.to_bytes().unwrap()).unwrap();
        assert_eq!(parsed, sealed);
    }

    #[test]
    fn oversized_signature_does_not_serialize() {
        let sealed = SealedMessage {
            iv: test_iv(),
            signature: vec![0xEE; SIG_FIELD_SIZE + 1],
            ciphertext: vec![0xDD; 5],
        };
        assert!(matches!(
            sealed.to_bytes(),
            Err(SealedError::SignatureTooLong { len: 73 })
        ));
    }
}
