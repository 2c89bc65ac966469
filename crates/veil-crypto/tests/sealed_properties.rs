//! Property-based tests for the sealed envelope format.
//!
//! These verify the seal/open round trip and the fixed wire layout for
//! ALL valid inputs, not just specific examples.

use ed25519_dalek::SigningKey;
use proptest::prelude::*;

use veil_crypto::{IV_SIZE, SIG_FIELD_SIZE, SealedMessage, open, seal};

/// Strategy for generating a key of one of the supported AES lengths.
fn arbitrary_key() -> impl Strategy<Value = Vec<u8>> {
    prop_oneof![
        prop::collection::vec(any::<u8>(), 16..=16),
        prop::collection::vec(any::<u8>(), 24..=24),
        prop::collection::vec(any::<u8>(), 32..=32),
    ]
}

fn arbitrary_iv() -> impl Strategy<Value = [u8; IV_SIZE]> {
    any::<[u8; IV_SIZE]>()
}

#[test]
fn prop_seal_open_roundtrip_all_key_lengths() {
    proptest!(|(
        plaintext in prop::collection::vec(any::<u8>(), 0..512),
        key in arbitrary_key(),
        iv in arbitrary_iv(),
    )| {
        let sealed = seal(&plaintext, &key, iv, None).expect("seal should succeed");
        let opened = open(&sealed, &key, None).expect("open should succeed");

        // PROPERTY: Round-trip must be identity
        prop_assert_eq!(opened, plaintext);
    });
}

#[test]
fn prop_signed_roundtrip_verifies_and_wrong_key_fails() {
    proptest!(|(
        plaintext in prop::collection::vec(any::<u8>(), 0..512),
        key in arbitrary_key(),
        iv in arbitrary_iv(),
        signer_seed in any::<[u8; 32]>(),
        other_seed in any::<[u8; 32]>(),
    )| {
        prop_assume!(signer_seed != other_seed);
        let signer = SigningKey::from_bytes(&signer_seed);
        let other = SigningKey::from_bytes(&other_seed);

        let sealed = seal(&plaintext, &key, iv, Some(&signer)).expect("seal should succeed");

        // PROPERTY: The matching verifying key opens the message
        let opened = open(&sealed, &key, Some(&signer.verifying_key()))
            .expect("open with the right key should succeed");
        prop_assert_eq!(opened, plaintext);

        // PROPERTY: Any other verifying key fails closed
        prop_assert!(open(&sealed, &key, Some(&other.verifying_key())).is_err());
    });
}

#[test]
fn prop_serialization_is_idempotent_for_all_signature_lengths() {
    proptest!(|(
        iv in arbitrary_iv(),
        signature in prop::collection::vec(any::<u8>(), 0..=64),
        ciphertext in prop::collection::vec(any::<u8>(), 0..512),
    )| {
        let message = SealedMessage { iv, signature, ciphertext };

        let bytes = message.to_bytes().expect("serialize should succeed");
        let decoded = SealedMessage::from_bytes(&bytes).expect("decode should succeed");

        // PROPERTY: Serialize then deserialize reproduces the message
        // bit-for-bit, including a zero-length signature
        prop_assert_eq!(decoded, message);
    });
}

#[test]
fn prop_wire_layout_has_fixed_header() {
    proptest!(|(
        iv in arbitrary_iv(),
        signature in prop::collection::vec(any::<u8>(), 0..=64),
        ciphertext in prop::collection::vec(any::<u8>(), 0..256),
    )| {
        let message = SealedMessage { iv, signature: signature.clone(), ciphertext: ciphertext.clone() };
        let bytes = message.to_bytes().expect("serialize should succeed");

        // PROPERTY: IV first, then the length-prefixed signature field,
        // then the ciphertext, at fixed offsets
        prop_assert_eq!(&bytes[..IV_SIZE], &iv[..]);
        prop_assert_eq!(bytes[IV_SIZE] as usize, SIG_FIELD_SIZE - signature.len());
        prop_assert_eq!(&bytes[IV_SIZE + 1 + SIG_FIELD_SIZE..], &ciphertext[..]);
    });
}
