//! Crate-local randomness.

use rand::{RngCore, rngs::OsRng};

/// Fill a fixed-size array from the OS entropy source.
pub(crate) fn random_array<const N: usize>() -> [u8; N] {
    let mut out = [0u8; N];
    OsRng.fill_bytes(&mut out);
    out
}

/// A random byte string of the given length, for dummy traffic.
pub(crate) fn random_bytes(len: usize) -> Vec<u8> {
    let mut out = vec![0u8; len];
    OsRng.fill_bytes(&mut out);
    out
}
