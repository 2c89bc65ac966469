//! Crate-local randomness.

use rand::{RngCore, rngs::OsRng};

/// Fill a fixed-size array from the operating system RNG.
pub(crate) fn random_array<const N: usize>() -> [u8; N] {
    let mut out = [0u8; N];
    OsRng.fill_bytes(&mut out);
    out
}
