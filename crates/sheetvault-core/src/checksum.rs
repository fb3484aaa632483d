//! Content fingerprints used for conflict detection and backup dedup.

use sha2::{Digest, Sha256};

/// Length of a hex-encoded SHA-256 digest.
pub const CHECKSUM_LEN: usize = 64;

/// SHA-256 of `data` as 64 lowercase hex characters.
pub fn checksum(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

/// Whether `value` has the shape of a checksum produced by [`checksum`].
pub fn is_checksum(value: &str) -> bool {
    value.len() == CHECKSUM_LEN
        && value
            .bytes()
            .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b))
}
