//! Truncated BLAKE2b checksums for corruption detection.
//!
//! The digest is hex-encoded and cut to `128 / truncation` characters.
//! These checksums detect accidental corruption; they are not a keyed MAC.

use blake2::{Blake2b512, Digest};
use subtle::ConstantTimeEq;

/// Truncation used when the requested one is zero or above [`MAX_TRUNCATION`].
pub const DEFAULT_TRUNCATION: u32 = 4;

/// Largest accepted truncation factor.
pub const MAX_TRUNCATION: u32 = 32;

/// Hex characters in an untruncated BLAKE2b-512 digest.
const FULL_HEX_LEN: usize = 128;

fn hex_len(truncation: u32) -> usize {
    let truncation = if truncation == 0 || truncation > MAX_TRUNCATION {
        DEFAULT_TRUNCATION
    } else {
        truncation
    };
    FULL_HEX_LEN / truncation as usize
}

/// Incremental checksum over data that arrives in chunks.
#[derive(Clone, Default)]
pub struct Checksummer {
    hasher: Blake2b512,
}

impl Checksummer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&mut self, data: &[u8]) {
        self.hasher.update(data);
    }

    /// Finish and return the truncated hex digest.
    pub fn finalize(self, truncation: u32) -> String {
        let mut digest = hex::encode(self.hasher.finalize());
        digest.truncate(hex_len(truncation));
        digest
    }
}

/// Checksum a complete byte slice.
pub fn checksum(data: &[u8], truncation: u32) -> String {
    let mut summer = Checksummer::new();
    summer.update(data);
    summer.finalize(truncation)
}

/// Compare a stored checksum against a computed one in constant time.
pub fn verify_checksum(expected: &str, actual: &str) -> bool {
    expected.len() == actual.len() && bool::from(expected.as_bytes().ct_eq(actual.as_bytes()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_checksum_deterministic() {
        assert_eq!(checksum(b"payload", 4), checksum(b"payload", 4));
        assert_ne!(checksum(b"payload", 4), checksum(b"payloae", 4));
    }

    #[test]
    fn test_truncation_lengths() {
        assert_eq!(checksum(b"x", 1).len(), 128);
        assert_eq!(checksum(b"x", 4).len(), 32);
        assert_eq!(checksum(b"x", 32).len(), 4);
    }

    #[test]
    fn test_truncation_over_cap_falls_back() {
        assert_eq!(checksum(b"x", 33), checksum(b"x", DEFAULT_TRUNCATION));
        assert_eq!(checksum(b"x", 0), checksum(b"x", DEFAULT_TRUNCATION));
    }

    #[test]
    fn test_incremental_matches_whole() {
        let data = vec![0x11u8; 10_000];
        let mut summer = Checksummer::new();
        for chunk in data.chunks(333) {
            summer.update(chunk);
        }
        assert_eq!(summer.finalize(8), checksum(&data, 8));
    }

    #[test]
    fn test_verify_checksum() {
        let sum = checksum(b"abc", 4);
        assert!(verify_checksum(&sum, &checksum(b"abc", 4)));
        assert!(!verify_checksum(&sum, &checksum(b"abd", 4)));
        assert!(!verify_checksum(&sum, &sum[..8]));
    }
}
