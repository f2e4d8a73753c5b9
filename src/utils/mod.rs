//! Utility functions and helpers.

pub mod cancel;
pub mod git;
pub mod http;

use sha2::{Digest, Sha256};

pub use cancel::CancelSignal;

/// Short, filesystem-safe hash of a string (first 16 hex chars of SHA-256).
pub fn short_hash(input: &str) -> String {
    let digest = Sha256::digest(input.as_bytes());
    hex::encode(&digest[..8])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_short_hash_is_stable() {
        assert_eq!(short_hash("a/b"), short_hash("a/b"));
        assert_ne!(short_hash("a/b"), short_hash("a/c"));
        assert_eq!(short_hash("a/b").len(), 16);
    }
}
