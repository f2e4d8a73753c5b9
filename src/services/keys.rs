//! Deterministic document keys.

use sha2::{Digest, Sha256};

use crate::models::Key;

/// Derives the index key of a manifest from its bucket and path.
///
/// The key is the hex SHA-256 of `bucket_id`, a NUL separator and the
/// `/`-normalized path. Content never contributes, so an edited manifest
/// keeps its key and a moved one gets a new key.
#[derive(Debug, Clone, Copy, Default)]
pub struct KeyGenerator;

impl KeyGenerator {
    pub fn new() -> Self {
        Self
    }

    pub fn key(&self, bucket_id: &str, path: &str) -> Key {
        let path = path.replace('\\', "/");
        let path = path.trim_start_matches("./").trim_start_matches('/');

        let mut hasher = Sha256::new();
        hasher.update(bucket_id.as_bytes());
        hasher.update([0u8]);
        hasher.update(path.as_bytes());
        Key::new(hex::encode(hasher.finalize()))
    }
}
