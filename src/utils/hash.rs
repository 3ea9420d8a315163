//! Stable 64-bit hashes.
//!
//! Config hashes and message-name hashes travel over the wire, so they must be
//! identical across builds, platforms and processes. `std::hash` makes no such
//! promise; these are the first eight bytes (little-endian) of a SHA-256 digest.

use sha2::{Digest, Sha256};

/// Incremental hasher over length-delimited fields.
#[derive(Clone, Default)]
pub struct StableHasher {
    digest: Sha256,
}

impl StableHasher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn write_u64(&mut self, value: u64) -> &mut Self {
        self.digest.update(value.to_le_bytes());
        self
    }

    pub fn write_bool(&mut self, value: bool) -> &mut Self {
        self.digest.update([u8::from(value)]);
        self
    }

    pub fn write_str(&mut self, value: &str) -> &mut Self {
        self.write_u64(value.len() as u64);
        self.digest.update(value.as_bytes());
        self
    }

    pub fn finish(&self) -> u64 {
        let digest = self.digest.clone().finalize();
        let mut head = [0u8; 8];
        head.copy_from_slice(&digest[..8]);
        u64::from_le_bytes(head)
    }
}

/// Hash of a message or method name.
pub fn hash_name(name: &str) -> u64 {
    let digest = Sha256::digest(name.as_bytes());
    let mut head = [0u8; 8];
    head.copy_from_slice(&digest[..8]);
    u64::from_le_bytes(head)
}
