//! Hashing for trace chains.

use sha2::{Digest, Sha256};

/// `prev_hash` of the first record in every chain.
pub const GENESIS_HASH: &str = "sha256:genesis";

/// Hash a string value using SHA-256.
pub fn sha256_hash(data: &str) -> String {
    format!("sha256:{:x}", Sha256::digest(data.as_bytes()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sha256() {
        let h = sha256_hash("hello");
        assert!(h.starts_with("sha256:"));
        assert_eq!(h.len(), 7 + 64);
        assert_eq!(h, sha256_hash("hello"));
        assert_ne!(h, sha256_hash("hello!"));
    }
}
