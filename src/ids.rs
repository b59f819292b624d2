//! 26-character sortable identifiers and SHA-256 hex hashing.
//!
//! Device ids, session ids, and hello nonces all use the same shape: a
//! ULID, which is a 26-character Crockford-base32 string that sorts
//! lexicographically the same way its timestamp does.

use sha2::{Digest, Sha256};
use ulid::Ulid;

/// Mint a fresh 26-character sortable identifier.
pub fn new_sortable_id() -> String {
    Ulid::new().to_string()
}

/// Lowercase hex SHA-256 digest of `bytes`.
pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// `true` if `value` is exactly 64 lowercase hex characters.
pub fn is_lower_hex64(value: &str) -> bool {
    value.len() == 64 && value.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sortable_ids_are_26_chars() {
        let id = new_sortable_id();
        assert_eq!(id.len(), 26);
    }

    #[test]
    fn sha256_hex_matches_known_vector() {
        assert_eq!(
            sha256_hex(b"payload"),
            "239f59ed55e737c77147cf55ad0c1b030b6d7ee748a7426952f9b852d5a935e5"
        );
    }

    #[test]
    fn hex64_validation() {
        assert!(is_lower_hex64(&"a".repeat(64)));
        assert!(!is_lower_hex64(&"A".repeat(64)));
        assert!(!is_lower_hex64(&"a".repeat(63)));
        assert!(!is_lower_hex64(&"g".repeat(64)));
    }
}
