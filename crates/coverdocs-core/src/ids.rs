//! Identifier and hashing helpers.

use sha2::{Digest, Sha256};
use uuid::Uuid;

/// Generate a new entity id (UUIDv4).
pub fn new_id() -> Uuid {
    Uuid::new_v4()
}

/// SHA-256 of the given bytes as 64 lower-hex characters.
///
/// Content hashes are the deduplication key and are never recomputed for a
/// stored object, so the encoding must stay stable.
pub fn sha256_hex(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

/// Deterministic ETag for a document revision.
///
/// A pure function of `(id, version)`: two readers of the same revision
/// always observe the same token, and every version bump changes it.
pub fn compute_etag(id: Uuid, version: i32) -> String {
    let mut hasher = Sha256::new();
    hasher.update(id.as_bytes());
    hasher.update(version.to_be_bytes());
    let digest = hasher.finalize();
    hex::encode(&digest[..16])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_ids_are_unique() {
        let a = new_id();
        let b = new_id();
        assert_ne!(a, b);
        assert_eq!(a.get_version_num(), 4);
    }

    #[test]
    fn test_sha256_known_vector() {
        // SHA-256("abc")
        assert_eq!(
            sha256_hex(b"abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn test_sha256_is_lower_hex_64() {
        let h = sha256_hex(b"some document bytes");
        assert_eq!(h.len(), 64);
        assert!(h.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
    }

    #[test]
    fn test_etag_deterministic() {
        let id = new_id();
        assert_eq!(compute_etag(id, 1), compute_etag(id, 1));
    }

    #[test]
    fn test_etag_changes_with_version() {
        let id = new_id();
        assert_ne!(compute_etag(id, 1), compute_etag(id, 2));
    }

    #[test]
    fn test_etag_changes_with_id() {
        assert_ne!(compute_etag(new_id(), 1), compute_etag(new_id(), 1));
    }

    #[test]
    fn test_etag_length() {
        assert_eq!(compute_etag(new_id(), 7).len(), 32);
    }
}
