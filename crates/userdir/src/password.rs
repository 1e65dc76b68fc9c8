//! Credential helpers layered over the digest primitives.

pub use sip_registrar::digest::{compute_ha1, hash_password};

use sip_registrar::digest::constant_time_eq;

/// Checks a plaintext candidate against the stored credential (HA1 digest or
/// plaintext). Empty candidates only match empty stored credentials.
pub fn verify_password(stored: &str, username: &str, realm: &str, candidate: &str) -> bool {
    let stored_hash = compute_ha1(username, realm, stored);
    if candidate.trim().is_empty() {
        return stored_hash.is_empty();
    }
    let candidate_hash = hash_password(username, realm, candidate);
    constant_time_eq(&stored_hash, &candidate_hash)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plaintext_and_digest_storage_both_verify() {
        assert!(verify_password(
            "wonderland",
            "alice",
            "example.com",
            "wonderland"
        ));
        let digest = hash_password("alice", "example.com", "wonderland");
        assert!(verify_password(&digest, "alice", "example.com", "wonderland"));
        assert!(!verify_password(&digest, "alice", "example.com", "nope"));
    }

    #[test]
    fn empty_candidate_only_matches_empty_stored() {
        assert!(verify_password("", "alice", "example.com", ""));
        assert!(!verify_password("secret", "alice", "example.com", ""));
    }
}
