//! # Hashing Utilities
//!
//! SHA-256, and only SHA-256. It backs three things in Stamp:
//!
//! - the share **commitment** (base64 of SHA-256 over the raw secret),
//! - the **payload hash** recorded in the audit trail for every signature,
//! - the **machine-bound key derivation** used by the file key store.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use sha2::{Digest, Sha256};

/// Compute the SHA-256 digest of `data`.
pub fn sha256(data: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(data);
    let result = hasher.finalize();
    let mut output = [0u8; 32];
    output.copy_from_slice(&result);
    output
}

/// SHA-256 over several parts, fed in order without separators.
///
/// Callers are responsible for making the concatenation unambiguous
/// (fixed-length parts, or a leading domain tag).
pub fn sha256_parts(parts: &[&[u8]]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    for part in parts {
        hasher.update(part);
    }
    let result = hasher.finalize();
    let mut output = [0u8; 32];
    output.copy_from_slice(&result);
    output
}

/// SHA-256 digest encoded as standard base64. This is the commitment format
/// carried by every share.
pub fn sha256_base64(data: &[u8]) -> String {
    BASE64.encode(sha256(data))
}

/// Short hex fingerprint (first 8 digest bytes) for log lines.
///
/// Safe to log: it identifies a payload or key without revealing it.
pub fn fingerprint(data: &[u8]) -> String {
    hex::encode(&sha256(data)[..8])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sha256_known_vector() {
        // NIST: SHA-256("abc")
        assert_eq!(
            hex::encode(sha256(b"abc")),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn test_sha256_parts_matches_concatenation() {
        let joined = sha256(b"stamp-machine-key");
        let parts = sha256_parts(&[b"stamp-", b"machine-", b"key"]);
        assert_eq!(joined, parts);
    }

    #[test]
    fn test_sha256_base64_length() {
        // 32 bytes -> 44 base64 characters with padding.
        assert_eq!(sha256_base64(b"secret").len(), 44);
    }

    #[test]
    fn test_fingerprint_is_sixteen_hex_chars() {
        let fp = fingerprint(b"payload");
        assert_eq!(fp.len(), 16);
        assert!(fp.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(fp, fingerprint(b"other payload"));
    }
}
