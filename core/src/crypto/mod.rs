//! # Cryptographic Primitives
//!
//! Thin, typed wrappers around audited crates. Nothing in here is clever:
//!
//! - **Ed25519** (`ed25519-dalek`) for signatures, behind [`SignatureProvider`]
//!   so the custodian and server never name the algorithm directly.
//! - **AES-256-GCM** (`aes-gcm`) for sealing the key record at rest.
//! - **SHA-256** (`sha2`) for share commitments, payload hashes and
//!   machine-bound key derivation.

pub mod encryption;
pub mod hash;
pub mod signatures;

pub use encryption::{open, seal, EncryptionError};
pub use hash::{fingerprint, sha256, sha256_base64};
pub use signatures::{
    decode_public_key_pem, encode_public_key_pem, Ed25519Provider, SignatureError,
    SignatureProvider,
};
