//! # Digital Signatures
//!
//! The [`SignatureProvider`] trait is the only way the rest of Stamp touches
//! an asymmetric algorithm. It is stateless: keys go in as byte slices and
//! come out as byte vectors, and the custodian decides where they live.
//!
//! [`Ed25519Provider`] is the one implementation. Ed25519 signatures are
//! deterministic (RFC 8032), so signing the same bytes with the same key
//! always yields the same 64 bytes.
//!
//! ## PEM
//!
//! Public keys are exchanged as PEM: standard base64 of the raw 32-byte key,
//! wrapped at 64 characters between `BEGIN PUBLIC KEY` / `END PUBLIC KEY`
//! lines. Decoding ignores every `-----` line and concatenates the rest.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use ed25519_dalek::{Signature, Signer, SigningKey, VerifyingKey};
use thiserror::Error;
use zeroize::Zeroizing;

use crate::config::{SIGNATURE_LENGTH, SIGNING_ALGORITHM, SIGNING_KEY_LENGTH, VERIFYING_KEY_LENGTH};

const PEM_HEADER: &str = "-----BEGIN PUBLIC KEY-----";
const PEM_FOOTER: &str = "-----END PUBLIC KEY-----";
const PEM_LINE_WIDTH: usize = 64;

/// Errors during key handling and signing.
///
/// Verification has no error variant. It answers `false`.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum SignatureError {
    #[error("invalid private key: expected {expected} bytes, got {got}")]
    InvalidPrivateKey { expected: usize, got: usize },

    #[error("invalid public key")]
    InvalidPublicKey,

    #[error("malformed PEM public key")]
    MalformedPem,
}

/// Stateless asymmetric signing primitive.
///
/// Implementations must be deterministic in the sense that [`verify`]
/// accepts every signature [`sign`] produces for the matching key, and must
/// never panic on malformed input.
///
/// [`sign`]: SignatureProvider::sign
/// [`verify`]: SignatureProvider::verify
pub trait SignatureProvider: Send + Sync {
    /// Algorithm tag, e.g. `"Ed25519"`.
    fn algorithm(&self) -> &'static str;

    /// Draw a fresh keypair from the OS CSPRNG. Returns `(private, public)`.
    fn generate_keypair(&self) -> (Zeroizing<Vec<u8>>, Vec<u8>);

    /// Sign `data` with a raw private key.
    fn sign(&self, private_key: &[u8], data: &[u8]) -> Result<Vec<u8>, SignatureError>;

    /// Verify `signature` over `data`. Malformed keys or signatures yield `false`.
    fn verify(&self, public_key: &[u8], data: &[u8], signature: &[u8]) -> bool;

    /// Recompute the public key belonging to `private_key`.
    fn derive_public_key(&self, private_key: &[u8]) -> Result<Vec<u8>, SignatureError>;

    /// Encode a public key as PEM.
    fn export_public_key_pem(&self, public_key: &[u8]) -> String {
        encode_public_key_pem(public_key)
    }

    /// Decode a PEM public key back to raw bytes.
    fn import_public_key_pem(&self, pem: &str) -> Result<Vec<u8>, SignatureError> {
        decode_public_key_pem(pem)
    }
}

/// Wrap raw public key bytes in a PEM envelope.
pub fn encode_public_key_pem(public_key: &[u8]) -> String {
    let body = BASE64.encode(public_key);
    let mut pem = String::with_capacity(body.len() + PEM_HEADER.len() + PEM_FOOTER.len() + 8);
    pem.push_str(PEM_HEADER);
    pem.push('\n');
    // Base64 output is ASCII, so byte chunks are char boundaries.
    for line in body.as_bytes().chunks(PEM_LINE_WIDTH) {
        pem.push_str(&String::from_utf8_lossy(line));
        pem.push('\n');
    }
    pem.push_str(PEM_FOOTER);
    pem
}

/// Strip the PEM envelope and decode the base64 body.
pub fn decode_public_key_pem(pem: &str) -> Result<Vec<u8>, SignatureError> {
    let body: String = pem
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with("-----"))
        .collect();
    if body.is_empty() {
        return Err(SignatureError::MalformedPem);
    }
    BASE64
        .decode(body.as_bytes())
        .map_err(|_| SignatureError::MalformedPem)
}

/// Ed25519 via `ed25519-dalek`.
#[derive(Debug, Clone, Copy, Default)]
pub struct Ed25519Provider;

impl Ed25519Provider {
    pub fn new() -> Self {
        Self
    }

    fn signing_key(private_key: &[u8]) -> Result<SigningKey, SignatureError> {
        let bytes: Zeroizing<[u8; SIGNING_KEY_LENGTH]> = Zeroizing::new(
            private_key
                .try_into()
                .map_err(|_| SignatureError::InvalidPrivateKey {
                    expected: SIGNING_KEY_LENGTH,
                    got: private_key.len(),
                })?,
        );
        Ok(SigningKey::from_bytes(&bytes))
    }
}

impl SignatureProvider for Ed25519Provider {
    fn algorithm(&self) -> &'static str {
        SIGNING_ALGORITHM
    }

    fn generate_keypair(&self) -> (Zeroizing<Vec<u8>>, Vec<u8>) {
        let signing_key = SigningKey::generate(&mut rand::rngs::OsRng);
        let private_key = Zeroizing::new(signing_key.to_bytes().to_vec());
        let public_key = signing_key.verifying_key().to_bytes().to_vec();
        (private_key, public_key)
    }

    fn sign(&self, private_key: &[u8], data: &[u8]) -> Result<Vec<u8>, SignatureError> {
        let signing_key = Self::signing_key(private_key)?;
        Ok(signing_key.sign(data).to_bytes().to_vec())
    }

    fn verify(&self, public_key: &[u8], data: &[u8], signature: &[u8]) -> bool {
        let Ok(key_bytes) = <[u8; VERIFYING_KEY_LENGTH]>::try_from(public_key) else {
            return false;
        };
        let Ok(verifying_key) = VerifyingKey::from_bytes(&key_bytes) else {
            return false;
        };
        if signature.len() != SIGNATURE_LENGTH {
            return false;
        }
        let Ok(signature) = Signature::from_slice(signature) else {
            return false;
        };
        verifying_key.verify_strict(data, &signature).is_ok()
    }

    fn derive_public_key(&self, private_key: &[u8]) -> Result<Vec<u8>, SignatureError> {
        let signing_key = Self::signing_key(private_key)?;
        Ok(signing_key.verifying_key().to_bytes().to_vec())
    }

    fn import_public_key_pem(&self, pem: &str) -> Result<Vec<u8>, SignatureError> {
        let bytes = decode_public_key_pem(pem)?;
        let key_bytes: [u8; VERIFYING_KEY_LENGTH] = bytes
            .as_slice()
            .try_into()
            .map_err(|_| SignatureError::InvalidPublicKey)?;
        VerifyingKey::from_bytes(&key_bytes).map_err(|_| SignatureError::InvalidPublicKey)?;
        Ok(bytes)
    }
}
