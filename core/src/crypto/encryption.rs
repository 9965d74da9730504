//! # AES-256-GCM Sealing
//!
//! Authenticated encryption for the key record at rest. The only consumer is
//! [`FileKeyStore`](crate::custody::FileKeyStore), but the functions are
//! generic over key and associated data.
//!
//! ## Wire format
//!
//! [`seal`] returns `nonce || ciphertext` as one buffer: 12 random nonce
//! bytes, then the ciphertext with its 16-byte GCM tag appended. [`open`]
//! expects exactly that layout. The nonce is drawn from the OS CSPRNG on
//! every call; a key record is sealed a handful of times in its life, so the
//! 96-bit birthday bound is not a concern.
//!
//! ## Associated data
//!
//! Both functions take AAD. The file store binds the record format version
//! into it, so a blob written by a different format revision fails to open
//! rather than being misparsed.

use aes_gcm::{
    aead::{Aead, KeyInit, Payload},
    Aes256Gcm, Nonce,
};
use rand::RngCore;
use thiserror::Error;
use zeroize::Zeroizing;

use crate::config::{AES_KEY_LENGTH, AES_NONCE_LENGTH, AES_TAG_LENGTH};

/// Errors that can occur during sealing and opening.
///
/// Deliberately coarse. "Wrong key" and "tampered blob" are the same answer.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum EncryptionError {
    #[error("encryption failed")]
    EncryptFailed,

    #[error("decryption failed -- wrong key or corrupted ciphertext")]
    DecryptFailed,

    #[error("ciphertext too short: must be at least {} bytes", AES_NONCE_LENGTH + AES_TAG_LENGTH)]
    CiphertextTooShort,
}

/// Encrypt `plaintext` under `key`, authenticating `aad` alongside it.
///
/// # Arguments
///
/// * `key`: 32-byte AES-256 key.
/// * `plaintext`: Bytes to seal. Any length.
/// * `aad`: Associated data. Must be supplied unchanged to [`open`].
pub fn seal(
    key: &[u8; AES_KEY_LENGTH],
    plaintext: &[u8],
    aad: &[u8],
) -> Result<Vec<u8>, EncryptionError> {
    let cipher = Aes256Gcm::new_from_slice(key).map_err(|_| EncryptionError::EncryptFailed)?;

    let mut nonce_bytes = [0u8; AES_NONCE_LENGTH];
    rand::rngs::OsRng.fill_bytes(&mut nonce_bytes);
    let nonce = Nonce::from_slice(&nonce_bytes);

    let ciphertext = cipher
        .encrypt(
            nonce,
            Payload {
                msg: plaintext,
                aad,
            },
        )
        .map_err(|_| EncryptionError::EncryptFailed)?;

    let mut out = Vec::with_capacity(AES_NONCE_LENGTH + ciphertext.len());
    out.extend_from_slice(&nonce_bytes);
    out.extend_from_slice(&ciphertext);
    Ok(out)
}

/// Decrypt a blob produced by [`seal`].
///
/// The plaintext comes back in a [`Zeroizing`] buffer because in practice it
/// is always key material.
///
/// # Errors
///
/// [`EncryptionError::CiphertextTooShort`] when the blob cannot even hold a
/// nonce and tag; [`EncryptionError::DecryptFailed`] for a wrong key, a
/// modified blob, or mismatched AAD.
pub fn open(
    key: &[u8; AES_KEY_LENGTH],
    data: &[u8],
    aad: &[u8],
) -> Result<Zeroizing<Vec<u8>>, EncryptionError> {
    if data.len() < AES_NONCE_LENGTH + AES_TAG_LENGTH {
        return Err(EncryptionError::CiphertextTooShort);
    }

    let (nonce_bytes, ciphertext) = data.split_at(AES_NONCE_LENGTH);
    let cipher = Aes256Gcm::new_from_slice(key).map_err(|_| EncryptionError::DecryptFailed)?;
    let nonce = Nonce::from_slice(nonce_bytes);

    cipher
        .decrypt(
            nonce,
            Payload {
                msg: ciphertext,
                aad,
            },
        )
        .map(Zeroizing::new)
        .map_err(|_| EncryptionError::DecryptFailed)
}
