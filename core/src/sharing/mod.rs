//! # Threshold Key Backup via Shamir's Secret Sharing
//!
//! Splits a secret of any length into `n` shares so that any `t` of them
//! put it back together and `t - 1` reveal nothing. Every byte of the secret
//! is shared independently: it becomes the constant term of a random
//! degree-`(t - 1)` polynomial over GF(256), and share `i` holds that
//! polynomial evaluated at `x = i`.
//!
//! ## Commitment
//!
//! Each share carries `base64(SHA-256(secret))`. Reconstruction recomputes
//! the digest over its output and refuses to return anything that does not
//! match. Interpolation happily produces *some* byte string from corrupted
//! or mixed-up shares; the commitment is what tells us it is the wrong one.
//!
//! ## Indices
//!
//! Shares are numbered `1..=n`. Index 0 is the secret's own evaluation
//! point and is never handed out.
//!
//! ## Usage
//!
//! ```
//! use stamp_core::sharing::{create_shares, reconstruct_secret};
//!
//! let secret = [7u8; 32];
//! let bundle = create_shares(&secret, 5, 3, "pem", "Ed25519").unwrap();
//! let picked = [bundle.shares[0].clone(), bundle.shares[2].clone(), bundle.shares[4].clone()];
//! let recovered = reconstruct_secret(&picked).unwrap();
//! assert_eq!(recovered.as_slice(), &secret);
//! ```

pub mod gf256;

use std::collections::BTreeSet;
use std::fmt;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use chrono::{DateTime, Utc};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use zeroize::{Zeroize, Zeroizing};

use crate::config::{COMMITMENT_LENGTH, MAX_SHARES, MIN_THRESHOLD};
use crate::crypto::hash::sha256_base64;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Which consistency rule a reconstruction batch broke.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Inconsistency {
    /// Payloads decode to different lengths.
    Length,
    /// Shares carry different commitments (mixed batches).
    Commitment,
    /// Shares disagree on the threshold they were split with.
    Threshold,
    /// The same index appears twice.
    DuplicateIndex,
    /// A share claims index 0.
    ZeroIndex,
}

impl fmt::Display for Inconsistency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let what = match self {
            Inconsistency::Length => "share payload lengths differ",
            Inconsistency::Commitment => "share commitments differ",
            Inconsistency::Threshold => "share thresholds differ",
            Inconsistency::DuplicateIndex => "duplicate share index",
            Inconsistency::ZeroIndex => "share index 0 is reserved",
        };
        f.write_str(what)
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ShareError {
    /// Bad split parameters. Raised before any randomness is drawn.
    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),

    #[error("insufficient shares: threshold is {threshold}, got {provided}")]
    InsufficientShares { threshold: u8, provided: usize },

    #[error("inconsistent shares: {0}")]
    Inconsistent(Inconsistency),

    #[error("share {index} payload is not valid base64")]
    InvalidPayload { index: u8 },

    /// The reconstructed secret does not hash to the shares' commitment.
    #[error("reconstructed secret does not match commitment")]
    CommitmentMismatch,
}

// ---------------------------------------------------------------------------
// Public Types
// ---------------------------------------------------------------------------

/// A single share of a split secret.
///
/// Field names match the JSON the service puts on the wire and the files
/// the admin tooling writes. `data` is base64; its decoded length equals the
/// secret's length. The payload is wiped when the share is dropped.
#[derive(Clone, Serialize, Deserialize)]
pub struct Share {
    pub index: u8,
    pub data: String,
    pub threshold: u8,
    pub total_shares: u8,
    pub created_at: DateTime<Utc>,
    pub commitment: String,
}

impl Share {
    /// Decode the base64 payload into a self-wiping buffer.
    pub fn payload(&self) -> Result<Zeroizing<Vec<u8>>, ShareError> {
        BASE64
            .decode(self.data.as_bytes())
            .map(Zeroizing::new)
            .map_err(|_| ShareError::InvalidPayload { index: self.index })
    }
}

impl fmt::Debug for Share {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Share")
            .field("index", &self.index)
            .field("data", &"<redacted>")
            .field("threshold", &self.threshold)
            .field("total_shares", &self.total_shares)
            .field("created_at", &self.created_at)
            .field("commitment", &self.commitment)
            .finish()
    }
}

impl Drop for Share {
    fn drop(&mut self) {
        self.data.zeroize();
    }
}

/// Everything one split produces. Shares are ordered by index.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShareBundle {
    pub shares: Vec<Share>,
    /// PEM public key of the keypair whose private half was split.
    pub public_key: String,
    pub commitment: String,
    pub algorithm: String,
}

/// Outcome of checking one share in isolation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShareVerification {
    pub is_valid: bool,
    pub message: String,
    pub share_index: u8,
}

/// Validated `(total, threshold)` pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SharingParams {
    pub total_shares: u8,
    pub threshold: u8,
}

impl SharingParams {
    /// # Constraints
    ///
    /// - `threshold >= 2` (1-of-n is just copying)
    /// - `threshold <= total_shares`
    /// - `total_shares <= 255` (indices are non-zero bytes)
    pub fn new(total_shares: usize, threshold: usize) -> Result<Self, ShareError> {
        if threshold < MIN_THRESHOLD as usize {
            return Err(ShareError::InvalidConfiguration(format!(
                "threshold must be at least {MIN_THRESHOLD}, got {threshold}"
            )));
        }
        if threshold > total_shares {
            return Err(ShareError::InvalidConfiguration(format!(
                "threshold ({threshold}) cannot exceed total shares ({total_shares})"
            )));
        }
        if total_shares > MAX_SHARES {
            return Err(ShareError::InvalidConfiguration(format!(
                "cannot create more than {MAX_SHARES} shares, got {total_shares}"
            )));
        }
        Ok(Self {
            total_shares: total_shares as u8,
            threshold: threshold as u8,
        })
    }
}

// ---------------------------------------------------------------------------
// Sharder Trait
// ---------------------------------------------------------------------------

/// Split/reconstruct seam used by the request server.
///
/// [`ShamirSharder`] is the real implementation; tests substitute sharders
/// that fail or panic to exercise the server's cleanup paths.
pub trait SecretSharder: Send + Sync {
    fn create_shares(
        &self,
        secret: &[u8],
        total_shares: usize,
        threshold: usize,
        public_key: &str,
        algorithm: &str,
    ) -> Result<ShareBundle, ShareError>;

    fn reconstruct_secret(&self, shares: &[Share]) -> Result<Zeroizing<Vec<u8>>, ShareError>;

    fn verify_share(&self, share: &Share, expected_commitment: &str) -> ShareVerification;
}

/// Shamir's scheme over GF(256).
#[derive(Debug, Clone, Copy, Default)]
pub struct ShamirSharder;

impl SecretSharder for ShamirSharder {
    fn create_shares(
        &self,
        secret: &[u8],
        total_shares: usize,
        threshold: usize,
        public_key: &str,
        algorithm: &str,
    ) -> Result<ShareBundle, ShareError> {
        create_shares(secret, total_shares, threshold, public_key, algorithm)
    }

    fn reconstruct_secret(&self, shares: &[Share]) -> Result<Zeroizing<Vec<u8>>, ShareError> {
        reconstruct_secret(shares)
    }

    fn verify_share(&self, share: &Share, expected_commitment: &str) -> ShareVerification {
        verify_share(share, expected_commitment)
    }
}

// ---------------------------------------------------------------------------
// Split and Reconstruct
// ---------------------------------------------------------------------------

/// Split `secret` into `total_shares` shares, any `threshold` of which
/// reconstruct it.
///
/// # Arguments
///
/// * `secret`: The bytes to split. Must not be empty.
/// * `total_shares`: Number of shares, at most 255.
/// * `threshold`: Shares needed to reconstruct, `2..=total_shares`.
/// * `public_key`: PEM public key recorded in the bundle.
/// * `algorithm`: Algorithm tag recorded in the bundle.
///
/// # Errors
///
/// [`ShareError::InvalidConfiguration`] for bad parameters or an empty
/// secret. Nothing random is drawn in that case.
pub fn create_shares(
    secret: &[u8],
    total_shares: usize,
    threshold: usize,
    public_key: &str,
    algorithm: &str,
) -> Result<ShareBundle, ShareError> {
    let params = SharingParams::new(total_shares, threshold)?;
    if secret.is_empty() {
        return Err(ShareError::InvalidConfiguration(
            "secret must not be empty".into(),
        ));
    }

    let degree = (params.threshold - 1) as usize;
    let commitment = sha256_base64(secret);
    let created_at = Utc::now();

    // One polynomial per secret byte: [secret_byte, c1, ..., c_{t-1}].
    let mut coefficients = Zeroizing::new(vec![0u8; secret.len() * (degree + 1)]);
    for (poly, &byte) in coefficients.chunks_mut(degree + 1).zip(secret) {
        poly[0] = byte;
        rand::rngs::OsRng.fill_bytes(&mut poly[1..]);
    }

    let mut shares = Vec::with_capacity(params.total_shares as usize);
    let mut payload = Zeroizing::new(vec![0u8; secret.len()]);
    for x in 1..=params.total_shares {
        for (out, poly) in payload.iter_mut().zip(coefficients.chunks(degree + 1)) {
            *out = gf256::eval_polynomial(poly, x);
        }
        shares.push(Share {
            index: x,
            data: BASE64.encode(payload.as_slice()),
            threshold: params.threshold,
            total_shares: params.total_shares,
            created_at,
            commitment: commitment.clone(),
        });
    }

    Ok(ShareBundle {
        shares,
        public_key: public_key.to_owned(),
        commitment,
        algorithm: algorithm.to_owned(),
    })
}

/// Reconstruct a secret from at least `threshold` shares of one split.
///
/// The first `threshold` shares (in the order given) are interpolated; any
/// extras only take part in the consistency checks. The result is verified
/// against the commitment before it is returned.
///
/// # Errors
///
/// - [`ShareError::InsufficientShares`]: fewer shares than the threshold.
/// - [`ShareError::Inconsistent`]: mixed commitments, thresholds or
///   lengths, a repeated index, or index 0.
/// - [`ShareError::InvalidPayload`]: a payload that is not base64.
/// - [`ShareError::CommitmentMismatch`]: interpolation produced bytes that
///   do not hash to the commitment.
pub fn reconstruct_secret(shares: &[Share]) -> Result<Zeroizing<Vec<u8>>, ShareError> {
    let Some(first) = shares.first() else {
        return Err(ShareError::InsufficientShares {
            threshold: MIN_THRESHOLD,
            provided: 0,
        });
    };

    let threshold = first.threshold;
    if threshold < MIN_THRESHOLD {
        return Err(ShareError::InvalidConfiguration(format!(
            "share threshold must be at least {MIN_THRESHOLD}, got {threshold}"
        )));
    }
    if shares.len() < threshold as usize {
        return Err(ShareError::InsufficientShares {
            threshold,
            provided: shares.len(),
        });
    }

    let mut seen = BTreeSet::new();
    for share in shares {
        if share.commitment != first.commitment {
            return Err(ShareError::Inconsistent(Inconsistency::Commitment));
        }
        if share.threshold != threshold {
            return Err(ShareError::Inconsistent(Inconsistency::Threshold));
        }
        if share.index == 0 {
            return Err(ShareError::Inconsistent(Inconsistency::ZeroIndex));
        }
        if !seen.insert(share.index) {
            return Err(ShareError::Inconsistent(Inconsistency::DuplicateIndex));
        }
    }

    let payloads = shares
        .iter()
        .map(Share::payload)
        .collect::<Result<Vec<_>, _>>()?;
    let secret_len = payloads[0].len();
    if secret_len == 0 {
        return Err(ShareError::InvalidPayload { index: first.index });
    }
    if payloads.iter().any(|p| p.len() != secret_len) {
        return Err(ShareError::Inconsistent(Inconsistency::Length));
    }

    let selected = threshold as usize;
    let xs: Vec<u8> = shares[..selected].iter().map(|s| s.index).collect();
    let mut ys = Zeroizing::new(vec![0u8; selected]);
    let mut secret = Zeroizing::new(vec![0u8; secret_len]);

    for (pos, out) in secret.iter_mut().enumerate() {
        for (y, payload) in ys.iter_mut().zip(&payloads) {
            *y = payload[pos];
        }
        *out = gf256::interpolate_at_zero(&xs, &ys);
    }

    if sha256_base64(&secret) != first.commitment {
        return Err(ShareError::CommitmentMismatch);
    }
    Ok(secret)
}

/// Check one share against an expected commitment.
///
/// Catches mixed-up or malformed shares. A share whose payload bytes were
/// altered still passes; only reconstruction's digest check can catch that.
pub fn verify_share(share: &Share, expected_commitment: &str) -> ShareVerification {
    let verdict = |is_valid: bool, message: &str| ShareVerification {
        is_valid,
        message: message.to_owned(),
        share_index: share.index,
    };

    if share.commitment != expected_commitment {
        return verdict(false, "Share commitment does not match expected commitment");
    }
    if !matches!(BASE64.decode(&share.commitment), Ok(d) if d.len() == COMMITMENT_LENGTH) {
        return verdict(false, "Share commitment is not a SHA-256 digest");
    }
    if share.index == 0 {
        return verdict(false, "Share index 0 is reserved");
    }
    match share.payload() {
        Err(_) => verdict(false, "Share data is not valid base64"),
        Ok(bytes) if bytes.is_empty() => verdict(false, "Share data is empty"),
        Ok(_) => verdict(true, "Share is valid"),
    }
}
