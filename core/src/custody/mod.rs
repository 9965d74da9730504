//! # Key Custody
//!
//! [`KeyCustodian`] owns the only long-lived copy of the private key. It is
//! a two-state machine, `NoKey` and `KeyLoaded`, guarded by one exclusive
//! lock that every entry point takes, so a signature can never observe a
//! half-deleted or half-imported key.
//!
//! Persistence and memory move together. A mutation writes the store first
//! and only then swaps the in-memory key; if the write fails the caller gets
//! the error and the previous state is untouched.
//!
//! Every buffer that holds private key bytes is a [`Zeroizing`] wrapper (or
//! wiped by a guard), so the bytes are overwritten on every exit path,
//! panics included.

pub mod record;
pub mod store;

use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use thiserror::Error;
use tracing::{debug, error, info, warn};
use zeroize::{Zeroize, Zeroizing};

use crate::audit::AuditSink;
use crate::crypto::hash::{fingerprint, sha256_base64};
use crate::crypto::signatures::{SignatureError, SignatureProvider};

pub use store::{FileKeyStore, KeyStore, MemoryKeyStore, StoreError};

#[derive(Debug, Error)]
pub enum CustodyError {
    #[error("no key loaded")]
    NoKeyLoaded,

    #[error("a key is already loaded")]
    AlreadyHasKey,

    #[error("deletion not confirmed")]
    NotConfirmed,

    #[error("public key does not match private key")]
    KeyMismatch,

    #[error(transparent)]
    Signature(#[from] SignatureError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// What [`KeyCustodian::delete_key`] actually did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeleteOutcome {
    Deleted,
    NothingToDelete,
}

/// Signature plus the identity that produced it, taken under one lock.
#[derive(Debug, Clone)]
pub struct Stamp {
    pub signature: Vec<u8>,
    pub public_key_pem: String,
    pub algorithm: &'static str,
}

/// Public half of the loaded key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublicIdentity {
    pub algorithm: &'static str,
    pub public_key_pem: String,
}

struct LoadedKey {
    private_key: Zeroizing<Vec<u8>>,
    public_key: Vec<u8>,
    algorithm: &'static str,
}

impl fmt::Debug for LoadedKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoadedKey")
            .field("algorithm", &self.algorithm)
            .field("public_key", &hex::encode(&self.public_key))
            .finish_non_exhaustive()
    }
}

/// A copy of the private key handed out for splitting.
///
/// The bytes are wiped when this value is dropped, which is also when the
/// wipe is recorded in the audit trail.
pub struct ExportedKey {
    secret: Zeroizing<Vec<u8>>,
    public_key_pem: String,
    algorithm: &'static str,
    audit: Arc<dyn AuditSink>,
}

impl ExportedKey {
    pub fn secret(&self) -> &[u8] {
        &self.secret
    }

    pub fn public_key_pem(&self) -> &str {
        &self.public_key_pem
    }

    pub fn algorithm(&self) -> &'static str {
        self.algorithm
    }
}

impl fmt::Debug for ExportedKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExportedKey")
            .field("algorithm", &self.algorithm)
            .field("len", &self.secret.len())
            .finish_non_exhaustive()
    }
}

impl Drop for ExportedKey {
    fn drop(&mut self) {
        self.secret.zeroize();
        self.audit
            .log_security_event("ExportedKeyWiped", "exported private key copy zeroed");
    }
}

/// Wipes a borrowed buffer when it goes out of scope.
struct WipeOnDrop<'a>(&'a mut [u8]);

impl Drop for WipeOnDrop<'_> {
    fn drop(&mut self) {
        self.0.zeroize();
    }
}

/// Sole owner of the live signing key.
pub struct KeyCustodian {
    provider: Arc<dyn SignatureProvider>,
    store: Arc<dyn KeyStore>,
    audit: Arc<dyn AuditSink>,
    state: Mutex<Option<LoadedKey>>,
}

impl fmt::Debug for KeyCustodian {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyCustodian")
            .field("algorithm", &self.provider.algorithm())
            .field("state", &*self.state.lock())
            .finish_non_exhaustive()
    }
}

impl KeyCustodian {
    pub fn new(
        provider: Arc<dyn SignatureProvider>,
        store: Arc<dyn KeyStore>,
        audit: Arc<dyn AuditSink>,
    ) -> Self {
        Self {
            provider,
            store,
            audit,
            state: Mutex::new(None),
        }
    }

    // -----------------------------------------------------------------------
    // Lifecycle
    // -----------------------------------------------------------------------

    /// Generate a fresh keypair and persist it.
    ///
    /// Replaces any loaded key, but only once the new record is safely
    /// stored.
    ///
    /// # Errors
    ///
    /// [`CustodyError::Store`] if the record cannot be written. Memory is
    /// left as it was.
    pub fn generate_key(&self) -> Result<(), CustodyError> {
        let mut state = self.state.lock();
        let (private_key, public_key) = self.provider.generate_keypair();
        let record = record::encode(&private_key, &public_key);
        self.store.save(&record)?;

        let fp = fingerprint(&public_key);
        *state = Some(LoadedKey {
            private_key,
            public_key,
            algorithm: self.provider.algorithm(),
        });
        info!(algorithm = self.provider.algorithm(), public_key = %fp, "signing key generated");
        self.audit
            .log_security_event("KeyGenerated", &format!("public key {fp}"));
        Ok(())
    }

    /// Load the persisted key. Returns `false` when nothing usable is stored.
    ///
    /// Missing records, failed integrity checks, malformed records and
    /// records whose halves do not belong together all land here; the cause
    /// is logged, and the caller decides whether to regenerate.
    pub fn load_key(&self) -> bool {
        let mut state = self.state.lock();
        let record = match self.store.load() {
            Ok(Some(record)) => record,
            Ok(None) => {
                debug!("no stored signing key");
                return false;
            }
            Err(e) => {
                warn!(error = %e, "stored signing key could not be read");
                self.audit.log_security_event("KeyLoadFailed", &e.to_string());
                return false;
            }
        };

        let (private_key, public_key) = match record::decode(&record) {
            Ok(parts) => parts,
            Err(e) => {
                warn!(error = %e, "stored key record is malformed");
                self.audit.log_security_event("KeyLoadFailed", &e.to_string());
                return false;
            }
        };

        match self.provider.derive_public_key(&private_key) {
            Ok(derived) if derived == public_key => {}
            _ => {
                warn!("stored key record halves do not match");
                self.audit
                    .log_security_event("KeyLoadFailed", "public key does not match private key");
                return false;
            }
        }

        let fp = fingerprint(&public_key);
        *state = Some(LoadedKey {
            private_key,
            public_key,
            algorithm: self.provider.algorithm(),
        });
        info!(public_key = %fp, "signing key loaded");
        self.audit
            .log_security_event("KeyLoaded", &format!("public key {fp}"));
        true
    }

    /// Install a key reconstructed from shares and persist it.
    ///
    /// `private_key` is zeroed before this returns, whatever the outcome.
    ///
    /// # Errors
    ///
    /// - [`CustodyError::AlreadyHasKey`]: a key is loaded; recovery never
    ///   overwrites a live key.
    /// - [`CustodyError::KeyMismatch`]: `public_key` does not belong to
    ///   `private_key`.
    /// - [`CustodyError::Store`]: the record could not be written.
    pub fn import_from_recovery(
        &self,
        private_key: &mut [u8],
        public_key: &[u8],
    ) -> Result<(), CustodyError> {
        let input = WipeOnDrop(private_key);
        let mut state = self.state.lock();

        if state.is_some() {
            self.audit
                .log_recovery_event("ImportRefused", "a key is already loaded");
            return Err(CustodyError::AlreadyHasKey);
        }

        let derived = self.provider.derive_public_key(&*input.0)?;
        if derived != public_key {
            self.audit
                .log_recovery_event("ImportRefused", "public key does not match private key");
            return Err(CustodyError::KeyMismatch);
        }

        let record = record::encode(&*input.0, public_key);
        self.store.save(&record)?;

        let fp = fingerprint(public_key);
        *state = Some(LoadedKey {
            private_key: Zeroizing::new(input.0.to_vec()),
            public_key: public_key.to_vec(),
            algorithm: self.provider.algorithm(),
        });
        info!(public_key = %fp, "signing key restored from shares");
        self.audit
            .log_recovery_event("KeyImported", &format!("public key {fp}"));
        Ok(())
    }

    /// Irreversibly destroy the key, in memory and on disk.
    ///
    /// # Errors
    ///
    /// [`CustodyError::NotConfirmed`] unless `confirm` is `true`; nothing
    /// is touched in that case. [`CustodyError::Store`] if the record could
    /// not be shredded; the in-memory key is kept.
    pub fn delete_key(&self, confirm: bool) -> Result<DeleteOutcome, CustodyError> {
        if !confirm {
            self.audit
                .log_security_event("KeyDeletionRefused", "deletion requested without confirmation");
            return Err(CustodyError::NotConfirmed);
        }

        let mut state = self.state.lock();
        // Disk first: a failed shred leaves the key loaded, matching the
        // record that is still stored.
        let shredded = match self.store.shred() {
            Ok(shredded) => shredded,
            Err(e) => {
                error!(error = %e, "key record shred failed; key kept in memory");
                self.audit
                    .log_security_event("KeyDeletionFailed", "record shred failed; key retained");
                return Err(e.into());
            }
        };
        // Dropping the LoadedKey zeroes the private key.
        let had_key = state.take().is_some();

        if !had_key && !shredded {
            info!("delete requested with no key present");
            self.audit
                .log_security_event("KeyDeleteNoop", "no key present");
            return Ok(DeleteOutcome::NothingToDelete);
        }

        warn!(in_memory = had_key, on_disk = shredded, "signing key deleted");
        self.audit
            .log_security_event("KeyDeleted", "signing key wiped and record shredded");
        Ok(DeleteOutcome::Deleted)
    }

    /// Drop the in-memory key without touching storage. Used at shutdown.
    pub fn unload(&self) {
        if self.state.lock().take().is_some() {
            debug!("signing key unloaded");
            self.audit
                .log_security_event("KeyUnloaded", "in-memory key wiped");
        }
    }

    // -----------------------------------------------------------------------
    // Signing
    // -----------------------------------------------------------------------

    pub fn sign(&self, data: &[u8]) -> Result<Vec<u8>, CustodyError> {
        let state = self.state.lock();
        let key = state.as_ref().ok_or(CustodyError::NoKeyLoaded)?;
        Ok(self.provider.sign(&key.private_key, data)?)
    }

    pub fn verify(&self, data: &[u8], signature: &[u8]) -> Result<bool, CustodyError> {
        let state = self.state.lock();
        let key = state.as_ref().ok_or(CustodyError::NoKeyLoaded)?;
        Ok(self.provider.verify(&key.public_key, data, signature))
    }

    /// Sign `data` and return the signature together with the signer's
    /// public key, so the two cannot come from different keys.
    pub fn stamp(&self, data: &[u8]) -> Result<Stamp, CustodyError> {
        let state = self.state.lock();
        let key = state.as_ref().ok_or(CustodyError::NoKeyLoaded)?;
        let signature = self.provider.sign(&key.private_key, data)?;
        Ok(Stamp {
            signature,
            public_key_pem: self.provider.export_public_key_pem(&key.public_key),
            algorithm: key.algorithm,
        })
    }

    // -----------------------------------------------------------------------
    // Export and Commitment
    // -----------------------------------------------------------------------

    /// Hand out a copy of the private key for splitting.
    ///
    /// Audited on every call, including calls that fail because no key is
    /// loaded. The copy wipes itself on drop.
    pub fn export_private_key_for_split(&self) -> Result<ExportedKey, CustodyError> {
        self.audit
            .log_security_event("PrivateKeyExported", "private key exported for share creation");
        let state = self.state.lock();
        let key = state.as_ref().ok_or(CustodyError::NoKeyLoaded)?;
        Ok(ExportedKey {
            secret: key.private_key.clone(),
            public_key_pem: self.provider.export_public_key_pem(&key.public_key),
            algorithm: key.algorithm,
            audit: Arc::clone(&self.audit),
        })
    }

    /// Base64 SHA-256 of the private key; the value every share of it carries.
    pub fn compute_commitment(&self) -> Result<String, CustodyError> {
        let state = self.state.lock();
        let key = state.as_ref().ok_or(CustodyError::NoKeyLoaded)?;
        Ok(sha256_base64(&key.private_key))
    }

    // -----------------------------------------------------------------------
    // Accessors
    // -----------------------------------------------------------------------

    pub fn has_key(&self) -> bool {
        self.state.lock().is_some()
    }

    pub fn algorithm(&self) -> Option<&'static str> {
        self.state.lock().as_ref().map(|k| k.algorithm)
    }

    pub fn public_key(&self) -> Result<Vec<u8>, CustodyError> {
        let state = self.state.lock();
        let key = state.as_ref().ok_or(CustodyError::NoKeyLoaded)?;
        Ok(key.public_key.clone())
    }

    pub fn public_key_pem(&self) -> Result<String, CustodyError> {
        let state = self.state.lock();
        let key = state.as_ref().ok_or(CustodyError::NoKeyLoaded)?;
        Ok(self.provider.export_public_key_pem(&key.public_key))
    }

    /// Algorithm and PEM public key, or `None` in `NoKey`.
    pub fn public_identity(&self) -> Option<PublicIdentity> {
        self.state.lock().as_ref().map(|key| PublicIdentity {
            algorithm: key.algorithm,
            public_key_pem: self.provider.export_public_key_pem(&key.public_key),
        })
    }

    /// Whether a record is present in storage, loaded or not.
    pub fn key_record_exists(&self) -> bool {
        self.store.exists()
    }

    pub fn provider(&self) -> &Arc<dyn SignatureProvider> {
        &self.provider
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::MemoryAuditSink;
    use crate::crypto::Ed25519Provider;

    struct Fixture {
        custodian: KeyCustodian,
        store: Arc<MemoryKeyStore>,
        audit: Arc<MemoryAuditSink>,
    }

    fn fixture() -> Fixture {
        let store = Arc::new(MemoryKeyStore::new());
        let audit = Arc::new(MemoryAuditSink::new());
        let custodian = KeyCustodian::new(
            Arc::new(Ed25519Provider::new()),
            store.clone(),
            audit.clone(),
        );
        Fixture {
            custodian,
            store,
            audit,
        }
    }

    #[test]
    fn test_starts_without_key() {
        let f = fixture();
        assert!(!f.custodian.has_key());
        assert!(f.custodian.algorithm().is_none());
        assert!(matches!(f.custodian.sign(b"x"), Err(CustodyError::NoKeyLoaded)));
        assert!(matches!(
            f.custodian.compute_commitment(),
            Err(CustodyError::NoKeyLoaded)
        ));
        assert!(!f.custodian.load_key());
    }

    #[test]
    fn test_generate_persists_and_signs() {
        let f = fixture();
        f.custodian.generate_key().unwrap();

        assert!(f.custodian.has_key());
        assert!(f.store.exists());
        assert_eq!(f.custodian.algorithm(), Some("Ed25519"));
        assert_eq!(f.audit.security_events("KeyGenerated"), 1);

        let sig = f.custodian.sign(b"hello").unwrap();
        assert!(f.custodian.verify(b"hello", &sig).unwrap());
        assert!(!f.custodian.verify(b"different", &sig).unwrap());
    }

    #[test]
    fn test_generate_failure_leaves_state_unchanged() {
        let f = fixture();
        f.store.set_fail_saves(true);
        assert!(matches!(f.custodian.generate_key(), Err(CustodyError::Store(_))));
        assert!(!f.custodian.has_key());

        f.store.set_fail_saves(false);
        f.custodian.generate_key().unwrap();
        let before = f.custodian.public_key().unwrap();

        f.store.set_fail_saves(true);
        assert!(f.custodian.generate_key().is_err());
        assert_eq!(f.custodian.public_key().unwrap(), before);
    }

    #[test]
    fn test_load_in_fresh_instance_yields_same_key() {
        let f = fixture();
        f.custodian.generate_key().unwrap();
        let pem = f.custodian.public_key_pem().unwrap();

        let second = KeyCustodian::new(
            Arc::new(Ed25519Provider::new()),
            f.store.clone(),
            Arc::new(MemoryAuditSink::new()),
        );
        assert!(second.load_key());
        assert_eq!(second.public_key_pem().unwrap(), pem);
    }

    #[test]
    fn test_load_rejects_malformed_record() {
        let f = fixture();
        f.store.save(&[9, 9]).unwrap();
        assert!(!f.custodian.load_key());
        assert_eq!(f.audit.security_events("KeyLoadFailed"), 1);
    }

    #[test]
    fn test_load_rejects_mismatched_halves() {
        let f = fixture();
        let record = record::encode(&[1u8; 32], &[2u8; 32]);
        f.store.save(&record).unwrap();
        assert!(!f.custodian.load_key());
        assert!(!f.custodian.has_key());
    }

    #[test]
    fn test_delete_requires_confirmation() {
        let f = fixture();
        f.custodian.generate_key().unwrap();

        assert!(matches!(
            f.custodian.delete_key(false),
            Err(CustodyError::NotConfirmed)
        ));
        assert!(f.custodian.has_key());
        assert!(f.store.exists());
    }

    #[test]
    fn test_delete_then_load_fails_and_sign_fails() {
        let f = fixture();
        f.custodian.generate_key().unwrap();

        assert_eq!(f.custodian.delete_key(true).unwrap(), DeleteOutcome::Deleted);
        assert!(!f.custodian.has_key());
        assert!(!f.store.exists());
        assert!(!f.custodian.load_key());
        assert!(matches!(f.custodian.sign(b"x"), Err(CustodyError::NoKeyLoaded)));
    }

    #[test]
    fn test_failed_shred_keeps_key_loaded() {
        let f = fixture();
        f.custodian.generate_key().unwrap();
        f.store.set_fail_shreds(true);

        assert!(matches!(f.custodian.delete_key(true), Err(CustodyError::Store(_))));
        assert!(f.custodian.has_key());
        assert!(f.store.exists());
        assert!(f.custodian.sign(b"still here").is_ok());
        assert_eq!(f.audit.security_events("KeyDeletionFailed"), 1);
        assert_eq!(f.audit.security_events("KeyDeleted"), 0);

        f.store.set_fail_shreds(false);
        assert_eq!(f.custodian.delete_key(true).unwrap(), DeleteOutcome::Deleted);
        assert!(!f.custodian.has_key());
    }

    #[test]
    fn test_delete_without_key_is_noop() {
        let f = fixture();
        assert_eq!(
            f.custodian.delete_key(true).unwrap(),
            DeleteOutcome::NothingToDelete
        );
        assert_eq!(f.audit.security_events("KeyDeleteNoop"), 1);
    }

    #[test]
    fn test_export_is_audited_and_wiped() {
        let f = fixture();
        assert!(f.custodian.export_private_key_for_split().is_err());
        assert_eq!(f.audit.security_events("PrivateKeyExported"), 1);

        f.custodian.generate_key().unwrap();
        let exported = f.custodian.export_private_key_for_split().unwrap();
        assert_eq!(exported.secret().len(), 32);
        assert_eq!(
            sha256_base64(exported.secret()),
            f.custodian.compute_commitment().unwrap()
        );
        assert_eq!(f.audit.security_events("PrivateKeyExported"), 2);
        assert_eq!(f.audit.security_events("ExportedKeyWiped"), 0);

        drop(exported);
        assert_eq!(f.audit.security_events("ExportedKeyWiped"), 1);
    }

    #[test]
    fn test_import_from_recovery_zeroes_input() {
        let provider = Ed25519Provider::new();
        let (private_key, public_key) = provider.generate_keypair();

        let f = fixture();
        let mut buffer = private_key.to_vec();
        f.custodian
            .import_from_recovery(&mut buffer, &public_key)
            .unwrap();

        assert!(buffer.iter().all(|&b| b == 0));
        assert_eq!(f.custodian.public_key().unwrap(), public_key);
        assert!(f.store.exists());
        assert_eq!(f.audit.recovery_events("KeyImported"), 1);
    }

    #[test]
    fn test_import_refuses_when_key_loaded() {
        let f = fixture();
        f.custodian.generate_key().unwrap();
        let before = f.custodian.public_key().unwrap();

        let (private_key, public_key) = Ed25519Provider::new().generate_keypair();
        let mut buffer = private_key.to_vec();
        assert!(matches!(
            f.custodian.import_from_recovery(&mut buffer, &public_key),
            Err(CustodyError::AlreadyHasKey)
        ));
        assert!(buffer.iter().all(|&b| b == 0));
        assert_eq!(f.custodian.public_key().unwrap(), before);
    }

    #[test]
    fn test_import_rejects_mismatched_public_key() {
        let provider = Ed25519Provider::new();
        let (private_key, _) = provider.generate_keypair();
        let (_, other_public) = provider.generate_keypair();

        let f = fixture();
        let mut buffer = private_key.to_vec();
        assert!(matches!(
            f.custodian.import_from_recovery(&mut buffer, &other_public),
            Err(CustodyError::KeyMismatch)
        ));
        assert!(buffer.iter().all(|&b| b == 0));
        assert!(!f.custodian.has_key());
        assert!(!f.store.exists());
    }

    #[test]
    fn test_stamp_returns_matching_identity() {
        let f = fixture();
        f.custodian.generate_key().unwrap();
        let stamp = f.custodian.stamp(b"payload").unwrap();

        let provider = Ed25519Provider::new();
        let public_key = provider.import_public_key_pem(&stamp.public_key_pem).unwrap();
        assert!(provider.verify(&public_key, b"payload", &stamp.signature));
        assert_eq!(stamp.algorithm, "Ed25519");
    }

    #[test]
    fn test_unload_keeps_record() {
        let f = fixture();
        f.custodian.generate_key().unwrap();
        f.custodian.unload();
        assert!(!f.custodian.has_key());
        assert!(f.custodian.key_record_exists());
        assert!(f.custodian.load_key());
    }
}
