//! # At-Rest Key Storage
//!
//! The custodian hands a plaintext key record to a [`KeyStore`] and the
//! store is responsible for keeping it encrypted on disk. Two stores ship:
//!
//! - [`FileKeyStore`]: AES-256-GCM under a key bound to this machine. A copy
//!   of the file is useless on another host.
//! - [`MemoryKeyStore`]: nothing touches disk. Used by tests and by
//!   short-lived tooling.
//!
//! ## Machine binding
//!
//! The file store's key is `SHA-256(domain tag || machine id || salt)`. The
//! machine id comes from systemd's `/etc/machine-id` (falling back to the
//! D-Bus copy); the 32-byte salt is generated once per install and kept
//! beside the key file. Neither is secret on its own; the point is that the
//! sealed record only opens where both exist.

use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use rand::RngCore;
use thiserror::Error;
use tracing::{debug, warn};
use zeroize::Zeroizing;

use crate::config::{AES_KEY_LENGTH, KEY_RECORD_FORMAT_VERSION, MACHINE_ID_PATHS, SHRED_OVERWRITE_LENGTH};
use crate::crypto::encryption::{open, seal};
use crate::crypto::hash::sha256_parts;

const MACHINE_KEY_DOMAIN: &[u8] = b"stamp/machine-bound-key/v1";
const RECORD_AAD_PREFIX: &[u8] = b"stamp-key-record";
const SALT_LENGTH: usize = 32;
const PRIVATE_FILE_MODE: u32 = 0o600;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("key store I/O error: {0}")]
    Io(#[from] io::Error),

    /// The sealed record would not open: wrong machine, wrong salt, or tampering.
    #[error("stored key failed its integrity check")]
    Integrity,

    #[error("encryption failed")]
    Seal,

    #[error("no machine identity available (looked in {0})")]
    MachineIdentity(String),
}

/// Persistence boundary for the single key record.
///
/// `save` receives the plaintext record and must encrypt it before it lands
/// anywhere durable; `load` returns the plaintext. Implementations are
/// called under the custodian's lock and never concurrently with each other.
pub trait KeyStore: Send + Sync {
    /// Replace the stored record.
    fn save(&self, record: &[u8]) -> Result<(), StoreError>;

    /// Read the stored record. `Ok(None)` when nothing is stored.
    fn load(&self) -> Result<Option<Zeroizing<Vec<u8>>>, StoreError>;

    fn exists(&self) -> bool;

    /// Overwrite the stored record with random bytes, then remove it.
    /// Returns `false` when there was nothing to remove.
    fn shred(&self) -> Result<bool, StoreError>;
}

// ---------------------------------------------------------------------------
// File Store
// ---------------------------------------------------------------------------

/// Key record sealed with a machine-bound AES-256-GCM key.
pub struct FileKeyStore {
    path: PathBuf,
    key: Zeroizing<[u8; AES_KEY_LENGTH]>,
}

impl std::fmt::Debug for FileKeyStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileKeyStore")
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}

impl FileKeyStore {
    /// Open a store at `path` whose encryption key is bound to this machine.
    ///
    /// Creates the parent directory and the salt file if they are missing.
    ///
    /// # Errors
    ///
    /// [`StoreError::MachineIdentity`] when no machine id file is readable,
    /// [`StoreError::Io`] when the salt cannot be read or created.
    pub fn open_machine_bound(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let machine_id = read_machine_id()?;
        let salt = load_or_create_salt(&salt_path(&path))?;
        let key = Zeroizing::new(sha256_parts(&[
            MACHINE_KEY_DOMAIN,
            machine_id.as_bytes(),
            salt.as_slice(),
        ]));
        debug!(path = %path.display(), "opened machine-bound key store");
        Ok(Self { path, key })
    }

    /// Open a store with an explicit sealing key.
    pub fn with_key(path: impl Into<PathBuf>, key: [u8; AES_KEY_LENGTH]) -> Self {
        Self {
            path: path.into(),
            key: Zeroizing::new(key),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn aad() -> Vec<u8> {
        let mut aad = RECORD_AAD_PREFIX.to_vec();
        aad.push(KEY_RECORD_FORMAT_VERSION);
        aad
    }
}

impl KeyStore for FileKeyStore {
    fn save(&self, record: &[u8]) -> Result<(), StoreError> {
        let sealed = seal(&self.key, record, &Self::aad()).map_err(|_| StoreError::Seal)?;
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        write_private_file_atomic(&self.path, &sealed)?;
        debug!(path = %self.path.display(), bytes = sealed.len(), "key record saved");
        Ok(())
    }

    fn load(&self) -> Result<Option<Zeroizing<Vec<u8>>>, StoreError> {
        let sealed = match fs::read(&self.path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        open(&self.key, &sealed, &Self::aad())
            .map(Some)
            .map_err(|_| StoreError::Integrity)
    }

    fn exists(&self) -> bool {
        self.path.is_file()
    }

    fn shred(&self) -> Result<bool, StoreError> {
        let len = match fs::metadata(&self.path) {
            Ok(meta) => meta.len() as usize,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(false),
            Err(e) => return Err(e.into()),
        };

        let mut noise = vec![0u8; len.max(SHRED_OVERWRITE_LENGTH)];
        rand::rngs::OsRng.fill_bytes(&mut noise);
        {
            let mut file = OpenOptions::new().write(true).open(&self.path)?;
            file.write_all(&noise)?;
            file.sync_all()?;
        }
        fs::remove_file(&self.path)?;
        debug!(path = %self.path.display(), "key record shredded");
        Ok(true)
    }
}

fn salt_path(key_path: &Path) -> PathBuf {
    key_path.with_extension("salt")
}

fn read_machine_id() -> Result<String, StoreError> {
    for candidate in MACHINE_ID_PATHS {
        match fs::read_to_string(candidate) {
            Ok(contents) if !contents.trim().is_empty() => return Ok(contents.trim().to_owned()),
            Ok(_) => warn!(path = candidate, "machine id file is empty"),
            Err(_) => continue,
        }
    }
    Err(StoreError::MachineIdentity(MACHINE_ID_PATHS.join(", ")))
}

fn load_or_create_salt(path: &Path) -> Result<Vec<u8>, StoreError> {
    match fs::read(path) {
        Ok(salt) if salt.len() == SALT_LENGTH => return Ok(salt),
        Ok(salt) => {
            // Regenerating would silently orphan the sealed record.
            return Err(StoreError::Io(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("salt file {} has {} bytes", path.display(), salt.len()),
            )));
        }
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => return Err(e.into()),
    }
    let mut salt = vec![0u8; SALT_LENGTH];
    rand::rngs::OsRng.fill_bytes(&mut salt);
    write_private_file_atomic(path, &salt)?;
    debug!(path = %path.display(), "created key store salt");
    Ok(salt)
}

/// Write via a sibling temp file and rename, so a crash never leaves a
/// half-written file at `path`.
fn write_private_file_atomic(path: &Path, contents: &[u8]) -> io::Result<()> {
    let tmp = path.with_extension("tmp");
    {
        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(PRIVATE_FILE_MODE)
            .open(&tmp)?;
        file.write_all(contents)?;
        file.sync_all()?;
    }
    fs::rename(&tmp, path)
}

// ---------------------------------------------------------------------------
// Memory Store
// ---------------------------------------------------------------------------

/// In-process store. The record lives in a self-wiping buffer.
#[derive(Default)]
pub struct MemoryKeyStore {
    record: Mutex<Option<Zeroizing<Vec<u8>>>>,
    fail_saves: AtomicBool,
    fail_shreds: AtomicBool,
}

impl std::fmt::Debug for MemoryKeyStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryKeyStore")
            .field("occupied", &self.exists())
            .finish_non_exhaustive()
    }
}

impl MemoryKeyStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent `save` fail with an I/O error.
    pub fn set_fail_saves(&self, fail: bool) {
        self.fail_saves.store(fail, Ordering::SeqCst);
    }

    /// Make every subsequent `shred` fail with an I/O error, leaving the
    /// record in place.
    pub fn set_fail_shreds(&self, fail: bool) {
        self.fail_shreds.store(fail, Ordering::SeqCst);
    }
}

impl KeyStore for MemoryKeyStore {
    fn save(&self, record: &[u8]) -> Result<(), StoreError> {
        if self.fail_saves.load(Ordering::SeqCst) {
            return Err(StoreError::Io(io::Error::new(
                io::ErrorKind::Other,
                "simulated write failure",
            )));
        }
        *self.record.lock() = Some(Zeroizing::new(record.to_vec()));
        Ok(())
    }

    fn load(&self) -> Result<Option<Zeroizing<Vec<u8>>>, StoreError> {
        Ok(self.record.lock().clone())
    }

    fn exists(&self) -> bool {
        self.record.lock().is_some()
    }

    fn shred(&self) -> Result<bool, StoreError> {
        if self.fail_shreds.load(Ordering::SeqCst) {
            return Err(StoreError::Io(io::Error::new(
                io::ErrorKind::Other,
                "simulated shred failure",
            )));
        }
        // Dropping the Zeroizing buffer wipes it.
        Ok(self.record.lock().take().is_some())
    }
}
