//! # Service Configuration & Constants
//!
//! Every magic number in Stamp lives here: key and signature sizes, the
//! sharing-scheme limits, framing limits, and the timing knobs for the
//! local socket server. Runtime-tunable values are collected in
//! [`ServiceConfig`], which the service binary fills from CLI flags and
//! environment variables.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

// ---------------------------------------------------------------------------
// Cryptographic Parameters
// ---------------------------------------------------------------------------

/// The signing algorithm reported in every signed response and share bundle.
pub const SIGNING_ALGORITHM: &str = "Ed25519";

/// Ed25519 secret key length in bytes.
pub const SIGNING_KEY_LENGTH: usize = 32;

/// Ed25519 public (verifying) key length in bytes.
pub const VERIFYING_KEY_LENGTH: usize = 32;

/// Ed25519 signature length in bytes.
pub const SIGNATURE_LENGTH: usize = 64;

/// Identifier stamped into every [`SignedResponse`](crate::server::SignedResponse).
pub const SIGNER_ID: &str = "StampService-v1";

/// AES-256-GCM key length in bytes. Used for at-rest sealing of the key record.
pub const AES_KEY_LENGTH: usize = 32;

/// AES-256-GCM nonce length in bytes. Twelve, always.
pub const AES_NONCE_LENGTH: usize = 12;

/// AES-256-GCM authentication tag length in bytes.
pub const AES_TAG_LENGTH: usize = 16;

/// Commitment digest length (SHA-256) before base64 encoding.
pub const COMMITMENT_LENGTH: usize = 32;

/// Number of leading base64 signature characters written to the audit log.
pub const SIGNATURE_LOG_PREFIX_LENGTH: usize = 16;

// ---------------------------------------------------------------------------
// Secret Sharing Limits
// ---------------------------------------------------------------------------

/// Smallest meaningful threshold. A 1-of-n split is just n copies of the key.
pub const MIN_THRESHOLD: u8 = 2;

/// Share indices are non-zero elements of GF(256), so 255 is the ceiling.
pub const MAX_SHARES: usize = 255;

// ---------------------------------------------------------------------------
// Key Storage
// ---------------------------------------------------------------------------

/// Version tag bound into the AAD of every sealed key record.
pub const KEY_RECORD_FORMAT_VERSION: u8 = 1;

/// Minimum number of random bytes written over a key record before removal.
pub const SHRED_OVERWRITE_LENGTH: usize = 1024;

/// Default location of the sealed key record.
pub const DEFAULT_KEY_PATH: &str = "/var/lib/stamp/master.key";

/// Files consulted, in order, for the machine identity that binds the
/// at-rest encryption key to this host.
pub const MACHINE_ID_PATHS: &[&str] = &["/etc/machine-id", "/var/lib/dbus/machine-id"];

// ---------------------------------------------------------------------------
// Local Channel
// ---------------------------------------------------------------------------

/// Default Unix domain socket path for the request server.
pub const DEFAULT_SOCKET_PATH: &str = "/run/stamp/stamp.sock";

/// Permission bits applied to the socket file after binding. Any local user
/// may connect; privileged methods are gated on the peer's uid.
pub const DEFAULT_SOCKET_MODE: u32 = 0o666;

/// Largest frame body accepted in either direction. Share bundles for a
/// 32-byte key are a few KiB; a megabyte leaves plenty of headroom for
/// sign payloads without letting a client balloon our memory.
pub const MAX_FRAME_LENGTH: usize = 1024 * 1024;

/// Per-connection read/write deadline on the server side.
pub const CONNECTION_IO_TIMEOUT: Duration = Duration::from_secs(10);

/// Total budget a client gives a single request, connect included.
pub const CLIENT_REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Pause between client connect attempts while the budget lasts.
pub const CLIENT_CONNECT_RETRY_INTERVAL: Duration = Duration::from_millis(100);

/// Pause after a failed `accept()` before trying again.
pub const ACCEPT_RETRY_BACKOFF: Duration = Duration::from_secs(1);

/// How long shutdown waits for in-flight connections before giving up on them.
pub const SHUTDOWN_GRACE_PERIOD: Duration = Duration::from_secs(5);

/// Prefix of the self-signed message produced by `TestStamp`.
pub const HEALTH_CHECK_MESSAGE_PREFIX: &str = "StampService Health Check";

// ---------------------------------------------------------------------------
// Runtime Configuration
// ---------------------------------------------------------------------------

/// Runtime configuration for a Stamp service instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceConfig {
    /// Path of the Unix domain socket the server binds.
    pub socket_path: PathBuf,
    /// Path of the sealed key record.
    pub key_path: PathBuf,
    /// Permission bits for the socket file.
    pub socket_mode: u32,
    /// Per-connection read/write deadline.
    pub io_timeout: Duration,
    /// Backoff after a failed accept.
    pub accept_backoff: Duration,
    /// Grace period for in-flight connections at shutdown.
    pub shutdown_grace: Duration,
    /// Generate a fresh key at startup when none is stored. Disable to start
    /// keyless and restore from shares instead.
    pub generate_if_missing: bool,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            socket_path: PathBuf::from(DEFAULT_SOCKET_PATH),
            key_path: PathBuf::from(DEFAULT_KEY_PATH),
            socket_mode: DEFAULT_SOCKET_MODE,
            io_timeout: CONNECTION_IO_TIMEOUT,
            accept_backoff: ACCEPT_RETRY_BACKOFF,
            shutdown_grace: SHUTDOWN_GRACE_PERIOD,
            generate_if_missing: true,
        }
    }
}
