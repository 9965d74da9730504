//! # Wire Messages
//!
//! Every request is `{"method": "...", "params": {...}}`. A response is the
//! method's own object on success or `{"error": "..."}` on failure; there
//! are no status codes, and presence of `error` is the whole signal. Field
//! names are snake_case.
//!
//! ## Method Index
//!
//! | Method                | Params                                   | Privileged |
//! |-----------------------|------------------------------------------|------------|
//! | `Sign`                | `operation, requester_id, payload`       | no         |
//! | `TestStamp`           | none                                     | no         |
//! | `GetStatus`           | none                                     | no         |
//! | `CreateShares`        | `total_shares, threshold, initiator`     | yes        |
//! | `VerifyShare`         | `share, commitment`                      | no         |
//! | `RecoverStart`        | `threshold`                              | yes        |
//! | `RecoverProvideShare` | a [`Share`]                              | yes        |
//! | `RecoverStatus`       | none                                     | no         |
//! | `RecoverReset`        | none                                     | yes        |
//! | `DeleteKey`           | `confirm_deletion`                       | yes        |

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::sharing::Share;

// ---------------------------------------------------------------------------
// Methods
// ---------------------------------------------------------------------------

/// Every operation the server dispatches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
    Sign,
    TestStamp,
    GetStatus,
    CreateShares,
    VerifyShare,
    RecoverStart,
    RecoverProvideShare,
    RecoverStatus,
    RecoverReset,
    DeleteKey,
}

impl Method {
    pub const ALL: [Method; 10] = [
        Method::Sign,
        Method::TestStamp,
        Method::GetStatus,
        Method::CreateShares,
        Method::VerifyShare,
        Method::RecoverStart,
        Method::RecoverProvideShare,
        Method::RecoverStatus,
        Method::RecoverReset,
        Method::DeleteKey,
    ];

    /// Methods that touch key material or custody state. Only the socket
    /// owner or root may call these.
    pub const PRIVILEGED: [Method; 5] = [
        Method::CreateShares,
        Method::RecoverStart,
        Method::RecoverProvideShare,
        Method::RecoverReset,
        Method::DeleteKey,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Method::Sign => "Sign",
            Method::TestStamp => "TestStamp",
            Method::GetStatus => "GetStatus",
            Method::CreateShares => "CreateShares",
            Method::VerifyShare => "VerifyShare",
            Method::RecoverStart => "RecoverStart",
            Method::RecoverProvideShare => "RecoverProvideShare",
            Method::RecoverStatus => "RecoverStatus",
            Method::RecoverReset => "RecoverReset",
            Method::DeleteKey => "DeleteKey",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|m| m.name() == name)
    }

    pub fn is_privileged(self) -> bool {
        Self::PRIVILEGED.contains(&self)
    }
}

// ---------------------------------------------------------------------------
// Envelope
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Request {
    pub method: String,
    #[serde(default)]
    pub params: Value,
}

impl Request {
    pub fn new(method: Method, params: Value) -> Self {
        Self {
            method: method.name().to_owned(),
            params,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
}

// ---------------------------------------------------------------------------
// Signing
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignRequest {
    pub operation: String,
    pub requester_id: String,
    #[serde(default)]
    pub payload: Map<String, Value>,
}

/// A signature over `signed_payload`, which is the exact byte sequence that
/// was signed (base64). Clients verify against those bytes rather than
/// re-serializing their own payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedResponse {
    pub signature: String,
    pub algorithm: String,
    pub signed_payload: String,
    pub signer_id: String,
    pub timestamp: DateTime<Utc>,
    /// PEM.
    pub public_key: String,
}

// ---------------------------------------------------------------------------
// Status
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceStatus {
    pub is_running: bool,
    pub key_present: bool,
    pub uptime_seconds: u64,
    pub last_health_check: Option<DateTime<Utc>>,
    pub algorithm: Option<String>,
    pub public_key: Option<String>,
    #[serde(default)]
    pub recovery_active: bool,
}

// ---------------------------------------------------------------------------
// Shares
// ---------------------------------------------------------------------------

fn default_total_shares() -> usize {
    5
}

fn default_threshold() -> usize {
    3
}

fn default_initiator() -> String {
    "unknown".to_owned()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShareCreationOptions {
    #[serde(default = "default_total_shares")]
    pub total_shares: usize,
    #[serde(default = "default_threshold")]
    pub threshold: usize,
    #[serde(default = "default_initiator")]
    pub initiator: String,
}

impl Default for ShareCreationOptions {
    fn default() -> Self {
        Self {
            total_shares: default_total_shares(),
            threshold: default_threshold(),
            initiator: default_initiator(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerifyShareParams {
    pub share: Share,
    pub commitment: String,
}

// ---------------------------------------------------------------------------
// Recovery
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecoverStartParams {
    pub threshold: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecoveryStatus {
    pub is_active: bool,
    pub shares_provided: usize,
    pub shares_required: usize,
    pub can_recover: bool,
    pub message: String,
}

// ---------------------------------------------------------------------------
// Deletion
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeleteKeyParams {
    #[serde(default, alias = "confirmDeletion")]
    pub confirm_deletion: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeleteKeyResponse {
    pub deleted: bool,
    pub message: String,
}
