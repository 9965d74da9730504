//! # Request Dispatcher
//!
//! [`StampService`] turns one request frame into one response frame. It owns
//! the shared state every connection task works against: the custodian, the
//! sharder and the single [`RecoverySession`].
//!
//! ## Locking
//!
//! The recovery session mutex is always taken before the custodian's
//! internal lock, never the other way round. Handlers that need both (recovery,
//! status) hold the session for the whole operation, so a recovery attempt
//! and a second `RecoverProvideShare` cannot interleave.
//!
//! ## Errors
//!
//! Every failure, typed or not, becomes `{"error": "..."}`. The message comes
//! from [`ServiceError::wire_message`], which never includes storage paths,
//! key bytes or internal detail. Each failure is also recorded as a security
//! event.

use std::sync::Arc;
use std::time::Instant;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, info, warn};

use super::messages::{
    DeleteKeyParams, DeleteKeyResponse, ErrorResponse, Method, RecoverStartParams,
    RecoveryStatus, Request, ServiceStatus, ShareCreationOptions, SignRequest, SignedResponse,
    VerifyShareParams,
};
use super::recovery::{Progress, RecoveryError, RecoverySession};
use crate::audit::AuditSink;
use crate::config::{HEALTH_CHECK_MESSAGE_PREFIX, SIGNATURE_LOG_PREFIX_LENGTH, SIGNER_ID};
use crate::crypto::hash::sha256;
use crate::custody::{CustodyError, DeleteOutcome, KeyCustodian};
use crate::sharing::{SecretSharder, Share, ShareError, SharingParams};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("invalid request: {0}")]
    BadRequest(String),

    #[error("unknown method: {0}")]
    UnknownMethod(String),

    #[error("permission denied")]
    PermissionDenied,

    #[error(transparent)]
    Custody(#[from] CustodyError),

    #[error(transparent)]
    Share(#[from] ShareError),

    #[error(transparent)]
    Recovery(#[from] RecoveryError),

    /// The shares reconstructed to bytes the signing algorithm rejects.
    #[error("reconstructed key is not a valid {0} key")]
    InvalidRecoveredKey(&'static str),

    /// Reconstruction or import failed; the session is still collecting.
    #[error("recovery failed: {0}")]
    RecoveryFailed(Box<ServiceError>),

    #[error("internal error")]
    Internal,
}

impl ServiceError {
    /// Message safe to put on the wire.
    pub fn wire_message(&self) -> String {
        match self {
            ServiceError::Custody(CustodyError::Store(_)) => "key storage failure".to_owned(),
            ServiceError::Custody(CustodyError::Signature(_)) => "signing failed".to_owned(),
            ServiceError::RecoveryFailed(inner) => format!("recovery failed: {}", inner.wire_message()),
            other => other.to_string(),
        }
    }
}

// ---------------------------------------------------------------------------
// Caller Identity
// ---------------------------------------------------------------------------

/// Who sent a request, as established by the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Caller {
    /// Peer uid, when the transport could read it.
    pub uid: Option<u32>,
    /// May call privileged methods.
    pub privileged: bool,
}

impl Caller {
    /// An in-process caller with full rights.
    pub fn local_admin() -> Self {
        Self {
            uid: None,
            privileged: true,
        }
    }

    /// A socket peer with the given uid, privileged when it is root or owns
    /// the socket.
    pub fn from_peer(uid: Option<u32>, owner_uid: u32) -> Self {
        let privileged = matches!(uid, Some(u) if u == 0 || u == owner_uid);
        Self { uid, privileged }
    }

    pub fn label(&self) -> String {
        match self.uid {
            Some(uid) => format!("uid:{uid}"),
            None => "local".to_owned(),
        }
    }
}

// ---------------------------------------------------------------------------
// Service
// ---------------------------------------------------------------------------

/// Shared state behind the request server.
pub struct StampService {
    custodian: Arc<KeyCustodian>,
    sharder: Arc<dyn SecretSharder>,
    audit: Arc<dyn AuditSink>,
    recovery: Mutex<RecoverySession>,
    started_at: Instant,
    last_health_check: Mutex<Option<DateTime<Utc>>>,
}

impl std::fmt::Debug for StampService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StampService")
            .field("custodian", &self.custodian)
            .field("recovery_active", &self.recovery.lock().is_active())
            .finish_non_exhaustive()
    }
}

type HandlerResult = Result<Value, ServiceError>;

impl StampService {
    pub fn new(
        custodian: Arc<KeyCustodian>,
        sharder: Arc<dyn SecretSharder>,
        audit: Arc<dyn AuditSink>,
    ) -> Self {
        Self {
            custodian,
            sharder,
            audit,
            recovery: Mutex::new(RecoverySession::new()),
            started_at: Instant::now(),
            last_health_check: Mutex::new(None),
        }
    }

    pub fn custodian(&self) -> &Arc<KeyCustodian> {
        &self.custodian
    }

    pub fn audit(&self) -> &Arc<dyn AuditSink> {
        &self.audit
    }

    /// Handle one raw request frame and produce the response frame.
    pub fn handle_request(&self, caller: &Caller, frame: &[u8]) -> Vec<u8> {
        let (method_name, result) = match serde_json::from_slice::<Request>(frame) {
            Ok(request) => {
                let result = self.dispatch(caller, &request.method, request.params);
                (request.method, result)
            }
            Err(e) => (String::from("?"), Err(ServiceError::BadRequest(e.to_string()))),
        };

        match result {
            Ok(value) => serde_json::to_vec(&value).unwrap_or_else(|_| error_frame("internal error")),
            Err(e) => {
                let message = e.wire_message();
                debug!(method = %method_name, caller = %caller.label(), error = %message, "request failed");
                if !matches!(e, ServiceError::PermissionDenied) {
                    self.audit.log_security_event(
                        "RequestFailed",
                        &format!("{method_name} from {}: {message}", caller.label()),
                    );
                }
                error_frame(&message)
            }
        }
    }

    /// Route a decoded request to its handler.
    pub fn dispatch(&self, caller: &Caller, method: &str, params: Value) -> HandlerResult {
        let method =
            Method::from_name(method).ok_or_else(|| ServiceError::UnknownMethod(method.to_owned()))?;

        if method.is_privileged() && !caller.privileged {
            warn!(method = method.name(), caller = %caller.label(), "privileged method refused");
            self.audit.log_auth_failure(
                &caller.label(),
                &format!("{} requires a privileged caller", method.name()),
            );
            return Err(ServiceError::PermissionDenied);
        }

        match method {
            Method::Sign => self.handle_sign(parse_params(params)?),
            Method::TestStamp => self.handle_test_stamp(),
            Method::GetStatus => self.handle_get_status(),
            Method::CreateShares => self.handle_create_shares(parse_params(params)?),
            Method::VerifyShare => self.handle_verify_share(parse_params(params)?),
            Method::RecoverStart => self.handle_recover_start(parse_params(params)?),
            Method::RecoverProvideShare => self.handle_recover_provide_share(parse_params(params)?),
            Method::RecoverStatus => to_value(&self.recovery.lock().status()),
            Method::RecoverReset => self.handle_recover_reset(),
            Method::DeleteKey => self.handle_delete_key(parse_params(params)?),
        }
    }

    // -----------------------------------------------------------------------
    // Signing
    // -----------------------------------------------------------------------

    fn handle_sign(&self, request: SignRequest) -> HandlerResult {
        // serde_json::Map is ordered by key, so this is canonical for a given payload.
        let signed_bytes = serde_json::to_vec(&request.payload)
            .map_err(|e| ServiceError::BadRequest(e.to_string()))?;
        let response = self.sign_bytes(&request.operation, &request.requester_id, &signed_bytes)?;
        to_value(&response)
    }

    fn handle_test_stamp(&self) -> HandlerResult {
        let now = Utc::now();
        let message = format!("{HEALTH_CHECK_MESSAGE_PREFIX} - {}", now.to_rfc3339());
        let response = self.sign_bytes("TestStamp", SIGNER_ID, message.as_bytes())?;
        *self.last_health_check.lock() = Some(now);
        to_value(&response)
    }

    fn sign_bytes(
        &self,
        operation: &str,
        requester_id: &str,
        bytes: &[u8],
    ) -> Result<SignedResponse, ServiceError> {
        let stamp = self.custodian.stamp(bytes)?;
        let signature = BASE64.encode(&stamp.signature);
        let prefix: String = signature.chars().take(SIGNATURE_LOG_PREFIX_LENGTH).collect();
        self.audit
            .log_sign_operation(operation, requester_id, &hex::encode(sha256(bytes)), &prefix);

        Ok(SignedResponse {
            signature,
            algorithm: stamp.algorithm.to_owned(),
            signed_payload: BASE64.encode(bytes),
            signer_id: SIGNER_ID.to_owned(),
            timestamp: Utc::now(),
            public_key: stamp.public_key_pem,
        })
    }

    // -----------------------------------------------------------------------
    // Status
    // -----------------------------------------------------------------------

    fn handle_get_status(&self) -> HandlerResult {
        let recovery_active = self.recovery.lock().is_active();
        let identity = self.custodian.public_identity();
        let status = ServiceStatus {
            is_running: true,
            key_present: identity.is_some(),
            uptime_seconds: self.started_at.elapsed().as_secs(),
            last_health_check: *self.last_health_check.lock(),
            algorithm: identity.as_ref().map(|i| i.algorithm.to_owned()),
            public_key: identity.map(|i| i.public_key_pem),
            recovery_active,
        };
        to_value(&status)
    }

    // -----------------------------------------------------------------------
    // Shares
    // -----------------------------------------------------------------------

    fn handle_create_shares(&self, options: ShareCreationOptions) -> HandlerResult {
        let params = SharingParams::new(options.total_shares, options.threshold)?;

        // The exported copy wipes itself on drop: on return, on `?`, and
        // while unwinding out of a panicking sharder.
        let exported = self.custodian.export_private_key_for_split()?;
        let bundle = self.sharder.create_shares(
            exported.secret(),
            params.total_shares as usize,
            params.threshold as usize,
            exported.public_key_pem(),
            exported.algorithm(),
        )?;
        drop(exported);

        info!(
            total_shares = params.total_shares,
            threshold = params.threshold,
            initiator = %options.initiator,
            "key split into shares"
        );
        self.audit
            .log_share_creation(params.total_shares, params.threshold, &options.initiator);
        to_value(&bundle)
    }

    fn handle_verify_share(&self, params: VerifyShareParams) -> HandlerResult {
        to_value(&self.sharder.verify_share(&params.share, &params.commitment))
    }

    // -----------------------------------------------------------------------
    // Recovery
    // -----------------------------------------------------------------------

    fn handle_recover_start(&self, params: RecoverStartParams) -> HandlerResult {
        let mut session = self.recovery.lock();
        if self.custodian.has_key() {
            return Err(CustodyError::AlreadyHasKey.into());
        }
        let restarted = session.start(params.threshold)?;
        let kind = if restarted {
            "RecoveryRestarted"
        } else {
            "RecoveryStarted"
        };
        info!(threshold = params.threshold, restarted, "recovery session started");
        self.audit
            .log_recovery_event(kind, &format!("Threshold: {}", params.threshold));
        to_value(&session.status())
    }

    fn handle_recover_provide_share(&self, share: Share) -> HandlerResult {
        let mut session = self.recovery.lock();
        let index = share.index;
        let progress = session.provide(share)?;

        let status = session.status();
        self.audit.log_recovery_event(
            "ShareProvided",
            &format!(
                "Share {index} provided. Total: {}/{}",
                status.shares_provided, status.shares_required
            ),
        );

        if let Progress::Collecting { .. } = progress {
            return to_value(&status);
        }

        let required = status.shares_required;
        match self.reconstruct_and_import(&session.collected()) {
            Ok(()) => {
                session.complete();
                info!("signing key recovered from shares");
                self.audit
                    .log_recovery_event("RecoveryCompleted", "Key successfully recovered");
                to_value(&RecoveryStatus {
                    is_active: false,
                    shares_provided: required,
                    shares_required: required,
                    can_recover: true,
                    message: "Recovery successful. Key restored.".into(),
                })
            }
            Err(e) => {
                session.withdraw(index);
                warn!(error = %e, share = index, "reconstruction failed; share slot released");
                self.audit
                    .log_recovery_event("RecoveryFailed", &format!("Error: {}", e.wire_message()));
                Err(ServiceError::RecoveryFailed(Box::new(e)))
            }
        }
    }

    fn reconstruct_and_import(&self, shares: &[Share]) -> Result<(), ServiceError> {
        let mut secret = self.sharder.reconstruct_secret(shares)?;
        let provider = self.custodian.provider();
        let public_key = provider
            .derive_public_key(&secret)
            .map_err(|_| ServiceError::InvalidRecoveredKey(provider.algorithm()))?;
        self.custodian
            .import_from_recovery(&mut secret, &public_key)?;
        Ok(())
    }

    fn handle_recover_reset(&self) -> HandlerResult {
        let mut session = self.recovery.lock();
        if session.reset() {
            info!("recovery session reset");
            self.audit
                .log_recovery_event("RecoveryReset", "Collected shares discarded");
        }
        to_value(&session.status())
    }

    // -----------------------------------------------------------------------
    // Deletion
    // -----------------------------------------------------------------------

    fn handle_delete_key(&self, params: DeleteKeyParams) -> HandlerResult {
        let outcome = self.custodian.delete_key(params.confirm_deletion)?;
        let response = match outcome {
            DeleteOutcome::Deleted => DeleteKeyResponse {
                deleted: true,
                message: "Master key successfully deleted. Service is now in keyless state."
                    .into(),
            },
            DeleteOutcome::NothingToDelete => DeleteKeyResponse {
                deleted: false,
                message: "No key exists to delete".into(),
            },
        };
        to_value(&response)
    }
}

fn parse_params<T: DeserializeOwned>(params: Value) -> Result<T, ServiceError> {
    let params = if params.is_null() {
        Value::Object(Default::default())
    } else {
        params
    };
    serde_json::from_value(params).map_err(|e| ServiceError::BadRequest(e.to_string()))
}

fn to_value<T: Serialize>(value: &T) -> HandlerResult {
    serde_json::to_value(value).map_err(|_| ServiceError::Internal)
}

/// Serialize `{"error": message}`.
pub fn error_frame(message: &str) -> Vec<u8> {
    let body = ErrorResponse {
        error: message.to_owned(),
    };
    serde_json::to_vec(&body).unwrap_or_else(|_| br#"{"error":"internal error"}"#.to_vec())
}
