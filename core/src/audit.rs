//! # Audit Trail
//!
//! Security-relevant events flow through the narrow [`AuditSink`] interface.
//! Sinks are fire-and-forget: every method is infallible and must return
//! promptly, so a slow or broken audit backend never changes the outcome of
//! a signing or recovery operation.
//!
//! [`TracingAuditSink`] emits structured `tracing` events under the
//! [`AUDIT_TARGET`] target. The service binary routes that target to a
//! rolling JSON file; everything else in the process logs elsewhere.
//! [`MemoryAuditSink`] records events in a list for assertions in tests.

use parking_lot::Mutex;
use tracing::{info, warn};

/// `tracing` target for every audit event.
pub const AUDIT_TARGET: &str = "stamp::audit";

/// Recorder for security-relevant events.
pub trait AuditSink: Send + Sync {
    /// A payload was signed. Only its hash and a signature prefix are recorded.
    fn log_sign_operation(
        &self,
        operation: &str,
        requester_id: &str,
        payload_hash: &str,
        signature_prefix: &str,
    );

    fn log_share_creation(&self, total_shares: u8, threshold: u8, initiator: &str);

    fn log_recovery_event(&self, kind: &str, details: &str);

    fn log_auth_failure(&self, requester_id: &str, reason: &str);

    fn log_security_event(&self, kind: &str, details: &str);
}

/// Writes audit events as structured `tracing` records.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingAuditSink;

impl AuditSink for TracingAuditSink {
    fn log_sign_operation(
        &self,
        operation: &str,
        requester_id: &str,
        payload_hash: &str,
        signature_prefix: &str,
    ) {
        info!(
            target: AUDIT_TARGET,
            event = "sign",
            operation,
            requester_id,
            payload_hash,
            signature_prefix,
            "payload signed"
        );
    }

    fn log_share_creation(&self, total_shares: u8, threshold: u8, initiator: &str) {
        info!(
            target: AUDIT_TARGET,
            event = "share_creation",
            total_shares,
            threshold,
            initiator,
            "key split into shares"
        );
    }

    fn log_recovery_event(&self, kind: &str, details: &str) {
        info!(target: AUDIT_TARGET, event = "recovery", kind, details, "recovery event");
    }

    fn log_auth_failure(&self, requester_id: &str, reason: &str) {
        warn!(target: AUDIT_TARGET, event = "auth_failure", requester_id, reason, "request refused");
    }

    fn log_security_event(&self, kind: &str, details: &str) {
        warn!(target: AUDIT_TARGET, event = "security", kind, details, "security event");
    }
}

/// One recorded audit event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuditEvent {
    Sign {
        operation: String,
        requester_id: String,
        payload_hash: String,
        signature_prefix: String,
    },
    ShareCreation {
        total_shares: u8,
        threshold: u8,
        initiator: String,
    },
    Recovery {
        kind: String,
        details: String,
    },
    AuthFailure {
        requester_id: String,
        reason: String,
    },
    Security {
        kind: String,
        details: String,
    },
}

/// Keeps every event in memory.
#[derive(Debug, Default)]
pub struct MemoryAuditSink {
    events: Mutex<Vec<AuditEvent>>,
}

impl MemoryAuditSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of everything recorded so far.
    pub fn events(&self) -> Vec<AuditEvent> {
        self.events.lock().clone()
    }

    /// Number of security events with the given kind.
    pub fn security_events(&self, kind: &str) -> usize {
        self.events
            .lock()
            .iter()
            .filter(|e| matches!(e, AuditEvent::Security { kind: k, .. } if k == kind))
            .count()
    }

    /// Number of recovery events with the given kind.
    pub fn recovery_events(&self, kind: &str) -> usize {
        self.events
            .lock()
            .iter()
            .filter(|e| matches!(e, AuditEvent::Recovery { kind: k, .. } if k == kind))
            .count()
    }

    fn push(&self, event: AuditEvent) {
        self.events.lock().push(event);
    }
}

impl AuditSink for MemoryAuditSink {
    fn log_sign_operation(
        &self,
        operation: &str,
        requester_id: &str,
        payload_hash: &str,
        signature_prefix: &str,
    ) {
        self.push(AuditEvent::Sign {
            operation: operation.into(),
            requester_id: requester_id.into(),
            payload_hash: payload_hash.into(),
            signature_prefix: signature_prefix.into(),
        });
    }

    fn log_share_creation(&self, total_shares: u8, threshold: u8, initiator: &str) {
        self.push(AuditEvent::ShareCreation {
            total_shares,
            threshold,
            initiator: initiator.into(),
        });
    }

    fn log_recovery_event(&self, kind: &str, details: &str) {
        self.push(AuditEvent::Recovery {
            kind: kind.into(),
            details: details.into(),
        });
    }

    fn log_auth_failure(&self, requester_id: &str, reason: &str) {
        self.push(AuditEvent::AuthFailure {
            requester_id: requester_id.into(),
            reason: reason.into(),
        });
    }

    fn log_security_event(&self, kind: &str, details: &str) {
        self.push(AuditEvent::Security {
            kind: kind.into(),
            details: details.into(),
        });
    }
}
