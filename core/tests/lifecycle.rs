//! Key lifecycle integration tests.
//!
//! These drive the dispatcher the way the socket does, with a real
//! encrypted file store in a temporary directory: generate, split, destroy,
//! recover from different share subsets, and reload in a fresh process.

use std::path::Path;
use std::sync::Arc;

use serde_json::{json, Value};

use stamp_core::audit::MemoryAuditSink;
use stamp_core::crypto::{Ed25519Provider, SignatureProvider};
use stamp_core::custody::{FileKeyStore, KeyCustodian, KeyStore};
use stamp_core::server::{
    Caller, DeleteKeyResponse, RecoveryStatus, ServiceStatus, SignedResponse, StampService,
};
use stamp_core::sharing::{reconstruct_secret, Share, ShareBundle, ShareError, ShamirSharder};

// ---------------------------------------------------------------------------
// Test Helpers
// ---------------------------------------------------------------------------

const STORE_KEY: [u8; 32] = [0x5a; 32];

struct Node {
    service: StampService,
    audit: Arc<MemoryAuditSink>,
}

/// A service over the key file at `path`, loading whatever is stored there.
fn node(path: &Path) -> Node {
    let audit = Arc::new(MemoryAuditSink::new());
    let store: Arc<dyn KeyStore> = Arc::new(FileKeyStore::with_key(path, STORE_KEY));
    let custodian = Arc::new(KeyCustodian::new(
        Arc::new(Ed25519Provider::new()),
        store,
        audit.clone(),
    ));
    custodian.load_key();
    Node {
        service: StampService::new(custodian, Arc::new(ShamirSharder), audit.clone()),
        audit,
    }
}

fn call(node: &Node, method: &str, params: Value) -> Value {
    let frame = serde_json::to_vec(&json!({"method": method, "params": params})).unwrap();
    let response = node.service.handle_request(&Caller::local_admin(), &frame);
    serde_json::from_slice(&response).unwrap()
}

fn call_ok<T: serde::de::DeserializeOwned>(node: &Node, method: &str, params: Value) -> T {
    let value = call(node, method, params);
    assert!(value.get("error").is_none(), "{method} failed: {value}");
    serde_json::from_value(value).unwrap()
}

fn call_err(node: &Node, method: &str, params: Value) -> String {
    let value = call(node, method, params);
    value["error"]
        .as_str()
        .unwrap_or_else(|| panic!("{method} unexpectedly succeeded: {value}"))
        .to_owned()
}

fn public_key(node: &Node) -> Option<String> {
    call_ok::<ServiceStatus>(node, "GetStatus", json!({})).public_key
}

fn recover(node: &Node, shares: &[&Share], threshold: usize) -> RecoveryStatus {
    call_ok::<RecoveryStatus>(node, "RecoverStart", json!({"threshold": threshold}));
    let mut last = None;
    for share in shares {
        last = Some(call_ok::<RecoveryStatus>(node, "RecoverProvideShare", json!(share)));
    }
    last.unwrap()
}

// ---------------------------------------------------------------------------
// Lifecycle
// ---------------------------------------------------------------------------

#[test]
fn test_generate_then_load_in_fresh_instance() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("master.key");

    let first = node(&path);
    assert!(public_key(&first).is_none());
    first.service.custodian().generate_key().unwrap();
    let pem = public_key(&first).unwrap();

    let second = node(&path);
    assert_eq!(public_key(&second), Some(pem));
}

#[test]
fn test_delete_then_sign_and_load_fail() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("master.key");
    let node_a = node(&path);
    node_a.service.custodian().generate_key().unwrap();

    let refused = call_err(&node_a, "DeleteKey", json!({"confirm_deletion": false}));
    assert_eq!(refused, "deletion not confirmed");
    assert!(path.exists());

    let deleted: DeleteKeyResponse =
        call_ok(&node_a, "DeleteKey", json!({"confirm_deletion": true}));
    assert!(deleted.deleted);
    assert!(!path.exists());

    let err = call_err(
        &node_a,
        "Sign",
        json!({"operation": "op", "requester_id": "r", "payload": {"x": 1}}),
    );
    assert_eq!(err, "no key loaded");

    let node_b = node(&path);
    assert!(!node_b.service.custodian().has_key());
}

#[test]
fn test_signature_roundtrip_through_service() {
    let dir = tempfile::tempdir().unwrap();
    let n = node(&dir.path().join("master.key"));
    n.service.custodian().generate_key().unwrap();

    let signed: SignedResponse = call_ok(
        &n,
        "Sign",
        json!({"operation": "hello", "requester_id": "tests", "payload": {"msg": "hello"}}),
    );
    assert!(stamp_core::client::verify_signed_response(&signed).unwrap());

    let mut forged = signed.clone();
    forged.signed_payload = base64_encode(br#"{"msg":"different"}"#);
    assert!(!stamp_core::client::verify_signed_response(&forged).unwrap());
}

fn base64_encode(bytes: &[u8]) -> String {
    use base64::Engine as _;
    base64::engine::general_purpose::STANDARD.encode(bytes)
}

// ---------------------------------------------------------------------------
// Backup and Recovery
// ---------------------------------------------------------------------------

#[test]
fn test_split_destroy_and_recover_from_two_subsets() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("master.key");
    let n = node(&path);
    n.service.custodian().generate_key().unwrap();
    let original_pem = public_key(&n).unwrap();

    let bundle: ShareBundle = call_ok(
        &n,
        "CreateShares",
        json!({"total_shares": 5, "threshold": 3, "initiator": "ops"}),
    );
    assert_eq!(bundle.shares.len(), 5);
    assert_eq!(bundle.public_key, original_pem);

    for share in &bundle.shares {
        let verdict: Value = call_ok(
            &n,
            "VerifyShare",
            json!({"share": share, "commitment": bundle.commitment}),
        );
        assert_eq!(verdict["is_valid"], true);
    }

    // RecoverStart is refused while the key is live.
    assert_eq!(
        call_err(&n, "RecoverStart", json!({"threshold": 3})),
        "a key is already loaded"
    );

    let by_index = |i: u8| bundle.shares.iter().find(|s| s.index == i).unwrap();

    call_ok::<DeleteKeyResponse>(&n, "DeleteKey", json!({"confirm_deletion": true}));
    let done = recover(&n, &[by_index(1), by_index(3), by_index(5)], 3);
    assert!(!done.is_active);
    assert!(done.can_recover);
    assert_eq!(done.message, "Recovery successful. Key restored.");
    assert_eq!(public_key(&n).unwrap(), original_pem);

    call_ok::<DeleteKeyResponse>(&n, "DeleteKey", json!({"confirm_deletion": true}));
    recover(&n, &[by_index(4), by_index(2), by_index(3)], 3);
    assert_eq!(public_key(&n).unwrap(), original_pem);

    // The recovered key was persisted.
    let reloaded = node(&path);
    assert_eq!(public_key(&reloaded).unwrap(), original_pem);
    assert_eq!(n.audit.recovery_events("RecoveryCompleted"), 2);
}

#[test]
fn test_two_shares_of_three_name_the_threshold() {
    let dir = tempfile::tempdir().unwrap();
    let n = node(&dir.path().join("master.key"));
    n.service.custodian().generate_key().unwrap();
    let bundle: ShareBundle =
        call_ok(&n, "CreateShares", json!({"total_shares": 5, "threshold": 3}));

    let subset = vec![bundle.shares[0].clone(), bundle.shares[2].clone()];
    match reconstruct_secret(&subset) {
        Err(ShareError::InsufficientShares {
            threshold,
            provided,
        }) => {
            assert_eq!(threshold, 3);
            assert_eq!(provided, 2);
        }
        other => panic!("expected InsufficientShares, got {other:?}"),
    }
}

#[test]
fn test_recovery_started_below_share_threshold_still_completes() {
    let dir = tempfile::tempdir().unwrap();
    let n = node(&dir.path().join("master.key"));
    n.service.custodian().generate_key().unwrap();
    let original_pem = public_key(&n).unwrap();
    let bundle: ShareBundle =
        call_ok(&n, "CreateShares", json!({"total_shares": 5, "threshold": 3}));
    call_ok::<DeleteKeyResponse>(&n, "DeleteKey", json!({"confirm_deletion": true}));

    call_ok::<RecoveryStatus>(&n, "RecoverStart", json!({"threshold": 2}));
    let first: RecoveryStatus = call_ok(&n, "RecoverProvideShare", json!(bundle.shares[0]));
    assert_eq!(first.shares_required, 3);
    let second: RecoveryStatus = call_ok(&n, "RecoverProvideShare", json!(bundle.shares[1]));
    assert!(second.is_active);
    assert_eq!(second.shares_provided, 2);

    let done: RecoveryStatus = call_ok(&n, "RecoverProvideShare", json!(bundle.shares[2]));
    assert!(!done.is_active);
    assert_eq!(public_key(&n).unwrap(), original_pem);
    assert_eq!(n.audit.recovery_events("RecoveryFailed"), 0);
}

#[test]
fn test_duplicate_share_does_not_advance_session() {
    let dir = tempfile::tempdir().unwrap();
    let n = node(&dir.path().join("master.key"));
    n.service.custodian().generate_key().unwrap();
    let bundle: ShareBundle =
        call_ok(&n, "CreateShares", json!({"total_shares": 3, "threshold": 2}));
    call_ok::<DeleteKeyResponse>(&n, "DeleteKey", json!({"confirm_deletion": true}));

    call_ok::<RecoveryStatus>(&n, "RecoverStart", json!({"threshold": 2}));
    call_ok::<RecoveryStatus>(&n, "RecoverProvideShare", json!(bundle.shares[1]));
    let err = call_err(&n, "RecoverProvideShare", json!(bundle.shares[1]));
    assert_eq!(err, "share with index 2 already provided");

    let status: RecoveryStatus = call_ok(&n, "RecoverStatus", json!({}));
    assert_eq!(status.shares_provided, 1);
    assert_eq!(
        status.message,
        "Recovery in progress. 1/2 shares provided. Need 1 more."
    );
}

#[test]
fn test_tampered_share_fails_and_session_survives() {
    let dir = tempfile::tempdir().unwrap();
    let n = node(&dir.path().join("master.key"));
    n.service.custodian().generate_key().unwrap();
    let original_pem = public_key(&n).unwrap();
    let bundle: ShareBundle =
        call_ok(&n, "CreateShares", json!({"total_shares": 3, "threshold": 2}));
    call_ok::<DeleteKeyResponse>(&n, "DeleteKey", json!({"confirm_deletion": true}));

    // Flip one byte of share 2's payload; it still decodes and carries the
    // right commitment, so only reconstruction can catch it.
    let mut tampered = bundle.shares[1].clone();
    let mut bytes = tampered.payload().unwrap().to_vec();
    bytes[0] ^= 0x01;
    tampered.data = base64_encode(&bytes);

    call_ok::<RecoveryStatus>(&n, "RecoverStart", json!({"threshold": 2}));
    call_ok::<RecoveryStatus>(&n, "RecoverProvideShare", json!(bundle.shares[0]));
    let err = call_err(&n, "RecoverProvideShare", json!(tampered));
    assert!(err.starts_with("recovery failed"), "{err}");
    assert!(!n.service.custodian().has_key());

    // The bad share's slot was released; the genuine one completes recovery.
    let status: RecoveryStatus = call_ok(&n, "RecoverStatus", json!({}));
    assert!(status.is_active);
    assert_eq!(status.shares_provided, 1);
    let done: RecoveryStatus = call_ok(&n, "RecoverProvideShare", json!(bundle.shares[2]));
    assert!(!done.is_active);
    assert_eq!(public_key(&n).unwrap(), original_pem);
}

#[test]
fn test_status_reflects_recovery_session() {
    let dir = tempfile::tempdir().unwrap();
    let n = node(&dir.path().join("master.key"));

    let status: ServiceStatus = call_ok(&n, "GetStatus", json!({}));
    assert!(!status.key_present);
    assert!(!status.recovery_active);

    call_ok::<RecoveryStatus>(&n, "RecoverStart", json!({"threshold": 3}));
    let status: ServiceStatus = call_ok(&n, "GetStatus", json!({}));
    assert!(status.recovery_active);

    call_ok::<RecoveryStatus>(&n, "RecoverReset", json!({}));
    let status: ServiceStatus = call_ok(&n, "GetStatus", json!({}));
    assert!(!status.recovery_active);
}

#[test]
fn test_key_file_is_not_plaintext() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("master.key");
    let n = node(&path);
    n.service.custodian().generate_key().unwrap();

    let bundle: ShareBundle =
        call_ok(&n, "CreateShares", json!({"total_shares": 2, "threshold": 2}));
    let secret = reconstruct_secret(&bundle.shares).unwrap();
    let on_disk = std::fs::read(&path).unwrap();
    assert!(!on_disk
        .windows(secret.len())
        .any(|window| window == secret.as_slice()));

    let provider = Ed25519Provider::new();
    let derived = provider.derive_public_key(&secret).unwrap();
    assert_eq!(derived, n.service.custodian().public_key().unwrap());
}
