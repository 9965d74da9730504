//! End-to-end tests over a real Unix socket.
//!
//! Each test binds its own socket in a temporary directory, drives the
//! server through [`StampClient`], and shuts it down through the watch
//! channel.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Map, Value};
use tokio::io::AsyncWriteExt;
use tokio::net::UnixStream;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use stamp_core::audit::MemoryAuditSink;
use stamp_core::client::{verify_signed_response, ClientError, StampClient};
use stamp_core::config::{ServiceConfig, MAX_FRAME_LENGTH};
use stamp_core::crypto::Ed25519Provider;
use stamp_core::custody::{KeyCustodian, MemoryKeyStore};
use stamp_core::server::{read_frame, IpcServer, ShareCreationOptions, StampService};
use stamp_core::sharing::ShamirSharder;

struct Harness {
    _dir: tempfile::TempDir,
    socket: PathBuf,
    shutdown: watch::Sender<bool>,
    server: JoinHandle<std::io::Result<()>>,
    service: Arc<StampService>,
}

impl Harness {
    async fn start(with_key: bool) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let config = ServiceConfig {
            socket_path: dir.path().join("stamp.sock"),
            key_path: dir.path().join("master.key"),
            io_timeout: Duration::from_millis(500),
            shutdown_grace: Duration::from_secs(1),
            ..ServiceConfig::default()
        };

        let audit = Arc::new(MemoryAuditSink::new());
        let custodian = Arc::new(KeyCustodian::new(
            Arc::new(Ed25519Provider::new()),
            Arc::new(MemoryKeyStore::new()),
            audit.clone(),
        ));
        if with_key {
            custodian.generate_key().unwrap();
        }
        let service = Arc::new(StampService::new(custodian, Arc::new(ShamirSharder), audit));

        let server = IpcServer::bind(&config, Arc::clone(&service)).unwrap();
        let (shutdown, rx) = watch::channel(false);
        let server = tokio::spawn(server.serve(rx));

        Self {
            socket: config.socket_path,
            _dir: dir,
            shutdown,
            server,
            service,
        }
    }

    fn client(&self) -> StampClient {
        StampClient::new(&self.socket).with_timeout(Duration::from_secs(2))
    }

    async fn stop(self) {
        self.shutdown.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(5), self.server)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert!(!self.socket.exists());
    }
}

fn payload(value: Value) -> Map<String, Value> {
    value.as_object().cloned().unwrap()
}

#[tokio::test]
async fn test_sign_over_socket_verifies() {
    let h = Harness::start(true).await;
    let client = h.client();

    let signed = client
        .sign("issue", "billing", payload(json!({"amount": 10, "to": "acme"})))
        .await
        .unwrap();
    assert_eq!(signed.signer_id, "StampService-v1");
    assert!(verify_signed_response(&signed).unwrap());

    let status = client.get_status().await.unwrap();
    assert!(status.is_running);
    assert!(status.key_present);
    assert_eq!(status.public_key.as_deref(), Some(signed.public_key.as_str()));

    h.stop().await;
}

#[tokio::test]
async fn test_health_check_over_socket() {
    let h = Harness::start(true).await;
    let client = h.client();

    let stamp = client.test_stamp().await.unwrap();
    assert!(verify_signed_response(&stamp).unwrap());
    assert!(client.get_status().await.unwrap().last_health_check.is_some());

    h.stop().await;
}

#[tokio::test]
async fn test_service_errors_surface_as_client_errors() {
    let h = Harness::start(false).await;
    let client = h.client();

    let err = client.test_stamp().await.unwrap_err();
    assert_eq!(err.service_message(), Some("no key loaded"));

    let err = client.delete_key(false).await.unwrap_err();
    assert_eq!(err.service_message(), Some("deletion not confirmed"));

    h.stop().await;
}

#[tokio::test]
async fn test_backup_and_restore_over_socket() {
    let h = Harness::start(true).await;
    let client = h.client();
    let original = client.get_status().await.unwrap().public_key.unwrap();

    let bundle = client
        .create_shares(&ShareCreationOptions {
            total_shares: 4,
            threshold: 2,
            initiator: "socket-test".into(),
        })
        .await
        .unwrap();
    let verdict = client
        .verify_share(&bundle.shares[3], &bundle.commitment)
        .await
        .unwrap();
    assert!(verdict.is_valid);

    assert!(client.delete_key(true).await.unwrap().deleted);
    assert!(!client.get_status().await.unwrap().key_present);

    client.recover_start(2).await.unwrap();
    let progress = client.recover_provide_share(&bundle.shares[3]).await.unwrap();
    assert_eq!(progress.shares_provided, 1);
    let done = client.recover_provide_share(&bundle.shares[0]).await.unwrap();
    assert!(!done.is_active);

    assert_eq!(client.get_status().await.unwrap().public_key.unwrap(), original);
    h.stop().await;
}

#[tokio::test]
async fn test_concurrent_signers() {
    let h = Harness::start(true).await;

    let mut tasks = Vec::new();
    for i in 0..16 {
        let client = h.client();
        tasks.push(tokio::spawn(async move {
            client
                .sign("bulk", "load", payload(json!({"n": i})))
                .await
        }));
    }
    for task in tasks {
        let signed = task.await.unwrap().unwrap();
        assert!(verify_signed_response(&signed).unwrap());
    }

    h.stop().await;
}

#[tokio::test]
async fn test_oversized_frame_is_refused() {
    let h = Harness::start(true).await;

    let mut stream = UnixStream::connect(&h.socket).await.unwrap();
    stream
        .write_all(&((MAX_FRAME_LENGTH as u32) + 1).to_be_bytes())
        .await
        .unwrap();
    let body = read_frame(&mut stream).await.unwrap();
    let value: Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(value["error"], "request too large");

    // The server is still healthy afterwards.
    assert!(h.client().get_status().await.is_ok());
    h.stop().await;
}

#[tokio::test]
async fn test_unknown_method_over_socket() {
    let h = Harness::start(true).await;
    let request = stamp_core::server::Request {
        method: "ExportPrivateKey".into(),
        params: json!({}),
    };
    let err = h.client().call_raw(&request).await.unwrap_err();
    assert!(matches!(err, ClientError::Service(ref m) if m == "unknown method: ExportPrivateKey"));
    assert!(h.service.custodian().has_key());
    h.stop().await;
}

#[tokio::test]
async fn test_client_waits_for_late_server() {
    let dir = tempfile::tempdir().unwrap();
    let socket = dir.path().join("late.sock");
    let client = StampClient::new(&socket).with_timeout(Duration::from_secs(3));

    let config = ServiceConfig {
        socket_path: socket.clone(),
        shutdown_grace: Duration::from_millis(500),
        ..ServiceConfig::default()
    };
    let starter = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(300)).await;
        let audit = Arc::new(MemoryAuditSink::new());
        let custodian = Arc::new(KeyCustodian::new(
            Arc::new(Ed25519Provider::new()),
            Arc::new(MemoryKeyStore::new()),
            audit.clone(),
        ));
        let service = Arc::new(StampService::new(custodian, Arc::new(ShamirSharder), audit));
        let server = IpcServer::bind(&config, service).unwrap();
        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(server.serve(rx));
        (tx, handle)
    });

    let status = client.get_status().await.unwrap();
    assert!(!status.key_present);

    let (tx, handle) = starter.await.unwrap();
    tx.send(true).unwrap();
    handle.await.unwrap().unwrap();
}
