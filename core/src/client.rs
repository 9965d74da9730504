//! # Socket Client
//!
//! A typed client for the Stamp socket protocol. Each call opens a fresh
//! connection, sends one frame and reads one frame back, all inside a single
//! timeout budget. Connection attempts that fail because the service is not
//! listening yet are retried until that budget runs out.
//!
//! ```no_run
//! # async fn demo() -> Result<(), stamp_core::client::ClientError> {
//! use stamp_core::client::{verify_signed_response, StampClient};
//! use serde_json::json;
//!
//! let client = StampClient::new("/run/stamp/stamp.sock");
//! let payload = json!({"invoice": 42}).as_object().cloned().unwrap_or_default();
//! let signed = client.sign("issue-invoice", "billing", payload).await?;
//! assert!(verify_signed_response(&signed)?);
//! # Ok(())
//! # }
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{json, Map, Value};
use thiserror::Error;
use tokio::net::UnixStream;
use tokio::time::Instant;
use tracing::debug;

use crate::config::{CLIENT_CONNECT_RETRY_INTERVAL, CLIENT_REQUEST_TIMEOUT};
use crate::crypto::{Ed25519Provider, SignatureProvider};
use crate::server::messages::{
    DeleteKeyParams, DeleteKeyResponse, Method, RecoverStartParams, RecoveryStatus, Request,
    ServiceStatus, ShareCreationOptions, SignRequest, SignedResponse, VerifyShareParams,
};
use crate::server::transport::{read_frame, write_frame, TransportError};
use crate::sharing::{Share, ShareBundle, ShareVerification};

#[derive(Debug, Error)]
pub enum ClientError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    /// The service answered with `{"error": ...}`.
    #[error("service error: {0}")]
    Service(String),

    #[error("malformed response: {0}")]
    Decode(String),
}

impl ClientError {
    /// The service's own error message, if that is what this is.
    pub fn service_message(&self) -> Option<&str> {
        match self {
            ClientError::Service(message) => Some(message),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct StampClient {
    socket_path: PathBuf,
    timeout: Duration,
}

impl StampClient {
    pub fn new(socket_path: impl Into<PathBuf>) -> Self {
        Self {
            socket_path: socket_path.into(),
            timeout: CLIENT_REQUEST_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    // -----------------------------------------------------------------------
    // Typed calls
    // -----------------------------------------------------------------------

    pub async fn sign(
        &self,
        operation: &str,
        requester_id: &str,
        payload: Map<String, Value>,
    ) -> Result<SignedResponse, ClientError> {
        let params = SignRequest {
            operation: operation.to_owned(),
            requester_id: requester_id.to_owned(),
            payload,
        };
        self.call(Method::Sign, &params).await
    }

    pub async fn test_stamp(&self) -> Result<SignedResponse, ClientError> {
        self.call(Method::TestStamp, &json!({})).await
    }

    pub async fn get_status(&self) -> Result<ServiceStatus, ClientError> {
        self.call(Method::GetStatus, &json!({})).await
    }

    pub async fn create_shares(
        &self,
        options: &ShareCreationOptions,
    ) -> Result<ShareBundle, ClientError> {
        self.call(Method::CreateShares, options).await
    }

    pub async fn verify_share(
        &self,
        share: &Share,
        commitment: &str,
    ) -> Result<ShareVerification, ClientError> {
        let params = VerifyShareParams {
            share: share.clone(),
            commitment: commitment.to_owned(),
        };
        self.call(Method::VerifyShare, &params).await
    }

    pub async fn recover_start(&self, threshold: usize) -> Result<RecoveryStatus, ClientError> {
        self.call(Method::RecoverStart, &RecoverStartParams { threshold })
            .await
    }

    pub async fn recover_provide_share(&self, share: &Share) -> Result<RecoveryStatus, ClientError> {
        self.call(Method::RecoverProvideShare, share).await
    }

    pub async fn recover_status(&self) -> Result<RecoveryStatus, ClientError> {
        self.call(Method::RecoverStatus, &json!({})).await
    }

    pub async fn recover_reset(&self) -> Result<RecoveryStatus, ClientError> {
        self.call(Method::RecoverReset, &json!({})).await
    }

    pub async fn delete_key(&self, confirm_deletion: bool) -> Result<DeleteKeyResponse, ClientError> {
        self.call(Method::DeleteKey, &DeleteKeyParams { confirm_deletion })
            .await
    }

    // -----------------------------------------------------------------------
    // Plumbing
    // -----------------------------------------------------------------------

    /// Send one request and decode the response as `T`.
    pub async fn call<P, T>(&self, method: Method, params: &P) -> Result<T, ClientError>
    where
        P: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        let params =
            serde_json::to_value(params).map_err(|e| ClientError::Decode(e.to_string()))?;
        let value = self.call_raw(&Request::new(method, params)).await?;
        serde_json::from_value(value).map_err(|e| ClientError::Decode(e.to_string()))
    }

    /// Send one request and return the raw response object.
    pub async fn call_raw(&self, request: &Request) -> Result<Value, ClientError> {
        let body = serde_json::to_vec(request).map_err(|e| ClientError::Decode(e.to_string()))?;
        let deadline = Instant::now() + self.timeout;

        let exchange = async {
            let mut stream = self.connect(deadline).await?;
            write_frame(&mut stream, &body).await?;
            Ok::<_, ClientError>(read_frame(&mut stream).await?)
        };
        let response = tokio::time::timeout_at(deadline, exchange)
            .await
            .map_err(|_| ClientError::Timeout(self.timeout))??;

        let value: Value =
            serde_json::from_slice(&response).map_err(|e| ClientError::Decode(e.to_string()))?;
        if let Some(message) = value.get("error").and_then(Value::as_str) {
            return Err(ClientError::Service(message.to_owned()));
        }
        Ok(value)
    }

    async fn connect(&self, deadline: Instant) -> Result<UnixStream, ClientError> {
        loop {
            match UnixStream::connect(&self.socket_path).await {
                Ok(stream) => return Ok(stream),
                Err(e) if Instant::now() + CLIENT_CONNECT_RETRY_INTERVAL < deadline => {
                    debug!(socket = %self.socket_path.display(), error = %e, "connect failed; retrying");
                    tokio::time::sleep(CLIENT_CONNECT_RETRY_INTERVAL).await;
                }
                Err(e) => return Err(TransportError::Io(e).into()),
            }
        }
    }
}

/// Check a [`SignedResponse`] offline against the public key it carries.
///
/// This proves the response is internally consistent. Callers that pin a
/// known service key should also compare `public_key` with it.
pub fn verify_signed_response(response: &SignedResponse) -> Result<bool, ClientError> {
    let provider = Ed25519Provider::new();
    let public_key = provider
        .import_public_key_pem(&response.public_key)
        .map_err(|e| ClientError::Decode(e.to_string()))?;
    let payload = BASE64
        .decode(&response.signed_payload)
        .map_err(|e| ClientError::Decode(format!("signed_payload: {e}")))?;
    let signature = BASE64
        .decode(&response.signature)
        .map_err(|e| ClientError::Decode(format!("signature: {e}")))?;
    Ok(provider.verify(&public_key, &payload, &signature))
}
