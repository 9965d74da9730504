//! # Unix Socket Listener
//!
//! One accept loop, one task per connection, one request per connection.
//!
//! ```text
//! accept ──▶ peer_cred ──▶ read_frame (timeout) ──▶ spawn_blocking(dispatch)
//!                                                        │
//!                              write_frame (timeout) ◀───┘
//! ```
//!
//! Dispatch runs on the blocking pool. A connection task that is dropped at
//! shutdown does not cancel a key mutation already in progress there; the
//! blocking section always runs to completion.
//!
//! ## Shutdown
//!
//! The accept loop watches a `tokio::sync::watch` channel. Once it fires (or
//! the sender is dropped) no new connections are accepted, in-flight
//! connections get [`ServiceConfig::shutdown_grace`] to finish, and the
//! socket file is removed.

use std::io;
use std::os::unix::fs::{MetadataExt, PermissionsExt};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tokio::net::{UnixListener, UnixStream};
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use super::dispatch::{error_frame, Caller, StampService};
use super::transport::{read_frame, write_frame, TransportError};
use crate::config::ServiceConfig;

/// A bound socket, ready to serve.
pub struct IpcServer {
    listener: UnixListener,
    socket_path: PathBuf,
    owner_uid: u32,
    io_timeout: Duration,
    accept_backoff: Duration,
    shutdown_grace: Duration,
    service: Arc<StampService>,
}

impl std::fmt::Debug for IpcServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IpcServer")
            .field("socket_path", &self.socket_path)
            .field("owner_uid", &self.owner_uid)
            .finish_non_exhaustive()
    }
}

impl IpcServer {
    /// Bind the socket described by `config`.
    ///
    /// A stale socket file from a previous run is removed first; a socket
    /// another instance is still serving is left alone and binding fails
    /// with [`io::ErrorKind::AddrInUse`]. The parent
    /// directory is created if needed, and the socket gets
    /// `config.socket_mode`. Whoever owns the resulting file is the
    /// privileged user.
    ///
    /// Must be called inside a tokio runtime.
    pub fn bind(config: &ServiceConfig, service: Arc<StampService>) -> io::Result<Self> {
        let path = &config.socket_path;
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        remove_stale_socket(path)?;

        let listener = UnixListener::bind(path)?;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(config.socket_mode))?;
        let owner_uid = std::fs::metadata(path)?.uid();

        info!(
            socket = %path.display(),
            mode = format_args!("{:o}", config.socket_mode),
            owner_uid,
            "listening on unix socket"
        );

        Ok(Self {
            listener,
            socket_path: path.clone(),
            owner_uid,
            io_timeout: config.io_timeout,
            accept_backoff: config.accept_backoff,
            shutdown_grace: config.shutdown_grace,
            service,
        })
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    pub fn owner_uid(&self) -> u32 {
        self.owner_uid
    }

    /// Accept and serve connections until `shutdown` fires.
    pub async fn serve(self, mut shutdown: watch::Receiver<bool>) -> io::Result<()> {
        let mut connections = JoinSet::new();

        loop {
            if *shutdown.borrow() {
                break;
            }

            tokio::select! {
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, _)) => {
                        let service = Arc::clone(&self.service);
                        let owner_uid = self.owner_uid;
                        let io_timeout = self.io_timeout;
                        connections.spawn(async move {
                            handle_connection(stream, service, owner_uid, io_timeout).await;
                        });
                    }
                    Err(e) => {
                        warn!(error = %e, backoff = ?self.accept_backoff, "accept failed");
                        tokio::select! {
                            _ = tokio::time::sleep(self.accept_backoff) => {}
                            _ = shutdown.changed() => {}
                        }
                    }
                },
                // Reap finished connection tasks so the set does not grow.
                Some(_) = connections.join_next(), if !connections.is_empty() => {}
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        // Sender gone: nobody can ask us to keep running.
                        break;
                    }
                }
            }
        }

        info!(in_flight = connections.len(), "listener stopping");
        drop(self.listener);

        let drain = async {
            while connections.join_next().await.is_some() {}
        };
        if tokio::time::timeout(self.shutdown_grace, drain).await.is_err() {
            warn!(
                grace = ?self.shutdown_grace,
                "in-flight connections did not finish in time; aborting"
            );
            connections.abort_all();
        }

        match std::fs::remove_file(&self.socket_path) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => warn!(error = %e, "could not remove socket file"),
        }
        info!("listener stopped");
        Ok(())
    }
}

/// Clear the way for a new listener at `path`.
///
/// A socket that still accepts connections belongs to a running instance,
/// and binding over it fails with `AddrInUse`. Only a file nobody listens
/// on is removed.
fn remove_stale_socket(path: &Path) -> io::Result<()> {
    match std::os::unix::net::UnixStream::connect(path) {
        Ok(_) => {
            return Err(io::Error::new(
                io::ErrorKind::AddrInUse,
                format!("another instance is listening on {}", path.display()),
            ))
        }
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
        Err(e) if e.kind() == io::ErrorKind::ConnectionRefused => {}
        Err(e) => return Err(e),
    }

    match std::fs::remove_file(path) {
        Ok(()) => {
            debug!(socket = %path.display(), "removed stale socket");
            Ok(())
        }
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}

async fn handle_connection(
    mut stream: UnixStream,
    service: Arc<StampService>,
    owner_uid: u32,
    io_timeout: Duration,
) {
    let uid = match stream.peer_cred() {
        Ok(cred) => Some(cred.uid()),
        Err(e) => {
            debug!(error = %e, "peer credentials unavailable");
            None
        }
    };
    let caller = Caller::from_peer(uid, owner_uid);

    let frame = match tokio::time::timeout(io_timeout, read_frame(&mut stream)).await {
        Ok(Ok(frame)) => frame,
        Ok(Err(TransportError::Closed)) => {
            debug!(caller = %caller.label(), "client closed before sending a request");
            return;
        }
        Ok(Err(TransportError::FrameTooLarge(len))) => {
            warn!(caller = %caller.label(), len, "oversized request refused");
            let body = error_frame("request too large");
            let _ = tokio::time::timeout(io_timeout, write_frame(&mut stream, &body)).await;
            return;
        }
        Ok(Err(e)) => {
            debug!(caller = %caller.label(), error = %e, "request read failed");
            return;
        }
        Err(_) => {
            debug!(caller = %caller.label(), "request read timed out");
            return;
        }
    };

    let dispatched = tokio::task::spawn_blocking(move || service.handle_request(&caller, &frame));
    let response = match dispatched.await {
        Ok(response) => response,
        Err(e) => {
            error!(caller = %caller.label(), error = %e, "request handler panicked");
            error_frame("internal error")
        }
    };

    match tokio::time::timeout(io_timeout, write_frame(&mut stream, &response)).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => debug!(caller = %caller.label(), error = %e, "response write failed"),
        Err(_) => debug!(caller = %caller.label(), "response write timed out"),
    }
}
