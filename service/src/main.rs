// Copyright (c) 2026 ALAS Technology. MIT License.
// See LICENSE for details.

//! # Stamp Service
//!
//! Entry point for the `stampd` binary. `stampd run` hosts the key-custody
//! service on a Unix socket; the remaining subcommands are administrative
//! clients of a running instance:
//!
//! - `status`, `test-stamp`, `sign`
//! - `create-shares`, `verify-share`
//! - `recover start | add-share | status | reset`
//! - `delete-key --confirm`
//! - `version`

mod cli;
mod commands;
mod logging;

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::signal;
use tokio::sync::watch;

use stamp_core::audit::{AuditSink, TracingAuditSink};
use stamp_core::client::StampClient;
use stamp_core::config::{ServiceConfig, SIGNER_ID, SIGNING_ALGORITHM};
use stamp_core::crypto::Ed25519Provider;
use stamp_core::custody::{FileKeyStore, KeyCustodian};
use stamp_core::server::{IpcServer, StampService};
use stamp_core::sharing::ShamirSharder;

use cli::{Commands, RunArgs, StampCli};
use logging::LogFormat;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = StampCli::parse();
    let format = LogFormat::from(cli.log_format);

    match cli.command {
        Commands::Run(args) => run_service(&cli.socket, args, format).await,
        Commands::Version => {
            print_version();
            Ok(())
        }
        command => run_client(&cli.socket, command, format).await,
    }
}

/// Runs one administrative subcommand against a live service.
async fn run_client(socket: &Path, command: Commands, format: LogFormat) -> Result<()> {
    logging::init_logging(&logging::default_directive("warn"), format, None);
    let client = StampClient::new(socket);

    match command {
        Commands::Status => commands::status(&client).await,
        Commands::TestStamp => commands::test_stamp(&client).await,
        Commands::Sign(args) => commands::sign(&client, args).await,
        Commands::CreateShares(args) => commands::create_shares(&client, args).await,
        Commands::VerifyShare(args) => commands::verify_share(&client, args).await,
        Commands::Recover(command) => commands::recover(&client, command).await,
        Commands::DeleteKey(args) => commands::delete_key(&client, args.confirm).await,
        Commands::Run(_) | Commands::Version => anyhow::bail!("not a client subcommand"),
    }
}

/// Hosts the service until SIGINT or SIGTERM.
async fn run_service(socket: &Path, args: RunArgs, format: LogFormat) -> Result<()> {
    if let Some(dir) = &args.audit_log_dir {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("failed to create audit log directory: {}", dir.display()))?;
    }
    let _audit_guard = logging::init_logging(
        &logging::default_directive("info"),
        format,
        args.audit_log_dir.as_deref(),
    );

    let config = ServiceConfig {
        socket_path: socket.to_path_buf(),
        key_path: args.key_path,
        socket_mode: args.socket_mode,
        generate_if_missing: !args.no_generate,
        ..ServiceConfig::default()
    };
    tracing::info!(
        socket = %config.socket_path.display(),
        key_path = %config.key_path.display(),
        generate_if_missing = config.generate_if_missing,
        "starting stampd"
    );

    // --- Key custody ---
    if let Some(dir) = config.key_path.parent() {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("failed to create key directory: {}", dir.display()))?;
    }
    let store = FileKeyStore::open_machine_bound(&config.key_path)
        .with_context(|| format!("failed to open key store at {}", config.key_path.display()))?;
    let audit: Arc<dyn AuditSink> = Arc::new(TracingAuditSink);
    let custodian = Arc::new(KeyCustodian::new(
        Arc::new(Ed25519Provider::new()),
        Arc::new(store),
        Arc::clone(&audit),
    ));

    if custodian.load_key() {
        tracing::info!("signing key loaded");
    } else if config.generate_if_missing {
        if custodian.key_record_exists() {
            tracing::warn!("stored key record is unusable; generating a replacement");
        }
        custodian
            .generate_key()
            .context("failed to generate signing key")?;
    } else {
        tracing::warn!("no signing key loaded; waiting for recovery from shares");
    }
    if let Some(identity) = custodian.public_identity() {
        tracing::info!(algorithm = identity.algorithm, "public key:\n{}", identity.public_key_pem);
    }

    // --- Server ---
    let service = Arc::new(StampService::new(
        Arc::clone(&custodian),
        Arc::new(ShamirSharder),
        audit,
    ));
    let server = IpcServer::bind(&config, service)
        .with_context(|| format!("failed to bind socket {}", config.socket_path.display()))?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let server_task = tokio::spawn(server.serve(shutdown_rx));

    shutdown_signal().await;
    tracing::info!("shutdown signal received, draining connections");
    let _ = shutdown_tx.send(true);

    match server_task.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => tracing::error!(error = %e, "server error during shutdown"),
        Err(e) => tracing::error!(error = %e, "server task failed"),
    }

    custodian.unload();
    tracing::info!("stampd stopped");
    Ok(())
}

/// Prints version information to stdout.
fn print_version() {
    println!("stampd    {}", env!("CARGO_PKG_VERSION"));
    println!("signer    {SIGNER_ID}");
    println!("algorithm {SIGNING_ALGORITHM}");
}

/// Waits for SIGINT (Ctrl+C) or SIGTERM, whichever comes first.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
