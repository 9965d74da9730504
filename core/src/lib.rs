// Copyright (c) 2026 ALAS Technology. MIT License.
// See LICENSE for details.

//! # Stamp Core Library
//!
//! Stamp is a local key-custody service. It holds exactly one long-lived
//! Ed25519 signing key, signs on behalf of local clients over a Unix domain
//! socket, and can split that key into threshold shares for offline backup
//! and later put it back together.
//!
//! ## Architecture
//!
//! Leaves first:
//!
//! - **crypto**: Ed25519 behind the [`SignatureProvider`](crypto::SignatureProvider)
//!   trait, AES-256-GCM sealing, SHA-256 helpers.
//! - **sharing**: Shamir secret sharing over GF(256) with a SHA-256
//!   commitment that catches tampered or mixed-up shares.
//! - **custody**: the [`KeyCustodian`](custody::KeyCustodian), sole owner of
//!   the live private key, plus the at-rest key stores.
//! - **server**: wire messages, the recovery state machine, the request
//!   dispatcher and the Unix socket listener.
//! - **client**: a typed client for the socket protocol.
//! - **audit**: the narrow event-recording interface everything above
//!   reports into.
//! - **config**: constants and runtime configuration.
//!
//! ## Ground rules
//!
//! 1. Key bytes never leave the process except as shares, and every copy
//!    is wiped on every exit path.
//! 2. No partial secrets. Reconstruction either verifies against the
//!    commitment or fails.
//! 3. Failures are typed. Only field-arithmetic invariant violations panic.

pub mod audit;
pub mod client;
pub mod config;
pub mod crypto;
pub mod custody;
pub mod server;
pub mod sharing;
