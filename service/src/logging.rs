//! # Structured Logging
//!
//! Initializes the `tracing` subscriber with configurable format (JSON or
//! pretty-printed) and environment-based filtering via `RUST_LOG`.
//!
//! All log output is written to stderr so that stdout stays free for the
//! JSON printed by the client subcommands.
//!
//! When an audit directory is given, events under the
//! [`AUDIT_TARGET`](stamp_core::audit::AUDIT_TARGET) target are also written
//! as JSON lines to `audit.log.<date>` in that directory, rolled daily.

use std::path::Path;

use tracing::Level;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling;
use tracing_subscriber::filter::Targets;
use tracing_subscriber::registry::Registry;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

use stamp_core::audit::AUDIT_TARGET;

use crate::cli::LogFormatArg;

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    /// Human-readable, colored output. Suitable for local development.
    Pretty,
    /// Machine-parseable JSON lines. Suitable for production log aggregation.
    Json,
}

impl From<LogFormatArg> for LogFormat {
    fn from(arg: LogFormatArg) -> Self {
        match arg {
            LogFormatArg::Pretty => LogFormat::Pretty,
            LogFormatArg::Json => LogFormat::Json,
        }
    }
}

/// Default console directive: crate logs at `level`, audit events always at
/// `info` so they reach the console when no audit directory is set.
pub fn default_directive(level: &str) -> String {
    format!("stampd={level},stamp_core={level},{AUDIT_TARGET}=info")
}

/// Initialize the global tracing subscriber.
///
/// Call this exactly once, early in `main()`.
///
/// The returned guard flushes the audit file on drop; keep it alive for the
/// life of the process.
///
/// # Environment
///
/// `RUST_LOG` overrides `directive` for the console layer:
///
/// ```text
/// RUST_LOG=stampd=debug,stamp_core=debug,stamp::audit=info
/// ```
pub fn init_logging(
    directive: &str,
    format: LogFormat,
    audit_dir: Option<&Path>,
) -> Option<WorkerGuard> {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(directive));

    let mut layers: Vec<Box<dyn Layer<Registry> + Send + Sync>> = Vec::new();

    layers.push(match format {
        LogFormat::Pretty => fmt::layer()
            .with_writer(std::io::stderr)
            .with_target(true)
            .with_thread_ids(false)
            .with_file(true)
            .with_line_number(true)
            .with_filter(env_filter)
            .boxed(),
        LogFormat::Json => fmt::layer()
            .json()
            .with_writer(std::io::stderr)
            .with_target(true)
            .with_filter(env_filter)
            .boxed(),
    });

    let guard = audit_dir.map(|dir| {
        let appender = rolling::daily(dir, "audit.log");
        let (writer, guard) = tracing_appender::non_blocking(appender);
        layers.push(
            fmt::layer()
                .json()
                .with_writer(writer)
                .with_current_span(false)
                .with_span_list(false)
                .with_target(true)
                .with_filter(Targets::new().with_target(AUDIT_TARGET, Level::INFO))
                .boxed(),
        );
        guard
    });

    tracing_subscriber::registry().with(layers).init();

    tracing::info!(format = ?format, audit_file = audit_dir.is_some(), "logging initialized");
    guard
}
