//! # CLI Interface
//!
//! Defines the command-line argument structure for `stampd` using `clap`
//! derive. `run` hosts the service; every other subcommand is a thin client
//! of a running instance.

use clap::{Args, Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

use stamp_core::config::{DEFAULT_KEY_PATH, DEFAULT_SOCKET_PATH};

/// Stamp local key-custody service.
///
/// Holds one Ed25519 signing key, signs for local clients over a Unix
/// socket, and can split the key into threshold shares for offline backup.
#[derive(Parser, Debug)]
#[command(
    name = "stampd",
    about = "Stamp local key-custody service",
    version,
    propagate_version = true
)]
pub struct StampCli {
    /// Path of the service's Unix domain socket.
    #[arg(long, short = 's', global = true, env = "STAMP_SOCKET", default_value = DEFAULT_SOCKET_PATH)]
    pub socket: PathBuf,

    /// Log output format.
    #[arg(long, global = true, value_enum, default_value_t = LogFormatArg::Pretty)]
    pub log_format: LogFormatArg,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LogFormatArg {
    Pretty,
    Json,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Host the service until SIGINT or SIGTERM.
    Run(RunArgs),
    /// Show whether the service is up and which key it holds.
    Status,
    /// Sign a health-check message and verify the result locally.
    TestStamp,
    /// Sign a JSON object payload.
    Sign(SignArgs),
    /// Split the key into shares and write one file per share.
    CreateShares(CreateSharesArgs),
    /// Check a share file against a commitment.
    VerifyShare(VerifyShareArgs),
    /// Restore a key from shares.
    #[command(subcommand)]
    Recover(RecoverCommand),
    /// Irreversibly destroy the key.
    DeleteKey(DeleteKeyArgs),
    /// Print version information and exit.
    Version,
}

#[derive(Args, Debug)]
pub struct RunArgs {
    /// Path of the encrypted key record.
    #[arg(long, env = "STAMP_KEY_PATH", default_value = DEFAULT_KEY_PATH)]
    pub key_path: PathBuf,

    /// Permission bits for the socket file, in octal.
    #[arg(long, env = "STAMP_SOCKET_MODE", default_value = "666", value_parser = parse_octal_mode)]
    pub socket_mode: u32,

    /// Directory for the daily-rolling audit log. Audit events reach the
    /// console log either way.
    #[arg(long, env = "STAMP_AUDIT_LOG_DIR")]
    pub audit_log_dir: Option<PathBuf>,

    /// Start without a key when none is stored, so it can be recovered
    /// from shares, instead of generating a fresh one.
    #[arg(long)]
    pub no_generate: bool,
}

#[derive(Args, Debug)]
pub struct SignArgs {
    /// Name of the operation being signed, for the audit trail.
    #[arg(long)]
    pub operation: String,

    /// Identity of the requester, for the audit trail.
    #[arg(long, default_value = "stampd-cli")]
    pub requester_id: String,

    /// JSON object to sign.
    #[arg(long)]
    pub payload: String,
}

#[derive(Args, Debug)]
pub struct CreateSharesArgs {
    /// Number of shares to create.
    #[arg(long, short = 'n', default_value_t = 5)]
    pub total: usize,

    /// Number of shares needed to recover.
    #[arg(long, short = 't', default_value_t = 3)]
    pub threshold: usize,

    /// Who requested the split, for the audit trail.
    #[arg(long, env = "USER", default_value = "unknown")]
    pub initiator: String,

    /// Directory to write the share files into. Created if missing.
    #[arg(long, short = 'o')]
    pub output_dir: PathBuf,
}

#[derive(Args, Debug)]
pub struct VerifyShareArgs {
    /// Share file written by `create-shares`.
    pub share_file: PathBuf,

    /// Expected commitment. Taken from the share itself when omitted.
    #[arg(long)]
    pub commitment: Option<String>,
}

#[derive(Subcommand, Debug)]
pub enum RecoverCommand {
    /// Open a recovery session.
    Start {
        /// Number of shares the session collects before reconstructing.
        #[arg(long, short = 't')]
        threshold: usize,
    },
    /// Provide one share file to the open session.
    AddShare {
        share_file: PathBuf,
    },
    /// Show session progress.
    Status,
    /// Abandon the session and discard collected shares.
    Reset,
}

#[derive(Args, Debug)]
pub struct DeleteKeyArgs {
    /// Required. Confirms that the key should be destroyed.
    #[arg(long)]
    pub confirm: bool,
}

fn parse_octal_mode(s: &str) -> Result<u32, String> {
    let mode = u32::from_str_radix(s.trim_start_matches("0o"), 8)
        .map_err(|e| format!("invalid octal mode {s:?}: {e}"))?;
    if mode > 0o777 {
        return Err(format!("mode {s} has bits outside 0o777"));
    }
    Ok(mode)
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn verify_cli_structure() {
        StampCli::command().debug_assert();
    }

    #[test]
    fn parses_recover_add_share() {
        let cli = StampCli::try_parse_from([
            "stampd",
            "--socket",
            "/tmp/s.sock",
            "recover",
            "add-share",
            "share-1.json",
        ])
        .unwrap();
        assert_eq!(cli.socket, PathBuf::from("/tmp/s.sock"));
        assert!(matches!(
            cli.command,
            Commands::Recover(RecoverCommand::AddShare { ref share_file })
                if share_file == &PathBuf::from("share-1.json")
        ));
    }

    #[test]
    fn octal_mode_parsing() {
        assert_eq!(parse_octal_mode("660"), Ok(0o660));
        assert_eq!(parse_octal_mode("0o600"), Ok(0o600));
        assert!(parse_octal_mode("999").is_err());
        assert!(parse_octal_mode("1777").is_err());
    }
}
