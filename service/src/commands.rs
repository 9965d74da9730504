//! Client-side subcommands.
//!
//! Each one opens a [`StampClient`] on the configured socket, makes one or
//! two calls and prints the result as JSON on stdout. Errors from the
//! service come back as `anyhow` errors with the service's message.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use serde::Serialize;
use serde_json::{Map, Value};

use stamp_core::client::{verify_signed_response, StampClient};
use stamp_core::server::ShareCreationOptions;
use stamp_core::sharing::{Share, ShareBundle};

use crate::cli::{CreateSharesArgs, RecoverCommand, SignArgs, VerifyShareArgs};

/// Bundle metadata written beside the share files. Carries no payloads.
#[derive(Debug, Serialize)]
struct BundleManifest<'a> {
    algorithm: &'a str,
    public_key: &'a str,
    commitment: &'a str,
    threshold: u8,
    total_shares: u8,
    created_at: chrono::DateTime<chrono::Utc>,
    share_files: Vec<String>,
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

pub async fn status(client: &StampClient) -> Result<()> {
    let status = client
        .get_status()
        .await
        .with_context(|| format!("querying {}", client.socket_path().display()))?;
    print_json(&status)
}

pub async fn test_stamp(client: &StampClient) -> Result<()> {
    let stamp = client.test_stamp().await.context("health-check signature")?;
    if !verify_signed_response(&stamp)? {
        bail!("service returned a signature that does not verify");
    }
    print_json(&stamp)
}

pub async fn sign(client: &StampClient, args: SignArgs) -> Result<()> {
    let payload: Map<String, Value> = match serde_json::from_str(&args.payload)
        .context("--payload is not valid JSON")?
    {
        Value::Object(map) => map,
        _ => bail!("--payload must be a JSON object"),
    };
    let signed = client
        .sign(&args.operation, &args.requester_id, payload)
        .await
        .context("signing request")?;
    print_json(&signed)
}

pub async fn create_shares(client: &StampClient, args: CreateSharesArgs) -> Result<()> {
    let options = ShareCreationOptions {
        total_shares: args.total,
        threshold: args.threshold,
        initiator: args.initiator,
    };
    let bundle = client
        .create_shares(&options)
        .await
        .context("creating shares")?;
    let files = write_bundle(&bundle, &args.output_dir)?;

    tracing::info!(
        shares = files.len(),
        threshold = args.threshold,
        dir = %args.output_dir.display(),
        "share files written"
    );
    for file in &files {
        println!("{}", file.display());
    }
    Ok(())
}

/// Write one `share-<index>.json` per share plus `bundle.json`.
fn write_bundle(bundle: &ShareBundle, dir: &Path) -> Result<Vec<PathBuf>> {
    fs::create_dir_all(dir).with_context(|| format!("creating {}", dir.display()))?;

    let mut written = Vec::with_capacity(bundle.shares.len());
    for share in &bundle.shares {
        let path = dir.join(format!("share-{}.json", share.index));
        write_private(&path, &serde_json::to_vec_pretty(share)?)?;
        written.push(path);
    }

    let first = bundle.shares.first().context("service returned no shares")?;
    let manifest = BundleManifest {
        algorithm: &bundle.algorithm,
        public_key: &bundle.public_key,
        commitment: &bundle.commitment,
        threshold: first.threshold,
        total_shares: first.total_shares,
        created_at: first.created_at,
        share_files: written
            .iter()
            .filter_map(|p| p.file_name())
            .map(|n| n.to_string_lossy().into_owned())
            .collect(),
    };
    let manifest_path = dir.join("bundle.json");
    fs::write(&manifest_path, serde_json::to_vec_pretty(&manifest)?)
        .with_context(|| format!("writing {}", manifest_path.display()))?;

    Ok(written)
}

fn write_private(path: &Path, bytes: &[u8]) -> Result<()> {
    use std::io::Write;
    use std::os::unix::fs::OpenOptionsExt;

    let mut file = fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .mode(0o600)
        .open(path)
        .with_context(|| format!("creating {}", path.display()))?;
    file.write_all(bytes)
        .with_context(|| format!("writing {}", path.display()))?;
    Ok(())
}

fn read_share(path: &Path) -> Result<Share> {
    let bytes = fs::read(path).with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_slice(&bytes).with_context(|| format!("{} is not a share file", path.display()))
}

pub async fn verify_share(client: &StampClient, args: VerifyShareArgs) -> Result<()> {
    let share = read_share(&args.share_file)?;
    let commitment = args.commitment.unwrap_or_else(|| share.commitment.clone());
    let verdict = client.verify_share(&share, &commitment).await?;
    print_json(&verdict)?;
    if !verdict.is_valid {
        bail!("share {} is not valid: {}", verdict.share_index, verdict.message);
    }
    Ok(())
}

pub async fn recover(client: &StampClient, command: RecoverCommand) -> Result<()> {
    let status = match command {
        RecoverCommand::Start { threshold } => client.recover_start(threshold).await?,
        RecoverCommand::AddShare { share_file } => {
            let share = read_share(&share_file)?;
            client.recover_provide_share(&share).await?
        }
        RecoverCommand::Status => client.recover_status().await?,
        RecoverCommand::Reset => client.recover_reset().await?,
    };
    print_json(&status)
}

pub async fn delete_key(client: &StampClient, confirm: bool) -> Result<()> {
    if !confirm {
        bail!("refusing to delete the key without --confirm");
    }
    let response = client.delete_key(true).await?;
    print_json(&response)
}
