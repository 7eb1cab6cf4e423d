//! Operator binary for the attest key store.
//!
//! ```text
//! attest-node --version-json
//! attest-node [--config <path>] <init|status|rotate-signing|rotate-master|snapshot <out>>
//! ```
//!
//! The keyring wrapping secret is read from the environment variable named in
//! the configuration (`ATTEST_KEYRING_SECRET` by default).

use anyhow::{bail, Context};
use attest_core::{logging, Config};
use attest_provenance::{MemoryRecordStore, ProvenanceService};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;

const NODE_PROTOCOL_VERSION: u32 = 1;
const KEYRING_FORMAT_VERSION: u32 = 1;

#[derive(Debug, Serialize)]
struct NodeVersionHandshake {
    version: &'static str,
    keyring_format: u32,
    protocol_version: u32,
}

#[derive(Debug, PartialEq, Eq)]
enum Command {
    Init,
    Status,
    RotateSigning,
    RotateMaster,
    Snapshot(PathBuf),
}

#[derive(Debug, PartialEq, Eq)]
struct Invocation {
    config_path: Option<PathBuf>,
    command: Command,
}

fn main() -> anyhow::Result<()> {
    let args: Vec<String> = std::env::args().skip(1).collect();

    if args.iter().any(|arg| arg == "--version-json") {
        let handshake = NodeVersionHandshake {
            version: env!("CARGO_PKG_VERSION"),
            keyring_format: KEYRING_FORMAT_VERSION,
            protocol_version: NODE_PROTOCOL_VERSION,
        };
        println!("{}", serde_json::to_string(&handshake)?);
        return Ok(());
    }

    let invocation = parse_args(&args)?;
    let config = match &invocation.config_path {
        Some(path) => Config::from_file(path)
            .with_context(|| format!("failed to load config from {}", path.display()))?,
        None => Config::default_config(),
    };
    logging::init_with(&config.logging);

    run(&config, invocation.command)
}

fn run(config: &Config, command: Command) -> anyhow::Result<()> {
    if command == Command::Status && !config.key_store.path.exists() {
        bail!(
            "no keyring at {}; run `attest-node init` first",
            config.key_store.path.display()
        );
    }

    let service = ProvenanceService::open(config, Arc::new(MemoryRecordStore::new()))
        .context("failed to open key store")?;

    match command {
        Command::Init | Command::Status => {
            print_json(&service.key_info()?)?;
        }
        Command::RotateSigning => {
            let info = service.rotate_signing_keys()?;
            tracing::info!(key_id = %info.key_id, version = info.version, "Signing keys rotated");
            print_json(&info)?;
        }
        Command::RotateMaster => {
            let info = service.rotate_master_key()?;
            tracing::info!(version = info.version, "Master key rotated");
            print_json(&info)?;
        }
        Command::Snapshot(out) => {
            let blob = service.backup_snapshot()?;
            std::fs::write(&out, &blob)
                .with_context(|| format!("failed to write snapshot to {}", out.display()))?;
            tracing::info!(path = %out.display(), bytes = blob.len(), "Wrote keyring snapshot");
        }
    }

    service.teardown();
    Ok(())
}

fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn parse_args(args: &[String]) -> anyhow::Result<Invocation> {
    let mut config_path = None;
    let mut positional = Vec::new();

    let mut args_iter = args.iter();
    while let Some(arg) = args_iter.next() {
        if arg == "--config" {
            match args_iter.next() {
                Some(path) => config_path = Some(PathBuf::from(path)),
                None => bail!("--config was provided without a path"),
            }
        } else {
            positional.push(arg.as_str());
        }
    }

    let command = match positional.as_slice() {
        ["init"] => Command::Init,
        ["status"] => Command::Status,
        ["rotate-signing"] => Command::RotateSigning,
        ["rotate-master"] => Command::RotateMaster,
        ["snapshot", out] => Command::Snapshot(PathBuf::from(*out)),
        ["snapshot"] => bail!("snapshot requires an output path"),
        [] => bail!("missing command: expected init, status, rotate-signing, rotate-master or snapshot"),
        other => bail!("unrecognized arguments: {}", other.join(" ")),
    };

    Ok(Invocation {
        config_path,
        command,
    })
}
