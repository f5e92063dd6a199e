use aeon_sync_core::config::Config;
use aeon_sync_core::core_bandwidth::{CompressedBatch, CompressionEngine};
use aeon_sync_core::core_migration::{SchemaVersion, SchemaVersionManager, SemVer};
use aeon_sync_core::core_protocol::{Payload, SyncMessage, SyncProtocol};
use aeon_sync_core::logging::{init_logging_with_config, LogConfig, LogLevel};
use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use serde::Deserialize;
use serde_json::{json, Value};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

#[derive(Parser, Debug)]
#[command(name = "aeon-sync")]
#[command(author, version, about = "Offline tooling for the Aeon sync engine", long_about = None)]
struct Args {
    /// Set the log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "warn")]
    log_level: String,

    /// Enable JSON formatted logging
    #[arg(long)]
    json_logs: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Inspect or validate a sync message stored as JSON
    Message {
        #[command(subcommand)]
        action: MessageAction,
    },
    /// Compress a file into a compressed batch (JSON)
    Compress {
        input: PathBuf,
        output: PathBuf,
        /// Compression level, 1-9
        #[arg(long, default_value_t = 6)]
        level: u8,
    },
    /// Restore the original bytes of a compressed batch
    Decompress { input: PathBuf, output: PathBuf },
    /// Print or validate engine configuration
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
    /// Plan schema upgrades
    Migration {
        #[command(subcommand)]
        action: MigrationAction,
    },
}

#[derive(Subcommand, Debug)]
enum MessageAction {
    /// Check the envelope and typed structure of a message
    Validate { file: PathBuf },
    /// Print a summary of a message
    Inspect { file: PathBuf },
}

#[derive(Subcommand, Debug)]
enum ConfigAction {
    /// Print a configuration as TOML (defaults when no file is given)
    Print {
        /// Apply AEON_SYNC_* environment overrides
        #[arg(long)]
        env: bool,
        file: Option<PathBuf>,
    },
    /// Load and validate a TOML configuration file
    Validate { file: PathBuf },
}

#[derive(Subcommand, Debug)]
enum MigrationAction {
    /// Print the version hops from one schema version to another
    Path {
        /// JSON file describing schema versions and compatible pairs
        #[arg(long)]
        schema: PathBuf,
        from: SemVer,
        to: SemVer,
    },
}

/// Schema description consumed by `migration path`
#[derive(Debug, Deserialize)]
struct SchemaFile {
    versions: Vec<SchemaEntry>,
    #[serde(default)]
    compatible: Vec<(SemVer, SemVer)>,
}

#[derive(Debug, Deserialize)]
struct SchemaEntry {
    version: SemVer,
    #[serde(default)]
    description: String,
    #[serde(default)]
    breaking: bool,
}

fn read_message(path: &Path) -> Result<SyncMessage> {
    let raw = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    let value: Value = serde_json::from_str(&raw).with_context(|| format!("{} is not JSON", path.display()))?;
    SyncProtocol::validate_message(&value)?;
    let message: SyncMessage = serde_json::from_value(value).context("message does not match the wire format")?;
    SyncProtocol::validate(&message)?;
    Ok(message)
}

fn payload_summary(payload: &Payload) -> Value {
    match payload {
        Payload::Handshake(h) => json!({
            "nodeId": h.node_id,
            "protocolVersion": h.protocol_version,
            "did": h.did,
            "capabilities": h.capabilities,
            "hasToken": h.ucan.is_some(),
        }),
        Payload::SyncRequest(r) => json!({
            "sessionId": r.session_id,
            "operations": r.operations.len(),
            "algorithm": r.batch.algorithm,
            "originalSize": r.batch.original_size,
            "compressedSize": r.batch.compressed_size,
        }),
        Payload::SyncResponse(r) => json!({
            "requestId": r.request_id,
            "applied": r.applied.len(),
            "conflicts": r.conflicts.len(),
        }),
        Payload::Ack(a) => json!({ "ackedMessageId": a.acked_message_id, "operations": a.operation_ids.len() }),
        Payload::Error(e) => json!({ "code": e.code, "message": e.message, "retryable": e.retryable }),
        Payload::Sealed(s) => json!({ "sender": s.sender_did, "recipient": s.recipient_did, "ciphertextLength": s.ciphertext.len() }),
    }
}

fn inspect(message: &SyncMessage) -> Value {
    json!({
        "type": message.message_type,
        "version": message.version,
        "sender": message.sender,
        "receiver": message.receiver,
        "messageId": message.message_id,
        "timestamp": message.timestamp,
        "signed": message.is_signed(),
        "sealed": message.payload.is_sealed(),
        "payload": payload_summary(&message.payload),
    })
}

fn compress(input: &Path, output: &Path, level: u8) -> Result<()> {
    let bytes = std::fs::read(input).with_context(|| format!("reading {}", input.display()))?;
    let mut engine = CompressionEngine::new(level, 0);
    let batch = engine.compress(&bytes);
    info!(
        original = batch.original_size,
        compressed = batch.compressed_size,
        algorithm = ?batch.algorithm,
        "Compressed input"
    );
    std::fs::write(output, serde_json::to_vec_pretty(&batch)?).with_context(|| format!("writing {}", output.display()))?;
    println!("{} -> {} bytes ({:.2})", batch.original_size, batch.compressed_size, batch.ratio);
    Ok(())
}

fn decompress(input: &Path, output: &Path) -> Result<()> {
    let raw = std::fs::read(input).with_context(|| format!("reading {}", input.display()))?;
    let batch: CompressedBatch = serde_json::from_slice(&raw).context("input is not a compressed batch")?;
    let bytes = CompressionEngine::default().decompress(&batch)?;
    std::fs::write(output, &bytes).with_context(|| format!("writing {}", output.display()))?;
    println!("{} bytes restored", bytes.len());
    Ok(())
}

fn load_schema(path: &Path) -> Result<SchemaVersionManager> {
    let raw = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    let file: SchemaFile = serde_json::from_str(&raw).context("invalid schema file")?;
    let mut manager = SchemaVersionManager::new();
    for entry in file.versions {
        manager.register_version(SchemaVersion::new(entry.version, entry.description, entry.breaking))?;
    }
    for (from, to) in file.compatible {
        manager.mark_compatible(from, to)?;
    }
    debug!(versions = manager.get_versions().len(), "Loaded schema");
    Ok(manager)
}

fn run(command: Command) -> Result<()> {
    match command {
        Command::Message { action: MessageAction::Validate { file } } => {
            let message = read_message(&file)?;
            println!("valid {} message {} from {}", message.message_type, message.message_id, message.sender);
        }
        Command::Message { action: MessageAction::Inspect { file } } => {
            let message = read_message(&file)?;
            println!("{}", serde_json::to_string_pretty(&inspect(&message))?);
        }
        Command::Compress { input, output, level } => compress(&input, &output, level)?,
        Command::Decompress { input, output } => decompress(&input, &output)?,
        Command::Config { action: ConfigAction::Print { env, file } } => {
            let config = match (file, env) {
                (Some(_), true) => bail!("--env and a config file are mutually exclusive"),
                (Some(path), false) => Config::from_file(path)?,
                (None, true) => Config::from_env()?,
                (None, false) => Config::default(),
            };
            print!("{}", config.to_toml_string()?);
        }
        Command::Config { action: ConfigAction::Validate { file } } => {
            Config::from_file(&file)?;
            println!("{} is valid", file.display());
        }
        Command::Migration { action: MigrationAction::Path { schema, from, to } } => {
            let manager = load_schema(&schema)?;
            let path = manager.get_migration_path(from, to)?;
            let hops: Vec<String> = std::iter::once(from).chain(path).map(|v| v.to_string()).collect();
            println!("{}", hops.join(" -> "));
            if manager.crosses_breaking_change(from, to) {
                println!("warning: path crosses a breaking change");
            }
        }
    }
    Ok(())
}

fn main() -> Result<()> {
    let args = Args::parse();

    let log_level = LogLevel::parse(&args.log_level).unwrap_or_else(|| {
        eprintln!("Invalid log level '{}', using 'warn'", args.log_level);
        LogLevel::Warn
    });
    init_logging_with_config(LogConfig::new(log_level).json_format(args.json_logs))?;

    run(args.command)
}
