//! Bitarchivectl - Command line tool for the bitarchive monitor
//!
//! Usage:
//!   bitarchivectl status            - Show monitor health
//!   bitarchivectl replicas          - Show replica liveness and list dates
//!   bitarchivectl batches           - Show batch jobs in flight
//!   bitarchivectl file <name>       - Show the per-replica status of a file
//!   bitarchivectl missing <replica> - List files missing from a replica
//!   bitarchivectl corrupt <replica> - List corrupt copies on a replica
//!   bitarchivectl sweep             - Run a consistency sweep
//!   bitarchivectl correct <replica> <name> --credentials <secret>
//!                                   - Replace a corrupt copy from a good one
//!   bitarchivectl reupload <replica> <name>
//!                                   - Upload a missing file from a good copy

use std::path::PathBuf;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use serde::Deserialize;

use bitarchive::config::ArchiveConfig;

/// Bitarchive Control Tool
#[derive(Parser)]
#[command(name = "bitarchivectl")]
#[command(about = "Inspect and maintain a bitarchive", long_about = None)]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "/etc/bitarchive/config.toml")]
    config: PathBuf,

    /// API endpoint to connect to (overrides config)
    #[arg(short, long)]
    endpoint: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show monitor health
    Status,
    /// Show every replica with its liveness
    Replicas,
    /// Show batch jobs and corrections in flight
    Batches,
    /// Show the status of one file on every replica
    File {
        /// Archived file name
        name: String,
    },
    /// List files missing from a replica
    Missing {
        /// Replica id
        replica: String,
    },
    /// List files whose copy on a replica lost the checksum vote
    Corrupt {
        /// Replica id
        replica: String,
    },
    /// Re-vote the checksums of every known file
    Sweep,
    /// Replace a corrupt copy with one fetched from a replica holding a good copy
    Correct {
        /// Replica holding the corrupt copy
        replica: String,
        /// Archived file name
        name: String,
        /// Credentials of the replica
        #[arg(long)]
        credentials: String,
    },
    /// Upload a file a replica is missing from a replica holding a good copy
    Reupload {
        /// Replica missing the file
        replica: String,
        /// Archived file name
        name: String,
    },
    /// Check configuration file for errors
    CheckConfig {
        /// Path to config file to check (defaults to --config path)
        #[arg(short, long)]
        file: Option<PathBuf>,
    },
}

// ============ API Response Types ============

#[allow(dead_code)]
#[derive(Debug, Deserialize)]
struct HealthResponse {
    #[serde(default)]
    healthy: bool,
    #[serde(default)]
    node_id: String,
    #[serde(default)]
    known_replicas: usize,
    #[serde(default)]
    live_replicas: usize,
    #[serde(default)]
    files: u64,
    #[serde(default)]
    uptime_seconds: u64,
}

#[derive(Debug, Deserialize)]
struct ReplicaResponse {
    id: String,
    #[serde(default)]
    name: String,
    #[serde(default)]
    replica_type: String,
    #[serde(default)]
    alive: bool,
    #[serde(default)]
    last_seen_ms_ago: Option<u64>,
    #[serde(default)]
    checksum_updated: Option<String>,
    #[serde(default)]
    filelist_updated: Option<String>,
}

#[derive(Debug, Deserialize)]
struct BatchesResponse {
    #[serde(default)]
    corrections_pending: usize,
    #[serde(default)]
    batches: Vec<PendingBatch>,
    #[serde(default)]
    corrections: Vec<PendingCorrection>,
}

#[derive(Debug, Deserialize)]
struct PendingCorrection {
    filename: String,
    replica_id: String,
    phase: String,
    #[serde(default)]
    age_ms: u64,
}

#[derive(Debug, Deserialize)]
struct RepairResponse {
    filename: String,
    replica_id: String,
    removed_bytes: Option<usize>,
}

#[derive(Debug, Deserialize)]
struct PendingBatch {
    job_id: String,
    kind: String,
    #[serde(default)]
    expected: Vec<String>,
    #[serde(default)]
    replied: Vec<String>,
    #[serde(default)]
    remaining_ms: u64,
}

#[derive(Debug, Deserialize)]
struct FileReport {
    filename: String,
    checksum: Option<String>,
    replicas: Vec<ReplicaFileStatus>,
}

#[derive(Debug, Deserialize)]
struct ReplicaFileStatus {
    replica_id: String,
    checksum: Option<String>,
    checksum_status: String,
    file_list_status: String,
    upload_status: String,
}

#[derive(Debug, Deserialize)]
struct FileListResponse {
    replica_id: String,
    files: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct SweepReport {
    files: usize,
    agreed: usize,
    majority: usize,
    ties: usize,
    no_checksums: usize,
    corrupt_copies: usize,
}

#[derive(Debug, Deserialize)]
struct ErrorResponse {
    error: String,
    code: String,
}

// ============ Main ============

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let endpoint = cli.endpoint.clone().unwrap_or_else(|| endpoint_from_config(&cli.config));
    let client = reqwest::Client::new();

    let result = match &cli.command {
        Commands::Status => show_status(&client, &endpoint).await,
        Commands::Replicas => list_replicas(&client, &endpoint).await,
        Commands::Batches => list_batches(&client, &endpoint).await,
        Commands::File { name } => show_file(&client, &endpoint, name).await,
        Commands::Missing { replica } => list_files(&client, &endpoint, replica, "missing").await,
        Commands::Corrupt { replica } => list_files(&client, &endpoint, replica, "corrupt").await,
        Commands::Sweep => sweep(&client, &endpoint).await,
        Commands::Correct { replica, name, credentials } => {
            let body = serde_json::json!({ "credentials": credentials });
            repair(&client, &endpoint, replica, name, "correct", Some(body)).await
        }
        Commands::Reupload { replica, name } => repair(&client, &endpoint, replica, name, "upload", None).await,
        Commands::CheckConfig { file } => {
            let config_path = file.clone().unwrap_or_else(|| cli.config.clone());
            check_config(&config_path)
        }
    };

    if let Err(e) = result {
        eprintln!("Error: {:#}", e);
        std::process::exit(1);
    }
}

/// API endpoint from the config file, localhost:8080 otherwise
fn endpoint_from_config(path: &PathBuf) -> String {
    let fallback = "http://127.0.0.1:8080".to_string();
    let Ok(config) = ArchiveConfig::from_file(path) else {
        return fallback;
    };

    // Convert bind address to localhost if it's 0.0.0.0
    let addr = config.api.bind_address;
    if addr.starts_with("0.0.0.0") {
        format!("http://127.0.0.1:{}", addr.split(':').nth(1).unwrap_or("8080"))
    } else {
        format!("http://{}", addr)
    }
}

/// Decode a JSON response, turning API errors into readable failures
async fn decode<T: serde::de::DeserializeOwned>(response: reqwest::Response) -> anyhow::Result<T> {
    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        match serde_json::from_str::<ErrorResponse>(&body) {
            Ok(err) => bail!("{} ({})", err.error, err.code),
            Err(_) => bail!("API error: {}", status),
        }
    }
    response.json().await.context("Invalid response from the monitor")
}

async fn get<T: serde::de::DeserializeOwned>(client: &reqwest::Client, url: &str) -> anyhow::Result<T> {
    let response = client
        .get(url)
        .send()
        .await
        .with_context(|| format!("Failed to reach {}", url))?;
    decode(response).await
}

// ============ Commands ============

async fn show_status(client: &reqwest::Client, endpoint: &str) -> anyhow::Result<()> {
    let health: HealthResponse = get(client, &format!("{}/health", endpoint)).await?;

    println!();
    println!("Bitarchive Monitor (bitarchivectl v{})", env!("CARGO_PKG_VERSION"));
    println!("========================================");
    println!();
    println!("Node ID:   {}", health.node_id);
    println!("Replicas:  {} live of {}", health.live_replicas, health.known_replicas);
    println!("Files:     {}", health.files);
    println!("Uptime:    {}", format_duration(std::time::Duration::from_secs(health.uptime_seconds)));
    println!();

    Ok(())
}

async fn list_replicas(client: &reqwest::Client, endpoint: &str) -> anyhow::Result<()> {
    let replicas: Vec<ReplicaResponse> = get(client, &format!("{}/replicas", endpoint)).await?;

    println!();
    println!("{:<12} {:<20} {:<11} {:<10} {:<26} {:<26}",
        "ID", "NAME", "TYPE", "STATUS", "CHECKSUMS UPDATED", "FILELIST UPDATED");
    println!("{}", "-".repeat(108));

    for replica in &replicas {
        // Pad status to fixed width BEFORE adding color codes
        let status_padded = format!("{:<10}", if replica.alive { "Alive" } else { "Silent" });
        let status_colored = if replica.alive {
            format!("\x1b[32m{}\x1b[0m", status_padded)
        } else {
            format!("\x1b[31m{}\x1b[0m", status_padded)
        };

        println!("{:<12} {:<20} {:<11} {} {:<26} {:<26}",
            replica.id,
            replica.name,
            replica.replica_type,
            status_colored,
            replica.checksum_updated.as_deref().unwrap_or("never"),
            replica.filelist_updated.as_deref().unwrap_or("never"),
        );
        if let Some(ms) = replica.last_seen_ms_ago {
            println!("{:<12} last seen {} ms ago", "", ms);
        }
    }
    println!();

    Ok(())
}

async fn list_batches(client: &reqwest::Client, endpoint: &str) -> anyhow::Result<()> {
    let batches: BatchesResponse = get(client, &format!("{}/batches", endpoint)).await?;

    println!();
    println!("Batch jobs in flight: {}  |  Corrections pending: {}",
        batches.batches.len(), batches.corrections_pending);
    println!();

    for batch in &batches.batches {
        let waiting: Vec<&String> = batch
            .expected
            .iter()
            .filter(|id| !batch.replied.contains(id))
            .collect();
        println!("{}  {:<10} replied {}/{}  waiting for {:?}  ({} remaining)",
            batch.job_id,
            batch.kind,
            batch.replied.len(),
            batch.expected.len(),
            waiting,
            format_duration(std::time::Duration::from_millis(batch.remaining_ms)),
        );
    }
    for correction in &batches.corrections {
        println!("correction '{}' on {}  waiting for {} reply  ({} old)",
            correction.filename,
            correction.replica_id,
            correction.phase,
            format_duration(std::time::Duration::from_millis(correction.age_ms)),
        );
    }

    Ok(())
}

async fn show_file(client: &reqwest::Client, endpoint: &str, name: &str) -> anyhow::Result<()> {
    let report: FileReport = get(client, &format!("{}/files/{}", endpoint, name)).await?;

    println!();
    println!("File:      {}", report.filename);
    println!("Checksum:  {}", report.checksum.as_deref().unwrap_or("(undecided)"));
    println!();
    println!("{:<12} {:<66} {:<9} {:<9} {:<20}",
        "REPLICA", "CHECKSUM", "VOTE", "LISTING", "UPLOAD");
    println!("{}", "-".repeat(118));
    for entry in &report.replicas {
        println!("{:<12} {:<66} {:<9} {:<9} {:<20}",
            entry.replica_id,
            entry.checksum.as_deref().unwrap_or("-"),
            entry.checksum_status,
            entry.file_list_status,
            entry.upload_status,
        );
    }
    println!();

    Ok(())
}

async fn list_files(
    client: &reqwest::Client,
    endpoint: &str,
    replica: &str,
    which: &str,
) -> anyhow::Result<()> {
    let listing: FileListResponse =
        get(client, &format!("{}/replicas/{}/{}", endpoint, replica, which)).await?;

    if listing.files.is_empty() {
        println!("No {} files on replica {}", which, listing.replica_id);
        return Ok(());
    }
    for file in &listing.files {
        println!("{}", file);
    }
    eprintln!("{} {} files on replica {}", listing.files.len(), which, listing.replica_id);

    Ok(())
}

async fn sweep(client: &reqwest::Client, endpoint: &str) -> anyhow::Result<()> {
    let url = format!("{}/sweep", endpoint);
    println!("Running consistency sweep...");

    let response = client
        .post(&url)
        .send()
        .await
        .with_context(|| format!("Failed to reach {}", url))?;
    let report: SweepReport = decode(response).await?;

    println!();
    println!("Files:           {}", report.files);
    println!("Agreed:          {}", report.agreed);
    println!("By majority:     {}", report.majority);
    println!("Ties:            {}", report.ties);
    println!("No checksums:    {}", report.no_checksums);
    println!("Corrupt copies:  {}", report.corrupt_copies);
    if report.ties > 0 || report.corrupt_copies > 0 {
        println!();
        println!("\x1b[33m⚠ Some files need attention; see `bitarchivectl corrupt <replica>`\x1b[0m");
    }
    println!();

    Ok(())
}

async fn repair(
    client: &reqwest::Client,
    endpoint: &str,
    replica: &str,
    name: &str,
    action: &str,
    body: Option<serde_json::Value>,
) -> anyhow::Result<()> {
    let url = format!("{}/replicas/{}/files/{}/{}", endpoint, replica, name, action);
    println!("Repairing '{}' on replica {}...", name, replica);

    let mut request = client.post(&url);
    if let Some(body) = body {
        request = request.json(&body);
    }
    let response = request
        .send()
        .await
        .with_context(|| format!("Failed to reach {}", url))?;
    let done: RepairResponse = decode(response).await?;

    print!("\x1b[1;32m✓\x1b[0m '{}' on replica {} now matches the canonical checksum", done.filename, done.replica_id);
    match done.removed_bytes {
        Some(bytes) => println!(" ({} byte bad copy moved to the attic)", bytes),
        None => println!(),
    }

    Ok(())
}

fn check_config(path: &PathBuf) -> anyhow::Result<()> {
    println!();
    println!("\x1b[1;36mBitarchive Configuration Check\x1b[0m");
    println!();

    if !path.exists() {
        bail!("Config file not found: {}", path.display());
    }
    println!("\x1b[1;32m✓\x1b[0m Config file: {}", path.display());

    let config = ArchiveConfig::from_file(path)
        .with_context(|| format!("Invalid configuration in {}", path.display()))?;
    println!("\x1b[1;32m✓\x1b[0m Configuration is valid");
    println!("\x1b[1;32m✓\x1b[0m Node ID: {} ({:?})", config.node.id, config.node.role);

    let mut warnings = Vec::new();
    for replica in &config.replicas {
        if replica.address.is_none() && replica.id != config.node.id {
            warnings.push(format!("replica '{}' has no address; it is only reachable in standalone mode", replica.id));
        }
    }
    if config.monitor.single_checksum_timeout_ms > config.monitor.batch_timeout_ms {
        warnings.push("monitor.single_checksum_timeout_ms exceeds monitor.batch_timeout_ms".to_string());
    }
    if config.replica.heartbeat_interval_ms >= config.monitor.acceptable_heartbeat_delay_ms {
        warnings.push(
            "replica.heartbeat_interval_ms should be well below monitor.acceptable_heartbeat_delay_ms".to_string(),
        );
    }

    println!();
    for warning in &warnings {
        println!("\x1b[1;33m⚠ WARNING:\x1b[0m {}", warning);
    }
    if warnings.is_empty() {
        println!("\x1b[1;32mNo warnings\x1b[0m");
    }
    println!();

    Ok(())
}

fn format_duration(d: std::time::Duration) -> String {
    let secs = d.as_secs();
    if secs >= 86400 {
        format!("{}d {}h", secs / 86400, (secs % 86400) / 3600)
    } else if secs >= 3600 {
        format!("{}h {}m", secs / 3600, (secs % 3600) / 60)
    } else if secs >= 60 {
        format!("{}m {}s", secs / 60, secs % 60)
    } else {
        format!("{}s", secs)
    }
}
