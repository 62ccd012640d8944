//! Bitarchive - Replicated Preservation Archive
//!
//! Runs a monitor node, a replica node, or a whole archive in one process.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use bitarchive::api::HttpServer;
use bitarchive::config::{ArchiveConfig, NodeRole};
use bitarchive::error::{Error, Result};
use bitarchive::monitor::MonitorServer;
use bitarchive::notify::{Notifier, TracingNotifier};
use bitarchive::replica::{Archive, HeartbeatSender, ReplicaServer, SystemSpaceProbe};
use bitarchive::router::MessageRouter;
use bitarchive::state::ReplicaStore;
use bitarchive::transport::{LocalTransport, TcpRoutes, TcpTransport, Transport};

/// Bitarchive - Replicated Preservation Archive
#[derive(Parser)]
#[command(name = "bitarchive")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "bitarchive.toml")]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the monitor node (batch coordination, reconciliation, admin API)
    Monitor,

    /// Run a replica server node
    Replica,

    /// Run the monitor and every configured replica in one process
    Standalone,

    /// Initialize a new configuration file
    Init {
        /// Output path for configuration file
        #[arg(short, long, default_value = "bitarchive.toml")]
        output: PathBuf,

        /// Node ID (a replica id for replica nodes)
        #[arg(long, default_value = "monitor")]
        node_id: String,

        /// Generate a replica configuration instead of a monitor one
        #[arg(long)]
        replica: bool,
    },

    /// Validate configuration file
    Validate,

    /// Show node information
    Info,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    init_logging(&cli.log_level);

    match cli.command {
        Commands::Monitor => run_node(cli.config, NodeRole::Monitor).await,
        Commands::Replica => run_node(cli.config, NodeRole::Replica).await,
        Commands::Standalone => run_standalone(cli.config).await,
        Commands::Init { output, node_id, replica } => run_init(output, node_id, replica),
        Commands::Validate => run_validate(cli.config),
        Commands::Info => run_info(cli.config),
    }
}

/// Initialize logging
fn init_logging(level: &str) {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| level.into());

    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}

/// Load the configuration, logging a helpful message on failure
fn load_config(config_path: &PathBuf) -> Result<ArchiveConfig> {
    match ArchiveConfig::from_file(config_path) {
        Ok(c) => {
            tracing::info!("Loaded configuration for node: {}", c.node.id);
            Ok(c)
        }
        Err(e) => {
            tracing::error!("Failed to load configuration from {:?}: {}", config_path, e);
            tracing::error!("Please check that the config file exists and is valid TOML");
            Err(e)
        }
    }
}

/// Remote destinations as seen from this node
fn tcp_routes(config: &ArchiveConfig) -> TcpRoutes {
    let replicas = config
        .replicas
        .iter()
        .filter(|r| r.id != config.node.id)
        .filter_map(|r| r.address.clone().map(|address| (r.id.clone(), address)))
        .collect();

    // Named clients wait for their replies inside the monitor process
    let monitor = match config.node.role {
        NodeRole::Monitor => None,
        NodeRole::Replica => config.monitor.address.clone(),
    };

    TcpRoutes {
        monitor: monitor.clone(),
        replicas,
        clients: monitor,
    }
}

/// Start the monitor and its message loop
async fn spawn_monitor(
    config: &ArchiveConfig,
    transport: Arc<dyn Transport>,
    notifier: Arc<dyn Notifier>,
    shutdown: watch::Receiver<bool>,
) -> Result<(Arc<MonitorServer>, JoinHandle<Result<()>>)> {
    let store = match ReplicaStore::open(config.state_dir(), config.known_replicas()) {
        Ok(s) => Arc::new(s),
        Err(e) => {
            tracing::error!("Failed to open replica store in {:?}: {}", config.state_dir(), e);
            return Err(e);
        }
    };
    tracing::info!(
        "Replica store opened: {} replicas, {} files",
        store.replicas().len(),
        store.file_count().await?
    );

    let monitor = Arc::new(MonitorServer::new(config, store, Arc::clone(&transport), notifier));
    let inbox = monitor.start().await?;
    let router = MessageRouter::new(Arc::clone(&monitor), transport);
    let handle = tokio::spawn(router.run(inbox, shutdown));

    Ok((monitor, handle))
}

/// Start a replica server, its message loop and its heartbeat
async fn spawn_replica(
    replica_id: String,
    storage_roots: &[PathBuf],
    config: &ArchiveConfig,
    transport: Arc<dyn Transport>,
    notifier: Arc<dyn Notifier>,
    shutdown: watch::Receiver<bool>,
) -> Result<Vec<JoinHandle<Result<()>>>> {
    let archive = match Archive::open(
        storage_roots,
        config.replica.min_space_left,
        Box::new(SystemSpaceProbe),
    ) {
        Ok(a) => Arc::new(a),
        Err(e) => {
            tracing::error!("Failed to open storage for replica {}: {}", replica_id, e);
            return Err(e);
        }
    };

    let server = Arc::new(ReplicaServer::new(
        replica_id.clone(),
        archive,
        config.replica.credentials.clone(),
        Arc::clone(&transport),
        notifier,
    ));
    let inbox = server.start().await?;
    let router = MessageRouter::new(server, Arc::clone(&transport));

    let heartbeat = HeartbeatSender::new(replica_id, config.heartbeat_interval(), transport);

    Ok(vec![
        tokio::spawn(router.run(inbox, shutdown.clone())),
        tokio::spawn(heartbeat.run(shutdown)),
    ])
}

/// Serve the admin API in the background
fn spawn_http(config: &ArchiveConfig, monitor: Arc<MonitorServer>) -> JoinHandle<()> {
    let http_server = HttpServer::new(config.api.clone(), config.node.id.clone(), monitor);
    tokio::spawn(async move {
        if let Err(e) = http_server.start().await {
            tracing::error!("HTTP server error: {}", e);
        }
    })
}

/// Wait for ctrl-c, then stop every loop
async fn wait_for_shutdown(
    shutdown_tx: watch::Sender<bool>,
    handles: Vec<JoinHandle<Result<()>>>,
) -> Result<()> {
    tokio::signal::ctrl_c().await?;
    tracing::info!("Received shutdown signal");

    let _ = shutdown_tx.send(true);
    for result in futures::future::join_all(handles).await {
        match result {
            Ok(Ok(())) => {}
            Ok(Err(e)) => tracing::warn!("Task ended with error: {}", e),
            Err(e) => tracing::warn!("Task panicked: {}", e),
        }
    }
    Ok(())
}

/// Start a monitor or replica node
async fn run_node(config_path: PathBuf, role: NodeRole) -> Result<()> {
    tracing::info!("Starting bitarchive {:?} node...", role);
    let config = load_config(&config_path)?;
    if config.node.role != role {
        let e = Error::Config(format!(
            "node '{}' is configured as {:?}, not {:?}",
            config.node.id, config.node.role, role
        ));
        tracing::error!("{}", e);
        return Err(e);
    }

    if let Err(e) = std::fs::create_dir_all(config.data_dir()) {
        tracing::error!("Failed to create data directory {:?}: {}", config.data_dir(), e);
        return Err(e.into());
    }

    let tcp = Arc::new(TcpTransport::new(
        config.node.bind_address.clone(),
        tcp_routes(&config),
        Duration::from_secs(5),
    ));
    let transport: Arc<dyn Transport> = tcp.clone();
    let notifier: Arc<dyn Notifier> = Arc::new(TracingNotifier);

    let listener = Arc::clone(&tcp);
    let transport_handle = tokio::spawn(async move {
        if let Err(e) = listener.start().await {
            tracing::error!("Transport error: {}", e);
        }
    });

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut http_handle = None;

    let handles = match config.node.role {
        NodeRole::Monitor => {
            let (monitor, handle) = spawn_monitor(&config, transport, notifier, shutdown_rx).await?;
            http_handle = Some(spawn_http(&config, monitor));
            vec![handle]
        }
        NodeRole::Replica => {
            if config.monitor.address.is_none() {
                tracing::warn!("monitor.address is not set; heartbeats and batch results cannot leave this node");
            }
            spawn_replica(
                config.node.id.clone(),
                &config.replica.storage_roots,
                &config,
                transport,
                notifier,
                shutdown_rx,
            )
            .await?
        }
    };

    tracing::info!("Node {} running as {:?}", config.node.id, config.node.role);
    wait_for_shutdown(shutdown_tx, handles).await?;

    // Cleanup
    tcp.stop();
    if let Some(handle) = http_handle {
        handle.abort();
    }
    transport_handle.abort();

    tracing::info!("Bitarchive shutdown complete");
    Ok(())
}

/// Run the monitor and all replicas in this process
async fn run_standalone(config_path: PathBuf) -> Result<()> {
    tracing::info!("Starting bitarchive in standalone mode...");
    let config = load_config(&config_path)?;

    let transport: Arc<dyn Transport> = Arc::new(LocalTransport::new());
    let notifier: Arc<dyn Notifier> = Arc::new(TracingNotifier);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    if config.replica.credentials.is_empty() {
        tracing::warn!("replica.credentials is empty; every remove-and-get will be refused");
    }

    let mut handles = Vec::new();
    for replica in &config.replicas {
        let roots = vec![config.data_dir().join("replicas").join(&replica.id)];
        handles.extend(
            spawn_replica(
                replica.id.clone(),
                &roots,
                &config,
                Arc::clone(&transport),
                Arc::clone(&notifier),
                shutdown_rx.clone(),
            )
            .await?,
        );
    }

    let (monitor, handle) = spawn_monitor(&config, transport, notifier, shutdown_rx).await?;
    handles.push(handle);
    let http_handle = spawn_http(&config, monitor);

    tracing::info!("Standalone archive running with {} replicas", config.replicas.len());
    wait_for_shutdown(shutdown_tx, handles).await?;
    http_handle.abort();

    tracing::info!("Bitarchive shutdown complete");
    Ok(())
}

/// Initialize configuration file
fn run_init(output: PathBuf, node_id: String, replica: bool) -> Result<()> {
    let (role, replica_id) = if replica {
        ("replica", node_id.clone())
    } else {
        ("monitor", "ONE".to_string())
    };

    let config_content = format!(r#"# Bitarchive Configuration
# Generated configuration file

[node]
id = "{node_id}"
role = "{role}"
bind_address = "0.0.0.0:7700"
data_dir = "/var/lib/bitarchive/{node_id}"

[[replicas]]
id = "{replica_id}"
name = "Replica {replica_id}"
replica_type = "bitarchive"
address = "127.0.0.1:7701"

[monitor]
address = "127.0.0.1:7700"
batch_timeout_ms = 1209600000
single_checksum_timeout_ms = 600000
acceptable_heartbeat_delay_ms = 60000
correction_timeout_ms = 3600000
fetch_timeout_ms = 600000

[replica]
storage_roots = ["/var/lib/bitarchive/{node_id}/storage"]
min_space_left = 104857600
heartbeat_interval_ms = 30000
credentials = "changeme"

[api]
enabled = true
bind_address = "0.0.0.0:8080"
cors_enabled = false

[logging]
level = "info"
format = "pretty"
"#);

    std::fs::write(&output, config_content)?;
    println!("Configuration file created: {}", output.display());
    println!("\nEdit the file to list your replicas and storage roots.");
    println!("Then start with: bitarchive --config {} {}", output.display(), role);

    Ok(())
}

/// Validate configuration
fn run_validate(config_path: PathBuf) -> Result<()> {
    match ArchiveConfig::from_file(&config_path) {
        Ok(config) => {
            println!("✓ Configuration is valid");
            println!("  Node ID: {}", config.node.id);
            println!("  Role: {:?}", config.node.role);
            println!("  Bind Address: {}", config.node.bind_address);
            println!("  Replicas: {}", config.replicas.len());
            Ok(())
        }
        Err(e) => {
            eprintln!("✗ Configuration error: {}", e);
            Err(e)
        }
    }
}

/// Show node information
fn run_info(config_path: PathBuf) -> Result<()> {
    let config = ArchiveConfig::from_file(&config_path)?;

    println!("Bitarchive Node Information");
    println!("===========================");
    println!();
    println!("Node ID:          {}", config.node.id);
    println!("Role:             {:?}", config.node.role);
    println!("Bind Address:     {}", config.node.bind_address);
    println!("Data Directory:   {}", config.data_dir().display());
    println!();
    println!("Replicas:");
    for replica in &config.replicas {
        println!(
            "  {:<14}  {:<10}  {}  ({})",
            replica.id,
            replica.replica_type.to_string(),
            replica.address.as_deref().unwrap_or("local"),
            replica.name
        );
    }
    println!();
    println!("Monitor Configuration:");
    println!("  Batch Timeout:  {} ms", config.monitor.batch_timeout_ms);
    println!("  Checksum Query: {} ms", config.monitor.single_checksum_timeout_ms);
    println!("  Liveness Delay: {} ms", config.monitor.acceptable_heartbeat_delay_ms);
    println!("  Correction Step: {} ms", config.monitor.correction_timeout_ms);
    println!("  Good-copy Fetch: {} ms", config.monitor.fetch_timeout_ms);
    if config.node.role == NodeRole::Replica {
        println!();
        println!("Replica Configuration:");
        println!("  Storage Roots:  {:?}", config.replica.storage_roots);
        println!("  Min Space Left: {} bytes", config.replica.min_space_left);
        println!("  Heartbeat:      {} ms", config.replica.heartbeat_interval_ms);
    }

    Ok(())
}
