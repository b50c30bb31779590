//! HerdLead - Cluster Membership and Leader Election
//!
//! Runs cluster nodes that agree on liveness and leadership through a
//! coordination store and replicate accepted records from the leader.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tokio::task::JoinHandle;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use herdlead::agent::{ClusterAgent, ClusterHandle};
use herdlead::api::HttpServer;
use herdlead::config::HerdConfig;
use herdlead::network::{NetworkClient, ReplicationServer};
use herdlead::replication::{RecordLog, ReplicaApplier, ReplicationCoordinator};
use herdlead::state::{NodeIdentity, ViewReader};
use herdlead::store::{child_path, Connector, MemoryCoordinator};

/// HerdLead - cluster membership and leader election
#[derive(Parser)]
#[command(name = "herdlead")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "herdlead.toml")]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error); overrides the config file
    #[arg(short, long)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start a node on an embedded coordination store
    Start,

    /// Run several nodes in one process sharing a coordination store
    Simulate {
        /// Number of nodes
        #[arg(short, long, default_value_t = 3)]
        nodes: usize,

        /// First replication port; node i listens on base + i
        #[arg(long, default_value_t = 7700)]
        base_port: u16,

        /// First HTTP API port; node i serves on base + i
        #[arg(long, default_value_t = 8100)]
        api_base_port: u16,

        /// Expire the leader's session after this many seconds
        #[arg(long)]
        fail_leader_after: Option<u64>,
    },

    /// Check cluster status
    Status {
        /// Node API address to query
        #[arg(short, long, default_value = "localhost:8081")]
        address: String,
    },

    /// Initialize a new configuration file
    Init {
        /// Output path for configuration file
        #[arg(short, long, default_value = "herdlead.toml")]
        output: PathBuf,
    },

    /// Validate configuration file
    Validate,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // A missing or broken file is reported by the command that needs it
    let logging = HerdConfig::from_file(&cli.config)
        .map(|c| c.logging)
        .unwrap_or_default();
    init_logging(cli.log_level.as_deref().unwrap_or(&logging.level), &logging.format);

    match cli.command {
        Commands::Start => run_start(cli.config).await,
        Commands::Simulate {
            nodes,
            base_port,
            api_base_port,
            fail_leader_after,
        } => run_simulate(cli.config, nodes, base_port, api_base_port, fail_leader_after).await,
        Commands::Status { address } => run_status(address).await,
        Commands::Init { output } => run_init(output),
        Commands::Validate => run_validate(cli.config),
    }
}

/// Initialize logging
fn init_logging(level: &str, format: &str) {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| level.into());

    let compact = format == "compact";
    tracing_subscriber::registry()
        .with(env_filter)
        .with(compact.then(|| tracing_subscriber::fmt::layer().compact()))
        .with((!compact).then(|| tracing_subscriber::fmt::layer()))
        .init();
}

/// Everything one node runs
struct RunningNode {
    cluster: Arc<ClusterHandle>,
    replication: Arc<ReplicationServer>,
    tasks: Vec<JoinHandle<()>>,
}

impl RunningNode {
    async fn stop(self) {
        self.replication.stop();
        self.cluster.shutdown().await;
        for task in self.tasks {
            task.abort();
        }
    }
}

/// Join the cluster and start the replication listener and HTTP API
async fn launch_node(
    config: &HerdConfig,
    connector: Arc<dyn Connector>,
) -> herdlead::Result<RunningNode> {
    let identity = NodeIdentity::generate(&config.node.id_prefix, config.advertise_address());
    tracing::info!("Starting node {} ({})", identity.id, identity.address);

    let listener = tokio::net::TcpListener::bind(&config.node.bind_address).await?;
    let cluster = Arc::new(
        ClusterAgent::start(identity.clone(), connector, config.coordination.clone()).await?,
    );

    let log = Arc::new(RecordLog::new());
    let applier = Arc::new(ReplicaApplier::new(
        identity.id.clone(),
        cluster.reader(),
        Arc::clone(&log),
    ));
    let replication = Arc::new(ReplicationServer::new(applier));

    let transport = Arc::new(NetworkClient::new(
        config.replication.connect_timeout(),
        config.replication.send_timeout(),
    ));
    let coordinator = Arc::new(ReplicationCoordinator::new(
        identity.id.clone(),
        cluster.reader(),
        log,
        transport,
        config.replication.send_timeout(),
    ));
    let http = HttpServer::new(config.api.clone(), Arc::clone(&cluster), coordinator);

    let mut tasks = Vec::new();

    let server = Arc::clone(&replication);
    tasks.push(tokio::spawn(async move {
        if let Err(e) = server.serve(listener).await {
            tracing::error!("Replication listener error: {}", e);
        }
    }));

    tasks.push(tokio::spawn(async move {
        if let Err(e) = http.start().await {
            tracing::error!("HTTP server error: {}", e);
        }
    }));

    tasks.push(tokio::spawn(log_view_changes(cluster.reader())));

    Ok(RunningNode {
        cluster,
        replication,
        tasks,
    })
}

/// Log every published cluster view
async fn log_view_changes(mut reader: ViewReader) {
    while let Ok(view) = reader.changed().await {
        tracing::info!(
            "[{}] epoch {}: role={}, leader={}, live={:?}",
            view.self_id,
            view.epoch,
            if view.is_leader() { "LEADER" } else { "FOLLOWER" },
            view.leader_id.as_deref().unwrap_or("unknown"),
            view.live_ids()
        );
    }
}

/// Start a single node
async fn run_start(config_path: PathBuf) -> anyhow::Result<()> {
    let config = HerdConfig::from_file(&config_path)
        .with_context(|| format!("failed to load configuration from {}", config_path.display()))?;

    // The embedded store lives as long as this process
    let store = MemoryCoordinator::new();
    let node = launch_node(&config, Arc::new(store)).await?;

    tokio::signal::ctrl_c().await?;
    tracing::info!("Received shutdown signal");

    node.stop().await;
    tracing::info!("HerdLead shutdown complete");
    Ok(())
}

/// Run several nodes against one shared store
async fn run_simulate(
    config_path: PathBuf,
    nodes: usize,
    base_port: u16,
    api_base_port: u16,
    fail_leader_after: Option<u64>,
) -> anyhow::Result<()> {
    anyhow::ensure!(nodes > 0, "at least one node is required");

    let base = if config_path.exists() {
        HerdConfig::from_file(&config_path).with_context(|| {
            format!("failed to load configuration from {}", config_path.display())
        })?
    } else {
        HerdConfig::default()
    };

    let store = MemoryCoordinator::new();
    let mut running = Vec::with_capacity(nodes);

    for i in 0..nodes {
        let offset = u16::try_from(i).context("too many nodes")?;
        let mut config = base.clone();
        config.node.bind_address = format!("127.0.0.1:{}", base_port + offset);
        config.node.advertise_address = None;
        config.api.bind_address = format!("127.0.0.1:{}", api_base_port + offset);

        let node = launch_node(&config, Arc::new(store.clone()))
            .await
            .with_context(|| format!("failed to start node {}", i + 1))?;
        println!(
            "node {} -> {} (replication {}, api {})",
            i + 1,
            node.cluster.identity().id,
            config.node.bind_address,
            config.api.bind_address
        );
        running.push(node);
    }

    if let Some(secs) = fail_leader_after {
        let store = store.clone();
        let leader = running[0].cluster.reader();
        let live_path = base.coordination.live_nodes_path.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(secs)).await;
            if let Some(leader_id) = leader.current().leader_id.clone() {
                tracing::warn!("Expiring session of leader {}", leader_id);
                store.expire_owner(&child_path(&live_path, &leader_id)).await;
            }
        });
    }

    tokio::signal::ctrl_c().await?;
    tracing::info!("Received shutdown signal");

    for node in running {
        node.stop().await;
    }
    Ok(())
}

/// Check cluster status
async fn run_status(address: String) -> anyhow::Result<()> {
    let url = format!("http://{}/cluster-info", address);

    let response = reqwest::get(&url)
        .await
        .with_context(|| format!("failed to reach {}", url))?;
    let status: serde_json::Value = response.json().await.context("invalid status response")?;
    println!("{}", serde_json::to_string_pretty(&status)?);
    Ok(())
}

/// Initialize configuration file
fn run_init(output: PathBuf) -> anyhow::Result<()> {
    let config = HerdConfig::default();
    let content = format!(
        "# HerdLead Configuration\n# Generated configuration file\n\n{}",
        config.to_toml()?
    );

    std::fs::write(&output, content)
        .with_context(|| format!("failed to write {}", output.display()))?;
    println!("Configuration file created: {}", output.display());
    println!("Then start with: herdlead --config {} start", output.display());

    Ok(())
}

/// Validate configuration
fn run_validate(config_path: PathBuf) -> anyhow::Result<()> {
    match HerdConfig::from_file(&config_path) {
        Ok(config) => {
            println!("✓ Configuration is valid");
            println!("  Node ID Prefix: {}", config.node.id_prefix);
            println!("  Bind Address:   {}", config.node.bind_address);
            println!("  Advertise:      {}", config.advertise_address());
            println!("  Live Nodes:     {}", config.coordination.live_nodes_path);
            println!("  Election:       {}", config.coordination.election_path);
            println!("  API:            {}", config.api.bind_address);
            Ok(())
        }
        Err(e) => {
            eprintln!("✗ Configuration error: {}", e);
            Err(e.into())
        }
    }
}
