//! quorumd binary

use clap::{Parser, Subcommand};
use quorumd::common::{timestamp_now_millis, Config};
use quorumd::coordinator::{ClusterView, LocalTransport, NodeCoordinator};
use quorumd::ClusterConfig;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "quorumd")]
#[command(about = "Cluster membership and leader election coordinator")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a node until Ctrl-C
    Serve {
        /// Config file (defaults to ./quorumd.{toml,json} if present)
        #[arg(long)]
        config: Option<PathBuf>,

        /// Node ID (overrides config)
        #[arg(long)]
        id: Option<String>,

        /// Start as bootstrap leader
        #[arg(long)]
        leader: bool,

        /// Extra nodes hosted in-process, joining through this node (comma-separated)
        #[arg(long, value_delimiter = ',')]
        peers: Vec<String>,
    },

    /// Run a cluster in-process, take the leader down and print the outcome
    Simulate {
        /// Number of nodes
        #[arg(long, default_value = "3")]
        nodes: usize,

        /// Heartbeat interval in milliseconds
        #[arg(long, default_value = "100")]
        heartbeat_ms: u64,

        /// Partition the leader off instead of shutting it down
        #[arg(long)]
        crash: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Serve {
            config,
            id,
            leader,
            peers,
        } => {
            // File and environment first, CLI flags on top
            let mut file_config = Config::load_from(config.as_deref())?;
            init_tracing(&file_config.log_level);

            if id.is_some() {
                file_config.cluster.node_id = id;
            }
            if leader {
                file_config.cluster.is_leader = true;
            }
            serve(file_config.cluster, peers).await?;
        }
        Commands::Simulate {
            nodes,
            heartbeat_ms,
            crash,
        } => {
            init_tracing("info");
            simulate(nodes, Duration::from_millis(heartbeat_ms), crash).await?;
        }
    }

    Ok(())
}

fn init_tracing(default_level: &str) {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_level.into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

async fn serve(config: ClusterConfig, peers: Vec<String>) -> anyhow::Result<()> {
    let bus = LocalTransport::new();
    let status_every = config.heartbeat_interval;
    let node = NodeCoordinator::from_config(config.clone(), bus.clone())?;
    node.start();

    let mut hosted = Vec::with_capacity(peers.len());
    for peer_id in peers {
        let peer_config = ClusterConfig {
            node_id: Some(peer_id),
            is_leader: false,
            ..config.clone()
        };
        let peer = NodeCoordinator::from_config(peer_config, bus.clone())?;
        peer.start();
        if let Err(e) = peer.join(node.node_id()) {
            warn!("{} could not join {}: {}", peer.node_id(), node.node_id(), e);
        }
        hosted.push(peer);
    }

    info!("Node {} serving, press Ctrl-C to stop", node.node_id());
    let mut ticker = tokio::time::interval(status_every);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let view = node.cluster_status();
                info!(
                    "leader={} epoch={} state={} active={}/{} capacity={}/{}",
                    view.leader_id.as_deref().unwrap_or("none"),
                    view.epoch,
                    view.election_state,
                    view.active_count,
                    view.total_count,
                    view.available_capacity,
                    view.total_capacity,
                );
            }
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    info!("Shutting down");
    for peer in &hosted {
        peer.shutdown().await;
    }
    node.shutdown().await;
    print!("{}", node.metrics().to_prometheus(node.node_id()));
    Ok(())
}

async fn simulate(count: usize, heartbeat: Duration, crash: bool) -> anyhow::Result<()> {
    anyhow::ensure!(count >= 2, "simulate needs at least 2 nodes");

    let bus = LocalTransport::new();
    let ids: Vec<String> = (0..count).map(|i| format!("node-{:02}", i)).collect();
    let leader_id = ids[count - 1].clone();

    let mut nodes = Vec::with_capacity(count);
    for (i, id) in ids.iter().enumerate() {
        let mut config = ClusterConfig::for_node(id.clone());
        config.heartbeat_interval = heartbeat;
        config.node_timeout = heartbeat * 4;
        config.is_leader = *id == leader_id;
        config.capacity.slots = 10 * (i as u64 + 1);
        nodes.push(NodeCoordinator::from_config(config, bus.clone())?);
    }

    for node in &nodes {
        node.start();
        if node.node_id() != leader_id {
            node.join(&leader_id)?;
        }
    }
    tokio::time::sleep(heartbeat * 3).await;

    let leader = leader_of(&nodes, &leader_id)?;
    let allocation = leader.allocate(15)?;
    info!("Allocated {:?}", allocation.slices);
    print_views("before", &nodes)?;

    if crash {
        info!("Partitioning leader {}", leader_id);
        bus.isolate(&leader_id);
    } else {
        info!("Shutting down leader {}", leader_id);
        leader.shutdown().await;
    }

    let started = timestamp_now_millis();
    tokio::time::sleep(heartbeat * 12).await;
    info!(
        "Waited {} ms for the cluster to settle",
        timestamp_now_millis() - started
    );
    print_views("after", &nodes)?;

    for node in &nodes {
        node.shutdown().await;
    }
    Ok(())
}

fn leader_of(nodes: &[Arc<NodeCoordinator>], id: &str) -> anyhow::Result<Arc<NodeCoordinator>> {
    nodes
        .iter()
        .find(|n| n.node_id() == id)
        .cloned()
        .ok_or_else(|| anyhow::anyhow!("no node {}", id))
}

fn print_views(label: &str, nodes: &[Arc<NodeCoordinator>]) -> anyhow::Result<()> {
    let views: Vec<ClusterView> = nodes.iter().map(|n| n.cluster_status()).collect();
    println!(
        "{}",
        serde_json::to_string_pretty(&serde_json::json!({ label: views }))?
    );
    Ok(())
}
