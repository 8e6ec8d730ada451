//! Mesh harness
//!
//! Runs a relay and N peers in one process. Peer 0 seeds a synthetic asset,
//! every other peer fetches it peer-first at the same time, and the run is
//! reported as JSON: where each peer got its bytes, per-peer stats, and the
//! edge saturation across all fetchers.

use anyhow::{bail, Result};
use async_trait::async_trait;
use clap::Parser;
use hardedging_core::config::Config;
use hardedging_core::core_mesh::{AssetClient, MeshHandle, MeshResult, OriginFetcher, OriginResponse};
use hardedging_core::logging::{init_logging_with_config, LogConfig, LogLevel};
use hardedging_core::RendezvousServer;
use serde_json::json;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tracing::info;

const ASSET_ID: &str = "/harness/asset.bin";

#[derive(Parser, Debug)]
#[command(name = "mesh-harness")]
#[command(about = "Run a relay plus N peers and report the shared-asset scenario", long_about = None)]
struct Args {
    /// Number of peers, including the seeding one
    #[arg(long, default_value = "4")]
    peers: usize,

    /// Size of the seeded asset in bytes
    #[arg(long, default_value = "65536")]
    asset_size: usize,

    /// Per-request mesh timeout in milliseconds
    #[arg(long, default_value = "5000")]
    timeout_ms: u64,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "warn")]
    log_level: String,
}

/// Stands in for the origin; counts how often it was needed
struct SyntheticOrigin {
    size: usize,
    hits: AtomicU64,
}

#[async_trait]
impl OriginFetcher for SyntheticOrigin {
    async fn fetch(&self, _url: &str) -> MeshResult<OriginResponse> {
        self.hits.fetch_add(1, Ordering::SeqCst);
        Ok(OriginResponse { bytes: synthetic_asset(self.size), content_type: Some("application/octet-stream".into()) })
    }
}

fn synthetic_asset(size: usize) -> Vec<u8> {
    (0..size).map(|i| (i % 251) as u8).collect()
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    if args.peers < 2 {
        bail!("--peers must be at least 2");
    }

    let level: LogLevel = args.log_level.parse().unwrap_or(LogLevel::Warn);
    init_logging_with_config(LogConfig::new(level))?;

    let mut config = Config::default();
    config.rendezvous.bind_address = "127.0.0.1:0".parse()?;
    config.node.room_id = "harness".to_string();
    config.node.request_timeout = Duration::from_millis(args.timeout_ms);
    config.node.max_asset_size_bytes = config.node.max_asset_size_bytes.max(args.asset_size);
    config.transport.max_frame_size = config.transport.max_frame_size.max(args.asset_size.div_ceil(3) * 4 + 1024);
    config.validate()?;

    let relay = RendezvousServer::new(config.rendezvous.clone()).spawn().await?;
    config.node.rendezvous_url = relay.signal_url();
    info!(url = %config.node.rendezvous_url, "Relay up");

    let mut nodes: Vec<(MeshHandle, JoinHandle<()>)> = Vec::with_capacity(args.peers);
    for _ in 0..args.peers {
        nodes.push(MeshHandle::connect(&config).await?);
    }

    let setup_started = Instant::now();
    for (node, _) in &nodes {
        let connected = node.wait_for_peers(args.peers - 1, config.node.negotiation_timeout).await?;
        if connected.len() < args.peers - 1 {
            bail!("peer only reached {} of {} others", connected.len(), args.peers - 1);
        }
    }
    let mesh_ready_ms = setup_started.elapsed().as_millis();

    let source = &nodes[0].0;
    source.seed_asset(ASSET_ID, synthetic_asset(args.asset_size), "application/octet-stream").await?;

    let origin = Arc::new(SyntheticOrigin { size: args.asset_size, hits: AtomicU64::new(0) });
    let fetches: Vec<_> = nodes[1..]
        .iter()
        .map(|(node, _)| {
            let client = AssetClient::new(node.clone(), origin.clone());
            tokio::spawn(async move {
                let started = Instant::now();
                let outcome = client.fetch_p2p_first(ASSET_ID).await;
                (outcome, started.elapsed())
            })
        })
        .collect();

    let expected = synthetic_asset(args.asset_size);
    let mut fetch_reports = Vec::new();
    for (index, fetch) in fetches.into_iter().enumerate() {
        let (outcome, elapsed) = fetch.await?;
        let outcome = outcome?;
        fetch_reports.push(json!({
            "peer": index + 1,
            "from": outcome.location,
            "bytes": outcome.bytes.len(),
            "intact": outcome.bytes == expected,
            "elapsedMs": elapsed.as_millis(),
        }));
    }

    let mut peer_reports = Vec::new();
    let (mut p2p_bytes, mut origin_bytes) = (0u64, 0u64);
    for (index, (node, _)) in nodes.iter().enumerate() {
        let stats = node.get_stats().await?;
        if index > 0 {
            p2p_bytes += stats.bytes_received_p2p;
            origin_bytes += stats.bytes_from_origin;
        }
        peer_reports.push(json!({
            "peer": index,
            "peerId": node.local_peer_id().await?,
            "stats": stats,
            "edgeSaturation": stats.edge_saturation(),
        }));
    }
    let total = p2p_bytes + origin_bytes;
    let edge_saturation = if total == 0 { 0.0 } else { p2p_bytes as f64 / total as f64 };

    let report = json!({
        "peers": args.peers,
        "assetSize": args.asset_size,
        "meshReadyMs": mesh_ready_ms,
        "originHits": origin.hits.load(Ordering::SeqCst),
        "edgeSaturation": edge_saturation,
        "fetches": fetch_reports,
        "nodes": peer_reports,
    });
    println!("{}", serde_json::to_string_pretty(&report)?);

    for (node, task) in nodes {
        node.shutdown().await?;
        let _ = task.await;
    }
    relay.shutdown().await?;
    Ok(())
}
