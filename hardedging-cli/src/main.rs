use anyhow::{anyhow, bail, Context, Result};
use clap::{Parser, Subcommand};
use hardedging_core::config::Config;
use hardedging_core::core_mesh::{metrics, AssetClient, HttpOrigin, MeshHandle};
use hardedging_core::logging::{init_logging_with_config, LogConfig, LogLevel};
use hardedging_core::RendezvousServer;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "hardedging")]
#[command(author, version, about = "Peer-to-peer asset mesh: relay and peer node", long_about = None)]
struct Args {
    /// Log level (trace, debug, info, warn, error); overrides the config file
    #[arg(short, long)]
    log_level: Option<String>,

    /// Enable JSON formatted logging
    #[arg(long)]
    json_logs: bool,

    /// TOML config file; HARDEDGING_* environment variables are applied on top
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the rendezvous relay
    Rendezvous {
        /// Address to listen on
        #[arg(long)]
        bind: Option<SocketAddr>,
    },
    /// Run a mesh peer
    Peer {
        /// Room to join
        #[arg(long)]
        room: Option<String>,

        /// Relay WebSocket URL (ws://host:port/signal)
        #[arg(long)]
        rendezvous_url: Option<String>,

        /// Seed a local file under an asset id: PATH=ASSET_ID (repeatable)
        #[arg(long = "seed", value_name = "PATH=ASSET_ID")]
        seeds: Vec<String>,

        /// Fetch an asset peer-first, then exit (repeatable)
        #[arg(long = "fetch", value_name = "ASSET_ID")]
        fetches: Vec<String>,

        /// Base URL for origin fallbacks of path-only asset ids
        #[arg(long)]
        origin: Option<String>,
    },
    /// Print the effective configuration as TOML
    Config,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let mut config = load_config(args.config.as_deref())?;
    if let Some(level) = &args.log_level {
        config.logging.level = level.clone();
    }
    if args.json_logs {
        config.logging.json_format = true;
    }

    match args.command {
        Command::Config => {
            config.validate()?;
            print!("{}", config.to_toml()?);
            Ok(())
        }
        Command::Rendezvous { bind } => {
            if let Some(bind) = bind {
                config.rendezvous.bind_address = bind;
            }
            config.validate()?;
            init_ambient(&config)?;
            run_rendezvous(config).await
        }
        Command::Peer { room, rendezvous_url, seeds, fetches, origin } => {
            if let Some(room) = room {
                config.node.room_id = room;
            }
            if let Some(url) = rendezvous_url {
                config.node.rendezvous_url = url;
            }
            config.validate()?;
            init_ambient(&config)?;
            run_peer(config, seeds, fetches, origin).await
        }
    }
}

fn load_config(path: Option<&Path>) -> Result<Config> {
    let mut config = match path {
        Some(path) => {
            let expanded = shellexpand::tilde(&path.to_string_lossy()).into_owned();
            Config::from_file(&expanded).with_context(|| format!("loading config from {}", expanded))?
        }
        None => Config::default(),
    };
    config.apply_env()?;
    Ok(config)
}

fn init_ambient(config: &Config) -> Result<()> {
    let log_config = LogConfig::try_from(&config.logging).unwrap_or_else(|e| {
        eprintln!("{}, using 'info'", e);
        LogConfig::new(LogLevel::Info).json_format(config.logging.json_format)
    });
    init_logging_with_config(log_config)?;

    metrics::init_metrics();
    if config.metrics.enabled {
        metrics::install_prometheus_exporter(config.metrics.bind_address)?;
        info!(addr = %config.metrics.bind_address, "Prometheus exporter listening");
    }
    Ok(())
}

async fn run_rendezvous(config: Config) -> Result<()> {
    let server = RendezvousServer::new(config.rendezvous);
    let listener = server.bind().await?;
    server
        .serve(listener, async {
            let _ = tokio::signal::ctrl_c().await;
            info!("Ctrl-C received, stopping relay");
        })
        .await?;
    Ok(())
}

async fn run_peer(config: Config, seeds: Vec<String>, fetches: Vec<String>, origin: Option<String>) -> Result<()> {
    let (mesh, task) = MeshHandle::connect(&config).await?;
    info!(room = %config.node.room_id, "Peer started");

    for seed in &seeds {
        let (path, asset_id) = parse_seed(seed)?;
        let bytes = tokio::fs::read(&path).await.with_context(|| format!("reading {}", path.display()))?;
        let content_type = content_type_for(&path);
        if mesh.seed_asset(&asset_id, bytes, content_type).await? {
            info!(asset_id = %asset_id, path = %path.display(), "Seeded asset");
        } else {
            warn!(asset_id = %asset_id, "Asset id already seeded, keeping the first one");
        }
    }

    if fetches.is_empty() {
        tokio::signal::ctrl_c().await?;
        info!("Ctrl-C received, leaving mesh");
    } else {
        // Give the relay a moment to introduce us to the room.
        mesh.wait_for_peers(1, config.node.negotiation_timeout).await?;

        let origin = match origin {
            Some(base) => HttpOrigin::with_base_url(base),
            None => HttpOrigin::new(),
        };
        let client = AssetClient::new(mesh.clone(), Arc::new(origin)).with_p2p_first(config.node.p2p_first);
        for asset_id in &fetches {
            match client.fetch_p2p_first(asset_id).await {
                Ok(outcome) => println!(
                    "{}",
                    serde_json::json!({
                        "assetId": asset_id,
                        "bytes": outcome.bytes.len(),
                        "contentType": outcome.content_type,
                        "from": outcome.location,
                    })
                ),
                Err(e) => warn!(asset_id = %asset_id, "Fetch failed: {}", e),
            }
        }
    }

    let stats = mesh.get_stats().await?;
    println!("{}", serde_json::to_string_pretty(&stats)?);
    mesh.shutdown().await?;
    let _ = task.await;
    Ok(())
}

/// `PATH=ASSET_ID`; the path may start with `~`
fn parse_seed(arg: &str) -> Result<(PathBuf, String)> {
    let (path, asset_id) = arg.rsplit_once('=').ok_or_else(|| anyhow!("--seed expects PATH=ASSET_ID, got '{}'", arg))?;
    if path.is_empty() || asset_id.is_empty() {
        bail!("--seed expects PATH=ASSET_ID, got '{}'", arg);
    }
    Ok((PathBuf::from(shellexpand::tilde(path).into_owned()), asset_id.to_string()))
}

fn content_type_for(path: &Path) -> &'static str {
    match path.extension().and_then(|e| e.to_str()).map(str::to_ascii_lowercase).as_deref() {
        Some("html") | Some("htm") => "text/html",
        Some("css") => "text/css",
        Some("js") | Some("mjs") => "text/javascript",
        Some("json") => "application/json",
        Some("png") => "image/png",
        Some("jpg") | Some("jpeg") => "image/jpeg",
        Some("gif") => "image/gif",
        Some("svg") => "image/svg+xml",
        Some("webp") => "image/webp",
        Some("wasm") => "application/wasm",
        Some("txt") => "text/plain",
        _ => "application/octet-stream",
    }
}
