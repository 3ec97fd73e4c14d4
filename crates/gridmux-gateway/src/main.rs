//! gridmux-gateway: shared feed multiplexer binary
//!
//! Owns the physical connections to upstream data feeds and serves any
//! number of client contexts over a single WebSocket endpoint.

use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use gridmux_metadata::{ConfigStore, MemoryStore, MuxSettings, ProviderConfig};
use gridmux_mux::{run_server, GatewayState, Mux};

#[derive(Parser, Debug)]
#[command(name = "gridmux-gateway")]
#[command(about = "Shared data-connection multiplexer for streaming feeds")]
struct Args {
    /// Client-facing bind address
    #[arg(long, default_value = "0.0.0.0:8080")]
    listen: String,

    /// Path to multiplexer settings file
    #[arg(short, long)]
    settings: Option<PathBuf>,

    /// Directory of provider configuration files (one YAML per provider,
    /// file stem is the provider id)
    #[arg(short, long)]
    providers: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    let settings = match args.settings {
        Some(ref path) => {
            let settings = MuxSettings::load(path)?;
            info!(path = %path.display(), "Loaded settings");
            settings
        }
        None => MuxSettings::default(),
    };

    let store = Arc::new(MemoryStore::new());
    if let Some(ref dir) = args.providers {
        let loaded = seed_store(store.as_ref(), dir).await?;
        info!(count = loaded, dir = %dir.display(), "Loaded provider configurations");
    }

    let addr: SocketAddr = args.listen.parse()?;
    let channel_capacity = settings.channel_capacity;
    let mux = Mux::start_ws(settings, store);

    let state = GatewayState {
        mux: mux.clone(),
        channel_capacity,
    };
    run_server(addr, state).await?;

    mux.stop();
    info!("Gateway stopped");
    Ok(())
}

/// Load every `*.yaml` in the directory into the store, keyed by file stem.
async fn seed_store(
    store: &dyn ConfigStore,
    dir: &PathBuf,
) -> Result<usize, Box<dyn std::error::Error>> {
    let mut loaded = 0;
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        if path.extension().and_then(|e| e.to_str()) != Some("yaml") {
            continue;
        }
        let Some(id) = path.file_stem().and_then(|s| s.to_str()) else {
            continue;
        };
        match ProviderConfig::load(&path) {
            Ok(config) => {
                store.save(id, config).await?;
                loaded += 1;
            }
            Err(e) => warn!(path = %path.display(), error = %e, "Skipping invalid provider config"),
        }
    }
    Ok(loaded)
}
