//! NADO node entry point.
//!
//! First launch creates the data directory, the genesis ledger, and the
//! node keys, then the four loops and the HTTP surface start sharing one
//! in-memory node state.

use clap::Parser;
use nado::api::{self, ApiState};
use nado::loops::{ConsensusLoop, CoreLoop, MessageLoop, PeerLoop};
use nado::{Config, GossipClient, Keypair, Node, Storage, DEFAULT_PORT, TRUST_SELF};
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};

const VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Parser)]
#[command(name = "nado", version, about = "NADO: peer-to-peer blockchain node")]
struct Args {
    /// Public IP address of this node
    #[arg(short, long, default_value = "127.0.0.1")]
    ip: IpAddr,

    /// Listen port
    #[arg(short, long, default_value_t = DEFAULT_PORT)]
    port: u16,

    /// Data directory
    #[arg(short, long, default_value = "./data")]
    data_dir: PathBuf,

    /// Seed nodes (comma-separated IPs)
    #[arg(short, long)]
    seeds: Option<String>,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("nado=info".parse().expect("static directive")),
        )
        .init();

    let args = Args::parse();

    let config = match Config::load_or_create(&args.data_dir, args.ip, args.port) {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load configuration: {e}");
            return;
        }
    };

    let storage = match Storage::open(&args.data_dir.join("db")) {
        Ok(storage) => Arc::new(storage),
        Err(e) => {
            error!("Failed to open storage: {e}");
            return;
        }
    };

    if !storage.is_initialized() {
        info!("Creating genesis ledger");
        if let Err(e) = storage.init_genesis(&config) {
            error!("Failed to write genesis: {e}");
            return;
        }
    }

    let (keypair, fresh_keys) = match Keypair::load_or_generate(&args.data_dir.join("keys.json")) {
        Ok(loaded) => loaded,
        Err(e) => {
            error!("Failed to load keys: {e}");
            return;
        }
    };
    if fresh_keys {
        let record = nado::PeerRecord {
            ip: config.ip,
            address: keypair.address(),
            trust: TRUST_SELF,
        };
        if let Err(e) = storage.save_peer(&record, false) {
            error!("Failed to register own peer record: {e}");
            return;
        }
    }

    // claims the port before anything else starts
    let bind: SocketAddr = SocketAddr::new("0.0.0.0".parse().expect("static addr"), args.port);
    let listener = match tokio::net::TcpListener::bind(bind).await {
        Ok(listener) => listener,
        Err(e) => {
            error!("Port {} already in use, exiting: {e}", args.port);
            std::process::exit(1);
        }
    };

    let node = match Node::new(config, storage, keypair) {
        Ok(node) => Arc::new(node),
        Err(e) => {
            error!("Failed to assemble node state: {e}");
            return;
        }
    };

    info!("NADO version {VERSION} started");
    info!("Your address: {}", node.address);
    info!("Your IP: {}", node.config.ip);

    if let Some(seeds) = args.seeds {
        let mut peer_state = node.peer_state.write().await;
        for seed in seeds.split(',') {
            match seed.trim().parse::<IpAddr>() {
                Ok(ip) if ip != node.config.ip => {
                    peer_state.peer_buffer.insert(ip);
                }
                Ok(_) => {}
                Err(_) => error!("Ignoring invalid seed {seed}"),
            }
        }
    }

    let client = GossipClient::new(node.config.port);

    tokio::spawn(ConsensusLoop::new(node.clone(), client.clone()).run());
    tokio::spawn(CoreLoop::new(node.clone(), client.clone()).run());
    tokio::spawn(PeerLoop::new(node.clone(), client.clone()).run());
    tokio::spawn(MessageLoop::new(node.clone()).run());

    info!("Starting Request Handler");
    let router = api::router(ApiState {
        node: node.clone(),
        client,
    });

    let shutdown_node = node.clone();
    let serve = axum::serve(
        listener,
        router.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move {
        let mut poll = tokio::time::interval(Duration::from_millis(500));
        loop {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {
                    info!("Terminating: interrupt received");
                    shutdown_node.request_terminate();
                    break;
                }
                _ = poll.tick() => {
                    if shutdown_node.terminating() {
                        break;
                    }
                }
            }
        }
    });

    if let Err(e) = serve.await {
        error!("Request handler failed: {e}");
    }

    node.request_terminate();
    // let the loops observe the flag before the process exits
    tokio::time::sleep(Duration::from_secs(1)).await;
    info!("Shutting down...");
}
