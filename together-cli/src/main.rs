//! mpv Together
//!
//! Launches mpv on a file and keeps it paused and positioned in lock-step
//! with every peer that joins.
//!
//! Usage:
//!   mpv-together --file movie.mkv
//!   mpv-together --file movie.mkv --peer 192.168.1.20:8080

mod mpv;
mod shutdown;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use together_core::player::transport::endpoint_name;
use together_core::{open_player, IpcTransport, NodeConfig, Session, StaticPortMapper};

#[derive(Parser, Debug)]
#[command(name = "mpv-together")]
#[command(about = "Watch with friends: keep mpv in sync across machines", long_about = None)]
struct Args {
    /// File to play
    #[arg(short, long)]
    file: PathBuf,

    /// mpv executable
    #[arg(long, default_value = "mpv")]
    mpv: PathBuf,

    /// Name of mpv's control endpoint
    #[arg(long, default_value = "mpvsocket")]
    socket_name: String,

    /// Seconds to wait for mpv to open its control endpoint
    #[arg(long, default_value_t = 5)]
    startup_grace: u64,

    /// Gossip listen address
    #[arg(long, env = "TOGETHER_LISTEN", default_value = "0.0.0.0:8080")]
    listen: SocketAddr,

    /// Address other peers should use to reach this one (host:port)
    #[arg(long, env = "TOGETHER_ADVERTISE")]
    advertise: Option<String>,

    /// Peer to join on startup, repeatable
    #[arg(long = "peer", env = "TOGETHER_PEERS", value_delimiter = ',')]
    peers: Vec<String>,

    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let level = if args.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_target(false)
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(format!("together_core={}", level).parse()?)
                .add_directive(format!("mpv_together={}", level).parse()?)
                .add_directive("hyper_util=off".parse()?)
                .add_directive("reqwest=off".parse()?)
                .add_directive("hyper=off".parse()?),
        )
        .with_writer(std::io::stderr)
        .init();

    let endpoint = endpoint_name(&args.socket_name);
    let mut player = mpv::launch(&args.mpv, &endpoint, &args.file)?;

    let cancel = CancellationToken::new();
    shutdown::watch(cancel.clone());

    let grace = Duration::from_secs(args.startup_grace);
    let stream = match open_player(&IpcTransport, &endpoint, grace).await {
        Ok(stream) => stream,
        Err(e) => {
            mpv::stop(&mut player).await;
            return Err(e.into());
        }
    };
    info!("Connected to mpv at {}", endpoint);

    let config = NodeConfig {
        listen: args.listen,
        advertise: args.advertise,
        ..NodeConfig::default()
    };
    let session = match Session::bind(config, stream, Arc::new(StaticPortMapper::discover()), cancel.clone()).await {
        Ok(session) => session,
        Err(e) => {
            mpv::stop(&mut player).await;
            return Err(e.into());
        }
    };
    info!("Peers can join this session at {}", session.self_address());

    let session_task = tokio::spawn(session.run(args.peers));

    tokio::select! {
        status = player.wait() => {
            match status {
                Ok(status) => info!("mpv exited ({})", status),
                Err(e) => warn!("Lost track of mpv: {}", e),
            }
            cancel.cancel();
        }
        _ = cancel.cancelled() => {}
    }

    let result = session_task.await;
    mpv::stop(&mut player).await;
    result??;

    info!("Bye");
    Ok(())
}
