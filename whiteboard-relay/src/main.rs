//! Whiteboard relay: forwards encrypted scene frames between room members.
//!
//! The relay never holds room keys. Log verbosity is controlled by `RUST_LOG`.

use clap::Parser;
use log::info;

use whiteboard_sync::relay::{RelayConfig, RelayServer};

/// Encrypted whiteboard relay
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Address to listen on for WebSocket connections
    #[arg(short, long, env = "RELAY_BIND_ADDR", default_value = "127.0.0.1:3002")]
    bind: String,

    /// Maximum members per room
    #[arg(long, env = "RELAY_MAX_PEERS_PER_ROOM", default_value_t = 100)]
    max_peers_per_room: usize,

    /// Frames buffered per member before a slow member starts losing frames
    #[arg(long, env = "RELAY_BROADCAST_CAPACITY", default_value_t = 256)]
    broadcast_capacity: usize,
}

impl From<Args> for RelayConfig {
    fn from(args: Args) -> Self {
        Self {
            bind_addr: args.bind,
            max_peers_per_room: args.max_peers_per_room,
            broadcast_capacity: args.broadcast_capacity,
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    let server = RelayServer::bind(args.into()).await?;

    tokio::select! {
        result = server.run() => result?,
        _ = tokio::signal::ctrl_c() => {
            info!("Shutting down relay");
        }
    }

    Ok(())
}
