//! Replica binary.
//!
//! Launched with its own id followed by the ids of every peer, it opens
//! the datagram endpoint named by its id and runs until terminated:
//!
//!   raftkv 0000 0001 0002 0003 0004
//!
//! Set `RUST_LOG=raftkv=debug` to watch protocol traffic on stderr.

use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use raftkv::core::replica::Replica;
use raftkv::core::server::ReplicaServer;
use raftkv::transport::unix::UnixDatagramTransport;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// This replica's id.
    id: String,

    /// Ids of every other replica in the cluster.
    peers: Vec<String>,

    /// Directory holding the datagram endpoints, one per id.
    #[arg(long, default_value = ".")]
    socket_dir: PathBuf,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    info!(id = %cli.id, peers = ?cli.peers, "replica starting");

    let transport = UnixDatagramTransport::bind(&cli.socket_dir, &cli.id, cli.peers.clone())
        .with_context(|| format!("binding datagram endpoint for {}", cli.id))?;
    let replica = Replica::new(cli.id, cli.peers);
    let (server, _shared) = ReplicaServer::new(replica, transport);

    server.run().await;
    Ok(())
}
