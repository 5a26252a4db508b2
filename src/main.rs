mod bencode;
mod bitfield;
mod cli;
mod engine;
mod error;
mod peer;
mod scheduler;
mod summary;
mod torrent;
mod tracker;

use cli::{Command, Opt};
use engine::Engine;
use error::Error;
use peer::proto::PeerId;
use torrent::metainfo::Metainfo;
use torrent::Torrent;

use rand::Rng;
use structopt::StructOpt;
use tracing::info;

use std::convert::TryFrom;
use std::path::Path;

/// Upper bound on simultaneous peer connections.
const MAX_PEERS: usize = 50;

#[tokio::main(flavor = "current_thread")]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    if let Err(e) = run(Opt::from_args()).await {
        eprintln!("error: {}", e);
        std::process::exit(1);
    }
}

async fn run(opt: Opt) -> Result<(), Error> {
    match opt.cmd {
        Command::Info { torrent } => {
            let metainfo = load_metainfo(&torrent).await?;
            println!("Tracker URL: {}", metainfo.announce);
            println!("Length: {}", metainfo.total_length);
            println!("Info Hash: {}", hex::encode(metainfo.info_hash));
            println!("Piece Length: {}", metainfo.piece_length);
            println!("Piece Hashes:");
            for hash in &metainfo.piece_hashes {
                println!("{}", hex::encode(hash));
            }
        }
        Command::Peers { torrent, port } => {
            let metainfo = load_metainfo(&torrent).await?;
            let response = tracker::fetch_peers(&metainfo, &generate_peer_id(), port).await?;
            info!(interval = response.interval, "announce ok");
            for addr in response.peers {
                println!("{}", addr);
            }
        }
        Command::Download {
            torrent,
            output,
            peers,
            port,
        } => {
            let metainfo = load_metainfo(&torrent).await?;
            let peer_id = generate_peer_id();
            let mut addrs = peers;
            if addrs.is_empty() {
                addrs = tracker::fetch_peers(&metainfo, &peer_id, port).await?.peers;
            }
            if addrs.is_empty() {
                return Err(Error::NoPeers);
            }
            addrs.truncate(MAX_PEERS);

            let mut engine = Engine::new(Torrent::new(metainfo), addrs, peer_id);
            engine.run(&output).await?;
            println!("Downloaded to {}.", output.display());
        }
    }
    Ok(())
}

async fn load_metainfo(path: &Path) -> Result<Metainfo, Error> {
    let bytes = tokio::fs::read(path).await?;
    Metainfo::try_from(bytes.as_slice())
}

/// Azureus-style peer id: client prefix plus random digits.
fn generate_peer_id() -> PeerId {
    let mut id = [0u8; 20];
    id[..8].copy_from_slice(b"-BP0001-");
    let mut rng = rand::thread_rng();
    for byte in id[8..].iter_mut() {
        *byte = rng.gen_range(b'0'..=b'9');
    }
    id
}
