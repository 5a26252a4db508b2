use structopt::StructOpt;

use std::net::SocketAddr;
use std::path::PathBuf;

#[derive(Debug, StructOpt)]
#[structopt(name = "bptorrent", about = "Minimal leeching BitTorrent client")]
pub struct Opt {
    #[structopt(subcommand)]
    pub cmd: Command,
}

#[derive(Debug, StructOpt)]
pub enum Command {
    /// Print torrent metadata
    Info {
        #[structopt(parse(from_os_str))]
        torrent: PathBuf,
    },
    /// Announce to the tracker and list peer addresses
    Peers {
        #[structopt(parse(from_os_str))]
        torrent: PathBuf,
        /// Listen port reported to the tracker
        #[structopt(long, default_value = "6881")]
        port: u16,
    },
    /// Download the whole torrent into a single output file
    Download {
        #[structopt(parse(from_os_str))]
        torrent: PathBuf,
        #[structopt(short = "o", long, parse(from_os_str))]
        output: PathBuf,
        /// Connect to these peers instead of asking the tracker
        #[structopt(long = "peer", number_of_values = 1)]
        peers: Vec<SocketAddr>,
        /// Listen port reported to the tracker
        #[structopt(long, default_value = "6881")]
        port: u16,
    },
}
