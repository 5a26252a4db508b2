pub mod http;
pub mod udp;

use crate::error::Error;
use crate::peer::proto::PeerId;
use crate::torrent::metainfo::Metainfo;

use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::time::Duration;

pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, PartialEq, Eq)]
pub struct AnnounceResponse {
    /// Seconds the tracker asks us to wait before re-announcing.
    pub interval: u64,
    pub peers: Vec<SocketAddr>,
}

/// Announces to the torrent's tracker and returns the peer list. The
/// scheme picks the transport; anything that is not `udp://` goes over
/// HTTP.
pub async fn fetch_peers(
    metainfo: &Metainfo,
    peer_id: &PeerId,
    port: u16,
) -> Result<AnnounceResponse, Error> {
    if metainfo.announce.starts_with("udp://") {
        udp::announce(metainfo, peer_id, port).await
    } else {
        http::announce(metainfo, peer_id, port).await
    }
}

/// Compact peer format: 6 bytes per peer, IPv4 address then big-endian
/// port.
pub(crate) fn parse_compact_peers(bytes: &[u8]) -> Result<Vec<SocketAddr>, Error> {
    if bytes.len() % 6 != 0 {
        return Err(Error::TrackerResponseInvalid(
            "peers field length is not a multiple of 6".into(),
        ));
    }
    Ok(bytes
        .chunks_exact(6)
        .map(|chunk| {
            let ip = Ipv4Addr::new(chunk[0], chunk[1], chunk[2], chunk[3]);
            let port = u16::from_be_bytes([chunk[4], chunk[5]]);
            SocketAddr::V4(SocketAddrV4::new(ip, port))
        })
        .collect())
}
