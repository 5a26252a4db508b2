use super::{parse_compact_peers, AnnounceResponse, REQUEST_TIMEOUT};
use crate::bencode;
use crate::error::Error;
use crate::peer::proto::PeerId;
use crate::torrent::metainfo::Metainfo;

use hyper::body;
use hyper::Client;
use percent_encoding::{percent_encode, NON_ALPHANUMERIC};
use tracing::debug;

fn build_uri(metainfo: &Metainfo, peer_id: &PeerId, port: u16) -> Result<hyper::Uri, Error> {
    let separator = if metainfo.announce.contains('?') {
        '&'
    } else {
        '?'
    };
    let query = format!(
        "{}{}info_hash={}&peer_id={}&port={}&uploaded=0&downloaded=0&left={}&compact=1",
        metainfo.announce,
        separator,
        percent_encode(&metainfo.info_hash, NON_ALPHANUMERIC),
        percent_encode(peer_id, NON_ALPHANUMERIC),
        port,
        metainfo.total_length,
    );
    Ok(query.parse()?)
}

/// HTTP announce: GET with the standard query parameters, bencoded
/// response body with a compact peer list.
pub async fn announce(
    metainfo: &Metainfo,
    peer_id: &PeerId,
    port: u16,
) -> Result<AnnounceResponse, Error> {
    let uri = build_uri(metainfo, peer_id, port)?;
    debug!(%uri, "announcing");

    let client = Client::new();
    let response = tokio::time::timeout(REQUEST_TIMEOUT, client.get(uri)).await??;
    let bytes = tokio::time::timeout(REQUEST_TIMEOUT, body::to_bytes(response.into_body())).await??;

    let value = bencode::decode(&bytes)?;
    if let Ok(reason) = value.get_bytes("failure reason") {
        return Err(Error::TrackerFailure(
            String::from_utf8_lossy(reason).into_owned(),
        ));
    }
    let interval = value.get_int("interval").unwrap_or(0) as u64;
    let peers = parse_compact_peers(value.get_bytes("peers")?)?;
    Ok(AnnounceResponse { interval, peers })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::convert::TryFrom;

    #[test]
    fn uri_percent_encodes_binary_fields() {
        let bytes = crate::torrent::metainfo::sample_torrent_bytes();
        let mut metainfo = Metainfo::try_from(bytes.as_slice()).unwrap();
        metainfo.info_hash = [0x12; 20];
        let peer_id = [b'a'; 20];

        let uri = build_uri(&metainfo, &peer_id, 6881).unwrap();
        let query = uri.query().unwrap();
        assert!(query.contains(&"%12".repeat(20)));
        assert!(query.contains("peer_id=aaaaaaaaaaaaaaaaaaaa"));
        assert!(query.contains("port=6881"));
        assert!(query.contains("left=40000"));
        assert!(query.contains("compact=1"));
    }

    #[test]
    fn failure_reason_surfaces_as_error() {
        let body = b"d14:failure reason9:not founde";
        let value = bencode::decode(body).unwrap();
        assert_eq!(value.get_bytes("failure reason").unwrap(), b"not found");
    }
}
