use super::{parse_compact_peers, AnnounceResponse, REQUEST_TIMEOUT};
use crate::error::Error;
use crate::peer::proto::PeerId;
use crate::torrent::metainfo::Metainfo;

use bytes::BufMut;
use tokio::net::UdpSocket;
use tokio::time::timeout;
use tracing::debug;

const PROTOCOL_MAGIC: u64 = 0x0417_2710_1980;
const ACTION_CONNECT: u32 = 0;
const ACTION_ANNOUNCE: u32 = 1;
const ACTION_ERROR: u32 = 3;

fn be_u32(bytes: &[u8]) -> u32 {
    u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])
}

fn be_u64(bytes: &[u8]) -> u64 {
    let mut buf = [0u8; 8];
    buf.copy_from_slice(&bytes[..8]);
    u64::from_be_bytes(buf)
}

fn connect_request(transaction_id: u32) -> Vec<u8> {
    let mut packet = Vec::with_capacity(16);
    packet.put_u64(PROTOCOL_MAGIC);
    packet.put_u32(ACTION_CONNECT);
    packet.put_u32(transaction_id);
    packet
}

fn announce_request(
    connection_id: u64,
    transaction_id: u32,
    metainfo: &Metainfo,
    peer_id: &PeerId,
    port: u16,
) -> Vec<u8> {
    let mut packet = Vec::with_capacity(98);
    packet.put_u64(connection_id);
    packet.put_u32(ACTION_ANNOUNCE);
    packet.put_u32(transaction_id);
    packet.put_slice(&metainfo.info_hash);
    packet.put_slice(peer_id);
    packet.put_u64(0); // downloaded
    packet.put_u64(metainfo.total_length as u64); // left
    packet.put_u64(0); // uploaded
    packet.put_u32(0); // event: none
    packet.put_u32(0); // ip: tracker uses the sender address
    packet.put_u32(rand::random()); // key
    packet.put_i32(-1); // num_want: default
    packet.put_u16(port);
    packet
}

/// Checks the fixed response header: enough bytes, expected action (or a
/// tracker error message), and the echoed transaction id.
fn check_response(
    buf: &[u8],
    min_len: usize,
    action: u32,
    transaction_id: u32,
) -> Result<(), Error> {
    if buf.len() >= 8 && be_u32(buf) == ACTION_ERROR {
        return Err(Error::TrackerFailure(
            String::from_utf8_lossy(&buf[8..]).into_owned(),
        ));
    }
    if buf.len() < min_len {
        return Err(Error::TrackerResponseInvalid("response too short".into()));
    }
    if be_u32(buf) != action {
        return Err(Error::TrackerResponseInvalid("unexpected action".into()));
    }
    if be_u32(&buf[4..8]) != transaction_id {
        return Err(Error::TransactionIdMismatch);
    }
    Ok(())
}

/// UDP announce per BEP 15: a connect exchange to obtain a connection id,
/// then the 98-byte announce request. Both waits are bounded.
pub async fn announce(
    metainfo: &Metainfo,
    peer_id: &PeerId,
    port: u16,
) -> Result<AnnounceResponse, Error> {
    let target = metainfo
        .announce
        .strip_prefix("udp://")
        .and_then(|rest| rest.split('/').next())
        .ok_or_else(|| Error::TrackerResponseInvalid("announce url".into()))?;

    let socket = UdpSocket::bind("0.0.0.0:0").await?;
    socket.connect(target).await?;
    debug!(tracker = target, "announcing");

    let transaction_id: u32 = rand::random();
    socket.send(&connect_request(transaction_id)).await?;
    let mut buf = [0u8; 2048];
    let n = timeout(REQUEST_TIMEOUT, socket.recv(&mut buf)).await??;
    check_response(&buf[..n], 16, ACTION_CONNECT, transaction_id)?;
    let connection_id = be_u64(&buf[8..16]);

    let transaction_id: u32 = rand::random();
    let request = announce_request(connection_id, transaction_id, metainfo, peer_id, port);
    socket.send(&request).await?;
    let n = timeout(REQUEST_TIMEOUT, socket.recv(&mut buf)).await??;
    check_response(&buf[..n], 20, ACTION_ANNOUNCE, transaction_id)?;

    let interval = be_u32(&buf[8..12]) as u64;
    let peers = parse_compact_peers(&buf[20..n])?;
    Ok(AnnounceResponse { interval, peers })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::torrent::metainfo;
    use std::convert::TryFrom;

    fn test_metainfo() -> Metainfo {
        let bytes = metainfo::sample_torrent_bytes();
        Metainfo::try_from(bytes.as_slice()).unwrap()
    }

    #[test]
    fn connect_request_layout() {
        let packet = connect_request(0xDEADBEEF);
        assert_eq!(packet.len(), 16);
        assert_eq!(be_u64(&packet[..8]), PROTOCOL_MAGIC);
        assert_eq!(be_u32(&packet[8..12]), ACTION_CONNECT);
        assert_eq!(be_u32(&packet[12..16]), 0xDEADBEEF);
    }

    #[test]
    fn announce_request_layout() {
        let metainfo = test_metainfo();
        let peer_id = [3u8; 20];
        let packet = announce_request(42, 7, &metainfo, &peer_id, 6881);
        assert_eq!(packet.len(), 98);
        assert_eq!(be_u64(&packet[..8]), 42);
        assert_eq!(be_u32(&packet[8..12]), ACTION_ANNOUNCE);
        assert_eq!(be_u32(&packet[12..16]), 7);
        assert_eq!(&packet[16..36], &metainfo.info_hash);
        assert_eq!(&packet[36..56], &peer_id);
        assert_eq!(be_u64(&packet[64..72]), 40000); // left
        assert_eq!(&packet[92..96], &(-1i32).to_be_bytes()); // num_want
        assert_eq!(&packet[96..98], &6881u16.to_be_bytes());
    }

    #[test]
    fn response_checks() {
        let mut ok = Vec::new();
        ok.put_u32(ACTION_CONNECT);
        ok.put_u32(9);
        ok.put_u64(1234);
        assert!(check_response(&ok, 16, ACTION_CONNECT, 9).is_ok());

        assert!(matches!(
            check_response(&ok, 16, ACTION_CONNECT, 10),
            Err(Error::TransactionIdMismatch)
        ));
        assert!(check_response(&ok[..12], 16, ACTION_CONNECT, 9).is_err());

        let mut failure = Vec::new();
        failure.put_u32(ACTION_ERROR);
        failure.put_u32(9);
        failure.put_slice(b"nope");
        match check_response(&failure, 16, ACTION_CONNECT, 9) {
            Err(Error::TrackerFailure(reason)) => assert_eq!(reason, "nope"),
            other => panic!("expected tracker failure, got {:?}", other.err()),
        }
    }
}
