use super::recv_buffer::RecvBuffer;
use crate::error::Error;
use crate::torrent::metainfo::InfoHash;

use bytes::BufMut;

pub const PROTOCOL_ID: &[u8; 19] = b"BitTorrent protocol";
pub const HANDSHAKE_LEN: usize = 68;

pub type PeerId = [u8; 20];

/// The fixed-size handshake exchanged before any length-prefixed messages:
/// one length byte, the protocol string, 8 reserved bytes, the infohash and
/// the sender's peer id.
#[derive(Debug, PartialEq, Eq, Clone)]
pub struct Handshake {
    pub info_hash: InfoHash,
    pub peer_id: PeerId,
}

impl Handshake {
    pub fn parse(buf: &[u8]) -> Result<Self, Error> {
        if buf.len() < HANDSHAKE_LEN {
            return Err(Error::HandshakeInvalid);
        }
        if buf[0] as usize != PROTOCOL_ID.len() || &buf[1..20] != PROTOCOL_ID {
            return Err(Error::HandshakeInvalid);
        }
        // reserved bytes 20..28 are accepted with any value
        let mut info_hash = [0u8; 20];
        info_hash.copy_from_slice(&buf[28..48]);
        let mut peer_id = [0u8; 20];
        peer_id.copy_from_slice(&buf[48..68]);
        Ok(Self { info_hash, peer_id })
    }
}

impl From<&Handshake> for Vec<u8> {
    fn from(handshake: &Handshake) -> Self {
        let mut out = Vec::with_capacity(HANDSHAKE_LEN);
        out.put_u8(PROTOCOL_ID.len() as u8);
        out.put_slice(PROTOCOL_ID);
        out.put_slice(&[0u8; 8]);
        out.put_slice(&handshake.info_hash);
        out.put_slice(&handshake.peer_id);
        out
    }
}

/// A peer-wire message. Payload-carrying variants own their bytes, so a
/// popped message stays valid after the receive buffer is reused.
#[derive(Debug, PartialEq, Eq, Clone)]
pub enum Message {
    Keepalive,
    Choke,
    Unchoke,
    Interested,
    NotInterested,
    Have(u32),
    Bitfield(Vec<u8>),
    Request { index: u32, begin: u32, length: u32 },
    Piece { index: u32, begin: u32, data: Vec<u8> },
    Cancel { index: u32, begin: u32, length: u32 },
    /// Unrecognized or malformed message, consumed and skipped.
    Unknown(u8),
}

/// Result of attempting to pop one message from the receive buffer.
#[derive(Debug, PartialEq, Eq)]
pub enum Popped {
    /// Nothing buffered at all.
    NoData,
    /// A partial message is buffered; more bytes are needed.
    Incomplete,
    Msg(Message),
}

const MSG_CHOKE: u8 = 0;
const MSG_UNCHOKE: u8 = 1;
const MSG_INTERESTED: u8 = 2;
const MSG_NOT_INTERESTED: u8 = 3;
const MSG_HAVE: u8 = 4;
const MSG_BITFIELD: u8 = 5;
const MSG_REQUEST: u8 = 6;
const MSG_PIECE: u8 = 7;
const MSG_CANCEL: u8 = 8;

fn be_u32(bytes: &[u8]) -> u32 {
    u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])
}

impl Message {
    /// Pops the next complete message off the receive buffer, consuming its
    /// bytes. The buffer is untouched while a message is still partial, so
    /// callers simply retry after the next socket read.
    pub fn pop(buf: &mut RecvBuffer) -> Popped {
        let bytes = buf.unprocessed();
        if bytes.is_empty() {
            return Popped::NoData;
        }
        if bytes.len() < 4 {
            return Popped::Incomplete;
        }
        let length = be_u32(bytes) as usize;
        if length == 0 {
            buf.advance(4);
            return Popped::Msg(Message::Keepalive);
        }
        if bytes.len() < 4 + length {
            return Popped::Incomplete;
        }

        let kind = bytes[4];
        let payload = &bytes[5..4 + length];
        let msg = Self::decode(kind, payload);
        buf.advance(4 + length);
        Popped::Msg(msg)
    }

    /// Payloads with the wrong size for their type come out as `Unknown`,
    /// which the caller logs and drops; the framing layer has already
    /// consumed the bytes so the stream stays in sync.
    fn decode(kind: u8, payload: &[u8]) -> Message {
        match kind {
            MSG_CHOKE if payload.is_empty() => Message::Choke,
            MSG_UNCHOKE if payload.is_empty() => Message::Unchoke,
            MSG_INTERESTED if payload.is_empty() => Message::Interested,
            MSG_NOT_INTERESTED if payload.is_empty() => Message::NotInterested,
            MSG_HAVE if payload.len() == 4 => Message::Have(be_u32(payload)),
            MSG_BITFIELD => Message::Bitfield(payload.to_vec()),
            MSG_REQUEST if payload.len() == 12 => Message::Request {
                index: be_u32(&payload[0..4]),
                begin: be_u32(&payload[4..8]),
                length: be_u32(&payload[8..12]),
            },
            MSG_PIECE if payload.len() >= 8 => Message::Piece {
                index: be_u32(&payload[0..4]),
                begin: be_u32(&payload[4..8]),
                data: payload[8..].to_vec(),
            },
            MSG_CANCEL if payload.len() == 12 => Message::Cancel {
                index: be_u32(&payload[0..4]),
                begin: be_u32(&payload[4..8]),
                length: be_u32(&payload[8..12]),
            },
            other => Message::Unknown(other),
        }
    }

    pub fn encode_into(&self, out: &mut Vec<u8>) {
        match self {
            Message::Keepalive => out.put_u32(0),
            Message::Choke => Self::encode_header(out, MSG_CHOKE, 0),
            Message::Unchoke => Self::encode_header(out, MSG_UNCHOKE, 0),
            Message::Interested => Self::encode_header(out, MSG_INTERESTED, 0),
            Message::NotInterested => Self::encode_header(out, MSG_NOT_INTERESTED, 0),
            Message::Have(index) => {
                Self::encode_header(out, MSG_HAVE, 4);
                out.put_u32(*index);
            }
            Message::Bitfield(bits) => {
                Self::encode_header(out, MSG_BITFIELD, bits.len());
                out.put_slice(bits);
            }
            Message::Request {
                index,
                begin,
                length,
            } => {
                Self::encode_header(out, MSG_REQUEST, 12);
                out.put_u32(*index);
                out.put_u32(*begin);
                out.put_u32(*length);
            }
            Message::Piece { index, begin, data } => {
                Self::encode_header(out, MSG_PIECE, 8 + data.len());
                out.put_u32(*index);
                out.put_u32(*begin);
                out.put_slice(data);
            }
            Message::Cancel {
                index,
                begin,
                length,
            } => {
                Self::encode_header(out, MSG_CANCEL, 12);
                out.put_u32(*index);
                out.put_u32(*begin);
                out.put_u32(*length);
            }
            Message::Unknown(kind) => Self::encode_header(out, *kind, 0),
        }
    }

    fn encode_header(out: &mut Vec<u8>, kind: u8, payload_len: usize) {
        out.put_u32(payload_len as u32 + 1);
        out.put_u8(kind);
    }
}

impl From<&Message> for Vec<u8> {
    fn from(msg: &Message) -> Self {
        let mut out = Vec::new();
        msg.encode_into(&mut out);
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn handshake_roundtrip() {
        let handshake = Handshake {
            info_hash: [0x11; 20],
            peer_id: [0x22; 20],
        };
        let bytes: Vec<u8> = (&handshake).into();
        assert_eq!(bytes.len(), HANDSHAKE_LEN);
        assert_eq!(bytes[0], 19);
        assert_eq!(&bytes[1..20], PROTOCOL_ID);
        assert_eq!(&bytes[20..28], &[0u8; 8]);
        assert_eq!(Handshake::parse(&bytes).unwrap(), handshake);
    }

    #[test]
    fn handshake_rejects_wrong_protocol() {
        let handshake = Handshake {
            info_hash: [0; 20],
            peer_id: [0; 20],
        };
        let mut bytes: Vec<u8> = (&handshake).into();
        bytes[5] ^= 0xFF;
        assert!(Handshake::parse(&bytes).is_err());
        assert!(Handshake::parse(&bytes[..67]).is_err());
    }

    #[test]
    fn pop_distinguishes_no_data_from_incomplete() {
        let mut buf = RecvBuffer::new();
        assert_eq!(Message::pop(&mut buf), Popped::NoData);

        buf.push_bytes(&[0, 0]);
        assert_eq!(Message::pop(&mut buf), Popped::Incomplete);

        // length prefix complete but payload missing; repeated polling
        // without new bytes never consumes anything
        buf.push_bytes(&[0, 5, 4]);
        assert_eq!(Message::pop(&mut buf), Popped::Incomplete);
        assert_eq!(Message::pop(&mut buf), Popped::Incomplete);
        assert_eq!(buf.len(), 5);

        // the final byte completes the exact length+4 frame
        buf.push_bytes(&[0, 0, 0, 1]);
        assert_eq!(Message::pop(&mut buf), Popped::Msg(Message::Have(1)));
        assert_eq!(Message::pop(&mut buf), Popped::NoData);
    }

    #[test]
    fn pop_keepalive_and_successive_messages() {
        let mut buf = RecvBuffer::new();
        buf.push_bytes(&[0, 0, 0, 0]); // keepalive
        let unchoke: Vec<u8> = (&Message::Unchoke).into();
        let have: Vec<u8> = (&Message::Have(7)).into();
        buf.push_bytes(&unchoke);
        buf.push_bytes(&have);

        assert_eq!(Message::pop(&mut buf), Popped::Msg(Message::Keepalive));
        assert_eq!(Message::pop(&mut buf), Popped::Msg(Message::Unchoke));
        assert_eq!(Message::pop(&mut buf), Popped::Msg(Message::Have(7)));
        assert_eq!(Message::pop(&mut buf), Popped::NoData);
    }

    #[test]
    fn pop_piece_message_split_across_reads() {
        let msg = Message::Piece {
            index: 2,
            begin: 16384,
            data: vec![0xCD; 100],
        };
        let bytes: Vec<u8> = (&msg).into();

        let mut buf = RecvBuffer::new();
        buf.push_bytes(&bytes[..50]);
        assert_eq!(Message::pop(&mut buf), Popped::Incomplete);
        buf.push_bytes(&bytes[50..]);
        assert_eq!(Message::pop(&mut buf), Popped::Msg(msg));
    }

    #[test]
    fn unknown_and_malformed_are_consumed() {
        let mut buf = RecvBuffer::new();
        // unknown type 20 with 2 payload bytes
        buf.push_bytes(&[0, 0, 0, 3, 20, 1, 2]);
        // Have with a short payload
        buf.push_bytes(&[0, 0, 0, 3, 4, 0, 0]);
        let choke: Vec<u8> = (&Message::Choke).into();
        buf.push_bytes(&choke);

        assert_eq!(Message::pop(&mut buf), Popped::Msg(Message::Unknown(20)));
        assert_eq!(Message::pop(&mut buf), Popped::Msg(Message::Unknown(4)));
        // stream stays in sync after skipping
        assert_eq!(Message::pop(&mut buf), Popped::Msg(Message::Choke));
    }

    #[test]
    fn request_encoding_layout() {
        let msg = Message::Request {
            index: 1,
            begin: 16384,
            length: 16384,
        };
        let bytes: Vec<u8> = (&msg).into();
        assert_eq!(bytes.len(), 17);
        assert_eq!(&bytes[..5], &[0, 0, 0, 13, 6]);
        assert_eq!(&bytes[5..9], &[0, 0, 0, 1]);
        assert_eq!(&bytes[9..13], &[0, 0, 0x40, 0]);
    }
}
