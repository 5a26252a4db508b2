use crate::bencode::{self, Value};
use crate::error::Error;

use sha1::{Digest, Sha1};

use std::convert::{TryFrom, TryInto};

pub type InfoHash = [u8; 20];
pub type PieceHash = [u8; 20];

/// Immutable view over a decoded torrent file: everything the engine needs,
/// extracted once. The multi-file layout is reduced to a total length; the
/// output is always a single flat file.
#[derive(Debug, PartialEq, Eq, Clone)]
pub struct Metainfo {
    pub announce: String,
    pub name: String,
    pub info_hash: InfoHash,
    pub piece_length: usize,
    pub total_length: usize,
    pub piece_hashes: Vec<PieceHash>,
}

impl Metainfo {
    pub fn piece_count(&self) -> usize {
        self.piece_hashes.len()
    }

    /// Length of one piece; the final piece covers whatever remains.
    pub fn length_of_piece(&self, index: usize) -> usize {
        if index + 1 == self.piece_count() {
            self.total_length - index * self.piece_length
        } else {
            self.piece_length
        }
    }
}

/// Reads an integer field that must fit in `usize`; negative values in a
/// hostile torrent are rejected instead of wrapping through a cast.
fn byte_length(value: &Value, key: &str) -> Result<usize, Error> {
    usize::try_from(value.get_int(key)?)
        .map_err(|_| Error::ValueTypeMissingOrInvalid(key.into()))
}

fn total_length(info: &Value) -> Result<usize, Error> {
    if info.get_int("length").is_ok() {
        return byte_length(info, "length");
    }
    // multi-file torrent: sum of per-file lengths
    let files = info.get_list("files")?;
    let mut total = 0usize;
    for file in files {
        total = total
            .checked_add(byte_length(file, "length")?)
            .ok_or_else(|| Error::ValueLengthInvalid("files".into()))?;
    }
    Ok(total)
}

impl TryFrom<&Value> for Metainfo {
    type Error = Error;
    fn try_from(torrent: &Value) -> Result<Self, Self::Error> {
        let announce = String::from_utf8(torrent.get_bytes("announce")?.to_vec())?;
        let info = torrent.get_dict("info")?;

        // infohash is SHA-1 over the re-encoded info dict; encoding preserves
        // entry order, so this matches the bytes of the original file
        let info_encoded: Vec<u8> = info.into();
        let info_hash: InfoHash = Sha1::digest(&info_encoded).into();

        let name = String::from_utf8(info.get_bytes("name")?.to_vec())?;
        let piece_length = byte_length(info, "piece length")?;
        if piece_length == 0 {
            return Err(Error::ValueTypeMissingOrInvalid("piece length".into()));
        }
        let total_length = total_length(info)?;

        let hashes = info.get_bytes("pieces")?;
        if hashes.len() % 20 != 0 {
            return Err(Error::ValueLengthInvalid("pieces".into()));
        }
        let piece_hashes: Vec<PieceHash> = hashes
            .chunks_exact(20)
            .map(|chunk| chunk.try_into().unwrap())
            .collect();

        let expected =
            total_length / piece_length + usize::from(total_length % piece_length != 0);
        if piece_hashes.len() != expected {
            return Err(Error::ValueLengthInvalid("pieces".into()));
        }

        Ok(Self {
            announce,
            name,
            info_hash,
            piece_length,
            total_length,
            piece_hashes,
        })
    }
}

impl TryFrom<&[u8]> for Metainfo {
    type Error = Error;
    fn try_from(bytes: &[u8]) -> Result<Self, Self::Error> {
        let value = bencode::decode(bytes)?;
        (&value).try_into()
    }
}

/// Test fixture shared across the crate: a single-file torrent of 40000
/// bytes in 3 pieces (16384 + 16384 + 7232).
#[cfg(test)]
pub fn sample_torrent_bytes() -> Vec<u8> {
    let info = vec![
        (b"length".to_vec(), Value::Integer(40000)),
        (b"name".to_vec(), Value::Bytes(b"sample.bin".to_vec())),
        (b"piece length".to_vec(), Value::Integer(16384)),
        (b"pieces".to_vec(), Value::Bytes(vec![0xab; 60])),
    ];
    let torrent = Value::Dict(vec![
        (
            b"announce".to_vec(),
            Value::Bytes(b"http://tracker.local:8080/announce".to_vec()),
        ),
        (b"info".to_vec(), Value::Dict(info)),
    ]);
    (&torrent).into()
}
