pub mod metainfo;
pub mod piece;

use metainfo::Metainfo;
use piece::{Piece, PieceState};

/// The torrent being downloaded: immutable metainfo plus one [`Piece`] per
/// piece hash. The counters are maintained by the scheduler and engine;
/// `active_pieces` always equals the number of pieces in the Downloading
/// state.
#[derive(Debug)]
pub struct Torrent {
    pub metainfo: Metainfo,
    pub pieces: Vec<Piece>,
    pub active_pieces: usize,
    pub downloaded_pieces: usize,
}

impl Torrent {
    pub fn new(metainfo: Metainfo) -> Self {
        let pieces = metainfo
            .piece_hashes
            .iter()
            .enumerate()
            .map(|(index, hash)| Piece::new(index, *hash))
            .collect();
        Self {
            metainfo,
            pieces,
            active_pieces: 0,
            downloaded_pieces: 0,
        }
    }

    /// Every piece has been downloaded and verified. Flushing may still be
    /// pending for some of them.
    pub fn is_complete(&self) -> bool {
        self.downloaded_pieces == self.pieces.len()
    }

    pub fn count_in_state(&self, state: PieceState) -> usize {
        self.pieces.iter().filter(|p| p.state == state).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::convert::TryFrom;

    #[test]
    fn new_torrent_has_one_init_piece_per_hash() {
        let bytes = metainfo::sample_torrent_bytes();
        let metainfo = Metainfo::try_from(bytes.as_slice()).unwrap();
        let torrent = Torrent::new(metainfo);
        assert_eq!(torrent.pieces.len(), 3);
        assert!(torrent
            .pieces
            .iter()
            .all(|p| p.state == PieceState::Init && p.current_peer.is_none()));
        assert_eq!(torrent.active_pieces, 0);
        assert!(!torrent.is_complete());
    }
}
