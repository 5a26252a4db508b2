//! Piece and peer selection.
//!
//! Peers and pieces reference each other by index into the engine's peer
//! list and the torrent's piece list. Activation and deactivation are the
//! only places those back-references change, and they always change both
//! sides together.

use crate::peer::proto::Message;
use crate::peer::{Peer, PeerStage};
use crate::torrent::piece::{Piece, PieceState};
use crate::torrent::Torrent;

/// Number of Init pieces this peer advertises. A peer with none is not
/// worth activating.
pub fn count_interesting_pieces(torrent: &Torrent, peer: &Peer) -> usize {
    torrent
        .pieces
        .iter()
        .filter(|piece| piece.state == PieceState::Init && peer.bitfield.get(piece.index))
        .count()
}

/// Lowest-indexed Init piece the peer advertises.
pub fn select_piece_for_download(torrent: &Torrent, peer: &Peer) -> Option<usize> {
    torrent
        .pieces
        .iter()
        .find(|piece| piece.state == PieceState::Init && peer.bitfield.get(piece.index))
        .map(|piece| piece.index)
}

/// Picks an idle, unchoked, handshaked peer and a piece for it. Peers
/// compete on priority first, then on how many pieces they can still
/// offer; the first candidate wins ties.
pub fn select_peer_and_piece(torrent: &Torrent, peers: &[Peer]) -> Option<(usize, usize)> {
    let mut best: Option<(usize, i64, usize)> = None;
    for (index, peer) in peers.iter().enumerate() {
        if peer.stage != PeerStage::Handshaked || peer.piece.is_some() || peer.choked {
            continue;
        }
        let interesting = count_interesting_pieces(torrent, peer);
        if interesting == 0 {
            continue;
        }
        let better = match best {
            None => true,
            Some((_, best_priority, best_interesting)) => {
                peer.priority > best_priority
                    || (peer.priority == best_priority && interesting > best_interesting)
            }
        };
        if better {
            best = Some((index, peer.priority, interesting));
        }
    }

    let (peer_index, _, _) = best?;
    let piece_index = select_piece_for_download(torrent, &peers[peer_index])?;
    Some((peer_index, piece_index))
}

/// Binds a peer and a piece together and moves the piece to Downloading.
pub fn activate_peer_and_piece(
    torrent: &mut Torrent,
    peers: &mut [Peer],
    peer_index: usize,
    piece_index: usize,
    now_ms: f64,
) {
    let peer = &mut peers[peer_index];
    let piece = &mut torrent.pieces[piece_index];
    debug_assert_eq!(piece.state, PieceState::Init);
    debug_assert!(piece.current_peer.is_none());
    debug_assert!(peer.piece.is_none());

    let length = torrent.metainfo.length_of_piece(piece_index);
    piece.prepare_for_download(length, now_ms);
    piece.state = PieceState::Downloading;
    piece.current_peer = Some(peer_index);
    peer.piece = Some(piece_index);
    torrent.active_pieces += 1;
}

/// Unbinds a peer from its piece. A piece still mid-download is abandoned
/// back to Init so another peer can pick it up; a piece that already
/// completed keeps its state.
pub fn deactivate_peer_and_piece(torrent: &mut Torrent, peers: &mut [Peer], peer_index: usize) {
    let peer = &mut peers[peer_index];
    if let Some(piece_index) = peer.piece.take() {
        let piece = &mut torrent.pieces[piece_index];
        debug_assert_eq!(piece.current_peer, Some(peer_index));
        piece.current_peer = None;
        if piece.state == PieceState::Downloading {
            piece.reset();
            torrent.active_pieces -= 1;
        }
    }
}

/// Tops the piece's outstanding requests up to the budget and stages the
/// Request messages. A no-op while the remote chokes us.
pub fn request_piece_blocks(peer: &mut Peer, piece: &mut Piece, now_tag: u8) {
    if peer.choked || piece.state != PieceState::Downloading {
        return;
    }
    let index = piece.index as u32;
    for (begin, length) in piece.take_block_requests(now_tag) {
        peer.send_msg(&Message::Request {
            index,
            begin,
            length,
        });
    }
}
