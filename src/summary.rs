//! Periodic one-line progress dashboard.

use crate::engine::LoopClock;
use crate::peer::{Peer, PeerStage};
use crate::torrent::piece::PieceState;
use crate::torrent::Torrent;

use tracing::info;

use std::fmt::Write;

pub struct Summary {
    last_secs: u64,
}

impl Default for Summary {
    fn default() -> Self {
        Self::new()
    }
}

impl Summary {
    pub fn new() -> Self {
        Self { last_secs: u64::MAX }
    }

    /// Emits the dashboard at most once per second of loop time.
    pub fn tick(&mut self, torrent: &Torrent, peers: &[Peer], clock: LoopClock) {
        if self.last_secs != u64::MAX && clock.secs <= self.last_secs {
            return;
        }
        self.last_secs = clock.secs;
        info!("{}", render(torrent, peers));
    }
}

/// Piece totals, peer stage counts, aggregate speed and the progress of
/// every in-flight piece, on one line.
pub fn render(torrent: &Torrent, peers: &[Peer]) -> String {
    let mut line = String::new();

    let flushed = torrent.count_in_state(PieceState::Flushed);
    let _ = write!(
        line,
        "pieces {}/{} flushed {}",
        torrent.downloaded_pieces,
        torrent.pieces.len(),
        flushed
    );

    let active = peers
        .iter()
        .filter(|p| p.stage == PeerStage::Handshaked)
        .count();
    let connecting = peers
        .iter()
        .filter(|p| matches!(p.stage, PeerStage::Connecting | PeerStage::Connected | PeerStage::WaitHandshake))
        .count();
    let failed = peers.iter().filter(|p| p.is_failed()).count();
    let _ = write!(
        line,
        " | peers {} up {} connecting {} failed",
        active, connecting, failed
    );

    let speed: f64 = torrent
        .pieces
        .iter()
        .filter(|p| p.state == PieceState::Downloading)
        .map(|p| p.speed_avg)
        .sum();
    let _ = write!(line, " | {:.1} kiB/s", speed);

    for piece in &torrent.pieces {
        if piece.state == PieceState::Downloading {
            let _ = write!(
                line,
                " | #{} {}/{} @{:.1}",
                piece.index, piece.received_count, piece.total_blocks, piece.speed_avg
            );
        }
    }
    line
}
