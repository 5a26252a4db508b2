//! Single-task download engine.
//!
//! One loop iteration: wait for readiness on any peer socket (bounded by a
//! 5 second timeout), service connects and writables before readables in
//! peer-index order, run the scheduler, flush completed pieces to the
//! output file, then do periodic housekeeping. All peer and piece state is
//! owned here and mutated inline; nothing is shared across tasks.

use crate::error::Error;
use crate::peer::proto::{Handshake, Message, PeerId, Popped, HANDSHAKE_LEN};
use crate::peer::{Peer, PeerStage};
use crate::scheduler;
use crate::summary::Summary;
use crate::torrent::piece::{BlockSave, PieceState};
use crate::torrent::Torrent;

use futures_util::future::poll_fn;
use tokio::io::{AsyncSeekExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{debug, info, warn};

use std::future::Future;
use std::io::SeekFrom;
use std::net::SocketAddr;
use std::path::Path;
use std::task::Poll;
use std::time::{Duration, Instant};

const READY_TIMEOUT: Duration = Duration::from_secs(5);
const HOUSEKEEPING_INTERVAL_SECS: u64 = 2;
const STALL_TIMEOUT_SECS: u64 = 10;
const KEEPALIVE_INTERVAL_SECS: u64 = 30;
/// A piece running below this fraction of the aggregate download speed gets
/// its peer evicted so a faster one can take over.
const SLOW_FRACTION: f64 = 0.1;

/// Wall-clock sampled once per loop iteration; every decision in that
/// iteration sees the same time.
#[derive(Debug, Clone, Copy)]
pub struct LoopClock {
    pub secs: u64,
    pub millis: f64,
}

impl LoopClock {
    fn at(start: Instant) -> Self {
        let elapsed = start.elapsed();
        Self {
            secs: elapsed.as_secs(),
            millis: elapsed.as_millis() as f64,
        }
    }

    /// Low-resolution request timestamp; 0 is reserved for "not asked".
    pub fn tag(&self) -> u8 {
        let tag = (self.secs & 0xFF) as u8;
        if tag == 0 {
            1
        } else {
            tag
        }
    }
}

enum Ready {
    Connected(usize, std::io::Result<TcpStream>),
    Writable(usize),
    Readable(usize),
}

pub struct Engine {
    pub torrent: Torrent,
    pub peers: Vec<Peer>,
    our_id: PeerId,
    start: Instant,
    last_housekeeping_secs: u64,
    /// Downloaded pieces whose buffers still need to reach the output file.
    pending_flush: Vec<usize>,
    summary: Summary,
}

impl Engine {
    pub fn new(torrent: Torrent, addrs: Vec<SocketAddr>, our_id: PeerId) -> Self {
        let piece_count = torrent.metainfo.piece_count();
        let peers = addrs
            .into_iter()
            .map(|addr| Peer::new(addr, piece_count))
            .collect();
        Self {
            torrent,
            peers,
            our_id,
            start: Instant::now(),
            last_housekeeping_secs: 0,
            pending_flush: Vec::new(),
            summary: Summary::new(),
        }
    }

    fn clock(&self) -> LoopClock {
        LoopClock::at(self.start)
    }

    /// Downloads every piece and writes them to `output`. Returns once all
    /// pieces are flushed, or fails when every peer is gone first.
    pub async fn run(&mut self, output: &Path) -> Result<(), Error> {
        let mut file = tokio::fs::File::create(output).await?;
        info!(
            pieces = self.torrent.pieces.len(),
            peers = self.peers.len(),
            "starting download"
        );

        loop {
            let clock = self.clock();
            self.start_connects(clock);

            if self.torrent.is_complete() && self.pending_flush.is_empty() {
                break;
            }
            if self.peers.iter().all(|p| p.is_failed()) {
                return Err(Error::NoPeers);
            }

            let events = self.wait_ready().await;
            let clock = self.clock();

            let mut readables = Vec::new();
            for event in events {
                match event {
                    Ready::Connected(index, result) => self.on_connected(index, result),
                    Ready::Writable(index) => self.on_writable(index, clock),
                    Ready::Readable(index) => readables.push(index),
                }
            }
            for index in readables {
                self.on_readable(index, clock);
            }

            if clock.secs.saturating_sub(self.last_housekeeping_secs) > HOUSEKEEPING_INTERVAL_SECS {
                self.last_housekeeping_secs = clock.secs;
                self.housekeeping(clock);
            }
            // runs after housekeeping so evicted pieces and freed peers are
            // re-paired in the same iteration
            self.schedule(clock);
            self.flush_outboxes(clock);
            self.flush_pieces(&mut file).await?;

            for piece in &mut self.torrent.pieces {
                if piece.state == PieceState::Downloading {
                    piece.sample_speed(clock.millis);
                }
            }
            self.summary.tick(&self.torrent, &self.peers, clock);
        }

        file.flush().await?;
        for peer in &mut self.peers {
            if !peer.is_failed() {
                peer.disconnect();
                peer.stage = PeerStage::Done;
            }
        }
        info!(name = %self.torrent.metainfo.name, "download complete");
        Ok(())
    }

    fn start_connects(&mut self, clock: LoopClock) {
        let info_hash = self.torrent.metainfo.info_hash;
        let our_id = self.our_id;
        for peer in &mut self.peers {
            if peer.stage != PeerStage::Init {
                continue;
            }
            match peer.start_connect(clock.secs) {
                Ok(()) => {
                    if peer.stage == PeerStage::Connected {
                        peer.send_handshake(&Handshake {
                            info_hash,
                            peer_id: our_id,
                        });
                    }
                }
                Err(e) => warn!(addr = %peer.addr, error = %e, "connect failed"),
            }
        }
    }

    /// One multiplexed readiness wait over every peer: pending connects,
    /// writability where output is staged, and readability. Returns empty
    /// on timeout so housekeeping still runs on an idle swarm.
    async fn wait_ready(&mut self) -> Vec<Ready> {
        let peers = &mut self.peers;
        let wait = poll_fn(|cx| {
            let mut events = Vec::new();
            for (index, peer) in peers.iter_mut().enumerate() {
                if let Some(fut) = peer.connect_future() {
                    if let Poll::Ready(result) = fut.as_mut().poll(cx) {
                        events.push(Ready::Connected(index, result));
                        continue;
                    }
                }
                if let Some(stream) = peer.stream.as_ref() {
                    if !peer.outbox.is_empty() {
                        if stream.poll_write_ready(cx).is_ready() {
                            events.push(Ready::Writable(index));
                        }
                    }
                    if stream.poll_read_ready(cx).is_ready() {
                        events.push(Ready::Readable(index));
                    }
                }
            }
            if events.is_empty() {
                Poll::Pending
            } else {
                Poll::Ready(events)
            }
        });
        tokio::time::timeout(READY_TIMEOUT, wait)
            .await
            .unwrap_or_default()
    }

    fn on_connected(&mut self, peer_index: usize, result: std::io::Result<TcpStream>) {
        let info_hash = self.torrent.metainfo.info_hash;
        let our_id = self.our_id;
        let peer = &mut self.peers[peer_index];
        match peer.finish_connect(result) {
            Ok(()) => {
                debug!(addr = %peer.addr, "connected");
                peer.send_handshake(&Handshake {
                    info_hash,
                    peer_id: our_id,
                });
            }
            Err(e) => warn!(addr = %peer.addr, error = %e, "connect failed"),
        }
    }

    fn on_writable(&mut self, peer_index: usize, clock: LoopClock) {
        if let Err(e) = self.peers[peer_index].flush(clock.secs) {
            self.fail_peer(peer_index, &e);
        }
    }

    fn on_readable(&mut self, peer_index: usize, clock: LoopClock) {
        match self.peers[peer_index].read_from_stream(clock.secs) {
            Ok(0) => {}
            Ok(_) => {
                if let Err(e) = self.drive_peer(peer_index, clock) {
                    self.fail_peer(peer_index, &e);
                }
            }
            Err(e) => self.fail_peer(peer_index, &e),
        }
    }

    /// Consumes buffered bytes for one peer: completes the handshake if it
    /// is still pending, then pops and dispatches messages until the buffer
    /// holds no complete message.
    fn drive_peer(&mut self, peer_index: usize, clock: LoopClock) -> Result<(), Error> {
        if self.peers[peer_index].stage == PeerStage::WaitHandshake {
            let expected = self.torrent.metainfo.info_hash;
            let peer = &mut self.peers[peer_index];
            // the 68 handshake bytes must arrive in one read; a short first
            // read means the remote is not speaking this protocol
            if peer.rx.len() < HANDSHAKE_LEN {
                return Err(Error::HandshakeInvalid);
            }
            let handshake = Handshake::parse(&peer.rx.unprocessed()[..HANDSHAKE_LEN])?;
            if handshake.info_hash != expected {
                return Err(Error::HandshakeInvalid);
            }
            peer.rx.advance(HANDSHAKE_LEN);
            peer.remote_id = Some(handshake.peer_id);
            peer.stage = PeerStage::Handshaked;
            // we hold nothing yet and never throttle the remote
            let bits = crate::bitfield::Bitfield::new(self.torrent.pieces.len());
            peer.send_msg(&Message::Bitfield(bits.as_bytes().to_vec()));
            peer.send_msg(&Message::Unchoke);
            debug!(addr = %peer.addr, id = %hex::encode(handshake.peer_id), "handshake complete");
        }
        if self.peers[peer_index].stage != PeerStage::Handshaked {
            return Ok(());
        }
        loop {
            match Message::pop(&mut self.peers[peer_index].rx) {
                Popped::Msg(msg) => self.handle_msg(peer_index, msg, clock),
                Popped::NoData | Popped::Incomplete => return Ok(()),
            }
        }
    }

    fn handle_msg(&mut self, peer_index: usize, msg: Message, clock: LoopClock) {
        match msg {
            Message::Keepalive => {}
            Message::Choke => {
                let peer = &mut self.peers[peer_index];
                peer.choked = true;
                // in-flight requests died with the choke; data already
                // received stays valid
                if let Some(piece_index) = peer.piece {
                    self.torrent.pieces[piece_index].release_requests();
                }
                debug!(addr = %peer.addr, "choked");
            }
            Message::Unchoke => {
                let peer = &mut self.peers[peer_index];
                peer.choked = false;
                if let Some(piece_index) = peer.piece {
                    scheduler::request_piece_blocks(
                        peer,
                        &mut self.torrent.pieces[piece_index],
                        clock.tag(),
                    );
                }
            }
            Message::Have(index) => {
                self.peers[peer_index].bitfield.set_bit(index as usize);
                self.express_interest(peer_index);
            }
            Message::Bitfield(payload) => {
                let peer = &mut self.peers[peer_index];
                peer.bitfield.merge_bytes(&payload);
                debug!(addr = %peer.addr, have = peer.bitfield.count_set(), "bitfield");
                self.express_interest(peer_index);
            }
            Message::Piece { index, begin, data } => {
                self.handle_block(peer_index, index, begin, &data, clock);
            }
            // we only leech; the remote's requests and interest are noted
            // and dropped
            Message::Interested | Message::NotInterested => {}
            Message::Request { .. } | Message::Cancel { .. } => {
                debug!(addr = %self.peers[peer_index].addr, "ignoring upload request");
            }
            Message::Unknown(kind) => {
                debug!(addr = %self.peers[peer_index].addr, kind, "skipping unknown message");
            }
        }
    }

    /// Tells the peer we are interested as soon as it advertises anything we
    /// still need; interest prompts the remote to unchoke us, which is what
    /// makes the peer schedulable.
    fn express_interest(&mut self, peer_index: usize) {
        let peer = &mut self.peers[peer_index];
        if peer.interested_sent {
            return;
        }
        if scheduler::count_interesting_pieces(&self.torrent, peer) > 0 {
            peer.send_msg(&Message::Interested);
            peer.interested_sent = true;
        }
    }

    /// Stores one arriving block after checking it belongs to this peer's
    /// assigned, in-progress piece. Anything malformed is logged and dropped
    /// without disturbing piece state.
    fn handle_block(&mut self, peer_index: usize, index: u32, begin: u32, data: &[u8], clock: LoopClock) {
        let index = index as usize;
        let piece_count = self.torrent.pieces.len();
        if index >= piece_count {
            warn!("rejected block: {}", Error::PieceIndexInvalid { index, piece_count });
            return;
        }
        if self.peers[peer_index].piece != Some(index)
            || self.torrent.pieces[index].state != PieceState::Downloading
        {
            warn!(index, "unsolicited block");
            return;
        }

        let piece = &mut self.torrent.pieces[index];
        match piece.save_block(begin as usize, data) {
            Ok(BlockSave::Stored) => {
                piece.speed_bytes += data.len();
                if piece.is_complete() {
                    self.complete_piece(peer_index, index);
                } else {
                    scheduler::request_piece_blocks(
                        &mut self.peers[peer_index],
                        &mut self.torrent.pieces[index],
                        clock.tag(),
                    );
                }
            }
            Ok(BlockSave::Duplicate) => debug!(index, begin, "duplicate block"),
            Err(e) => warn!(index, begin, error = %e, "rejected block"),
        }
    }

    fn complete_piece(&mut self, peer_index: usize, index: usize) {
        let piece = &mut self.torrent.pieces[index];
        if piece.verify() {
            piece.state = PieceState::Downloaded;
            piece.release_tracking();
            self.torrent.active_pieces -= 1;
            self.torrent.downloaded_pieces += 1;
            self.pending_flush.push(index);
            info!(
                index,
                done = self.torrent.downloaded_pieces,
                total = self.torrent.pieces.len(),
                "piece verified"
            );
        } else {
            warn!(index, "{}", Error::PieceHashMismatch { index });
            self.peers[peer_index].priority -= 1;
        }
        // verified pieces keep their state here; a failed piece is still
        // Downloading and gets reset back to Init
        scheduler::deactivate_peer_and_piece(&mut self.torrent, &mut self.peers, peer_index);
    }

    /// Pairs up idle peers with pieces until no eligible pair remains.
    fn schedule(&mut self, clock: LoopClock) {
        while let Some((peer_index, piece_index)) =
            scheduler::select_peer_and_piece(&self.torrent, &self.peers)
        {
            scheduler::activate_peer_and_piece(
                &mut self.torrent,
                &mut self.peers,
                peer_index,
                piece_index,
                clock.millis,
            );
            let peer = &mut self.peers[peer_index];
            debug!(addr = %peer.addr, piece = piece_index, "activated");
            if !peer.interested_sent {
                peer.send_msg(&Message::Interested);
                peer.interested_sent = true;
            }
            scheduler::request_piece_blocks(
                peer,
                &mut self.torrent.pieces[piece_index],
                clock.tag(),
            );
        }
    }

    /// Eager write pass so staged messages go out this iteration instead of
    /// waiting for the next writability event.
    fn flush_outboxes(&mut self, clock: LoopClock) {
        for peer_index in 0..self.peers.len() {
            let peer = &self.peers[peer_index];
            if peer.stream.is_none() || peer.outbox.is_empty() {
                continue;
            }
            if let Err(e) = self.peers[peer_index].flush(clock.secs) {
                self.fail_peer(peer_index, &e);
            }
        }
    }

    async fn flush_pieces(&mut self, file: &mut tokio::fs::File) -> Result<(), Error> {
        let piece_length = self.torrent.metainfo.piece_length;
        for index in std::mem::take(&mut self.pending_flush) {
            let piece = &mut self.torrent.pieces[index];
            let buffer = std::mem::take(&mut piece.buffer);
            file.seek(SeekFrom::Start((index * piece_length) as u64))
                .await?;
            file.write_all(&buffer).await?;
            piece.state = PieceState::Flushed;
            debug!(index, bytes = buffer.len(), "piece flushed");
        }
        Ok(())
    }

    /// Periodic pass: evict stalled peers, re-request aged blocks, evict
    /// the peers behind pathologically slow pieces, keep idle connections
    /// alive.
    fn housekeeping(&mut self, clock: LoopClock) {
        for peer_index in 0..self.peers.len() {
            let peer = &self.peers[peer_index];
            let quiet_for = clock.secs.saturating_sub(peer.last_recv_secs);
            let stalled = match peer.stage {
                // connect or handshake never completed
                PeerStage::Connecting | PeerStage::Connected | PeerStage::WaitHandshake => {
                    quiet_for > STALL_TIMEOUT_SECS
                }
                PeerStage::Handshaked => peer.piece.is_some() && quiet_for > STALL_TIMEOUT_SECS,
                _ => false,
            };
            if stalled {
                self.fail_peer(peer_index, &Error::PeerDisconnected);
            }
        }

        // aged requests are presumed lost; clear and re-request
        let tag = clock.tag();
        let Engine { torrent, peers, .. } = self;
        for piece_index in 0..torrent.pieces.len() {
            let piece = &mut torrent.pieces[piece_index];
            if piece.state != PieceState::Downloading {
                continue;
            }
            let cleared = piece.expire_stale_requests(tag);
            if cleared > 0 {
                debug!(piece = piece_index, cleared, "expired stale requests");
                if let Some(peer_index) = piece.current_peer {
                    scheduler::request_piece_blocks(&mut peers[peer_index], piece, tag);
                }
            }
        }

        self.evict_slow_peers();

        for peer in &mut self.peers {
            if peer.is_connected()
                && clock.secs.saturating_sub(peer.last_send_secs) > KEEPALIVE_INTERVAL_SECS
            {
                peer.send_msg(&Message::Keepalive);
            }
        }
    }

    /// With several pieces in flight, a piece crawling far below the swarm's
    /// combined speed is holding its slot hostage; its peer loses the piece
    /// and some priority, and the scheduler reassigns the piece elsewhere.
    fn evict_slow_peers(&mut self) {
        if self.torrent.active_pieces < 2 {
            return;
        }
        let speeds: Vec<(usize, f64)> = self
            .torrent
            .pieces
            .iter()
            .filter(|p| p.state == PieceState::Downloading)
            .filter_map(|p| p.current_peer.map(|peer| (peer, p.speed_avg)))
            .collect();
        let total: f64 = speeds.iter().map(|(_, s)| s).sum();
        if total <= 0.0 {
            return;
        }
        for (peer_index, speed) in speeds {
            if speed < total * SLOW_FRACTION {
                debug!(addr = %self.peers[peer_index].addr, speed, total, "evicting slow peer");
                scheduler::deactivate_peer_and_piece(&mut self.torrent, &mut self.peers, peer_index);
                self.peers[peer_index].priority -= 1;
            }
        }
    }

    fn fail_peer(&mut self, peer_index: usize, error: &Error) {
        warn!(addr = %self.peers[peer_index].addr, error = %error, "dropping peer");
        scheduler::deactivate_peer_and_piece(&mut self.torrent, &mut self.peers, peer_index);
        let peer = &mut self.peers[peer_index];
        peer.disconnect();
        peer.stage = PeerStage::Error;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bencode::Value;
    use crate::torrent::metainfo::Metainfo;
    use sha1::{Digest, Sha1};
    use std::convert::TryFrom;

    const PIECE_LEN: usize = 16384;
    const TOTAL_LEN: usize = 40000; // 2 full pieces + 7232

    fn content() -> Vec<u8> {
        (0..TOTAL_LEN).map(|i| (i % 241) as u8).collect()
    }

    fn test_engine(peer_count: usize) -> Engine {
        let data = content();
        let mut hashes = Vec::new();
        for chunk in data.chunks(PIECE_LEN) {
            let digest: [u8; 20] = Sha1::digest(chunk).into();
            hashes.extend_from_slice(&digest);
        }
        let info = Value::Dict(vec![
            (b"length".to_vec(), Value::Integer(TOTAL_LEN as i64)),
            (b"name".to_vec(), Value::Bytes(b"t".to_vec())),
            (b"piece length".to_vec(), Value::Integer(PIECE_LEN as i64)),
            (b"pieces".to_vec(), Value::Bytes(hashes)),
        ]);
        let torrent = Value::Dict(vec![
            (b"announce".to_vec(), Value::Bytes(b"http://t/".to_vec())),
            (b"info".to_vec(), info),
        ]);
        let bytes: Vec<u8> = (&torrent).into();
        let metainfo = Metainfo::try_from(bytes.as_slice()).unwrap();

        let addrs = (0..peer_count)
            .map(|i| format!("127.0.0.1:{}", 6881 + i).parse().unwrap())
            .collect();
        Engine::new(Torrent::new(metainfo), addrs, [7u8; 20])
    }

    fn clock(secs: u64) -> LoopClock {
        LoopClock {
            secs,
            millis: secs as f64 * 1000.0,
        }
    }

    fn handshake_peer(engine: &mut Engine, peer_index: usize) {
        engine.peers[peer_index].stage = PeerStage::Handshaked;
        let bits = vec![0xFF; 1];
        engine.handle_msg(peer_index, Message::Bitfield(bits), clock(1));
    }

    /// Serves every staged Request for the peer's assigned piece out of
    /// `data`, clearing the outbox.
    fn answer_requests(engine: &mut Engine, peer_index: usize, data: &[u8], now: LoopClock) {
        let mut rx = crate::peer::recv_buffer::RecvBuffer::new();
        let outbox = std::mem::take(&mut engine.peers[peer_index].outbox);
        rx.push_bytes(&outbox);
        loop {
            match Message::pop(&mut rx) {
                Popped::Msg(Message::Request {
                    index,
                    begin,
                    length,
                }) => {
                    let offset = index as usize * PIECE_LEN + begin as usize;
                    let block = data[offset..offset + length as usize].to_vec();
                    engine.handle_msg(
                        peer_index,
                        Message::Piece {
                            index,
                            begin,
                            data: block,
                        },
                        now,
                    );
                }
                Popped::Msg(_) => {}
                Popped::NoData | Popped::Incomplete => break,
            }
        }
    }

    #[test]
    fn two_peers_download_all_pieces() {
        let mut engine = test_engine(2);
        let data = content();
        handshake_peer(&mut engine, 0);
        handshake_peer(&mut engine, 1);
        // Interested staged as soon as the bitfield shows wanted pieces
        assert_eq!(&engine.peers[0].outbox[..5], &[0, 0, 0, 1, 2]);

        // choked peers are not schedulable yet
        engine.schedule(clock(1));
        assert_eq!(engine.torrent.active_pieces, 0);

        engine.handle_msg(0, Message::Unchoke, clock(2));
        engine.handle_msg(1, Message::Unchoke, clock(2));
        engine.schedule(clock(2));
        // both peers bound to distinct pieces
        assert_eq!(engine.torrent.active_pieces, 2);
        let p0 = engine.peers[0].piece.unwrap();
        let p1 = engine.peers[1].piece.unwrap();
        assert_ne!(p0, p1);

        // serve requests until the swarm drains
        for round in 3..20u64 {
            engine.schedule(clock(round));
            answer_requests(&mut engine, 0, &data, clock(round));
            answer_requests(&mut engine, 1, &data, clock(round));
            if engine.torrent.is_complete() {
                break;
            }
        }

        assert!(engine.torrent.is_complete());
        assert_eq!(engine.torrent.downloaded_pieces, 3);
        assert_eq!(engine.torrent.active_pieces, 0);
        let mut flushed = engine.pending_flush.clone();
        flushed.sort_unstable();
        assert_eq!(flushed, vec![0, 1, 2]);

        // assembled bytes match the source exactly
        let mut assembled = Vec::new();
        for piece in &engine.torrent.pieces {
            assert_eq!(piece.state, PieceState::Downloaded);
            assembled.extend_from_slice(&piece.buffer);
        }
        assert_eq!(assembled, data);
    }

    #[test]
    fn choke_mid_piece_then_unchoke_resumes() {
        let mut engine = test_engine(1);
        let data = content();
        handshake_peer(&mut engine, 0);
        engine.handle_msg(0, Message::Unchoke, clock(1));
        engine.schedule(clock(1));

        let piece_index = engine.peers[0].piece.unwrap();
        // drop the staged requests on the floor and choke before any answer
        engine.peers[0].outbox.clear();
        engine.handle_msg(0, Message::Choke, clock(2));
        assert_eq!(engine.torrent.pieces[piece_index].outstanding, 0);
        // assignment survives the choke
        assert_eq!(engine.peers[0].piece, Some(piece_index));
        assert_eq!(engine.torrent.pieces[piece_index].state, PieceState::Downloading);

        engine.handle_msg(0, Message::Unchoke, clock(3));
        assert!(engine.torrent.pieces[piece_index].outstanding > 0);
        answer_requests(&mut engine, 0, &data, clock(3));

        // piece finished despite the interruption
        assert_eq!(engine.torrent.pieces[piece_index].state, PieceState::Downloaded);
    }

    #[test]
    fn corrupt_piece_is_retried_from_scratch() {
        let mut engine = test_engine(1);
        let mut bad = content();
        handshake_peer(&mut engine, 0);
        engine.handle_msg(0, Message::Unchoke, clock(1));
        engine.schedule(clock(1));

        let piece_index = engine.peers[0].piece.unwrap();
        bad[piece_index * PIECE_LEN] ^= 0xFF;
        answer_requests(&mut engine, 0, &bad, clock(2));

        // failed verification: piece back to Init, peer unbound and demoted
        assert_eq!(engine.torrent.pieces[piece_index].state, PieceState::Init);
        assert_eq!(engine.torrent.pieces[piece_index].current_peer, None);
        assert_eq!(engine.torrent.active_pieces, 0);
        assert_eq!(engine.torrent.downloaded_pieces, 0);
        assert_eq!(engine.peers[0].piece, None);
        assert_eq!(engine.peers[0].priority, -1);

        // same peer retries with good data
        engine.schedule(clock(3));
        answer_requests(&mut engine, 0, &content(), clock(3));
        assert_eq!(engine.torrent.pieces[piece_index].state, PieceState::Downloaded);
    }

    #[test]
    fn unsolicited_and_out_of_range_blocks_are_dropped() {
        let mut engine = test_engine(1);
        handshake_peer(&mut engine, 0);
        engine.handle_msg(0, Message::Unchoke, clock(1));
        engine.schedule(clock(1));
        let assigned = engine.peers[0].piece.unwrap();
        let other = (assigned + 1) % 3;

        engine.handle_msg(
            0,
            Message::Piece {
                index: other as u32,
                begin: 0,
                data: vec![0; PIECE_LEN],
            },
            clock(2),
        );
        engine.handle_msg(
            0,
            Message::Piece {
                index: 99,
                begin: 0,
                data: vec![0; PIECE_LEN],
            },
            clock(2),
        );
        assert_eq!(engine.torrent.pieces[assigned].received_count, 0);
        assert_eq!(engine.torrent.pieces[other].state, PieceState::Init);
    }

    #[test]
    fn stalled_peer_is_evicted_and_piece_freed() {
        let mut engine = test_engine(2);
        handshake_peer(&mut engine, 0);
        engine.handle_msg(0, Message::Unchoke, clock(1));
        engine.schedule(clock(1));
        let piece_index = engine.peers[0].piece.unwrap();
        engine.peers[0].last_recv_secs = 1;

        engine.housekeeping(clock(20));
        assert_eq!(engine.peers[0].stage, PeerStage::Error);
        assert_eq!(engine.peers[0].piece, None);
        assert_eq!(engine.torrent.pieces[piece_index].state, PieceState::Init);
        assert_eq!(engine.torrent.active_pieces, 0);
    }

    #[test]
    fn slow_piece_is_evicted_against_aggregate_speed() {
        let mut engine = test_engine(3);
        for peer_index in 0..3 {
            handshake_peer(&mut engine, peer_index);
            engine.handle_msg(peer_index, Message::Unchoke, clock(1));
        }
        engine.schedule(clock(1));
        assert_eq!(engine.torrent.active_pieces, 3);

        // 15 is above 10% of the mean (7.2) but below 10% of the total
        // throughput (21.5), so it must still be evicted
        for peer_index in 0..3 {
            let piece_index = engine.peers[peer_index].piece.unwrap();
            engine.torrent.pieces[piece_index].speed_avg =
                if peer_index == 2 { 15.0 } else { 100.0 };
        }
        engine.evict_slow_peers();

        assert_eq!(engine.torrent.active_pieces, 2);
        assert_eq!(engine.peers[2].piece, None);
        assert_eq!(engine.peers[2].priority, -1);
        assert_eq!(engine.peers[0].priority, 0);
        assert!(engine.peers[0].piece.is_some());
        assert!(engine.peers[1].piece.is_some());
    }

    #[test]
    fn short_first_handshake_read_fails_the_peer() {
        let mut engine = test_engine(1);
        engine.peers[0].stage = PeerStage::WaitHandshake;
        engine.peers[0].rx.push_bytes(&[19; 10]);
        assert!(engine.drive_peer(0, clock(1)).is_err());
    }

    #[test]
    fn complete_handshake_promotes_peer_and_greets() {
        let mut engine = test_engine(1);
        engine.peers[0].stage = PeerStage::WaitHandshake;
        let greeting: Vec<u8> = (&Handshake {
            info_hash: engine.torrent.metainfo.info_hash,
            peer_id: [9u8; 20],
        })
            .into();
        engine.peers[0].rx.push_bytes(&greeting);
        engine.drive_peer(0, clock(1)).unwrap();

        assert_eq!(engine.peers[0].stage, PeerStage::Handshaked);
        assert_eq!(engine.peers[0].remote_id, Some([9u8; 20]));
        // empty bitfield then unchoke staged for the remote
        assert!(!engine.peers[0].outbox.is_empty());
    }

    #[test]
    fn housekeeping_requeues_aged_requests() {
        let mut engine = test_engine(1);
        handshake_peer(&mut engine, 0);
        engine.handle_msg(0, Message::Unchoke, clock(10));
        engine.schedule(clock(10));
        let piece_index = engine.peers[0].piece.unwrap();
        assert_eq!(engine.torrent.pieces[piece_index].outstanding, 1);

        engine.peers[0].outbox.clear();
        engine.peers[0].last_recv_secs = 16; // not stalled
        engine.housekeeping(clock(17));

        // old request expired and immediately re-asked with a fresh tag
        assert_eq!(engine.torrent.pieces[piece_index].outstanding, 1);
        assert!(!engine.peers[0].outbox.is_empty());
    }
}
