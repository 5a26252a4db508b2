use super::metainfo::PieceHash;
use crate::error::Error;

use sha1::{Digest, Sha1};

/// Blocks are the request granularity of the peer wire: 16 KiB, except
/// possibly the final block of a piece.
pub const BLOCK_SIZE: usize = 16 * 1024;

/// Backpressure against a single peer: never more than this many
/// unanswered Request messages per piece.
pub const MAX_OUTSTANDING_REQUESTS: usize = 10;

/// A block request older than this many clock ticks is considered lost and
/// becomes eligible for re-request.
pub const REQUEST_TTL_TICKS: u8 = 4;

#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum PieceState {
    Init,
    Downloading,
    Downloaded,
    Flushed,
}

#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum BlockSave {
    Stored,
    Duplicate,
}

/// Per-piece download state. Block-tracking buffers exist only while the
/// piece is Downloading; they are freed on completion or abandonment.
///
/// `asked` holds a low-resolution timestamp tag per block (loop seconds
/// mod 256, never 0 for an in-flight request) instead of a boolean, which
/// is what makes request aging possible without a separate timer table.
#[derive(Debug)]
pub struct Piece {
    pub index: usize,
    pub hash: PieceHash,
    pub state: PieceState,
    pub length: usize,
    pub total_blocks: usize,
    pub last_block_size: usize,
    pub buffer: Vec<u8>,
    asked: Vec<u8>,
    received: Vec<bool>,
    pub received_count: usize,
    pub outstanding: usize,
    /// Index of the peer currently downloading this piece; kept in sync
    /// with `Peer::piece` by the scheduler, cleared together on
    /// deactivation.
    pub current_peer: Option<usize>,
    pub speed_bytes: usize,
    pub speed_sampled_ms: f64,
    pub speed_avg: f64,
}

impl Piece {
    pub fn new(index: usize, hash: PieceHash) -> Self {
        Self {
            index,
            hash,
            state: PieceState::Init,
            length: 0,
            total_blocks: 0,
            last_block_size: 0,
            buffer: Vec::new(),
            asked: Vec::new(),
            received: Vec::new(),
            received_count: 0,
            outstanding: 0,
            current_peer: None,
            speed_bytes: 0,
            speed_sampled_ms: 0.0,
            speed_avg: 0.0,
        }
    }

    /// Sizes the block grid and allocates the accumulation buffer. Called
    /// once per activation; the grid is fixed until the piece completes or
    /// is abandoned.
    pub fn prepare_for_download(&mut self, length: usize, now_ms: f64) {
        let total_blocks = (length + BLOCK_SIZE - 1) / BLOCK_SIZE;
        let mut last_block_size = length - (total_blocks - 1) * BLOCK_SIZE;
        if last_block_size == 0 {
            last_block_size = BLOCK_SIZE;
        }

        self.length = length;
        self.total_blocks = total_blocks;
        self.last_block_size = last_block_size;
        self.buffer = vec![0; length];
        self.asked = vec![0; total_blocks];
        self.received = vec![false; total_blocks];
        self.received_count = 0;
        self.outstanding = 0;

        self.speed_bytes = 0;
        self.speed_sampled_ms = now_ms;
        self.speed_avg = 0.0;
    }

    /// Frees block tracking and the accumulation buffer, reverting to Init.
    /// Used when a Downloading piece is abandoned or fails verification.
    pub fn reset(&mut self) {
        self.state = PieceState::Init;
        self.buffer = Vec::new();
        self.asked = Vec::new();
        self.received = Vec::new();
        self.received_count = 0;
        self.outstanding = 0;
    }

    /// Frees block tracking after a verified piece has been handed off.
    pub fn release_tracking(&mut self) {
        self.asked = Vec::new();
        self.received = Vec::new();
        self.outstanding = 0;
    }

    pub fn block_size_at(&self, block: usize) -> usize {
        if block + 1 == self.total_blocks {
            self.last_block_size
        } else {
            BLOCK_SIZE
        }
    }

    pub fn is_block_received(&self, block: usize) -> bool {
        self.received.get(block).copied().unwrap_or(false)
    }

    pub fn is_complete(&self) -> bool {
        self.total_blocks > 0 && self.received_count == self.total_blocks
    }

    /// Picks up to the outstanding-request budget of unasked, unreceived
    /// blocks, tags them with `now_tag` and returns their (begin, length)
    /// pairs for the caller to turn into Request messages.
    pub fn take_block_requests(&mut self, now_tag: u8) -> Vec<(u32, u32)> {
        let tag = if now_tag == 0 { 1 } else { now_tag };
        let mut requests = Vec::new();
        for block in 0..self.total_blocks {
            if self.outstanding >= MAX_OUTSTANDING_REQUESTS {
                break;
            }
            if self.asked[block] == 0 && !self.received[block] {
                self.asked[block] = tag;
                self.outstanding += 1;
                requests.push((
                    (block * BLOCK_SIZE) as u32,
                    self.block_size_at(block) as u32,
                ));
            }
        }
        requests
    }

    /// Clears every outstanding request, keeping received blocks. Used when
    /// the remote chokes us: in-flight requests will never be answered, but
    /// data already stored stays valid.
    pub fn release_requests(&mut self) {
        for tag in self.asked.iter_mut() {
            *tag = 0;
        }
        self.outstanding = 0;
    }

    /// Clears requests older than [`REQUEST_TTL_TICKS`], making the blocks
    /// eligible for re-request. Tags are mod-256 seconds, so the distance is
    /// computed with wrapping arithmetic.
    pub fn expire_stale_requests(&mut self, now_tag: u8) -> usize {
        let now = if now_tag == 0 { 1 } else { now_tag };
        let mut cleared = 0;
        for tag in self.asked.iter_mut() {
            if *tag != 0 && now.wrapping_sub(*tag) > REQUEST_TTL_TICKS {
                *tag = 0;
                self.outstanding -= 1;
                cleared += 1;
            }
        }
        cleared
    }

    /// Stores one received block. Duplicate deliveries are ignored; malformed
    /// offsets and sizes are rejected with a typed error, which the caller
    /// logs and drops without touching piece state.
    pub fn save_block(&mut self, begin: usize, data: &[u8]) -> Result<BlockSave, Error> {
        if begin % BLOCK_SIZE != 0 {
            return Err(Error::BlockMisaligned { begin });
        }
        let block = begin / BLOCK_SIZE;
        if block >= self.total_blocks {
            return Err(Error::BlockOutOfRange {
                block,
                total_blocks: self.total_blocks,
            });
        }
        let expected = self.block_size_at(block);
        if data.len() != expected {
            return Err(Error::BlockSizeMismatch {
                got: data.len(),
                expected,
            });
        }
        if self.received[block] {
            return Ok(BlockSave::Duplicate);
        }

        self.buffer[begin..begin + data.len()].copy_from_slice(data);
        self.received[block] = true;
        self.received_count += 1;
        if self.asked[block] != 0 {
            self.asked[block] = 0;
            self.outstanding -= 1;
        }
        Ok(BlockSave::Stored)
    }

    pub fn verify(&self) -> bool {
        let digest: [u8; 20] = Sha1::digest(&self.buffer).into();
        digest == self.hash
    }

    /// Folds bytes received since the last sample into the exponential
    /// moving average (kiB/s). Samples at most twice per second; between
    /// samples the current average is returned.
    pub fn sample_speed(&mut self, now_ms: f64) -> f64 {
        let elapsed = now_ms - self.speed_sampled_ms;
        if elapsed > 500.0 {
            let instantaneous = self.speed_bytes as f64 / elapsed * 1000.0 / 1024.0;
            self.speed_avg = self.speed_avg * 0.9 + 0.1 * instantaneous;
            self.speed_bytes = 0;
            self.speed_sampled_ms = now_ms;
            instantaneous
        } else {
            self.speed_avg
        }
    }
}
