/// Initial capacity; large enough for a full 16 KiB block message plus
/// headers without reallocation in the common case.
const INITIAL_CAPACITY: usize = 32 * 1024;

/// Byte accumulator between the socket and the message parser.
///
/// Socket reads land in the writable tail via [`writable`](Self::writable)
/// and [`mark_received`](Self::mark_received); the parser consumes complete
/// messages from the front via [`unprocessed`](Self::unprocessed) and
/// [`advance`](Self::advance). Consumed bytes are reclaimed by shifting the
/// remainder down whenever the tail runs out, so a slow parser never sees
/// torn messages and the buffer only grows for oversized single messages.
#[derive(Debug)]
pub struct RecvBuffer {
    data: Vec<u8>,
    received: usize,
    processed: usize,
}

impl Default for RecvBuffer {
    fn default() -> Self {
        Self::new()
    }
}

impl RecvBuffer {
    pub fn new() -> Self {
        Self {
            data: vec![0; INITIAL_CAPACITY],
            received: 0,
            processed: 0,
        }
    }

    /// Bytes received but not yet consumed by the parser.
    pub fn unprocessed(&self) -> &[u8] {
        &self.data[self.processed..self.received]
    }

    pub fn len(&self) -> usize {
        self.received - self.processed
    }

    pub fn is_empty(&self) -> bool {
        self.received == self.processed
    }

    /// Marks `n` bytes at the front as consumed.
    pub fn advance(&mut self, n: usize) {
        debug_assert!(self.processed + n <= self.received);
        self.processed += n;
        if self.processed == self.received {
            self.processed = 0;
            self.received = 0;
        }
    }

    /// Returns the writable tail for a socket read, compacting or growing
    /// first so the slice is never empty.
    pub fn writable(&mut self) -> &mut [u8] {
        if self.received == self.data.len() {
            if self.processed > 0 {
                self.data.copy_within(self.processed..self.received, 0);
                self.received -= self.processed;
                self.processed = 0;
            } else {
                self.data.resize(self.data.len() * 2, 0);
            }
        }
        &mut self.data[self.received..]
    }

    /// Commits `n` bytes written into the slice returned by
    /// [`writable`](Self::writable).
    pub fn mark_received(&mut self, n: usize) {
        debug_assert!(self.received + n <= self.data.len());
        self.received += n;
    }

    /// Appends bytes through the writable path. Used by tests and by code
    /// that already holds the bytes in memory.
    pub fn push_bytes(&mut self, bytes: &[u8]) {
        let mut offset = 0;
        while offset < bytes.len() {
            let dst = self.writable();
            let n = dst.len().min(bytes.len() - offset);
            dst[..n].copy_from_slice(&bytes[offset..offset + n]);
            self.mark_received(n);
            offset += n;
        }
    }
}
