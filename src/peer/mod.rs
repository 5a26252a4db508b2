pub mod proto;
pub mod recv_buffer;

use crate::bitfield::Bitfield;
use crate::error::Error;
use proto::{Message, PeerId};
use recv_buffer::RecvBuffer;

use futures_util::future::FutureExt;
use tokio::net::TcpStream;

use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;

#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum PeerStage {
    /// Known address, no connection attempt yet.
    Init,
    /// TCP connect in flight.
    Connecting,
    /// Connected, our handshake not yet queued.
    Connected,
    /// Our handshake sent, waiting for the remote's.
    WaitHandshake,
    /// Handshakes exchanged, message pump running.
    Handshaked,
    /// Download finished cleanly with this peer.
    Done,
    /// Failed or evicted; never revisited.
    Error,
}

type ConnectFuture = Pin<Box<dyn Future<Output = std::io::Result<TcpStream>>>>;

/// One remote peer: connection stage, socket, staged output and receive
/// buffer, plus the scheduler-facing state (bitfield, choke/interest flags,
/// assigned piece).
///
/// Outgoing messages are staged in `outbox` and flushed on writability, so
/// everything above the socket can be driven in tests without I/O.
pub struct Peer {
    pub addr: SocketAddr,
    pub stage: PeerStage,
    pub stream: Option<TcpStream>,
    connect: Option<ConnectFuture>,
    pub rx: RecvBuffer,
    pub outbox: Vec<u8>,
    pub bitfield: Bitfield,
    pub remote_id: Option<PeerId>,
    /// We told the remote we are interested.
    pub interested_sent: bool,
    /// The remote currently chokes us; starts true per the protocol.
    pub choked: bool,
    /// Piece this peer is downloading; kept in sync with
    /// `Piece::current_peer` by the scheduler.
    pub piece: Option<usize>,
    /// Scheduling preference; lowered when the peer is evicted for being
    /// slow, so better peers win ties.
    pub priority: i64,
    pub last_recv_secs: u64,
    pub last_send_secs: u64,
}

impl Peer {
    pub fn new(addr: SocketAddr, piece_count: usize) -> Self {
        Self {
            addr,
            stage: PeerStage::Init,
            stream: None,
            connect: None,
            rx: RecvBuffer::new(),
            outbox: Vec::new(),
            bitfield: Bitfield::new(piece_count),
            remote_id: None,
            interested_sent: false,
            choked: true,
            piece: None,
            priority: 0,
            last_recv_secs: 0,
            last_send_secs: 0,
        }
    }

    pub fn is_failed(&self) -> bool {
        matches!(self.stage, PeerStage::Error)
    }

    /// Connection is open and the message pump may run.
    pub fn is_connected(&self) -> bool {
        matches!(
            self.stage,
            PeerStage::Connected | PeerStage::WaitHandshake | PeerStage::Handshaked
        )
    }

    /// Kicks off a non-blocking TCP connect. A connect to a reachable local
    /// address can complete on the first poll; otherwise the future is kept
    /// and polled by the readiness sweep.
    pub fn start_connect(&mut self, now_secs: u64) -> Result<(), Error> {
        let mut fut: ConnectFuture = Box::pin(TcpStream::connect(self.addr));
        self.stage = PeerStage::Connecting;
        self.last_recv_secs = now_secs;
        self.last_send_secs = now_secs;
        match fut.as_mut().now_or_never() {
            Some(Ok(stream)) => {
                self.stream = Some(stream);
                self.stage = PeerStage::Connected;
                Ok(())
            }
            Some(Err(e)) => {
                self.stage = PeerStage::Error;
                Err(e.into())
            }
            None => {
                self.connect = Some(fut);
                Ok(())
            }
        }
    }

    pub fn connect_future(&mut self) -> Option<&mut ConnectFuture> {
        self.connect.as_mut()
    }

    /// Called by the readiness sweep when the connect future resolves.
    pub fn finish_connect(&mut self, result: std::io::Result<TcpStream>) -> Result<(), Error> {
        self.connect = None;
        match result {
            Ok(stream) => {
                self.stream = Some(stream);
                self.stage = PeerStage::Connected;
                Ok(())
            }
            Err(e) => {
                self.stage = PeerStage::Error;
                Err(e.into())
            }
        }
    }

    /// Stages a message for the next flush.
    pub fn send_msg(&mut self, msg: &Message) {
        msg.encode_into(&mut self.outbox);
    }

    pub fn send_handshake(&mut self, handshake: &proto::Handshake) {
        let bytes: Vec<u8> = handshake.into();
        self.outbox.extend_from_slice(&bytes);
        self.stage = PeerStage::WaitHandshake;
    }

    /// Writes the staged outbox to the socket. A write that stops partway
    /// through leaves the remote mid-message with no way to resync, so it
    /// fails the peer. A full send clears the outbox.
    pub fn flush(&mut self, now_secs: u64) -> Result<(), Error> {
        if self.outbox.is_empty() {
            return Ok(());
        }
        let stream = self.stream.as_ref().ok_or(Error::PeerDisconnected)?;
        let len = self.outbox.len();
        let mut sent = 0;
        while sent < len {
            match stream.try_write(&self.outbox[sent..]) {
                Ok(0) => return Err(Error::PeerDisconnected),
                Ok(n) => sent += n,
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                    if sent == 0 {
                        // nothing left the process yet, retry on the next
                        // writability pass
                        return Ok(());
                    }
                    return Err(Error::PartialSend { sent, len });
                }
                Err(e) => return Err(e.into()),
            }
        }
        self.outbox.clear();
        self.last_send_secs = now_secs;
        Ok(())
    }

    /// Drains the readable socket into the receive buffer. Returns the
    /// number of bytes read; zero means the socket produced only
    /// would-block (a spurious readiness wakeup).
    pub fn read_from_stream(&mut self, now_secs: u64) -> Result<usize, Error> {
        let mut total = 0;
        loop {
            let stream = match self.stream.as_ref() {
                Some(s) => s,
                None => return Err(Error::PeerDisconnected),
            };
            let n = match stream.try_read(self.rx.writable()) {
                Ok(0) => return Err(Error::PeerDisconnected),
                Ok(n) => n,
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                Err(e) => return Err(e.into()),
            };
            self.rx.mark_received(n);
            total += n;
        }
        if total > 0 {
            self.last_recv_secs = now_secs;
        }
        Ok(total)
    }

    /// Drops the socket and any staged output. The stage is set by the
    /// caller, which knows whether this is completion or failure.
    pub fn disconnect(&mut self) {
        self.stream = None;
        self.connect = None;
        self.outbox.clear();
    }
}
