#[derive(Debug)]
pub enum Error {
    Bencode(crate::bencode::ParseError),
    Io(std::io::Error),
    ValueTypeMissingOrInvalid(String),
    ValueLengthInvalid(String),
    Utf8Invalid(std::string::FromUtf8Error),
    AddrInvalid(std::net::AddrParseError),
    Hyper(hyper::Error),
    Http(hyper::http::Error),
    UriInvalid(hyper::http::uri::InvalidUri),
    Timeout(tokio::time::error::Elapsed),
    HandshakeInvalid,
    PeerDisconnected,
    PartialSend { sent: usize, len: usize },
    PieceIndexInvalid { index: usize, piece_count: usize },
    BlockMisaligned { begin: usize },
    BlockOutOfRange { block: usize, total_blocks: usize },
    BlockSizeMismatch { got: usize, expected: usize },
    PieceHashMismatch { index: usize },
    TrackerFailure(String),
    TrackerResponseInvalid(String),
    TransactionIdMismatch,
    NoPeers,
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Error::Bencode(e) => write!(f, "{}", e),
            Error::Io(e) => write!(f, "io error: {}", e),
            Error::ValueTypeMissingOrInvalid(value) => {
                write!(f, "value {:?} missing or has invalid type", value)
            }
            Error::ValueLengthInvalid(value) => write!(f, "value {:?} has invalid length", value),
            Error::Utf8Invalid(e) => write!(f, "invalid UTF-8 encoding: {}", e),
            Error::AddrInvalid(e) => write!(f, "invalid peer address: {}", e),
            Error::Hyper(e) => write!(f, "http error: {}", e),
            Error::Http(e) => write!(f, "http error: {}", e),
            Error::UriInvalid(e) => write!(f, "invalid URI: {}", e),
            Error::Timeout(e) => write!(f, "timed out: {}", e),
            Error::HandshakeInvalid => write!(f, "peer sent an invalid handshake"),
            Error::PeerDisconnected => write!(f, "peer closed the connection"),
            Error::PartialSend { sent, len } => {
                write!(f, "short send to peer: sent {} of {} bytes", sent, len)
            }
            Error::PieceIndexInvalid { index, piece_count } => {
                write!(f, "piece index {} out of range ({} pieces)", index, piece_count)
            }
            Error::BlockMisaligned { begin } => {
                write!(f, "block offset {} is not block-aligned", begin)
            }
            Error::BlockOutOfRange { block, total_blocks } => {
                write!(f, "block index {} exceeds total blocks {}", block, total_blocks)
            }
            Error::BlockSizeMismatch { got, expected } => {
                write!(f, "block size mismatch: got {}, expected {}", got, expected)
            }
            Error::PieceHashMismatch { index } => {
                write!(f, "hash verification failed for piece {}", index)
            }
            Error::TrackerFailure(reason) => write!(f, "tracker returned failure: {}", reason),
            Error::TrackerResponseInvalid(what) => {
                write!(f, "invalid tracker response: {}", what)
            }
            Error::TransactionIdMismatch => {
                write!(f, "tracker response transaction id does not match")
            }
            Error::NoPeers => write!(f, "no peers available"),
        }
    }
}

impl std::error::Error for Error {}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e)
    }
}
impl From<crate::bencode::ParseError> for Error {
    fn from(e: crate::bencode::ParseError) -> Self {
        Self::Bencode(e)
    }
}
impl From<std::string::FromUtf8Error> for Error {
    fn from(e: std::string::FromUtf8Error) -> Self {
        Self::Utf8Invalid(e)
    }
}
impl From<std::net::AddrParseError> for Error {
    fn from(e: std::net::AddrParseError) -> Self {
        Self::AddrInvalid(e)
    }
}
impl From<hyper::Error> for Error {
    fn from(e: hyper::Error) -> Self {
        Self::Hyper(e)
    }
}
impl From<hyper::http::Error> for Error {
    fn from(e: hyper::http::Error) -> Self {
        Self::Http(e)
    }
}
impl From<hyper::http::uri::InvalidUri> for Error {
    fn from(e: hyper::http::uri::InvalidUri) -> Self {
        Self::UriInvalid(e)
    }
}
impl From<tokio::time::error::Elapsed> for Error {
    fn from(e: tokio::time::error::Elapsed) -> Self {
        Self::Timeout(e)
    }
}
