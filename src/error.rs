use std::fmt;
use thiserror::Error;

/// Which deadline expired.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutKind {
    Dial,
    Read,
    Write,
    /// Waiting for the peer's extension handshake.
    Handshake,
    /// The overall wait for metadata pieces.
    Pieces,
    /// Waiting for room in the collector's admission queue.
    Enqueue,
}

impl fmt::Display for TimeoutKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TimeoutKind::Dial => "dial",
            TimeoutKind::Read => "read",
            TimeoutKind::Write => "write",
            TimeoutKind::Handshake => "extension handshake",
            TimeoutKind::Pieces => "pieces",
            TimeoutKind::Enqueue => "enqueue",
        };
        f.write_str(s)
    }
}

/// Errors produced while resolving metadata or submitting work to a collector.
#[derive(Debug, Error)]
pub enum MetadataError {
    /// The TCP connection to the peer could not be established.
    #[error("connect error: {0}")]
    Connect(#[source] std::io::Error),

    /// Socket I/O failed after the connection was up (including a short read).
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// The peer sent something that does not follow the wire protocol.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// The peer answered a piece request with a reject message.
    #[error("rejected by peer (piece {piece})")]
    RejectedByPeer { piece: i64 },

    #[error("{0} timeout")]
    Timeout(TimeoutKind),

    /// The advertised metadata size needs more pieces than we are willing to request.
    #[error("too many metadata pieces: {pieces}")]
    TooManyPieces { pieces: u64 },

    /// Bencoded data had an unexpected shape or could not be parsed.
    #[error("decode error: {0}")]
    Decode(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("collector closed")]
    Closed,

    #[error("collector queue full")]
    QueueFull,

    /// A fault was caught at the query boundary.
    #[error("query panicked: {0}")]
    Panicked(String),
}

impl From<rbit::bencode::BencodeError> for MetadataError {
    fn from(err: rbit::bencode::BencodeError) -> Self {
        MetadataError::Decode(err.to_string())
    }
}

impl MetadataError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, MetadataError::Timeout(_))
    }
}
