use thiserror::Error;

/// Failures of a single piece-download attempt on one connection.
///
/// Every variant sends the piece back to the scheduler; only
/// `ConnectionLost` also ends the worker that owned the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum DownloadError {
    /// The peer never unchoked us within the allowed wait.
    #[error("timed out waiting for unchoke")]
    Timeout,
    /// The peer choked us while blocks were outstanding.
    #[error("peer choked us mid-piece")]
    Choked,
    /// Read/write failure, malformed frame or idle timeout. The connection is closed.
    #[error("connection lost")]
    ConnectionLost,
}

#[derive(Debug, Error)]
pub enum ApplicationError {
    #[error("parser error: {0}")]
    ParserError(String),

    #[error("tracker error: {0}")]
    TrackerError(String),

    /// Bad protocol string, info-hash mismatch or handshake timeout.
    #[error("handshake error: {0}")]
    HandshakeError(String),

    /// Framing or length violation on the wire.
    #[error("malformed message: {0}")]
    MalformedMessage(String),

    #[error(transparent)]
    Download(#[from] DownloadError),

    #[error("hash mismatch for piece {0}")]
    HashMismatch(usize),

    /// Every connection is gone while pieces are still missing.
    #[error("insufficient peers: {remaining} piece(s) left and no usable connection")]
    InsufficientPeers { remaining: usize },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}
