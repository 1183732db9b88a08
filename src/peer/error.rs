use thiserror::Error;

/// Errors that terminate a peer connection.
///
/// Every variant is fatal: the connection emits
/// [`Disconnected`](super::PeerEvent::Disconnected), returns its
/// outstanding requests to the picker, and closes the socket. Retries
/// happen above this layer.
#[derive(Debug, Error)]
pub enum PeerError {
    /// Network I/O error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// The handshake bytes were invalid, the socket closed mid-handshake,
    /// the exchange timed out, or the peer is in a different swarm.
    #[error("handshake failed")]
    HandshakeFailed,

    /// Received a protocol message whose payload disagrees with its id.
    #[error("malformed message: {0}")]
    Malformed(String),

    /// Received a `Piece` that matches nothing we requested.
    #[error("unexpected piece {index}:{begin} ({length} bytes)")]
    UnexpectedPiece { index: u32, begin: u32, length: u32 },

    /// A transmitted request got no `Piece` within the request timeout.
    #[error("peer does not respond to requests")]
    PeerDoesNotRespond,

    /// The peer kept us choked too long while we had requests queued.
    #[error("peer did not unchoke us")]
    UnchokeTimeout,

    /// The connection was closed.
    #[error("connection closed")]
    ConnectionClosed,

    /// The socket produced no data within the read timeout.
    #[error("read timed out")]
    ReadTimeout,

    /// A write did not complete within the write timeout.
    #[error("write timed out")]
    WriteTimeout,
}
