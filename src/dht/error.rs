use thiserror::Error;

#[derive(Debug, Error)]
pub enum DhtError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("bencode error: {0}")]
    Bencode(#[from] crate::bencode::BencodeError),

    /// A message decoded as bencode but does not form a valid KRPC
    /// message.
    #[error("malformed message: {0}")]
    Malformed(String),

    #[error("invalid node id length")]
    InvalidNodeId,

    /// No response arrived within the query timeout.
    #[error("query timed out")]
    Timeout,

    /// The remote answered with a KRPC error message.
    #[error("remote error {code}: {message}")]
    Remote { code: i64, message: String },

    /// The query was abandoned before a response arrived.
    #[error("query cancelled")]
    Cancelled,
}
