use thiserror::Error;

/// Errors surfaced by DHT operations.
#[derive(Debug, Error)]
pub enum DhtError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("bencode error: {0}")]
    Bencode(#[from] crate::bencode::BencodeError),

    /// A frame decoded as bencode but does not match any message shape.
    /// Malformed packets are logged and dropped; this only reaches callers
    /// through explicit parse APIs.
    #[error("malformed message: {0}")]
    MalformedMessage(String),

    #[error("invalid id length: {0} bytes")]
    InvalidIdLength(usize),

    #[error("invalid hex id")]
    InvalidHexId,

    /// An outgoing frame would exceed the packet cap.
    #[error("message too large: {0} bytes")]
    MessageTooLarge(usize),

    /// No response after the full retry budget.
    #[error("request timed out")]
    Timeout,

    /// The remote peer answered with an error frame.
    #[error("remote error {code}: {text}")]
    Remote { code: i64, text: String },

    /// A store request carried a token that verifies against neither the
    /// current nor the previous secret.
    #[error("invalid store token")]
    InvalidToken,

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Operation refused because the node is shutting down.
    #[error("node is shutting down")]
    ShuttingDown,
}
