//! Error types for the meshhost library.

use thiserror::Error;

/// The main error type for meshhost operations.
#[derive(Debug, Error)]
pub enum Error {
    /// Serial port error.
    #[error("serial port error: {0}")]
    Serial(#[from] tokio_serial::Error),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Frame encoding/decoding error.
    #[error("frame error: {0}")]
    Frame(#[from] FrameError),

    /// Malformed or unexpected message from the controller.
    #[error("protocol error: {message}")]
    Protocol { message: String },

    /// Connection is not established.
    #[error("not connected")]
    NotConnected,

    /// A send is already in flight on the controller link.
    #[error("controller link is busy")]
    LinkBusy,

    /// The controller did not come back after a soft reset.
    ///
    /// The link refuses new work until it is reset by a reconnect.
    #[error("controller link failed")]
    LinkFailed,

    /// Invalid configuration.
    #[error("invalid configuration: {reason}")]
    Config { reason: String },

    /// A transaction resolved with a failure.
    #[error(transparent)]
    Transaction(#[from] TransactionError),

    /// Channel send error.
    #[error("channel send error")]
    ChannelSend,

    /// Channel receive error.
    #[error("channel closed")]
    ChannelClosed,
}

/// Terminal failure of a single send-data transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum TransactionError {
    /// The controller refused the request at acceptance time.
    #[error("controller did not send the request")]
    NotSent,

    /// The controller never answered the request.
    #[error("no response from controller")]
    NoAck,

    /// The send was aborted; the delivery outcome is unknown.
    #[error("transmission aborted")]
    Aborted,

    /// The controller was soft-reset and the request was not retried further.
    #[error("controller recovered after soft reset ({retries_used} retries used)")]
    LinkRecovered { retries_used: u8 },

    /// The connection was re-established while the transaction was in flight.
    #[error("controller link was reset")]
    LinkReset,

    /// Every callback ID is currently in use.
    #[error("callback IDs exhausted")]
    Exhausted,

    /// The controller did not confirm a soft reset in time.
    #[error("controller did not recover from soft reset")]
    LinkFailed,
}

/// Frame-specific errors.
#[derive(Debug, Error)]
pub enum FrameError {
    /// Frame too short to contain its header.
    #[error("frame too short: need at least {need} bytes, got {got}")]
    TooShort { need: usize, got: usize },

    /// Frame payload exceeds maximum size.
    #[error("frame too large: {size} bytes exceeds maximum {max}")]
    TooLarge { size: usize, max: usize },

    /// Incomplete frame data.
    #[error("incomplete frame: expected {expected} bytes, got {got}")]
    Incomplete { expected: usize, got: usize },

    /// Checksum did not match the frame contents.
    #[error("checksum mismatch: expected 0x{expected:02x}, got 0x{got:02x}")]
    Checksum { expected: u8, got: u8 },

    /// Message type byte is neither request nor response.
    #[error("unknown message type 0x{0:02x}")]
    UnknownType(u8),
}

/// Result type alias for meshhost operations.
pub type Result<T> = std::result::Result<T, Error>;
