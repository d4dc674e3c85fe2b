//! Error types shared by the voice pipeline

use thiserror::Error;

/// Result type alias for pipeline operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors raised by the transport, engines and device backends.
///
/// Every variant except [`Error::Connection`] is recoverable: the session
/// turns it into a status line and returns to an interactable idle state.
#[derive(Debug, Error)]
pub enum Error {
    /// Endpoint unreachable or channel lost; terminal for the session
    #[error("connection error: {0}")]
    Connection(String),

    /// A send was attempted while the channel is not open
    #[error("not connected")]
    NotConnected,

    /// Inbound audio frame that cannot be decoded as 16-bit PCM
    #[error("corrupt audio chunk: {0}")]
    CorruptChunk(String),

    /// Microphone or output device unavailable
    #[error("device error: {0}")]
    Device(String),

    /// Unparsable or unknown control message
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Capture encoder failure
    #[error("encode error: {0}")]
    Encode(String),

    /// IO error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization error
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}
