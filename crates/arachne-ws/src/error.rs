//! Error types for the protocol engine.
//!
//! Protocol errors ([`HandshakeError`], [`FrameError`]) are handled inside
//! the server by rejecting the upgrade or tearing the connection down.
//! Transport errors travel back to whoever initiated the write.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

use crate::connection::ConnectionId;

/// Result type for engine operations.
pub type WsResult<T> = Result<T, WsError>;

/// Rejection reasons for an HTTP upgrade request.
#[derive(Debug, Error)]
pub enum HandshakeError {
    #[error("missing Sec-WebSocket-Key header")]
    MissingKey,

    #[error("malformed request: {0}")]
    MalformedRequest(String),

    #[error("request head exceeds {limit} bytes")]
    RequestTooLarge { limit: usize },

    #[error("read request: {0}")]
    Io(#[from] io::Error),
}

/// Failures while decoding a single frame.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FrameError {
    /// Fewer bytes than the header itself declares.
    #[error("frame header truncated: need {needed} bytes, have {available}")]
    Truncated { needed: usize, available: usize },

    #[error("declared payload length {declared} exceeds the {available} bytes available")]
    PayloadOutOfBounds { declared: u64, available: usize },

    #[error("MSB of 64-bit payload length must be 0")]
    LengthMsbSet,

    #[error("payload length {len} exceeds maximum {max}")]
    TooLarge { len: u64, max: u64 },

    #[error("client frame is not masked")]
    Unmasked,

    #[error("text frame payload is not valid UTF-8")]
    InvalidUtf8,
}

/// Umbrella error for connection and server operations.
#[derive(Debug, Error)]
pub enum WsError {
    #[error("handshake rejected: {0}")]
    Handshake(#[from] HandshakeError),

    #[error("protocol error: {0}")]
    Frame(#[from] FrameError),

    #[error("connection {0} is not open")]
    ConnectionClosed(ConnectionId),

    #[error("transport error: {0}")]
    Transport(#[from] io::Error),
}

/// Failures while loading [`Options`](crate::config::Options).
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {}: {source}", .path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to parse options: {0}")]
    Parse(#[from] toml::de::Error),
}
