//! Error types for duplex connections.

use thiserror::Error;

/// Errors surfaced by a [`Connection`](crate::Connection) implementation.
#[derive(Debug, Error)]
pub enum TransportError {
    /// The connection has been closed, locally or by the peer.
    #[error("Connection closed")]
    ConnectionClosed,

    /// The message could not be delivered.
    #[error("Send failed: {0}")]
    SendFailed(String),

    /// The message exceeds what the connection accepts.
    #[error("Message size {size} exceeds maximum {max}")]
    MessageTooLarge {
        /// Size of the rejected message.
        size: usize,
        /// Maximum accepted size.
        max: usize,
    },

    /// I/O failure from an underlying stream.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Anything else.
    #[error("{0}")]
    Other(String),
}
