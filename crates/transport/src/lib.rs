//! Abstract duplex connection contract.
//!
//! The RPC engine never touches sockets. It consumes a message-oriented,
//! bidirectional [`Connection`] and leaves framing of the byte stream (if any)
//! to the concrete binding. Each `send` delivers exactly one message and each
//! `recv` yields exactly one message, in order.
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

pub mod error;

use async_trait::async_trait;
use bytes::Bytes;

pub use error::TransportError;
pub use error::TransportError as Error;

/// A duplex, message-oriented connection between two endpoints.
///
/// `send` and `recv` may be called concurrently from different tasks; the
/// engine runs one writer and one reader per connection.
#[async_trait]
pub trait Connection: Send + Sync + 'static {
    /// Send one message to the peer.
    async fn send(&self, message: Bytes) -> Result<(), TransportError>;

    /// Receive the next message from the peer.
    ///
    /// Returns [`TransportError::ConnectionClosed`] once either side closed.
    async fn recv(&self) -> Result<Bytes, TransportError>;

    /// Close the connection. Pending and future `recv` calls on both ends
    /// resolve with [`TransportError::ConnectionClosed`].
    async fn close(&self) -> Result<(), TransportError>;

    /// Short human-readable description used in log lines.
    fn describe(&self) -> String {
        "connection".to_string()
    }
}
