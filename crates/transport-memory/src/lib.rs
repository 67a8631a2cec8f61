//! In-memory duplex connection for testing.
//!
//! [`MemoryConnection::pair`] returns two connected endpoints that exchange
//! whole messages over bounded channels. Closing either end closes both,
//! which makes it a faithful stand-in for a socket binding in tests.
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

use async_trait::async_trait;
use bytes::Bytes;
use tether_transport::{Connection, TransportError};
use tokio_util::sync::CancellationToken;
use tracing::debug;
use uuid::Uuid;

/// Options for a memory connection pair.
#[derive(Debug, Clone)]
pub struct MemoryOptions {
    /// Messages buffered per direction before `send` waits.
    pub capacity: usize,
    /// Largest accepted message, if limited.
    pub max_message_size: Option<usize>,
}

impl Default for MemoryOptions {
    fn default() -> Self {
        Self {
            capacity: 100,
            max_message_size: None,
        }
    }
}

/// One end of an in-memory connection pair.
pub struct MemoryConnection {
    id: Uuid,
    side: &'static str,
    sender: flume::Sender<Bytes>,
    receiver: flume::Receiver<Bytes>,
    closed: CancellationToken,
    max_message_size: Option<usize>,
}

impl std::fmt::Debug for MemoryConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryConnection")
            .field("id", &self.id)
            .field("side", &self.side)
            .field("closed", &self.closed.is_cancelled())
            .finish_non_exhaustive()
    }
}

impl MemoryConnection {
    /// Create a connected pair with default options.
    #[must_use]
    pub fn pair() -> (Self, Self) {
        Self::pair_with_options(&MemoryOptions::default())
    }

    /// Create a connected pair.
    #[must_use]
    pub fn pair_with_options(options: &MemoryOptions) -> (Self, Self) {
        let (a_to_b_tx, a_to_b_rx) = flume::bounded(options.capacity);
        let (b_to_a_tx, b_to_a_rx) = flume::bounded(options.capacity);
        let id = Uuid::new_v4();
        let closed = CancellationToken::new();

        let a = Self {
            id,
            side: "a",
            sender: a_to_b_tx,
            receiver: b_to_a_rx,
            closed: closed.clone(),
            max_message_size: options.max_message_size,
        };
        let b = Self {
            id,
            side: "b",
            sender: b_to_a_tx,
            receiver: a_to_b_rx,
            closed,
            max_message_size: options.max_message_size,
        };

        debug!("Created memory connection pair {id}");

        (a, b)
    }

    /// Connection pair identifier shared by both ends.
    #[must_use]
    pub const fn id(&self) -> Uuid {
        self.id
    }

    /// Whether either end has closed the pair.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }
}

#[async_trait]
impl Connection for MemoryConnection {
    async fn send(&self, message: Bytes) -> Result<(), TransportError> {
        if self.closed.is_cancelled() {
            return Err(TransportError::ConnectionClosed);
        }

        match self.max_message_size {
            Some(max) if message.len() > max => {
                return Err(TransportError::MessageTooLarge {
                    size: message.len(),
                    max,
                });
            }
            _ => {}
        }

        tokio::select! {
            () = self.closed.cancelled() => Err(TransportError::ConnectionClosed),
            result = self.sender.send_async(message) => {
                result.map_err(|_| TransportError::ConnectionClosed)
            }
        }
    }

    async fn recv(&self) -> Result<Bytes, TransportError> {
        tokio::select! {
            biased;
            () = self.closed.cancelled() => Err(TransportError::ConnectionClosed),
            result = self.receiver.recv_async() => {
                result.map_err(|_| TransportError::ConnectionClosed)
            }
        }
    }

    async fn close(&self) -> Result<(), TransportError> {
        debug!("Closing memory connection {} ({})", self.id, self.side);
        self.closed.cancel();
        Ok(())
    }

    fn describe(&self) -> String {
        format!("memory:{}:{}", self.id, self.side)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_pair_is_bidirectional() {
        let _ = tracing_subscriber::fmt::try_init();

        let (a, b) = MemoryConnection::pair();

        a.send(Bytes::from("Hello, Memory!")).await.unwrap();
        assert_eq!(b.recv().await.unwrap(), Bytes::from("Hello, Memory!"));

        b.send(Bytes::from("Hello back!")).await.unwrap();
        assert_eq!(a.recv().await.unwrap(), Bytes::from("Hello back!"));
    }

    #[tokio::test]
    async fn test_messages_keep_order() {
        let (a, b) = MemoryConnection::pair();

        for i in 0..10u8 {
            a.send(Bytes::from(vec![i])).await.unwrap();
        }
        for i in 0..10u8 {
            assert_eq!(b.recv().await.unwrap(), Bytes::from(vec![i]));
        }
    }

    #[tokio::test]
    async fn test_close_wakes_pending_recv_on_both_ends() {
        let (a, b) = MemoryConnection::pair();

        let pending = tokio::spawn(async move { b.recv().await });
        tokio::task::yield_now().await;

        a.close().await.unwrap();

        assert!(matches!(
            pending.await.unwrap(),
            Err(TransportError::ConnectionClosed)
        ));
        assert!(matches!(
            a.send(Bytes::from_static(b"late")).await,
            Err(TransportError::ConnectionClosed)
        ));
    }

    #[tokio::test]
    async fn test_dropped_peer_reads_as_closed() {
        let (a, b) = MemoryConnection::pair();
        drop(b);

        assert!(matches!(
            a.recv().await,
            Err(TransportError::ConnectionClosed)
        ));
    }

    #[tokio::test]
    async fn test_message_size_limit() {
        let (a, _b) = MemoryConnection::pair_with_options(&MemoryOptions {
            capacity: 4,
            max_message_size: Some(4),
        });

        let result = a.send(Bytes::from_static(b"too long")).await;
        assert!(matches!(
            result,
            Err(TransportError::MessageTooLarge { size: 8, max: 4 })
        ));
    }
}
