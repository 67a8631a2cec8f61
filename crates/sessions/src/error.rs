//! Error types for session synchronization.

use tether_rpc::{CodecError, RpcError};
use thiserror::Error;

/// Result type alias for session operations.
pub type Result<T> = std::result::Result<T, SessionError>;

/// Errors raised by [`Session`](crate::Session) operations.
#[derive(Debug, Error)]
pub enum SessionError {
    /// The peer kept rejecting the transaction.
    #[error("Transaction conflicted {attempts} times in a row on {keys:?}")]
    ConflictRetriesExhausted {
        /// Attempts made, the first one included.
        attempts: u32,
        /// Keys of the last conflict.
        keys: Vec<String>,
    },

    /// A value could not be encoded or decoded.
    #[error("Codec error on key {key}: {source}")]
    Codec {
        /// The key whose value failed.
        key: String,
        /// Underlying failure.
        #[source]
        source: CodecError,
    },

    /// The sync call to the peer failed.
    #[error("Sync call failed: {0}")]
    Rpc(#[from] RpcError),

    /// The connection behind the session is gone.
    #[error("Session closed")]
    Closed,
}
