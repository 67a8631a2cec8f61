//! Error types for the RPC node.
//!
//! These are local, engine-level failures. Faults that travel across the
//! connection live in [`crate::fault`].

use std::time::Duration;

use tether_transport::TransportError;
use thiserror::Error;

use crate::call::ServiceCallIdentifier;
use crate::extension::ExtensionIdentifier;
use crate::node::NodeState;
use crate::serialization::SerializationFormat;

/// Result type alias for node operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for node operations.
#[derive(Debug, Error)]
pub enum Error {
    /// Transport-level failure.
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    /// Protocol-level errors.
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// Codec errors during serialization/deserialization.
    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    /// Handshake failed.
    #[error("Handshake failed: {0}")]
    Handshake(#[from] HandshakeError),

    /// An extension failed to bind or run.
    #[error("Extension {identifier} failed: {reason}")]
    Extension {
        /// The failing extension.
        identifier: ExtensionIdentifier,
        /// Why it failed.
        reason: String,
    },

    /// Two registered services declare the same call.
    #[error("Call {0} is registered more than once")]
    DuplicateCall(ServiceCallIdentifier),

    /// The node is not in the state the operation needs.
    #[error("Invalid node state: expected {expected}, got {actual}")]
    InvalidState {
        /// Required state.
        expected: NodeState,
        /// Current state.
        actual: NodeState,
    },

    /// Operation timed out.
    #[error("Operation timed out after {0:?}")]
    Timeout(Duration),

    /// The node closed while the operation was pending.
    #[error("Connection closed")]
    ConnectionClosed,
}

/// Protocol-level errors.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Frame too large.
    #[error("Frame size {size} exceeds maximum {max}")]
    FrameTooLarge {
        /// Size of the frame.
        size: usize,
        /// Maximum allowed size.
        max: usize,
    },

    /// An event arrived that the call's current state does not allow.
    #[error("Unexpected event: expected {expected}, got {actual}")]
    UnexpectedEvent {
        /// What the call was waiting for.
        expected: String,
        /// What arrived instead.
        actual: String,
    },
}

/// Codec-related errors.
#[derive(Debug, Error)]
pub enum CodecError {
    /// Serialization failed.
    #[error("Failed to serialize: {0}")]
    SerializationFailed(String),

    /// Deserialization failed.
    #[error("Failed to deserialize: {0}")]
    DeserializationFailed(String),

    /// The format is known but has no built-in codec.
    #[error("Unsupported format: {0}")]
    UnsupportedFormat(SerializationFormat),

    /// The wire identifier matches no known format.
    #[error("Unknown format identifier: {0}")]
    UnknownFormat(i8),

    /// The encoded frame exceeds the configured maximum.
    #[error("Frame size {size} exceeds maximum {max}")]
    FrameTooLarge {
        /// Size of the frame.
        size: usize,
        /// Maximum allowed size.
        max: usize,
    },
}

/// Handshake failures. Any of them aborts the connection.
#[derive(Debug, Error)]
pub enum HandshakeError {
    /// The peers share no protocol version.
    #[error("No common protocol version (local {local:?}, remote {remote:?})")]
    NoCommonVersion {
        /// Versions this node supports.
        local: Vec<u32>,
        /// Versions the peer offered.
        remote: Vec<u32>,
    },

    /// The proposed frame format is not accepted.
    #[error("Frame format {0} is not accepted")]
    UnsupportedFrameFormat(SerializationFormat),

    /// The peer requires an extension this node does not have.
    #[error("Peer requires missing extensions: {0:?}")]
    MissingExtensions(Vec<ExtensionIdentifier>),

    /// The peer rejected the handshake.
    #[error("Rejected by peer: {0}")]
    Rejected(String),

    /// A message arrived out of order or could not be parsed.
    #[error("Unexpected handshake message: {0}")]
    UnexpectedMessage(String),
}
