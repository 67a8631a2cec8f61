//! Node configuration.

use std::time::Duration;

use crate::handshake::PROTOCOL_VERSION;
use crate::serialization::{MAX_FRAME_SIZE, SerializationFormat};

/// Configuration for an RPC node.
#[derive(Debug, Clone)]
pub struct NodeConfig {
    /// Protocol versions this node speaks. The highest common one wins.
    pub protocol_versions: Vec<u32>,
    /// Frame format proposed when connecting.
    pub frame_format: SerializationFormat,
    /// Frame formats accepted from a connecting peer.
    pub accepted_frame_formats: Vec<SerializationFormat>,
    /// Format for payloads this node encodes.
    pub payload_format: SerializationFormat,
    /// Bound on the whole handshake.
    pub handshake_timeout: Duration,
    /// Incoming calls served at once; further opens are refused with
    /// [`crate::fault::TooManyCallsError`].
    pub max_concurrent_calls: usize,
    /// Encoded frames queued for the writer before senders wait.
    pub outbound_queue_capacity: usize,
    /// Recently finished references remembered per direction, so late
    /// frames for them are dropped quietly.
    pub retired_reference_capacity: usize,
    /// How long a stream producer waits for the next `Start`.
    pub stream_start_timeout: Option<Duration>,
    /// Largest encoded frame accepted or sent.
    pub max_frame_size: usize,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            protocol_versions: vec![PROTOCOL_VERSION],
            frame_format: SerializationFormat::CBOR,
            accepted_frame_formats: vec![SerializationFormat::CBOR, SerializationFormat::JSON],
            payload_format: SerializationFormat::CBOR,
            handshake_timeout: Duration::from_secs(10),
            max_concurrent_calls: 1024,
            outbound_queue_capacity: 1024,
            retired_reference_capacity: 1024,
            stream_start_timeout: Some(Duration::from_secs(60)),
            max_frame_size: MAX_FRAME_SIZE,
        }
    }
}
