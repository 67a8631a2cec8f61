//! Events exchanged within a call.
//!
//! Upstream events travel from caller to callee, downstream events from
//! callee to caller. Only the owner of a direction emits its events.

use serde::{Deserialize, Serialize};

use crate::call::{CallShape, ServiceCallIdentifier};
use crate::fault::FaultEnvelope;
use crate::serialization::SerializedPayload;

/// Pull-based flow control signal sent by the consumer of a stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamOperation {
    /// Request exactly one further stream event.
    Start,
    /// End the stream early.
    Close,
}

/// Wire form of one stream event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamFrame {
    /// One element.
    Element(SerializedPayload),
    /// The producer is exhausted.
    Complete,
    /// The producer failed.
    Error(FaultEnvelope),
}

impl StreamFrame {
    /// Whether no further stream event may follow this one.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        !matches!(self, Self::Element(_))
    }
}

/// Outcome carried by a `Response` event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponsePayload {
    /// The call succeeded.
    Success(SerializedPayload),
    /// The call failed.
    Error(FaultEnvelope),
}

/// Events emitted by the caller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpstreamEvent {
    /// Begin a call.
    Open {
        /// The call to run.
        service_call: ServiceCallIdentifier,
        /// Shape the caller expects.
        shape: CallShape,
        /// Initial request.
        payload: SerializedPayload,
    },
    /// Upstream stream event.
    Data(StreamFrame),
    /// Flow control for the downstream direction.
    StreamOperation(StreamOperation),
    /// Non-fatal notice.
    Warning {
        /// Human-readable text.
        message: String,
    },
    /// The caller failed the call.
    Error(FaultEnvelope),
    /// The caller abandoned the call.
    Cancel,
}

impl UpstreamEvent {
    /// Short name for logs.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Open { .. } => "open",
            Self::Data(_) => "data",
            Self::StreamOperation(StreamOperation::Start) => "start",
            Self::StreamOperation(StreamOperation::Close) => "close",
            Self::Warning { .. } => "warning",
            Self::Error(_) => "error",
            Self::Cancel => "cancel",
        }
    }
}

/// Events emitted by the callee.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DownstreamEvent {
    /// A streaming call is ready.
    Opened,
    /// Downstream stream event.
    Data(StreamFrame),
    /// Final outcome of a call with a single response.
    Response(ResponsePayload),
    /// Flow control for the upstream direction.
    StreamOperation(StreamOperation),
    /// Non-fatal notice.
    Warning {
        /// Human-readable text.
        message: String,
    },
    /// The callee failed the call.
    Error(FaultEnvelope),
}

impl DownstreamEvent {
    /// Short name for logs.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Opened => "opened",
            Self::Data(_) => "data",
            Self::Response(_) => "response",
            Self::StreamOperation(StreamOperation::Start) => "start",
            Self::StreamOperation(StreamOperation::Close) => "close",
            Self::Warning { .. } => "warning",
            Self::Error(_) => "error",
        }
    }
}
