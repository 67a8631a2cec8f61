use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::{Fault, RegisteredFault, StatusCode};
use crate::call::ServiceCallIdentifier;
use crate::protocol::RpcReference;
use crate::serialization::SerializedPayload;

/// No implementation is registered for the requested call.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error("no implementation registered for {service_call}")]
pub struct NotFoundError {
    /// The call that was requested.
    pub service_call: ServiceCallIdentifier,
}

impl Fault for NotFoundError {
    fn status_code(&self) -> StatusCode {
        StatusCode::NOT_FOUND
    }
}

impl RegisteredFault for NotFoundError {
    const DISCRIMINATOR: &'static str = "tether.NotFound";
}

/// A frame broke the call's event sequence.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error("protocol violation: {message}")]
pub struct ProtocolViolationError {
    /// What went wrong.
    pub message: String,
}

impl Fault for ProtocolViolationError {
    fn status_code(&self) -> StatusCode {
        StatusCode::BAD_REQUEST
    }
}

impl RegisteredFault for ProtocolViolationError {
    const DISCRIMINATOR: &'static str = "tether.ProtocolViolation";
}

/// A frame named a call reference that is not open.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error("unknown call reference {reference}")]
pub struct UnknownReferenceError {
    /// The unknown reference.
    pub reference: RpcReference,
}

impl Fault for UnknownReferenceError {
    fn status_code(&self) -> StatusCode {
        StatusCode::BAD_REQUEST
    }
}

impl RegisteredFault for UnknownReferenceError {
    const DISCRIMINATOR: &'static str = "tether.UnknownReference";
}

/// A stream was not started or advanced in time.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error("request timed out: {message}")]
pub struct RequestTimeoutError {
    /// What timed out.
    pub message: String,
}

impl Fault for RequestTimeoutError {
    fn status_code(&self) -> StatusCode {
        StatusCode::REQUEST_TIMEOUT
    }
}

impl RegisteredFault for RequestTimeoutError {
    const DISCRIMINATOR: &'static str = "tether.RequestTimeout";
}

/// The callee is already running as many calls as it allows.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error("too many concurrent calls, limit is {limit}")]
pub struct TooManyCallsError {
    /// The callee's concurrency limit.
    pub limit: usize,
}

impl Fault for TooManyCallsError {
    fn status_code(&self) -> StatusCode {
        StatusCode::TOO_MANY_REQUESTS
    }
}

impl RegisteredFault for TooManyCallsError {
    const DISCRIMINATOR: &'static str = "tether.TooManyCalls";
}

/// An implementation failed or panicked.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error("internal server error: {message}")]
pub struct InternalServerError {
    /// The original failure message.
    pub message: String,
    /// Messages of the underlying causes, outermost first.
    pub causes: Vec<String>,
}

impl Fault for InternalServerError {
    fn status_code(&self) -> StatusCode {
        StatusCode::INTERNAL_SERVER_ERROR
    }

    fn debug_message(&self) -> String {
        if self.causes.is_empty() {
            self.message.clone()
        } else {
            format!("{}: {}", self.message, self.causes.join(": "))
        }
    }
}

impl RegisteredFault for InternalServerError {
    const DISCRIMINATOR: &'static str = "tether.InternalServerError";
}

impl From<anyhow::Error> for InternalServerError {
    fn from(error: anyhow::Error) -> Self {
        Self {
            message: error.to_string(),
            causes: error.chain().skip(1).map(ToString::to_string).collect(),
        }
    }
}

/// The connection closed while the call was in flight.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error("connection closed: {message}")]
pub struct ConnectionClosedError {
    /// Context for the closure.
    pub message: String,
}

impl Fault for ConnectionClosedError {
    fn status_code(&self) -> StatusCode {
        StatusCode::SERVICE_UNAVAILABLE
    }
}

impl RegisteredFault for ConnectionClosedError {
    const DISCRIMINATOR: &'static str = "tether.ConnectionClosed";
}

/// The call was cancelled by its caller.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error("cancelled: {message}")]
pub struct CancelledError {
    /// Context for the cancellation.
    pub message: String,
}

impl Fault for CancelledError {
    fn status_code(&self) -> StatusCode {
        StatusCode::CLIENT_CLOSED_REQUEST
    }
}

impl RegisteredFault for CancelledError {
    const DISCRIMINATOR: &'static str = "tether.Cancelled";
}

/// A fault whose discriminator this side does not know.
///
/// Keeps everything the envelope carried, so relaying it re-encodes the
/// original discriminator and body unchanged.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{debug_message}")]
pub struct UnrecognizedRpcError {
    /// Discriminator sent by the peer.
    pub discriminator: String,
    /// Status sent by the peer.
    pub status_code: StatusCode,
    /// Message sent by the peer.
    pub debug_message: String,
    /// Raw body sent by the peer.
    pub body: Option<SerializedPayload>,
}

impl Fault for UnrecognizedRpcError {
    fn status_code(&self) -> StatusCode {
        self.status_code
    }

    fn debug_message(&self) -> String {
        self.debug_message.clone()
    }
}

impl From<super::FaultEnvelope> for UnrecognizedRpcError {
    fn from(envelope: super::FaultEnvelope) -> Self {
        Self {
            discriminator: envelope.discriminator,
            status_code: envelope.status_code,
            debug_message: envelope.debug_message,
            body: envelope.body,
        }
    }
}
