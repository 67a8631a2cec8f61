//! Faults that travel across the connection.
//!
//! A fault is any [`Fault`] implementation. Faults meant to survive the trip
//! also implement [`RegisteredFault`], which gives them a stable
//! discriminator and a serde body. On the receiving side the discriminator
//! is resolved against an [`ErrorRegistry`]; anything it does not know
//! becomes an [`UnrecognizedRpcError`] that still carries the status, message
//! and raw body.

mod builtin;
mod registry;

use std::any::Any;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize, de::DeserializeOwned};
use tracing::warn;

use crate::error::{CodecError, Error};
use crate::serialization::{SerializationFormat, SerializedPayload};

pub use builtin::{
    CancelledError, ConnectionClosedError, InternalServerError, NotFoundError,
    ProtocolViolationError, RequestTimeoutError, TooManyCallsError, UnknownReferenceError,
    UnrecognizedRpcError,
};
pub use registry::{ErrorRegistry, ErrorSerializer};

/// Status attached to every fault, using HTTP numbering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StatusCode(u16);

impl StatusCode {
    /// 400.
    pub const BAD_REQUEST: Self = Self(400);
    /// 404.
    pub const NOT_FOUND: Self = Self(404);
    /// 408.
    pub const REQUEST_TIMEOUT: Self = Self(408);
    /// 409.
    pub const CONFLICT: Self = Self(409);
    /// 429.
    pub const TOO_MANY_REQUESTS: Self = Self(429);
    /// 499, the caller went away.
    pub const CLIENT_CLOSED_REQUEST: Self = Self(499);
    /// 500.
    pub const INTERNAL_SERVER_ERROR: Self = Self(500);
    /// 503.
    pub const SERVICE_UNAVAILABLE: Self = Self(503);

    /// Wrap a raw code.
    #[must_use]
    pub const fn new(code: u16) -> Self {
        Self(code)
    }

    /// The raw code.
    #[must_use]
    pub const fn as_u16(self) -> u16 {
        self.0
    }

    /// Whether the caller is at fault.
    #[must_use]
    pub const fn is_client_error(self) -> bool {
        self.0 >= 400 && self.0 < 500
    }

    /// Whether the callee is at fault.
    #[must_use]
    pub const fn is_server_error(self) -> bool {
        self.0 >= 500 && self.0 < 600
    }
}

impl fmt::Display for StatusCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A failure that can be reported to the other side of a call.
pub trait Fault: fmt::Debug + fmt::Display + Send + Sync + 'static {
    /// Status reported with the fault.
    fn status_code(&self) -> StatusCode;

    /// Human-readable detail.
    fn debug_message(&self) -> String {
        self.to_string()
    }
}

/// A fault with a stable discriminator and a serde body, so the peer can
/// rebuild the concrete type.
pub trait RegisteredFault: Fault + Serialize + DeserializeOwned {
    /// Stable name identifying this type on the wire.
    const DISCRIMINATOR: &'static str;
}

/// Wire form of a fault.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FaultEnvelope {
    /// Names the concrete type.
    pub discriminator: String,
    /// Status of the fault.
    pub status_code: StatusCode,
    /// Human-readable detail.
    pub debug_message: String,
    /// Encoded subtype fields, when the sender could encode them.
    pub body: Option<SerializedPayload>,
}

type BodyEncoder = fn(
    &(dyn Any + Send + Sync),
    SerializationFormat,
) -> Result<Option<SerializedPayload>, CodecError>;

/// A fault raised by, or received from, a call.
///
/// Cheap to clone. The concrete type is reachable through
/// [`RpcError::downcast_ref`].
#[derive(Clone)]
pub struct RpcError {
    discriminator: Arc<str>,
    fault: Arc<dyn Fault>,
    any: Arc<dyn Any + Send + Sync>,
    encode_body: BodyEncoder,
}

impl RpcError {
    /// Wrap a registered fault.
    pub fn new<F: RegisteredFault>(fault: F) -> Self {
        let fault = Arc::new(fault);
        Self {
            discriminator: Arc::from(F::DISCRIMINATOR),
            any: fault.clone(),
            fault,
            encode_body: encode_registered::<F>,
        }
    }

    /// Wrap a fault whose discriminator this side could not resolve.
    #[must_use]
    pub fn unrecognized(fault: UnrecognizedRpcError) -> Self {
        let fault = Arc::new(fault);
        Self {
            discriminator: Arc::from(fault.discriminator.as_str()),
            any: fault.clone(),
            fault,
            encode_body: encode_unrecognized,
        }
    }

    /// [`NotFoundError`] for a call.
    #[must_use]
    pub fn not_found(service_call: crate::call::ServiceCallIdentifier) -> Self {
        Self::new(NotFoundError { service_call })
    }

    /// [`ProtocolViolationError`].
    pub fn protocol_violation(message: impl Into<String>) -> Self {
        Self::new(ProtocolViolationError {
            message: message.into(),
        })
    }

    /// [`InternalServerError`] without a cause chain.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(InternalServerError {
            message: message.into(),
            causes: Vec::new(),
        })
    }

    /// [`ConnectionClosedError`].
    #[must_use]
    pub fn connection_closed() -> Self {
        Self::new(ConnectionClosedError {
            message: "connection closed".to_string(),
        })
    }

    /// [`CancelledError`].
    pub fn cancelled(message: impl Into<String>) -> Self {
        Self::new(CancelledError {
            message: message.into(),
        })
    }

    /// The discriminator, preserved even for unrecognized faults.
    #[must_use]
    pub fn discriminator(&self) -> &str {
        &self.discriminator
    }

    /// Status of the fault.
    #[must_use]
    pub fn status_code(&self) -> StatusCode {
        self.fault.status_code()
    }

    /// Human-readable detail.
    #[must_use]
    pub fn debug_message(&self) -> String {
        self.fault.debug_message()
    }

    /// The fault as a trait object.
    #[must_use]
    pub fn fault(&self) -> &dyn Fault {
        self.fault.as_ref()
    }

    /// The concrete fault, if it is an `F`.
    #[must_use]
    pub fn downcast_ref<F: Fault>(&self) -> Option<&F> {
        self.any.downcast_ref::<F>()
    }

    /// Whether the concrete fault is an `F`.
    #[must_use]
    pub fn is<F: Fault>(&self) -> bool {
        self.any.is::<F>()
    }

    /// Build the wire form, encoding the body in `format`.
    ///
    /// A body that fails to encode is dropped; the peer then sees an
    /// unrecognized fault with the same status and message.
    #[must_use]
    pub fn to_envelope(&self, format: SerializationFormat) -> FaultEnvelope {
        let body = match (self.encode_body)(self.any.as_ref(), format) {
            Ok(body) => body,
            Err(e) => {
                warn!(
                    "Dropping body of fault {} that failed to encode: {e}",
                    self.discriminator
                );
                None
            }
        };

        FaultEnvelope {
            discriminator: self.discriminator.to_string(),
            status_code: self.status_code(),
            debug_message: self.debug_message(),
            body,
        }
    }
}

fn encode_registered<F: RegisteredFault>(
    fault: &(dyn Any + Send + Sync),
    format: SerializationFormat,
) -> Result<Option<SerializedPayload>, CodecError> {
    fault
        .downcast_ref::<F>()
        .map(|fault| format.encode(fault))
        .transpose()
}

#[allow(clippy::unnecessary_wraps)]
fn encode_unrecognized(
    fault: &(dyn Any + Send + Sync),
    _format: SerializationFormat,
) -> Result<Option<SerializedPayload>, CodecError> {
    Ok(fault
        .downcast_ref::<UnrecognizedRpcError>()
        .and_then(|fault| fault.body.clone()))
}

impl fmt::Debug for RpcError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RpcError")
            .field("discriminator", &self.discriminator)
            .field("status_code", &self.status_code())
            .field("fault", &self.fault)
            .finish()
    }
}

impl fmt::Display for RpcError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} ({}, status {})",
            self.debug_message(),
            self.discriminator,
            self.status_code()
        )
    }
}

impl std::error::Error for RpcError {}

impl From<anyhow::Error> for RpcError {
    fn from(error: anyhow::Error) -> Self {
        Self::new(InternalServerError::from(error))
    }
}

impl From<CodecError> for RpcError {
    fn from(error: CodecError) -> Self {
        Self::internal(error.to_string())
    }
}

impl From<Error> for RpcError {
    fn from(error: Error) -> Self {
        match error {
            Error::ConnectionClosed | Error::Transport(_) | Error::InvalidState { .. } => {
                Self::connection_closed()
            }
            other => Self::internal(other.to_string()),
        }
    }
}
