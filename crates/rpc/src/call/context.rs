use std::fmt;

use serde::{Serialize, de::DeserializeOwned};

use crate::call::{CallShape, ServiceCallIdentifier};
use crate::fault::{ErrorRegistry, FaultEnvelope, RpcError};
use crate::protocol::RpcReference;
use crate::serialization::{PayloadSerializer, SerializedPayload};

/// Which side of the call this node is on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CallDirection {
    /// The peer called us.
    Incoming,
    /// We are calling the peer.
    Outgoing,
}

/// Per-call information handed to handlers and interceptors.
#[derive(Clone)]
pub struct CallContext {
    service_call: ServiceCallIdentifier,
    shape: CallShape,
    direction: CallDirection,
    reference: Option<RpcReference>,
    serializer: PayloadSerializer,
    declared_errors: ErrorRegistry,
    node_errors: ErrorRegistry,
}

impl CallContext {
    pub(crate) const fn new(
        service_call: ServiceCallIdentifier,
        shape: CallShape,
        direction: CallDirection,
        serializer: PayloadSerializer,
        declared_errors: ErrorRegistry,
        node_errors: ErrorRegistry,
    ) -> Self {
        Self {
            service_call,
            shape,
            direction,
            reference: None,
            serializer,
            declared_errors,
            node_errors,
        }
    }

    pub(crate) fn with_reference(mut self, reference: RpcReference) -> Self {
        self.reference = Some(reference);
        self
    }

    /// The call being made.
    #[must_use]
    pub const fn service_call(&self) -> &ServiceCallIdentifier {
        &self.service_call
    }

    /// Shape of the call.
    #[must_use]
    pub const fn shape(&self) -> CallShape {
        self.shape
    }

    /// Incoming or outgoing.
    #[must_use]
    pub const fn direction(&self) -> CallDirection {
        self.direction
    }

    /// The wire reference. Outgoing calls get one only when the frame is
    /// sent, after the interceptor chain has run.
    #[must_use]
    pub const fn reference(&self) -> Option<RpcReference> {
        self.reference
    }

    /// Serializer for outgoing payloads.
    #[must_use]
    pub const fn serializer(&self) -> PayloadSerializer {
        self.serializer
    }

    /// Encode a value in this node's payload format.
    ///
    /// # Errors
    ///
    /// Returns [`crate::fault::InternalServerError`] if the value cannot be
    /// serialized.
    pub fn encode<T: Serialize + ?Sized>(&self, value: &T) -> Result<SerializedPayload, RpcError> {
        self.serializer.serialize(value).map_err(RpcError::from)
    }

    /// Decode a payload the peer sent.
    ///
    /// # Errors
    ///
    /// Returns [`crate::fault::ProtocolViolationError`] if the payload does
    /// not decode as `T`.
    pub fn decode<T: DeserializeOwned>(&self, payload: &SerializedPayload) -> Result<T, RpcError> {
        self.serializer.deserialize(payload).map_err(|e| {
            RpcError::protocol_violation(format!(
                "malformed payload for {}: {e}",
                self.service_call
            ))
        })
    }

    /// Wire form of a fault.
    #[must_use]
    pub fn fault_envelope(&self, error: &RpcError) -> FaultEnvelope {
        error.to_envelope(self.serializer.format())
    }

    /// Rebuild a fault the peer sent, trying the call's declared faults
    /// before the node's.
    #[must_use]
    pub fn decode_fault(&self, envelope: FaultEnvelope) -> RpcError {
        self.declared_errors.decode_with(&self.node_errors, envelope)
    }
}

impl fmt::Debug for CallContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallContext")
            .field("service_call", &self.service_call)
            .field("shape", &self.shape)
            .field("direction", &self.direction)
            .field("reference", &self.reference)
            .finish_non_exhaustive()
    }
}
