use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use tracing::warn;

use super::{
    CancelledError, ConnectionClosedError, FaultEnvelope, InternalServerError, NotFoundError,
    ProtocolViolationError, RegisteredFault, RequestTimeoutError, RpcError, TooManyCallsError,
    UnknownReferenceError, UnrecognizedRpcError,
};
use crate::error::CodecError;
use crate::serialization::SerializationFormat;

type FaultDecoder = fn(&FaultEnvelope) -> Result<RpcError, CodecError>;

/// Maps discriminators to the concrete fault types that can be rebuilt from
/// an envelope.
///
/// Immutable once shared: registration goes through `&mut self` and clones
/// the table only if another handle still points at it.
#[derive(Clone, Default)]
pub struct ErrorRegistry {
    decoders: Arc<HashMap<String, FaultDecoder>>,
}

/// The registry doubles as the fault serializer of a call or node.
pub type ErrorSerializer = ErrorRegistry;

impl ErrorRegistry {
    /// An empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry holding the built-in faults.
    #[must_use]
    pub fn with_builtin() -> Self {
        let mut registry = Self::new();
        registry
            .register::<NotFoundError>()
            .register::<ProtocolViolationError>()
            .register::<UnknownReferenceError>()
            .register::<RequestTimeoutError>()
            .register::<TooManyCallsError>()
            .register::<InternalServerError>()
            .register::<ConnectionClosedError>()
            .register::<CancelledError>();
        registry
    }

    /// Register a fault type.
    pub fn register<F: RegisteredFault>(&mut self) -> &mut Self {
        Arc::make_mut(&mut self.decoders)
            .insert(F::DISCRIMINATOR.to_string(), decode_registered::<F>);
        self
    }

    /// Register a fault type, by value.
    #[must_use]
    pub fn with<F: RegisteredFault>(mut self) -> Self {
        self.register::<F>();
        self
    }

    /// Add every registration of `other`.
    pub fn extend(&mut self, other: &Self) {
        if other.decoders.is_empty() {
            return;
        }
        let decoders = Arc::make_mut(&mut self.decoders);
        for (discriminator, decoder) in other.decoders.iter() {
            decoders.insert(discriminator.clone(), *decoder);
        }
    }

    /// Whether `discriminator` is registered.
    #[must_use]
    pub fn contains(&self, discriminator: &str) -> bool {
        self.decoders.contains_key(discriminator)
    }

    /// Number of registered types.
    #[must_use]
    pub fn len(&self) -> usize {
        self.decoders.len()
    }

    /// Whether nothing is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.decoders.is_empty()
    }

    /// Rebuild the concrete fault, if its type is registered here.
    #[must_use]
    pub fn resolve(&self, envelope: &FaultEnvelope) -> Option<RpcError> {
        let decoder = self.decoders.get(&envelope.discriminator)?;
        match decoder(envelope) {
            Ok(error) => Some(error),
            Err(e) => {
                warn!(
                    "Fault {} does not decode as its registered type: {e}",
                    envelope.discriminator
                );
                None
            }
        }
    }

    /// Rebuild a fault, falling back to [`UnrecognizedRpcError`].
    #[must_use]
    pub fn decode(&self, envelope: FaultEnvelope) -> RpcError {
        self.resolve(&envelope)
            .unwrap_or_else(|| RpcError::unrecognized(UnrecognizedRpcError::from(envelope)))
    }

    /// Rebuild a fault, trying this registry before `fallback`.
    #[must_use]
    pub fn decode_with(&self, fallback: &Self, envelope: FaultEnvelope) -> RpcError {
        self.resolve(&envelope)
            .or_else(|| fallback.resolve(&envelope))
            .unwrap_or_else(|| RpcError::unrecognized(UnrecognizedRpcError::from(envelope)))
    }
}

fn decode_registered<F: RegisteredFault>(envelope: &FaultEnvelope) -> Result<RpcError, CodecError> {
    let body = envelope
        .body
        .as_ref()
        .ok_or_else(|| CodecError::DeserializationFailed("fault has no body".to_string()))?;
    SerializationFormat::decode::<F>(body).map(RpcError::new)
}

impl fmt::Debug for ErrorRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut discriminators: Vec<&str> = self.decoders.keys().map(String::as_str).collect();
        discriminators.sort_unstable();
        f.debug_struct("ErrorRegistry")
            .field("discriminators", &discriminators)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::call::ServiceCallIdentifier;
    use crate::fault::StatusCode;

    #[test]
    fn test_registered_fault_roundtrip() {
        let registry = ErrorRegistry::with_builtin();
        let original = RpcError::not_found(ServiceCallIdentifier::new("bank", "withdraw"));

        for format in [SerializationFormat::CBOR, SerializationFormat::JSON] {
            let decoded = registry.decode(original.to_envelope(format));
            assert_eq!(
                decoded.downcast_ref::<NotFoundError>(),
                original.downcast_ref::<NotFoundError>()
            );
            assert_eq!(decoded.status_code(), StatusCode::NOT_FOUND);
        }
    }

    #[test]
    fn test_unregistered_fault_becomes_unrecognized() {
        let original = RpcError::protocol_violation("bad frame");
        let envelope = original.to_envelope(SerializationFormat::CBOR);

        let decoded = ErrorRegistry::new().decode(envelope.clone());
        let unrecognized = decoded.downcast_ref::<UnrecognizedRpcError>().unwrap();
        assert_eq!(unrecognized.discriminator, "tether.ProtocolViolation");
        assert_eq!(decoded.status_code(), StatusCode::BAD_REQUEST);
        assert_eq!(decoded.debug_message(), original.debug_message());
        assert_eq!(decoded.discriminator(), original.discriminator());

        // A relay re-encodes the same envelope, and the origin registry can
        // still resolve it.
        let relayed = decoded.to_envelope(SerializationFormat::JSON);
        assert_eq!(relayed, envelope);
        assert!(
            ErrorRegistry::with_builtin()
                .decode(relayed)
                .is::<ProtocolViolationError>()
        );
    }

    #[test]
    fn test_decode_with_prefers_declared_types() {
        let declared = ErrorRegistry::new().with::<CancelledError>();
        let node = ErrorRegistry::with_builtin();
        let envelope = RpcError::cancelled("gone").to_envelope(SerializationFormat::CBOR);

        assert!(declared.decode_with(&node, envelope.clone()).is::<CancelledError>());
        assert!(
            ErrorRegistry::new()
                .decode_with(&node, envelope)
                .is::<CancelledError>()
        );
    }

    #[test]
    fn test_missing_body_degrades() {
        let mut envelope = RpcError::internal("boom").to_envelope(SerializationFormat::CBOR);
        envelope.body = None;

        let decoded = ErrorRegistry::with_builtin().decode(envelope);
        assert!(decoded.is::<UnrecognizedRpcError>());
        assert_eq!(decoded.debug_message(), "boom");
    }

    #[test]
    fn test_extend() {
        let mut registry = ErrorRegistry::new();
        registry.extend(&ErrorRegistry::with_builtin());
        assert_eq!(registry.len(), 8);
        assert!(registry.contains(NotFoundError::DISCRIMINATOR));
    }
}
