//! Service descriptions and the registry incoming calls resolve against.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tracing::debug;

use crate::call::{CallShape, RunnableCallDescription, ServiceCallIdentifier};
use crate::error::{Error, Result};
use crate::fault::{ErrorRegistry, RpcError};
use crate::interceptor::Interceptor;

/// A named bundle of calls.
#[derive(Debug, Clone)]
pub struct ServiceDescription {
    name: String,
    calls: Vec<RunnableCallDescription>,
}

impl ServiceDescription {
    /// An empty service.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            calls: Vec::new(),
        }
    }

    /// Add a call.
    #[must_use]
    pub fn with_call(mut self, call: RunnableCallDescription) -> Self {
        self.calls.push(call);
        self
    }

    /// Name of the service.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Calls of the service.
    #[must_use]
    pub fn calls(&self) -> &[RunnableCallDescription] {
        &self.calls
    }
}

/// Resolves `(service_id, call_id)` to a runnable call.
///
/// Cheap to clone and immutable once the node is active.
#[derive(Debug, Clone, Default)]
pub struct ServiceRegistry {
    calls: Arc<HashMap<ServiceCallIdentifier, RunnableCallDescription>>,
}

/// Name used by server stubs for the registry they fill.
pub type RpcImplementationRegistry = ServiceRegistry;

impl ServiceRegistry {
    /// An empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register every call of `service`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::DuplicateCall`] if a call is already registered; the
    /// registry is left unchanged.
    pub fn register(&mut self, service: &ServiceDescription) -> Result<()> {
        let mut seen = HashSet::new();
        for call in service.calls() {
            if self.calls.contains_key(call.identifier()) || !seen.insert(call.identifier()) {
                return Err(Error::DuplicateCall(call.identifier().clone()));
            }
        }

        let calls = Arc::make_mut(&mut self.calls);
        for call in service.calls() {
            calls.insert(call.identifier().clone(), call.clone());
        }

        debug!(
            "Registered service {} with {} calls",
            service.name(),
            service.calls().len()
        );
        Ok(())
    }

    /// Find the call for an `Open`.
    ///
    /// # Errors
    ///
    /// [`crate::fault::NotFoundError`] if nothing is registered under
    /// `identifier`, [`crate::fault::ProtocolViolationError`] if the
    /// registered call has a different shape.
    pub fn resolve(
        &self,
        identifier: &ServiceCallIdentifier,
        shape: CallShape,
    ) -> std::result::Result<&RunnableCallDescription, RpcError> {
        let call = self
            .calls
            .get(identifier)
            .ok_or_else(|| RpcError::not_found(identifier.clone()))?;

        if call.shape() != shape {
            return Err(RpcError::protocol_violation(format!(
                "{identifier} is a {} call, caller expected {shape}",
                call.shape()
            )));
        }

        Ok(call)
    }

    /// Whether a call is registered.
    #[must_use]
    pub fn contains(&self, identifier: &ServiceCallIdentifier) -> bool {
        self.calls.contains_key(identifier)
    }

    /// Number of registered calls.
    #[must_use]
    pub fn len(&self) -> usize {
        self.calls.len()
    }

    /// Whether no call is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.calls.is_empty()
    }

    /// Every fault declared by a registered call.
    #[must_use]
    pub fn declared_errors(&self) -> ErrorRegistry {
        let mut errors = ErrorRegistry::new();
        for call in self.calls.values() {
            errors.extend(call.errors());
        }
        errors
    }

    /// A copy whose every call runs through `interceptors`, outermost first.
    #[must_use]
    pub fn intercepted(&self, interceptors: &[Arc<dyn Interceptor>]) -> Self {
        if interceptors.is_empty() {
            return self.clone();
        }

        let calls = self
            .calls
            .iter()
            .map(|(identifier, call)| {
                let wrapped = interceptors
                    .iter()
                    .rev()
                    .fold(call.clone(), |call, interceptor| {
                        call.intercepted_with(Arc::clone(interceptor))
                    });
                (identifier.clone(), wrapped)
            })
            .collect();

        Self {
            calls: Arc::new(calls),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::call::SingleCallDescription;
    use crate::fault::{CancelledError, NotFoundError, ProtocolViolationError};

    fn echo_service() -> ServiceDescription {
        let echo = SingleCallDescription::<String, String>::new("echo", "say")
            .declaring::<CancelledError>();
        ServiceDescription::new("echo").with_call(echo.calling(|s| async move { Ok(s) }))
    }

    #[test]
    fn test_resolve() {
        let mut registry = ServiceRegistry::new();
        registry.register(&echo_service()).unwrap();
        let identifier = ServiceCallIdentifier::new("echo", "say");

        assert!(registry.resolve(&identifier, CallShape::Single).is_ok());
        assert!(
            registry
                .resolve(&identifier, CallShape::ColdDownstream)
                .unwrap_err()
                .is::<ProtocolViolationError>()
        );
        assert!(
            registry
                .resolve(&ServiceCallIdentifier::new("echo", "shout"), CallShape::Single)
                .unwrap_err()
                .is::<NotFoundError>()
        );
    }

    #[test]
    fn test_duplicate_registration() {
        let mut registry = ServiceRegistry::new();
        registry.register(&echo_service()).unwrap();
        assert!(matches!(
            registry.register(&echo_service()),
            Err(Error::DuplicateCall(_))
        ));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_declared_errors_are_collected() {
        let mut registry = ServiceRegistry::new();
        registry.register(&echo_service()).unwrap();
        assert!(registry.declared_errors().contains("tether.Cancelled"));
    }
}
