//! Interceptor chain.
//!
//! An interceptor sees every call of a direction before its handler does.
//! Each method receives `next`, the rest of the chain; calling it continues
//! the call and it may be called more than once. The default methods pass
//! straight through.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use futures::FutureExt;

use crate::call::{
    BistreamHandler, CallContext, CallHandler, DownstreamHandler, PayloadStream, SingleHandler,
    UpstreamHandler,
};
use crate::fault::RpcError;
use crate::serialization::SerializedPayload;

/// Wraps calls of one direction.
#[async_trait]
pub trait Interceptor: Send + Sync + 'static {
    /// Intercept a Single call.
    async fn intercept_single(
        &self,
        context: CallContext,
        request: SerializedPayload,
        next: SingleHandler,
    ) -> Result<SerializedPayload, RpcError> {
        next(context, request).await
    }

    /// Intercept a ColdUpstream call.
    async fn intercept_upstream(
        &self,
        context: CallContext,
        request: SerializedPayload,
        upstream: PayloadStream,
        next: UpstreamHandler,
    ) -> Result<SerializedPayload, RpcError> {
        next(context, request, upstream).await
    }

    /// Intercept a ColdDownstream call.
    async fn intercept_downstream(
        &self,
        context: CallContext,
        request: SerializedPayload,
        next: DownstreamHandler,
    ) -> Result<PayloadStream, RpcError> {
        next(context, request).await
    }

    /// Intercept a ColdBistream call.
    async fn intercept_bistream(
        &self,
        context: CallContext,
        request: SerializedPayload,
        upstream: PayloadStream,
        next: BistreamHandler,
    ) -> Result<PayloadStream, RpcError> {
        next(context, request, upstream).await
    }
}

impl CallHandler {
    /// Put `interceptor` in front of this handler.
    #[must_use]
    pub fn wrapped_by(self, interceptor: Arc<dyn Interceptor>) -> Self {
        match self {
            Self::Single(next) => Self::Single(Arc::new(
                move |context: CallContext, request: SerializedPayload| {
                    let interceptor = Arc::clone(&interceptor);
                    let next = Arc::clone(&next);
                    async move { interceptor.intercept_single(context, request, next).await }
                        .boxed()
                },
            )),
            Self::ColdUpstream(next) => Self::ColdUpstream(Arc::new(
                move |context: CallContext, request: SerializedPayload, upstream: PayloadStream| {
                    let interceptor = Arc::clone(&interceptor);
                    let next = Arc::clone(&next);
                    async move {
                        interceptor
                            .intercept_upstream(context, request, upstream, next)
                            .await
                    }
                    .boxed()
                },
            )),
            Self::ColdDownstream(next) => Self::ColdDownstream(Arc::new(
                move |context: CallContext, request: SerializedPayload| {
                    let interceptor = Arc::clone(&interceptor);
                    let next = Arc::clone(&next);
                    async move {
                        interceptor
                            .intercept_downstream(context, request, next)
                            .await
                    }
                    .boxed()
                },
            )),
            Self::ColdBistream(next) => Self::ColdBistream(Arc::new(
                move |context: CallContext, request: SerializedPayload, upstream: PayloadStream| {
                    let interceptor = Arc::clone(&interceptor);
                    let next = Arc::clone(&next);
                    async move {
                        interceptor
                            .intercept_bistream(context, request, upstream, next)
                            .await
                    }
                    .boxed()
                },
            )),
        }
    }
}

/// Fold `interceptors` around `tail`, right to left, so the first
/// interceptor runs first.
#[must_use]
pub fn compose(interceptors: &[Arc<dyn Interceptor>], tail: CallHandler) -> CallHandler {
    interceptors
        .iter()
        .rev()
        .fold(tail, |next, interceptor| next.wrapped_by(Arc::clone(interceptor)))
}

/// Ordered interceptors for both directions.
#[derive(Clone, Default)]
pub struct InterceptorRegistry {
    incoming: Vec<Arc<dyn Interceptor>>,
    outgoing: Vec<Arc<dyn Interceptor>>,
}

impl InterceptorRegistry {
    /// An empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an interceptor for calls the peer makes.
    pub fn add_incoming(&mut self, interceptor: Arc<dyn Interceptor>) -> &mut Self {
        self.incoming.push(interceptor);
        self
    }

    /// Append an interceptor for calls this node makes.
    pub fn add_outgoing(&mut self, interceptor: Arc<dyn Interceptor>) -> &mut Self {
        self.outgoing.push(interceptor);
        self
    }

    /// Append every interceptor of `other`, keeping order.
    pub fn extend(&mut self, other: &Self) {
        self.incoming.extend(other.incoming.iter().cloned());
        self.outgoing.extend(other.outgoing.iter().cloned());
    }

    /// Interceptors for incoming calls, outermost first.
    #[must_use]
    pub fn incoming(&self) -> &[Arc<dyn Interceptor>] {
        &self.incoming
    }

    /// Interceptors for outgoing calls, outermost first.
    #[must_use]
    pub fn outgoing(&self) -> &[Arc<dyn Interceptor>] {
        &self.outgoing
    }

    /// Wrap an incoming handler in the incoming chain.
    #[must_use]
    pub fn apply_incoming(&self, handler: CallHandler) -> CallHandler {
        compose(&self.incoming, handler)
    }

    /// Wrap an outgoing handler in the outgoing chain.
    #[must_use]
    pub fn apply_outgoing(&self, handler: CallHandler) -> CallHandler {
        compose(&self.outgoing, handler)
    }
}

impl fmt::Debug for InterceptorRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InterceptorRegistry")
            .field("incoming", &self.incoming.len())
            .field("outgoing", &self.outgoing.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::call::{CallDirection, CallShape, ServiceCallIdentifier};
    use crate::fault::ErrorRegistry;
    use crate::serialization::{PayloadSerializer, SerializationFormat};
    use parking_lot::Mutex;

    struct Recording {
        name: &'static str,
        log: Arc<Mutex<Vec<String>>>,
    }

    #[async_trait]
    impl Interceptor for Recording {
        async fn intercept_single(
            &self,
            context: CallContext,
            request: SerializedPayload,
            next: SingleHandler,
        ) -> Result<SerializedPayload, RpcError> {
            self.log.lock().push(format!("{} before", self.name));
            let response = next(context, request).await;
            self.log.lock().push(format!("{} after", self.name));
            response
        }
    }

    struct Retrying;

    #[async_trait]
    impl Interceptor for Retrying {
        async fn intercept_single(
            &self,
            context: CallContext,
            request: SerializedPayload,
            next: SingleHandler,
        ) -> Result<SerializedPayload, RpcError> {
            match next(context.clone(), request.clone()).await {
                Ok(response) => Ok(response),
                Err(_) => next(context, request).await,
            }
        }
    }

    fn context() -> CallContext {
        CallContext::new(
            ServiceCallIdentifier::new("test", "echo"),
            CallShape::Single,
            CallDirection::Incoming,
            PayloadSerializer::default(),
            ErrorRegistry::new(),
            ErrorRegistry::with_builtin(),
        )
    }

    fn echo(log: Arc<Mutex<Vec<String>>>) -> CallHandler {
        CallHandler::Single(Arc::new(move |_context: CallContext, request: SerializedPayload| {
            let log = Arc::clone(&log);
            async move {
                log.lock().push("handler".to_string());
                Ok(request)
            }
            .boxed()
        }))
    }

    #[tokio::test]
    async fn test_chain_runs_in_registration_order() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut registry = InterceptorRegistry::new();
        registry
            .add_incoming(Arc::new(Recording {
                name: "first",
                log: Arc::clone(&log),
            }))
            .add_incoming(Arc::new(Recording {
                name: "second",
                log: Arc::clone(&log),
            }));

        let CallHandler::Single(handler) = registry.apply_incoming(echo(Arc::clone(&log))) else {
            panic!("shape changed");
        };
        let request = SerializationFormat::CBOR.encode(&1u8).unwrap();
        assert_eq!(handler(context(), request.clone()).await.unwrap(), request);

        assert_eq!(
            *log.lock(),
            vec![
                "first before",
                "second before",
                "handler",
                "second after",
                "first after"
            ]
        );
    }

    #[tokio::test]
    async fn test_next_can_be_called_twice() {
        let attempts = Arc::new(Mutex::new(0u32));
        let counted = Arc::clone(&attempts);
        let flaky = CallHandler::Single(Arc::new(
            move |_context: CallContext, request: SerializedPayload| {
                let attempts = Arc::clone(&counted);
                async move {
                    let mut attempts = attempts.lock();
                    *attempts += 1;
                    if *attempts == 1 {
                        Err(RpcError::internal("first attempt fails"))
                    } else {
                        Ok(request)
                    }
                }
                .boxed()
            },
        ));

        let chain: Vec<Arc<dyn Interceptor>> = vec![Arc::new(Retrying)];
        let CallHandler::Single(handler) = compose(&chain, flaky) else {
            panic!("shape changed");
        };
        let request = SerializationFormat::CBOR.encode(&1u8).unwrap();
        assert!(handler(context(), request).await.is_ok());
        assert_eq!(*attempts.lock(), 2);
    }

    #[test]
    fn test_shape_is_preserved() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let wrapped = echo(log).wrapped_by(Arc::new(Retrying));
        assert_eq!(wrapped.shape(), CallShape::Single);
    }
}
