use std::fmt;
use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;

use futures::{FutureExt, Stream, StreamExt};

use crate::call::{
    BistreamHandler, CallContext, CallHandler, CallShape, DownstreamHandler, Payload,
    PayloadStream, RpcStream, RunnableCallDescription, ServiceCallIdentifier, SingleHandler,
    UpstreamHandler,
};
use crate::fault::{ErrorRegistry, RegisteredFault, RpcError};
use crate::serialization::SerializedPayload;

/// What every typed call description exposes.
pub trait CallDescription {
    /// Shape of the described call.
    const SHAPE: CallShape;

    /// The described call.
    fn identifier(&self) -> &ServiceCallIdentifier;

    /// Faults the call declares.
    fn errors(&self) -> &ErrorRegistry;
}

#[derive(Clone)]
struct DescriptionBase {
    identifier: ServiceCallIdentifier,
    errors: ErrorRegistry,
}

impl DescriptionBase {
    fn new(service_id: impl Into<String>, call_id: impl Into<String>) -> Self {
        Self {
            identifier: ServiceCallIdentifier::new(service_id, call_id),
            errors: ErrorRegistry::new(),
        }
    }

    fn runnable(&self, handler: CallHandler) -> RunnableCallDescription {
        RunnableCallDescription::new(self.identifier.clone(), self.errors.clone(), handler)
    }
}

pub(crate) fn decode_items<T: Payload>(context: CallContext, items: PayloadStream) -> RpcStream<T> {
    items
        .map(move |item| item.and_then(|payload| context.decode(&payload)))
        .boxed()
}

pub(crate) fn encode_items<T, S>(context: CallContext, items: S) -> PayloadStream
where
    T: Payload,
    S: Stream<Item = Result<T, RpcError>> + Send + 'static,
{
    items
        .map(move |item| item.and_then(|value| context.encode(&value)))
        .boxed()
}

macro_rules! description_common {
    ($name:ident < $($param:ident),+ >, $shape:expr) => {
        impl<$($param),+> $name<$($param),+> {
            /// Describe `service_id`/`call_id`.
            pub fn new(service_id: impl Into<String>, call_id: impl Into<String>) -> Self {
                Self {
                    base: DescriptionBase::new(service_id, call_id),
                    _marker: PhantomData,
                }
            }

            /// Declare a fault the call may raise.
            #[must_use]
            pub fn declaring<F: RegisteredFault>(mut self) -> Self {
                self.base.errors.register::<F>();
                self
            }
        }

        impl<$($param),+> CallDescription for $name<$($param),+> {
            const SHAPE: CallShape = $shape;

            fn identifier(&self) -> &ServiceCallIdentifier {
                &self.base.identifier
            }

            fn errors(&self) -> &ErrorRegistry {
                &self.base.errors
            }
        }

        impl<$($param),+> Clone for $name<$($param),+> {
            fn clone(&self) -> Self {
                Self {
                    base: self.base.clone(),
                    _marker: PhantomData,
                }
            }
        }

        impl<$($param),+> fmt::Debug for $name<$($param),+> {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.debug_struct(stringify!($name))
                    .field("identifier", &self.base.identifier)
                    .field("errors", &self.base.errors)
                    .finish()
            }
        }
    };
}

/// One request, one response.
pub struct SingleCallDescription<Req, Resp> {
    base: DescriptionBase,
    _marker: PhantomData<fn(Req) -> Resp>,
}

description_common!(SingleCallDescription<Req, Resp>, CallShape::Single);

impl<Req: Payload, Resp: Payload> SingleCallDescription<Req, Resp> {
    /// Bind an implementation.
    pub fn calling<F, Fut>(&self, implementation: F) -> RunnableCallDescription
    where
        F: Fn(Req) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Resp, RpcError>> + Send + 'static,
    {
        let implementation = Arc::new(implementation);
        let handler: SingleHandler =
            Arc::new(move |context: CallContext, payload: SerializedPayload| {
                let implementation = Arc::clone(&implementation);
                async move {
                    let request: Req = context.decode(&payload)?;
                    let response = implementation(request).await?;
                    context.encode(&response)
                }
                .boxed()
            });
        self.base.runnable(CallHandler::Single(handler))
    }
}

/// A request plus a caller stream, one response.
pub struct ColdUpstreamCallDescription<Req, Item, Resp> {
    base: DescriptionBase,
    _marker: PhantomData<fn(Req, Item) -> Resp>,
}

description_common!(
    ColdUpstreamCallDescription<Req, Item, Resp>,
    CallShape::ColdUpstream
);

impl<Req: Payload, Item: Payload, Resp: Payload> ColdUpstreamCallDescription<Req, Item, Resp> {
    /// Bind an implementation. It receives the caller's items as a stream
    /// that pulls one element per poll.
    pub fn calling<F, Fut>(&self, implementation: F) -> RunnableCallDescription
    where
        F: Fn(Req, RpcStream<Item>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Resp, RpcError>> + Send + 'static,
    {
        let implementation = Arc::new(implementation);
        let handler: UpstreamHandler = Arc::new(
            move |context: CallContext, payload: SerializedPayload, upstream: PayloadStream| {
                let implementation = Arc::clone(&implementation);
                async move {
                    let request: Req = context.decode(&payload)?;
                    let items = decode_items(context.clone(), upstream);
                    let response = implementation(request, items).await?;
                    context.encode(&response)
                }
                .boxed()
            },
        );
        self.base.runnable(CallHandler::ColdUpstream(handler))
    }
}

/// A request, a callee stream.
pub struct ColdDownstreamCallDescription<Req, Item> {
    base: DescriptionBase,
    _marker: PhantomData<fn(Req) -> Item>,
}

description_common!(
    ColdDownstreamCallDescription<Req, Item>,
    CallShape::ColdDownstream
);

impl<Req: Payload, Item: Payload> ColdDownstreamCallDescription<Req, Item> {
    /// Bind an implementation. The returned stream is polled once per
    /// `Start` the caller sends.
    pub fn calling<F, Fut, S>(&self, implementation: F) -> RunnableCallDescription
    where
        F: Fn(Req) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<S, RpcError>> + Send + 'static,
        S: Stream<Item = Result<Item, RpcError>> + Send + 'static,
    {
        let implementation = Arc::new(implementation);
        let handler: DownstreamHandler =
            Arc::new(move |context: CallContext, payload: SerializedPayload| {
                let implementation = Arc::clone(&implementation);
                async move {
                    let request: Req = context.decode(&payload)?;
                    let items = implementation(request).await?;
                    Ok::<_, RpcError>(encode_items(context, items))
                }
                .boxed()
            });
        self.base.runnable(CallHandler::ColdDownstream(handler))
    }
}

/// A request plus a caller stream, a callee stream.
pub struct ColdBistreamCallDescription<Req, In, Out> {
    base: DescriptionBase,
    _marker: PhantomData<fn(Req, In) -> Out>,
}

description_common!(
    ColdBistreamCallDescription<Req, In, Out>,
    CallShape::ColdBistream
);

impl<Req: Payload, In: Payload, Out: Payload> ColdBistreamCallDescription<Req, In, Out> {
    /// Bind an implementation.
    pub fn calling<F, Fut, S>(&self, implementation: F) -> RunnableCallDescription
    where
        F: Fn(Req, RpcStream<In>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<S, RpcError>> + Send + 'static,
        S: Stream<Item = Result<Out, RpcError>> + Send + 'static,
    {
        let implementation = Arc::new(implementation);
        let handler: BistreamHandler = Arc::new(
            move |context: CallContext, payload: SerializedPayload, upstream: PayloadStream| {
                let implementation = Arc::clone(&implementation);
                async move {
                    let request: Req = context.decode(&payload)?;
                    let items = decode_items(context.clone(), upstream);
                    let outgoing = implementation(request, items).await?;
                    Ok::<_, RpcError>(encode_items(context, outgoing))
                }
                .boxed()
            },
        );
        self.base.runnable(CallHandler::ColdBistream(handler))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::call::CallDirection;
    use crate::fault::{CancelledError, ProtocolViolationError};
    use crate::serialization::{PayloadSerializer, SerializationFormat};

    fn context(shape: CallShape) -> CallContext {
        CallContext::new(
            ServiceCallIdentifier::new("math", "op"),
            shape,
            CallDirection::Incoming,
            PayloadSerializer::new(SerializationFormat::CBOR),
            ErrorRegistry::new(),
            ErrorRegistry::with_builtin(),
        )
    }

    #[tokio::test]
    async fn test_single_handler_decodes_and_encodes() {
        let description = SingleCallDescription::<u32, u32>::new("math", "double");
        let runnable = description.calling(|x| async move { Ok(x * 2) });
        assert_eq!(runnable.shape(), CallShape::Single);

        let CallHandler::Single(handler) = runnable.handler().clone() else {
            panic!("expected a single handler");
        };
        let context = context(CallShape::Single);
        let response = handler(context.clone(), context.encode(&21u32).unwrap())
            .await
            .unwrap();
        assert_eq!(context.decode::<u32>(&response).unwrap(), 42);
    }

    #[tokio::test]
    async fn test_malformed_request_is_a_protocol_violation() {
        let description = SingleCallDescription::<u32, u32>::new("math", "double");
        let CallHandler::Single(handler) = description
            .calling(|x| async move { Ok(x * 2) })
            .handler()
            .clone()
        else {
            panic!("expected a single handler");
        };

        let context = context(CallShape::Single);
        let error = handler(context.clone(), context.encode("not a number").unwrap())
            .await
            .unwrap_err();
        assert!(error.is::<ProtocolViolationError>());
    }

    #[tokio::test]
    async fn test_downstream_handler_encodes_items() {
        let description = ColdDownstreamCallDescription::<u32, u32>::new("math", "count");
        let CallHandler::ColdDownstream(handler) = description
            .calling(|n| async move { Ok(futures::stream::iter((0..n).map(Ok))) })
            .handler()
            .clone()
        else {
            panic!("expected a downstream handler");
        };

        let context = context(CallShape::ColdDownstream);
        let items: Vec<u32> = handler(context.clone(), context.encode(&3u32).unwrap())
            .await
            .unwrap()
            .map(|item| context.decode::<u32>(&item.unwrap()).unwrap())
            .collect()
            .await;
        assert_eq!(items, vec![0, 1, 2]);
    }

    #[test]
    fn test_declared_errors() {
        let description =
            SingleCallDescription::<u32, u32>::new("math", "double").declaring::<CancelledError>();
        assert!(description.errors().contains("tether.Cancelled"));
        assert_eq!(description.identifier().to_string(), "math/double");
        assert_eq!(
            <SingleCallDescription<u32, u32> as CallDescription>::SHAPE,
            CallShape::Single
        );
    }
}
