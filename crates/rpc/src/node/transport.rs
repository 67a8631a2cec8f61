//! The caller-facing handle of a node.

use std::fmt;
use std::sync::{Arc, Weak};

use futures::{FutureExt, Stream};

use crate::call::{
    BistreamHandler, CallContext, CallDescription, CallDirection, CallHandler, CallShape,
    ColdBistreamCallDescription, ColdDownstreamCallDescription, ColdUpstreamCallDescription,
    DownstreamHandler, Payload, PayloadStream, RpcStream, SingleCallDescription, SingleHandler,
    UpstreamHandler, decode_items, encode_items,
};
use crate::fault::RpcError;
use crate::interceptor::InterceptorRegistry;
use crate::node::core::{NodeCore, OutgoingChain};
use crate::runner;
use crate::serialization::SerializedPayload;

/// Makes calls to the peer. Cheap to clone.
///
/// Calls made while the node is not active fail with a
/// `ConnectionClosedError`.
#[derive(Clone)]
pub struct RpcTransport {
    core: Arc<NodeCore>,
}

impl RpcTransport {
    pub(crate) const fn new(core: Arc<NodeCore>) -> Self {
        Self { core }
    }

    /// Encode the request and pick the outgoing chain for `D`'s shape.
    fn prepare<D: CallDescription>(
        &self,
        description: &D,
    ) -> Result<(CallContext, CallHandler), RpcError> {
        let dispatch = self.core.dispatch().ok_or_else(RpcError::connection_closed)?;
        let context = CallContext::new(
            description.identifier().clone(),
            D::SHAPE,
            CallDirection::Outgoing,
            self.core.serializer,
            description.errors().clone(),
            dispatch.errors.clone(),
        );
        let handler = match D::SHAPE {
            CallShape::Single => dispatch.outgoing.single.clone(),
            CallShape::ColdUpstream => dispatch.outgoing.upstream.clone(),
            CallShape::ColdDownstream => dispatch.outgoing.downstream.clone(),
            CallShape::ColdBistream => dispatch.outgoing.bistream.clone(),
        };
        Ok((context, handler))
    }

    fn shape_mismatch(context: &CallContext) -> RpcError {
        RpcError::internal(format!(
            "outgoing chain does not match {} call {}",
            context.shape(),
            context.service_call()
        ))
    }

    /// Make a Single call.
    ///
    /// # Errors
    ///
    /// The callee's fault, or a local fault if the call could not be made.
    pub async fn single_call<Req, Resp>(
        &self,
        description: &SingleCallDescription<Req, Resp>,
        request: Req,
    ) -> Result<Resp, RpcError>
    where
        Req: Payload,
        Resp: Payload,
    {
        let (context, handler) = self.prepare(description)?;
        let CallHandler::Single(handler) = handler else {
            return Err(Self::shape_mismatch(&context));
        };

        let payload = context.encode(&request)?;
        let response = handler(context.clone(), payload).await?;
        context.decode(&response)
    }

    /// Make a ColdUpstream call. `items` is polled once per `Start` the
    /// callee sends.
    ///
    /// # Errors
    ///
    /// The callee's fault, or a local fault if the call could not be made.
    pub async fn client_stream<Req, Item, Resp, S>(
        &self,
        description: &ColdUpstreamCallDescription<Req, Item, Resp>,
        request: Req,
        items: S,
    ) -> Result<Resp, RpcError>
    where
        Req: Payload,
        Item: Payload,
        Resp: Payload,
        S: Stream<Item = Result<Item, RpcError>> + Send + 'static,
    {
        let (context, handler) = self.prepare(description)?;
        let CallHandler::ColdUpstream(handler) = handler else {
            return Err(Self::shape_mismatch(&context));
        };

        let payload = context.encode(&request)?;
        let upstream = encode_items(context.clone(), items);
        let response = handler(context.clone(), payload, upstream).await?;
        context.decode(&response)
    }

    /// Make a ColdDownstream call. Each poll of the returned stream asks
    /// the callee for one element; dropping it ends the call.
    ///
    /// # Errors
    ///
    /// Fails if the callee rejects the call before streaming.
    pub async fn server_stream<Req, Item>(
        &self,
        description: &ColdDownstreamCallDescription<Req, Item>,
        request: Req,
    ) -> Result<RpcStream<Item>, RpcError>
    where
        Req: Payload,
        Item: Payload,
    {
        let (context, handler) = self.prepare(description)?;
        let CallHandler::ColdDownstream(handler) = handler else {
            return Err(Self::shape_mismatch(&context));
        };

        let payload = context.encode(&request)?;
        let downstream = handler(context.clone(), payload).await?;
        Ok(decode_items(context, downstream))
    }

    /// Make a ColdBistream call.
    ///
    /// # Errors
    ///
    /// Fails if the callee rejects the call before streaming.
    pub async fn bi_stream<Req, In, Out, S>(
        &self,
        description: &ColdBistreamCallDescription<Req, In, Out>,
        request: Req,
        items: S,
    ) -> Result<RpcStream<Out>, RpcError>
    where
        Req: Payload,
        In: Payload,
        Out: Payload,
        S: Stream<Item = Result<In, RpcError>> + Send + 'static,
    {
        let (context, handler) = self.prepare(description)?;
        let CallHandler::ColdBistream(handler) = handler else {
            return Err(Self::shape_mismatch(&context));
        };

        let payload = context.encode(&request)?;
        let upstream = encode_items(context.clone(), items);
        let downstream = handler(context.clone(), payload, upstream).await?;
        Ok(decode_items(context, downstream))
    }
}

impl fmt::Debug for RpcTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RpcTransport")
            .field("role", &self.core.role)
            .field("state", &self.core.state())
            .finish_non_exhaustive()
    }
}

fn upgrade(core: &Weak<NodeCore>) -> Result<Arc<NodeCore>, RpcError> {
    core.upgrade().ok_or_else(RpcError::connection_closed)
}

/// Compose the outgoing interceptors around the runners that put calls
/// on the wire.
pub(crate) fn outgoing_chain(
    core: &Weak<NodeCore>,
    interceptors: &InterceptorRegistry,
) -> OutgoingChain {
    let single: SingleHandler = {
        let core = core.clone();
        Arc::new(move |context: CallContext, payload: SerializedPayload| {
            let core = core.clone();
            async move { runner::single::call(upgrade(&core)?, context, payload).await }.boxed()
        })
    };

    let upstream: UpstreamHandler = {
        let core = core.clone();
        Arc::new(
            move |context: CallContext, payload: SerializedPayload, items: PayloadStream| {
                let core = core.clone();
                async move {
                    runner::upstream::call(upgrade(&core)?, context, payload, items).await
                }
                .boxed()
            },
        )
    };

    let downstream: DownstreamHandler = {
        let core = core.clone();
        Arc::new(move |context: CallContext, payload: SerializedPayload| {
            let core = core.clone();
            async move { runner::downstream::call(upgrade(&core)?, context, payload).await }
                .boxed()
        })
    };

    let bistream: BistreamHandler = {
        let core = core.clone();
        Arc::new(
            move |context: CallContext, payload: SerializedPayload, items: PayloadStream| {
                let core = core.clone();
                async move {
                    runner::bistream::call(upgrade(&core)?, context, payload, items).await
                }
                .boxed()
            },
        )
    };

    OutgoingChain {
        single: interceptors.apply_outgoing(CallHandler::Single(single)),
        upstream: interceptors.apply_outgoing(CallHandler::ColdUpstream(upstream)),
        downstream: interceptors.apply_outgoing(CallHandler::ColdDownstream(downstream)),
        bistream: interceptors.apply_outgoing(CallHandler::ColdBistream(bistream)),
    }
}
