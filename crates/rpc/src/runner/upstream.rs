//! A request plus a caller stream, one response.

use std::sync::Arc;

use crate::call::{CallContext, PayloadStream, UpstreamHandler};
use crate::fault::RpcError;
use crate::node::core::{CallChannels, NodeCore};
use crate::protocol::{DownstreamEvent, ResponsePayload};
use crate::runner::stream::{pull_stream, push_stream};
use crate::runner::{AbortOnDrop, Outbox, guarded, open};
use crate::serialization::SerializedPayload;

/// Caller half: open the call, feed `source` on demand, await the
/// `Response`.
pub(crate) async fn call(
    core: Arc<NodeCore>,
    context: CallContext,
    payload: SerializedPayload,
    source: PayloadStream,
) -> Result<SerializedPayload, RpcError> {
    let mut call = open(core, context, payload).await?;

    let outbox = call.outbox.clone();
    let flow = call.channels.flow.clone();
    let pump_context = call.context.clone();
    let _pump = AbortOnDrop::spawn(async move {
        push_stream(&outbox, &flow, source, &pump_context, None).await;
    });

    call.response().await
}

/// Callee half: hand the handler a stream that pulls from the caller.
pub(crate) async fn serve(
    handler: UpstreamHandler,
    outbox: &Outbox,
    context: CallContext,
    payload: SerializedPayload,
    channels: CallChannels,
) {
    let inbound = pull_stream(
        outbox.clone(),
        channels.data,
        channels.demand,
        context.clone(),
        (),
    );

    let response = match guarded(handler(context.clone(), payload, inbound)).await {
        Ok(payload) => ResponsePayload::Success(payload),
        Err(error) => ResponsePayload::Error(context.fault_envelope(&error)),
    };
    outbox.conclude(DownstreamEvent::Response(response)).await;
}
