//! A request plus a caller stream, a callee stream.

use std::sync::Arc;
use std::time::Duration;

use crate::call::{BistreamHandler, CallContext, PayloadStream};
use crate::fault::RpcError;
use crate::node::core::{CallChannels, NodeCore};
use crate::protocol::{DownstreamEvent, ResponsePayload};
use crate::runner::downstream::produce;
use crate::runner::stream::{pull_stream, push_stream};
use crate::runner::{AbortOnDrop, Outbox, guarded, open};
use crate::serialization::SerializedPayload;

/// Caller half: open the call, feed `source` on demand and return the
/// callee's stream.
pub(crate) async fn call(
    core: Arc<NodeCore>,
    context: CallContext,
    payload: SerializedPayload,
    source: PayloadStream,
) -> Result<PayloadStream, RpcError> {
    let mut call = open(core, context, payload).await?;
    call.opened().await?;

    let outbox = call.outbox.clone();
    let flow = call.channels.flow.clone();
    let pump_context = call.context.clone();
    let pump = AbortOnDrop::spawn(async move {
        push_stream(&outbox, &flow, source, &pump_context, None).await;
    });

    call.guard.finish();
    Ok(pull_stream(
        call.outbox,
        call.channels.data,
        call.channels.demand,
        call.context,
        (call.guard, pump),
    ))
}

/// Callee half: both directions at once, each with its own flow control.
pub(crate) async fn serve(
    handler: BistreamHandler,
    outbox: &Outbox,
    context: CallContext,
    payload: SerializedPayload,
    channels: CallChannels,
    start_timeout: Option<Duration>,
) {
    if outbox.downstream(DownstreamEvent::Opened).await.is_err() {
        return;
    }

    let inbound = pull_stream(
        outbox.clone(),
        channels.data.clone(),
        Arc::clone(&channels.demand),
        context.clone(),
        (),
    );

    let source = match guarded(handler(context.clone(), payload, inbound)).await {
        Ok(source) => source,
        Err(error) => {
            let response = ResponsePayload::Error(context.fault_envelope(&error));
            outbox.conclude(DownstreamEvent::Response(response)).await;
            return;
        }
    };

    produce(outbox, &channels, source, &context, start_timeout).await;
}
