//! A request, a callee stream.

use std::sync::Arc;
use std::time::Duration;

use tracing::debug;

use crate::call::{CallContext, DownstreamHandler, PayloadStream};
use crate::fault::RpcError;
use crate::node::core::{CallChannels, NodeCore};
use crate::protocol::{DownstreamEvent, ResponsePayload};
use crate::runner::stream::{PushOutcome, pull_stream, push_stream, start_timeout_fault};
use crate::runner::{Outbox, guarded, open};
use crate::serialization::SerializedPayload;

/// Caller half: open the call and, once `Opened`, return a stream that
/// pulls one element per poll.
pub(crate) async fn call(
    core: Arc<NodeCore>,
    context: CallContext,
    payload: SerializedPayload,
) -> Result<PayloadStream, RpcError> {
    let mut call = open(core, context, payload).await?;
    call.opened().await?;

    // From here the stream's own Close takes over from Cancel.
    call.guard.finish();
    Ok(pull_stream(
        call.outbox,
        call.channels.data,
        call.channels.demand,
        call.context,
        call.guard,
    ))
}

/// Callee half: reply `Opened`, then produce the handler's stream on
/// demand.
pub(crate) async fn serve(
    handler: DownstreamHandler,
    outbox: &Outbox,
    context: CallContext,
    payload: SerializedPayload,
    channels: CallChannels,
    start_timeout: Option<Duration>,
) {
    if outbox.downstream(DownstreamEvent::Opened).await.is_err() {
        return;
    }

    let source = match guarded(handler(context.clone(), payload)).await {
        Ok(source) => source,
        Err(error) => {
            let response = ResponsePayload::Error(context.fault_envelope(&error));
            outbox.conclude(DownstreamEvent::Response(response)).await;
            return;
        }
    };

    produce(outbox, &channels, source, &context, start_timeout).await;
}

/// Produce `source` for the caller and report a stalled consumer.
pub(crate) async fn produce(
    outbox: &Outbox,
    channels: &CallChannels,
    source: PayloadStream,
    context: &CallContext,
    start_timeout: Option<Duration>,
) {
    let outcome = push_stream(outbox, &channels.flow, source, context, start_timeout).await;
    debug!("Stream of call {} ended: {outcome:?}", outbox.reference());

    if outcome == PushOutcome::TimedOut {
        if let Some(limit) = start_timeout {
            let fault = start_timeout_fault(limit);
            let envelope = context.fault_envelope(&fault);
            outbox.conclude(DownstreamEvent::Error(envelope)).await;
        }
    }
}
