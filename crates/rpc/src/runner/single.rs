//! One request, one response.

use std::sync::Arc;

use crate::call::{CallContext, SingleHandler};
use crate::fault::RpcError;
use crate::node::core::NodeCore;
use crate::protocol::{DownstreamEvent, ResponsePayload};
use crate::runner::{Outbox, guarded, open};
use crate::serialization::SerializedPayload;

/// Caller half: send `Open`, await the `Response`.
pub(crate) async fn call(
    core: Arc<NodeCore>,
    context: CallContext,
    payload: SerializedPayload,
) -> Result<SerializedPayload, RpcError> {
    let mut call = open(core, context, payload).await?;
    call.response().await
}

/// Callee half: run the handler, reply with its outcome.
pub(crate) async fn serve(
    handler: SingleHandler,
    outbox: &Outbox,
    context: CallContext,
    payload: SerializedPayload,
) {
    let response = match guarded(handler(context.clone(), payload)).await {
        Ok(payload) => ResponsePayload::Success(payload),
        Err(error) => ResponsePayload::Error(context.fault_envelope(&error)),
    };
    outbox.conclude(DownstreamEvent::Response(response)).await;
}
