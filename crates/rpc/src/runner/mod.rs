//! Call runners.
//!
//! Each shape has a caller half, which turns an outgoing call into frames,
//! and a callee half, which drives a registered handler from frames. Both
//! halves share the stream plumbing in [`stream`].

pub(crate) mod bistream;
pub(crate) mod downstream;
pub(crate) mod single;
pub(crate) mod stream;
pub(crate) mod upstream;

use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::FutureExt;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::call::{CallContext, CallHandler, RunnableCallDescription};
use crate::error::Result;
use crate::fault::RpcError;
use crate::node::core::{CallChannels, Control, NodeCore, Side};
use crate::protocol::{
    DownstreamEvent, ResponsePayload, RpcFrame, RpcReference, StreamFrame, StreamOperation,
    UpstreamEvent,
};
use crate::serialization::SerializedPayload;

/// Sends the frames of one call from one side.
#[derive(Clone)]
pub(crate) struct Outbox {
    core: Arc<NodeCore>,
    reference: RpcReference,
    side: Side,
}

impl Outbox {
    pub(crate) const fn new(core: Arc<NodeCore>, reference: RpcReference, side: Side) -> Self {
        Self {
            core,
            reference,
            side,
        }
    }

    pub(crate) const fn reference(&self) -> RpcReference {
        self.reference
    }

    fn data_frame(&self, frame: StreamFrame) -> RpcFrame {
        match self.side {
            Side::Caller => RpcFrame::upstream(self.reference, UpstreamEvent::Data(frame)),
            Side::Callee => RpcFrame::downstream(self.reference, DownstreamEvent::Data(frame)),
        }
    }

    fn operation_frame(&self, operation: StreamOperation) -> RpcFrame {
        match self.side {
            Side::Caller => {
                RpcFrame::upstream(self.reference, UpstreamEvent::StreamOperation(operation))
            }
            Side::Callee => {
                RpcFrame::downstream(self.reference, DownstreamEvent::StreamOperation(operation))
            }
        }
    }

    pub(crate) async fn data(&self, frame: StreamFrame) -> Result<()> {
        self.core.send(self.data_frame(frame)).await
    }

    pub(crate) async fn operation(&self, operation: StreamOperation) -> Result<()> {
        self.core.send(self.operation_frame(operation)).await
    }

    pub(crate) fn operation_detached(&self, operation: StreamOperation) {
        self.core.send_detached(self.operation_frame(operation));
    }

    pub(crate) async fn downstream(&self, event: DownstreamEvent) -> Result<()> {
        self.core
            .send(RpcFrame::downstream(self.reference, event))
            .await
    }

    /// Send the last frame of an incoming call. The caller may be gone.
    pub(crate) async fn conclude(&self, event: DownstreamEvent) {
        let name = event.name();
        if let Err(e) = self.downstream(event).await {
            debug!("Dropping {name} for call {}: {e}", self.reference);
        }
    }
}

/// Retires a call when dropped, first sending a farewell frame if one is
/// set.
pub(crate) struct CallGuard {
    core: Arc<NodeCore>,
    reference: RpcReference,
    side: Side,
    farewell: Option<RpcFrame>,
}

impl CallGuard {
    pub(crate) const fn new(core: Arc<NodeCore>, reference: RpcReference, side: Side) -> Self {
        Self {
            core,
            reference,
            side,
            farewell: None,
        }
    }

    pub(crate) fn set_farewell(&mut self, farewell: Option<RpcFrame>) {
        self.farewell = farewell;
    }

    /// The call reached a terminal event; nothing needs to be said.
    pub(crate) fn finish(&mut self) {
        self.farewell = None;
    }
}

impl Drop for CallGuard {
    fn drop(&mut self) {
        if let Some(frame) = self.farewell.take() {
            debug!("Abandoning call {}", self.reference);
            self.core.send_detached(frame);
        }
        self.core.retire(self.side, self.reference);
    }
}

/// Aborts a helper task when dropped.
pub(crate) struct AbortOnDrop(JoinHandle<()>);

impl AbortOnDrop {
    pub(crate) fn spawn<F>(future: F) -> Self
    where
        F: Future<Output = ()> + Send + 'static,
    {
        Self(tokio::spawn(future))
    }
}

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// Turn a panic payload into the fault reported to the peer.
pub(crate) fn panic_fault(panic: &(dyn Any + Send)) -> RpcError {
    let message = panic
        .downcast_ref::<&str>()
        .map(|s| (*s).to_string())
        .or_else(|| panic.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string());
    RpcError::internal(format!("implementation panicked: {message}"))
}

/// Run an implementation future, converting a panic into a fault.
pub(crate) async fn guarded<T, F>(future: F) -> std::result::Result<T, RpcError>
where
    F: Future<Output = std::result::Result<T, RpcError>>,
{
    match AssertUnwindSafe(future).catch_unwind().await {
        Ok(result) => result,
        Err(panic) => Err(panic_fault(panic.as_ref())),
    }
}

/// Serve one incoming call until it finishes or is cancelled.
pub(crate) async fn serve(
    core: Arc<NodeCore>,
    call: RunnableCallDescription,
    context: CallContext,
    payload: SerializedPayload,
    channels: CallChannels,
) {
    let reference = channels.reference;
    let _guard = CallGuard::new(Arc::clone(&core), reference, Side::Callee);
    let outbox = Outbox::new(Arc::clone(&core), reference, Side::Callee);
    let cancel = channels.cancel.clone();
    let start_timeout = core.config.stream_start_timeout;

    debug!(
        "Serving {} call {} as {reference}",
        context.shape(),
        context.service_call()
    );

    let work = async {
        match call.handler().clone() {
            CallHandler::Single(handler) => single::serve(handler, &outbox, context, payload).await,
            CallHandler::ColdUpstream(handler) => {
                upstream::serve(handler, &outbox, context, payload, channels).await;
            }
            CallHandler::ColdDownstream(handler) => {
                downstream::serve(handler, &outbox, context, payload, channels, start_timeout)
                    .await;
            }
            CallHandler::ColdBistream(handler) => {
                bistream::serve(handler, &outbox, context, payload, channels, start_timeout).await;
            }
        }
    };

    tokio::select! {
        biased;
        () = cancel.cancelled() => debug!("Incoming call {reference} cancelled"),
        () = work => debug!("Incoming call {reference} finished"),
    }
}

/// An outgoing call whose `Open` has been sent.
pub(crate) struct OpenedCall {
    pub(crate) context: CallContext,
    pub(crate) channels: CallChannels,
    pub(crate) outbox: Outbox,
    pub(crate) guard: CallGuard,
}

/// Register an outgoing call and send its `Open`. Dropping the result
/// before a terminal event cancels the call on the peer.
pub(crate) async fn open(
    core: Arc<NodeCore>,
    context: CallContext,
    payload: SerializedPayload,
) -> std::result::Result<OpenedCall, RpcError> {
    let reference = core.next_reference();
    let context = context.with_reference(reference);
    let channels = core
        .register(Side::Caller, reference, context.shape())
        .ok_or_else(RpcError::connection_closed)?;
    let mut guard = CallGuard::new(Arc::clone(&core), reference, Side::Caller);

    core.send(RpcFrame::upstream(
        reference,
        UpstreamEvent::Open {
            service_call: context.service_call().clone(),
            shape: context.shape(),
            payload,
        },
    ))
    .await?;
    guard.set_farewell(Some(RpcFrame::upstream(reference, UpstreamEvent::Cancel)));

    Ok(OpenedCall {
        context,
        channels,
        outbox: Outbox::new(core, reference, Side::Caller),
        guard,
    })
}

impl OpenedCall {
    /// Wait for the single `Response` of a call.
    pub(crate) async fn response(&mut self) -> std::result::Result<SerializedPayload, RpcError> {
        let result = match self.channels.control.recv_async().await {
            Ok(Control::Response(ResponsePayload::Success(payload))) => Ok(payload),
            Ok(Control::Response(ResponsePayload::Error(envelope)) | Control::Failed(envelope)) => {
                Err(self.context.decode_fault(envelope))
            }
            Ok(Control::Opened) => {
                return Err(RpcError::protocol_violation(format!(
                    "{} call {} received Opened",
                    self.context.shape(),
                    self.outbox.reference()
                )));
            }
            Err(_) => Err(RpcError::connection_closed()),
        };
        self.guard.finish();
        result
    }

    /// Wait for `Opened` on a streaming call.
    pub(crate) async fn opened(&mut self) -> std::result::Result<(), RpcError> {
        match self.channels.control.recv_async().await {
            Ok(Control::Opened) => Ok(()),
            Ok(Control::Response(ResponsePayload::Error(envelope)) | Control::Failed(envelope)) => {
                self.guard.finish();
                Err(self.context.decode_fault(envelope))
            }
            Ok(Control::Response(ResponsePayload::Success(_))) => {
                Err(RpcError::protocol_violation(format!(
                    "{} call {} received a response before Opened",
                    self.context.shape(),
                    self.outbox.reference()
                )))
            }
            Err(_) => {
                self.guard.finish();
                Err(RpcError::connection_closed())
            }
        }
    }
}
