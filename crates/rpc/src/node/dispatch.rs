//! Routing of inbound frames to the calls they belong to.
//!
//! Runs on the read loop, so nothing here waits: events are forwarded into
//! per-call channels and replies are queued without blocking.

use std::sync::Arc;

use tracing::{debug, warn};

use crate::call::{CallContext, CallDirection, CallShape, ServiceCallIdentifier};
use crate::fault::{FaultEnvelope, RpcError, TooManyCallsError, UnknownReferenceError};
use crate::node::core::{CallSlot, Control, NodeCore, Side};
use crate::protocol::{
    DownstreamEvent, FrameHeader, ResponsePayload, RpcFrame, RpcReference, StreamFrame,
    UpstreamEvent,
};
use crate::runner;
use crate::serialization::SerializedPayload;

impl NodeCore {
    pub(crate) fn dispatch_frame(self: &Arc<Self>, frame: RpcFrame) {
        let (direction, event) = frame.describe();
        debug!(
            "Received {direction} {event} frame for {}",
            frame.call_reference()
        );

        match frame {
            RpcFrame::Upstream(FrameHeader {
                call_reference,
                event,
            }) => self.on_upstream(call_reference, event),
            RpcFrame::Downstream(FrameHeader {
                call_reference,
                event,
            }) => self.on_downstream(call_reference, event),
        }
    }

    fn envelope(&self, error: &RpcError) -> FaultEnvelope {
        error.to_envelope(self.serializer.format())
    }

    fn on_upstream(self: &Arc<Self>, reference: RpcReference, event: UpstreamEvent) {
        let event = match event {
            UpstreamEvent::Open {
                service_call,
                shape,
                payload,
            } => {
                self.on_open(reference, service_call, shape, payload);
                return;
            }
            other => other,
        };

        let Some(slot) = self.slot(Side::Callee, reference) else {
            self.on_unknown(
                Side::Callee,
                reference,
                event.name(),
                matches!(event, UpstreamEvent::Error(_)),
            );
            return;
        };

        match event {
            UpstreamEvent::Open { .. } => {}
            UpstreamEvent::Data(frame) => {
                if !slot.shape.streams_upstream() {
                    self.callee_violation(
                        reference,
                        &slot,
                        format!("{} call received upstream data", slot.shape),
                    );
                } else if !slot.take_demand() {
                    self.callee_violation(reference, &slot, "stream event without Start".into());
                } else {
                    let _ = slot.data.send(frame);
                }
            }
            UpstreamEvent::StreamOperation(operation) => {
                if slot.shape.streams_downstream() {
                    let _ = slot.flow.send(operation);
                } else {
                    self.callee_violation(
                        reference,
                        &slot,
                        format!("{} call received a stream operation", slot.shape),
                    );
                }
            }
            UpstreamEvent::Warning { message } => {
                warn!("Caller warning on {reference}: {message}");
            }
            UpstreamEvent::Error(envelope) => {
                debug!(
                    "Caller failed call {reference}: {}",
                    envelope.debug_message
                );
                slot.cancel.cancel();
                self.retire(Side::Callee, reference);
            }
            UpstreamEvent::Cancel => {
                debug!("Caller cancelled call {reference}");
                slot.cancel.cancel();
                self.retire(Side::Callee, reference);
            }
        }
    }

    fn on_open(
        self: &Arc<Self>,
        reference: RpcReference,
        service_call: ServiceCallIdentifier,
        shape: CallShape,
        payload: SerializedPayload,
    ) {
        if self.contains(Side::Callee, reference) {
            warn!("Peer reopened call {reference}");
            let error = RpcError::protocol_violation(format!("call {reference} is already open"));
            self.send_detached(RpcFrame::downstream(
                reference,
                DownstreamEvent::Error(self.envelope(&error)),
            ));
            return;
        }

        let Some(dispatch) = self.dispatch() else {
            return;
        };

        let call = match dispatch.services.resolve(&service_call, shape) {
            Ok(call) => call.clone(),
            Err(error) => {
                debug!("Rejecting call {service_call} on {reference}: {error}");
                self.send_detached(RpcFrame::downstream(
                    reference,
                    DownstreamEvent::Error(self.envelope(&error)),
                ));
                return;
            }
        };

        let Ok(permit) = Arc::clone(&self.permits).try_acquire_owned() else {
            let limit = self.config.max_concurrent_calls.max(1);
            warn!("Refusing call {service_call} on {reference}: {limit} calls already running");
            let error = RpcError::new(TooManyCallsError { limit });
            self.send_detached(RpcFrame::downstream(
                reference,
                DownstreamEvent::Error(self.envelope(&error)),
            ));
            return;
        };

        let Some(channels) = self.register(Side::Callee, reference, shape) else {
            return;
        };

        let context = CallContext::new(
            service_call,
            shape,
            CallDirection::Incoming,
            self.serializer,
            call.errors().clone(),
            dispatch.errors.clone(),
        )
        .with_reference(reference);

        let core = Arc::clone(self);
        self.tasks.spawn(async move {
            runner::serve(core, call, context, payload, channels).await;
            drop(permit);
        });
    }

    fn on_downstream(self: &Arc<Self>, reference: RpcReference, event: DownstreamEvent) {
        let Some(slot) = self.slot(Side::Caller, reference) else {
            self.on_unknown(
                Side::Caller,
                reference,
                event.name(),
                matches!(event, DownstreamEvent::Error(_)),
            );
            return;
        };

        match event {
            DownstreamEvent::Opened => {
                if slot.shape.streams_downstream() {
                    let _ = slot.control.send(Control::Opened);
                } else {
                    self.caller_violation(
                        reference,
                        &slot,
                        format!("{} call received Opened", slot.shape),
                    );
                }
            }
            DownstreamEvent::Data(frame) => {
                if !slot.shape.streams_downstream() {
                    self.caller_violation(
                        reference,
                        &slot,
                        format!("{} call received downstream data", slot.shape),
                    );
                } else if !slot.take_demand() {
                    self.caller_violation(reference, &slot, "stream event without Start".into());
                } else {
                    let _ = slot.data.send(frame);
                }
            }
            DownstreamEvent::Response(response) => {
                if let ResponsePayload::Error(envelope) = &response {
                    Self::fail_stream(&slot, envelope);
                }
                let _ = slot.control.send(Control::Response(response));
            }
            DownstreamEvent::StreamOperation(operation) => {
                if slot.shape.streams_upstream() {
                    let _ = slot.flow.send(operation);
                } else {
                    self.caller_violation(
                        reference,
                        &slot,
                        format!("{} call received a stream operation", slot.shape),
                    );
                }
            }
            DownstreamEvent::Warning { message } => {
                warn!("Callee warning on {reference}: {message}");
            }
            DownstreamEvent::Error(envelope) => {
                Self::fail_stream(&slot, &envelope);
                let _ = slot.control.send(Control::Failed(envelope));
            }
        }
    }

    /// A streaming caller may already be reading elements; it learns about
    /// a failure through its data channel.
    fn fail_stream(slot: &CallSlot, envelope: &FaultEnvelope) {
        if slot.shape.streams_downstream() {
            let _ = slot.data.send(StreamFrame::Error(envelope.clone()));
        }
    }

    fn on_unknown(&self, side: Side, reference: RpcReference, event: &str, is_error: bool) {
        if self.is_retired(side, reference) {
            debug!("Dropping late {event} for finished call {reference}");
            return;
        }

        // Answering an error with an error would never end.
        if is_error {
            warn!("Ignoring {event} for unknown call {reference}");
            return;
        }

        warn!("Received {event} for unknown call {reference}");
        let envelope = self.envelope(&RpcError::new(UnknownReferenceError { reference }));
        let reply = match side {
            Side::Callee => RpcFrame::downstream(reference, DownstreamEvent::Error(envelope)),
            Side::Caller => RpcFrame::upstream(reference, UpstreamEvent::Error(envelope)),
        };
        self.send_detached(reply);
    }

    fn callee_violation(&self, reference: RpcReference, slot: &CallSlot, message: String) {
        warn!("Protocol violation on incoming call {reference}: {message}");
        let envelope = self.envelope(&RpcError::protocol_violation(message));
        slot.cancel.cancel();
        self.retire(Side::Callee, reference);
        self.send_detached(RpcFrame::downstream(
            reference,
            DownstreamEvent::Error(envelope),
        ));
    }

    fn caller_violation(&self, reference: RpcReference, slot: &CallSlot, message: String) {
        warn!("Protocol violation on outgoing call {reference}: {message}");
        let envelope = self.envelope(&RpcError::protocol_violation(message));
        self.send_detached(RpcFrame::upstream(
            reference,
            UpstreamEvent::Error(envelope.clone()),
        ));
        Self::fail_stream(slot, &envelope);
        let _ = slot.control.send(Control::Failed(envelope));
    }
}
