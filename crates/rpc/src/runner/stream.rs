//! Pull-based stream plumbing shared by every streaming runner.
//!
//! The consumer of a direction sends one `Start` per element it wants and
//! the producer answers each with exactly one stream event.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use futures::{FutureExt, StreamExt};
use tracing::debug;

use crate::call::{CallContext, PayloadStream};
use crate::fault::{RequestTimeoutError, RpcError};
use crate::protocol::{StreamFrame, StreamOperation};
use crate::runner::{Outbox, panic_fault};

/// Sends `Close` when dropped while armed.
struct CloseOnDrop {
    outbox: Option<Outbox>,
}

impl CloseOnDrop {
    const fn new(outbox: Outbox) -> Self {
        Self {
            outbox: Some(outbox),
        }
    }

    fn disarm(&mut self) {
        self.outbox = None;
    }
}

impl Drop for CloseOnDrop {
    fn drop(&mut self) {
        if let Some(outbox) = self.outbox.take() {
            debug!("Closing stream of call {} early", outbox.reference());
            outbox.operation_detached(StreamOperation::Close);
        }
    }
}

/// Consume the peer's stream of a call. Each poll sends one `Start` and
/// yields the event it buys. Dropping the stream early sends `Close`.
///
/// `keep_alive` lives exactly as long as the stream does.
pub(crate) fn pull_stream<K>(
    outbox: Outbox,
    data: flume::Receiver<StreamFrame>,
    demand: Arc<AtomicU32>,
    context: CallContext,
    keep_alive: K,
) -> PayloadStream
where
    K: Send + 'static,
{
    // Created outside the generator so a stream dropped before its first
    // poll still closes.
    let close = CloseOnDrop::new(outbox.clone());

    async_stream::stream! {
        let keep_alive = keep_alive;
        let mut close = close;

        loop {
            demand.fetch_add(1, Ordering::AcqRel);
            if outbox.operation(StreamOperation::Start).await.is_err() {
                close.disarm();
                yield Err(RpcError::connection_closed());
                break;
            }

            match data.recv_async().await {
                Ok(StreamFrame::Element(payload)) => yield Ok(payload),
                Ok(StreamFrame::Complete) => {
                    close.disarm();
                    break;
                }
                Ok(StreamFrame::Error(envelope)) => {
                    close.disarm();
                    yield Err(context.decode_fault(envelope));
                    break;
                }
                Err(_) => {
                    close.disarm();
                    yield Err(RpcError::connection_closed());
                    break;
                }
            }
        }

        drop(close);
        drop(keep_alive);
    }
    .boxed()
}

/// How a producer stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PushOutcome {
    /// Sent `Complete`.
    Completed,
    /// Sent an `Error` stream event.
    Failed,
    /// The consumer sent `Close`.
    Closed,
    /// No `Start` arrived in time.
    TimedOut,
    /// The call or connection went away.
    Disconnected,
}

/// Feed `source` to the peer, one element per `Start`.
pub(crate) async fn push_stream(
    outbox: &Outbox,
    flow: &flume::Receiver<StreamOperation>,
    mut source: PayloadStream,
    context: &CallContext,
    start_timeout: Option<Duration>,
) -> PushOutcome {
    loop {
        let operation = match start_timeout {
            Some(limit) => match tokio::time::timeout(limit, flow.recv_async()).await {
                Ok(operation) => operation,
                Err(_) => return PushOutcome::TimedOut,
            },
            None => flow.recv_async().await,
        };

        match operation {
            Ok(StreamOperation::Start) => {}
            Ok(StreamOperation::Close) => return PushOutcome::Closed,
            Err(_) => return PushOutcome::Disconnected,
        }

        let (frame, outcome) = match AssertUnwindSafe(source.next()).catch_unwind().await {
            Ok(Some(Ok(payload))) => (StreamFrame::Element(payload), None),
            Ok(Some(Err(error))) => (
                StreamFrame::Error(context.fault_envelope(&error)),
                Some(PushOutcome::Failed),
            ),
            Ok(None) => (StreamFrame::Complete, Some(PushOutcome::Completed)),
            Err(panic) => (
                StreamFrame::Error(context.fault_envelope(&panic_fault(panic.as_ref()))),
                Some(PushOutcome::Failed),
            ),
        };

        if outbox.data(frame).await.is_err() {
            return PushOutcome::Disconnected;
        }
        if let Some(outcome) = outcome {
            return outcome;
        }
    }
}

/// The fault a producer reports when its consumer stalls.
pub(crate) fn start_timeout_fault(limit: Duration) -> RpcError {
    RpcError::new(RequestTimeoutError {
        message: format!("no Start within {limit:?}"),
    })
}
