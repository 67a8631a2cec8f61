//! Shared state of an active node.

use std::num::NonZeroUsize;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use bytes::Bytes;
use dashmap::DashMap;
use lru::LruCache;
use parking_lot::{Mutex, RwLock};
use tether_transport::Connection;
use tokio::sync::{Semaphore, watch};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info};

use crate::call::{CallHandler, CallShape};
use crate::error::{Error, Result};
use crate::extension::BoundExtension;
use crate::fault::{ErrorRegistry, FaultEnvelope};
use crate::handshake::Negotiated;
use crate::node::{NodeConfig, NodeRole, NodeState};
use crate::protocol::{ResponsePayload, RpcFrame, RpcReference, StreamFrame, StreamOperation};
use crate::serialization::{FrameCodec, PayloadSerializer};
use crate::service::ServiceRegistry;

/// Which end of a call this node is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Side {
    /// We opened the call; we send upstream frames.
    Caller,
    /// The peer opened the call; we send downstream frames.
    Callee,
}

/// Lifecycle events delivered to the runner that owns a call.
#[derive(Debug)]
pub(crate) enum Control {
    Opened,
    Response(ResponsePayload),
    Failed(FaultEnvelope),
}

/// Dispatcher-side endpoints of one call.
#[derive(Clone)]
pub(crate) struct CallSlot {
    pub(crate) shape: CallShape,
    pub(crate) control: flume::Sender<Control>,
    pub(crate) data: flume::Sender<StreamFrame>,
    pub(crate) flow: flume::Sender<StreamOperation>,
    pub(crate) demand: Arc<AtomicU32>,
    pub(crate) cancel: CancellationToken,
}

impl CallSlot {
    /// Consume one outstanding `Start`, if any.
    pub(crate) fn take_demand(&self) -> bool {
        self.demand
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |d| d.checked_sub(1))
            .is_ok()
    }
}

/// Runner-side endpoints of one call.
pub(crate) struct CallChannels {
    pub(crate) reference: RpcReference,
    pub(crate) control: flume::Receiver<Control>,
    pub(crate) data: flume::Receiver<StreamFrame>,
    pub(crate) flow: flume::Receiver<StreamOperation>,
    pub(crate) demand: Arc<AtomicU32>,
    pub(crate) cancel: CancellationToken,
}

/// Registry, chains and faults, fixed once extensions are bound.
pub(crate) struct Dispatch {
    pub(crate) services: ServiceRegistry,
    pub(crate) errors: ErrorRegistry,
    pub(crate) outgoing: OutgoingChain,
}

/// The outgoing interceptor chain, composed once per shape.
pub(crate) struct OutgoingChain {
    pub(crate) single: CallHandler,
    pub(crate) upstream: CallHandler,
    pub(crate) downstream: CallHandler,
    pub(crate) bistream: CallHandler,
}

pub(crate) struct NodeCore {
    pub(crate) config: NodeConfig,
    pub(crate) role: NodeRole,
    pub(crate) negotiated: Negotiated,
    pub(crate) connection: Arc<dyn Connection>,
    pub(crate) codec: FrameCodec,
    pub(crate) serializer: PayloadSerializer,
    pub(crate) shutdown: CancellationToken,
    pub(crate) tasks: TaskTracker,
    pub(crate) permits: Arc<Semaphore>,
    state: watch::Sender<NodeState>,
    outbound: flume::Sender<Bytes>,
    next_reference: AtomicU64,
    outgoing: DashMap<RpcReference, CallSlot>,
    incoming: DashMap<RpcReference, CallSlot>,
    retired_outgoing: Mutex<LruCache<RpcReference, ()>>,
    retired_incoming: Mutex<LruCache<RpcReference, ()>>,
    dispatch: RwLock<Option<Arc<Dispatch>>>,
    extensions: RwLock<Vec<BoundExtension>>,
}

impl NodeCore {
    pub(crate) fn new(
        config: NodeConfig,
        role: NodeRole,
        negotiated: Negotiated,
        connection: Arc<dyn Connection>,
        codec: FrameCodec,
        state: watch::Sender<NodeState>,
        outbound: flume::Sender<Bytes>,
    ) -> Self {
        let retired =
            NonZeroUsize::new(config.retired_reference_capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            serializer: PayloadSerializer::new(config.payload_format),
            permits: Arc::new(Semaphore::new(config.max_concurrent_calls.max(1))),
            config,
            role,
            negotiated,
            connection,
            codec,
            shutdown: CancellationToken::new(),
            tasks: TaskTracker::new(),
            state,
            outbound,
            next_reference: AtomicU64::new(1),
            outgoing: DashMap::new(),
            incoming: DashMap::new(),
            retired_outgoing: Mutex::new(LruCache::new(retired)),
            retired_incoming: Mutex::new(LruCache::new(retired)),
            dispatch: RwLock::new(None),
            extensions: RwLock::new(Vec::new()),
        }
    }

    pub(crate) fn state(&self) -> NodeState {
        *self.state.borrow()
    }

    pub(crate) fn subscribe_state(&self) -> watch::Receiver<NodeState> {
        self.state.subscribe()
    }

    pub(crate) fn activate(&self, dispatch: Dispatch, extensions: Vec<BoundExtension>) {
        *self.dispatch.write() = Some(Arc::new(dispatch));
        *self.extensions.write() = extensions;
        self.state.send_if_modified(|state| {
            if *state == NodeState::Handshaking {
                *state = NodeState::Active;
                true
            } else {
                false
            }
        });
    }

    pub(crate) fn dispatch(&self) -> Option<Arc<Dispatch>> {
        self.dispatch.read().clone()
    }

    pub(crate) fn extensions(&self) -> Vec<BoundExtension> {
        self.extensions.read().clone()
    }

    pub(crate) fn next_reference(&self) -> RpcReference {
        RpcReference::new(self.next_reference.fetch_add(1, Ordering::Relaxed))
    }

    /// Queue a frame, waiting for room in the outbound queue.
    pub(crate) async fn send(&self, frame: RpcFrame) -> Result<()> {
        if self.shutdown.is_cancelled() {
            return Err(Error::ConnectionClosed);
        }

        let (direction, event) = frame.describe();
        debug!(
            "Sending {direction} {event} frame for {}",
            frame.call_reference()
        );

        let bytes = self.codec.encode(&frame)?;
        self.outbound
            .send_async(bytes)
            .await
            .map_err(|_| Error::ConnectionClosed)
    }

    /// Queue a frame from a context that cannot wait.
    pub(crate) fn send_detached(&self, frame: RpcFrame) {
        if self.shutdown.is_cancelled() {
            return;
        }

        let (direction, event) = frame.describe();
        let bytes = match self.codec.encode(&frame) {
            Ok(bytes) => bytes,
            Err(e) => {
                error!(
                    "Dropping {direction} {event} frame for {} that failed to encode: {e}",
                    frame.call_reference()
                );
                return;
            }
        };

        debug!(
            "Sending {direction} {event} frame for {}",
            frame.call_reference()
        );

        match self.outbound.try_send(bytes) {
            Ok(()) | Err(flume::TrySendError::Disconnected(_)) => {}
            Err(flume::TrySendError::Full(bytes)) => {
                if let Ok(runtime) = tokio::runtime::Handle::try_current() {
                    let outbound = self.outbound.clone();
                    runtime.spawn(async move {
                        let _ = outbound.send_async(bytes).await;
                    });
                }
            }
        }
    }

    fn slots(&self, side: Side) -> &DashMap<RpcReference, CallSlot> {
        match side {
            Side::Caller => &self.outgoing,
            Side::Callee => &self.incoming,
        }
    }

    fn retired(&self, side: Side) -> &Mutex<LruCache<RpcReference, ()>> {
        match side {
            Side::Caller => &self.retired_outgoing,
            Side::Callee => &self.retired_incoming,
        }
    }

    /// Create the channels of a new call. Returns `None` if the reference
    /// is already in use or the node is closing.
    pub(crate) fn register(
        &self,
        side: Side,
        reference: RpcReference,
        shape: CallShape,
    ) -> Option<CallChannels> {
        if self.shutdown.is_cancelled() {
            return None;
        }

        let (control_tx, control_rx) = flume::unbounded();
        let (data_tx, data_rx) = flume::unbounded();
        let (flow_tx, flow_rx) = flume::unbounded();
        let demand = Arc::new(AtomicU32::new(0));
        let cancel = self.shutdown.child_token();

        let slot = CallSlot {
            shape,
            control: control_tx,
            data: data_tx,
            flow: flow_tx,
            demand: Arc::clone(&demand),
            cancel: cancel.clone(),
        };

        match self.slots(side).entry(reference) {
            dashmap::mapref::entry::Entry::Occupied(_) => return None,
            dashmap::mapref::entry::Entry::Vacant(entry) => {
                entry.insert(slot);
            }
        }

        // A node that closed while the slot was inserted must not leave it
        // waiting forever.
        if self.shutdown.is_cancelled() {
            self.slots(side).remove(&reference);
            return None;
        }

        Some(CallChannels {
            reference,
            control: control_rx,
            data: data_rx,
            flow: flow_rx,
            demand,
            cancel,
        })
    }

    pub(crate) fn slot(&self, side: Side, reference: RpcReference) -> Option<CallSlot> {
        self.slots(side).get(&reference).map(|slot| slot.clone())
    }

    pub(crate) fn contains(&self, side: Side, reference: RpcReference) -> bool {
        self.slots(side).contains_key(&reference)
    }

    /// Forget a call and remember its reference as retired.
    pub(crate) fn retire(&self, side: Side, reference: RpcReference) {
        if self.slots(side).remove(&reference).is_some() {
            self.retired(side).lock().put(reference, ());
        }
    }

    pub(crate) fn is_retired(&self, side: Side, reference: RpcReference) -> bool {
        self.retired(side).lock().contains(&reference)
    }

    /// Number of calls in flight per side, for diagnostics.
    pub(crate) fn in_flight(&self) -> (usize, usize) {
        (self.outgoing.len(), self.incoming.len())
    }

    /// Move to `Closed`, cancel every call and release everything that
    /// could keep the node alive. Idempotent.
    pub(crate) fn close(&self, reason: &str) {
        let changed = self.state.send_if_modified(|state| {
            if *state == NodeState::Closed {
                false
            } else {
                *state = NodeState::Closed;
                true
            }
        });
        if !changed {
            return;
        }

        let (outgoing, incoming) = self.in_flight();
        info!(
            "Closing node ({reason}); {outgoing} outgoing and {incoming} incoming calls in flight"
        );

        self.shutdown.cancel();
        self.tasks.close();
        self.outgoing.clear();
        self.incoming.clear();
        self.dispatch.write().take();
        self.extensions.write().clear();
    }
}
