//! Call descriptions and the type-erased handlers bound to them.
//!
//! A typed description (for example [`SingleCallDescription`]) names a call
//! and fixes its payload types. Binding an implementation with `calling`
//! yields a [`RunnableCallDescription`], whose [`CallHandler`] works on
//! [`SerializedPayload`]s so the node and the interceptor chain never see
//! the concrete types.

mod context;
mod description;

use std::fmt;
use std::sync::Arc;

use futures::future::BoxFuture;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize, de::DeserializeOwned};

use crate::fault::{ErrorRegistry, RpcError};
use crate::interceptor::Interceptor;
use crate::serialization::SerializedPayload;

pub use context::{CallContext, CallDirection};
pub use description::{
    CallDescription, ColdBistreamCallDescription, ColdDownstreamCallDescription,
    ColdUpstreamCallDescription, SingleCallDescription,
};
pub(crate) use description::{decode_items, encode_items};

/// Type alias for boxed futures.
pub type BoxedFuture<T> = BoxFuture<'static, T>;

/// A stream of typed items, each of which may be a fault.
pub type RpcStream<T> = BoxStream<'static, Result<T, RpcError>>;

/// A stream of encoded items.
pub type PayloadStream = RpcStream<SerializedPayload>;

/// Erased handler of a Single call.
pub type SingleHandler = Arc<
    dyn Fn(CallContext, SerializedPayload) -> BoxedFuture<Result<SerializedPayload, RpcError>>
        + Send
        + Sync,
>;

/// Erased handler of a ColdUpstream call.
pub type UpstreamHandler = Arc<
    dyn Fn(
            CallContext,
            SerializedPayload,
            PayloadStream,
        ) -> BoxedFuture<Result<SerializedPayload, RpcError>>
        + Send
        + Sync,
>;

/// Erased handler of a ColdDownstream call.
pub type DownstreamHandler = Arc<
    dyn Fn(CallContext, SerializedPayload) -> BoxedFuture<Result<PayloadStream, RpcError>>
        + Send
        + Sync,
>;

/// Erased handler of a ColdBistream call.
pub type BistreamHandler = Arc<
    dyn Fn(
            CallContext,
            SerializedPayload,
            PayloadStream,
        ) -> BoxedFuture<Result<PayloadStream, RpcError>>
        + Send
        + Sync,
>;

/// Values that can travel as a payload.
pub trait Payload: Serialize + DeserializeOwned + Send + 'static {}

impl<T> Payload for T where T: Serialize + DeserializeOwned + Send + 'static {}

/// Names one call of one service.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ServiceCallIdentifier {
    /// Service name.
    pub service_id: String,
    /// Call name within the service.
    pub call_id: String,
}

impl ServiceCallIdentifier {
    /// Create an identifier.
    pub fn new(service_id: impl Into<String>, call_id: impl Into<String>) -> Self {
        Self {
            service_id: service_id.into(),
            call_id: call_id.into(),
        }
    }
}

impl fmt::Display for ServiceCallIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.service_id, self.call_id)
    }
}

/// How requests and responses flow in a call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallShape {
    /// One request, one response.
    Single,
    /// A request plus a caller stream, one response.
    ColdUpstream,
    /// A request, a callee stream.
    ColdDownstream,
    /// A request plus a caller stream, a callee stream.
    ColdBistream,
}

impl CallShape {
    /// Whether the caller streams elements to the callee.
    #[must_use]
    pub const fn streams_upstream(self) -> bool {
        matches!(self, Self::ColdUpstream | Self::ColdBistream)
    }

    /// Whether the callee streams elements to the caller.
    #[must_use]
    pub const fn streams_downstream(self) -> bool {
        matches!(self, Self::ColdDownstream | Self::ColdBistream)
    }

    /// Short name for logs.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Single => "single",
            Self::ColdUpstream => "cold_upstream",
            Self::ColdDownstream => "cold_downstream",
            Self::ColdBistream => "cold_bistream",
        }
    }
}

impl fmt::Display for CallShape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A type-erased handler, one variant per call shape.
#[derive(Clone)]
pub enum CallHandler {
    /// Single call.
    Single(SingleHandler),
    /// ColdUpstream call.
    ColdUpstream(UpstreamHandler),
    /// ColdDownstream call.
    ColdDownstream(DownstreamHandler),
    /// ColdBistream call.
    ColdBistream(BistreamHandler),
}

impl CallHandler {
    /// The shape this handler serves.
    #[must_use]
    pub const fn shape(&self) -> CallShape {
        match self {
            Self::Single(_) => CallShape::Single,
            Self::ColdUpstream(_) => CallShape::ColdUpstream,
            Self::ColdDownstream(_) => CallShape::ColdDownstream,
            Self::ColdBistream(_) => CallShape::ColdBistream,
        }
    }
}

impl fmt::Debug for CallHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CallHandler::{}", self.shape())
    }
}

/// A call description bound to an implementation.
#[derive(Debug, Clone)]
pub struct RunnableCallDescription {
    identifier: ServiceCallIdentifier,
    errors: ErrorRegistry,
    handler: CallHandler,
}

impl RunnableCallDescription {
    pub(crate) const fn new(
        identifier: ServiceCallIdentifier,
        errors: ErrorRegistry,
        handler: CallHandler,
    ) -> Self {
        Self {
            identifier,
            errors,
            handler,
        }
    }

    /// The call this implements.
    #[must_use]
    pub const fn identifier(&self) -> &ServiceCallIdentifier {
        &self.identifier
    }

    /// Shape of the call.
    #[must_use]
    pub const fn shape(&self) -> CallShape {
        self.handler.shape()
    }

    /// Faults the call declares.
    #[must_use]
    pub const fn errors(&self) -> &ErrorRegistry {
        &self.errors
    }

    /// The bound handler.
    #[must_use]
    pub const fn handler(&self) -> &CallHandler {
        &self.handler
    }

    /// A copy whose handler runs through `interceptor` first.
    #[must_use]
    pub fn intercepted_with(&self, interceptor: Arc<dyn Interceptor>) -> Self {
        Self {
            identifier: self.identifier.clone(),
            errors: self.errors.clone(),
            handler: self.handler.clone().wrapped_by(interceptor),
        }
    }
}
