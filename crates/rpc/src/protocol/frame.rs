//! Frame envelope.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::protocol::{DownstreamEvent, UpstreamEvent};

/// Correlates every frame of one call.
///
/// Allocated by the caller from a per-node counter, so a value is unique per
/// direction for the lifetime of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RpcReference(u64);

impl RpcReference {
    /// Wrap a raw reference.
    #[must_use]
    pub const fn new(value: u64) -> Self {
        Self(value)
    }

    /// The raw value.
    #[must_use]
    pub const fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for RpcReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Header shared by both directions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FrameHeader<E> {
    /// The call this frame belongs to.
    pub call_reference: RpcReference,
    /// What happened.
    pub event: E,
}

impl<E> FrameHeader<E> {
    /// Create a header.
    pub const fn new(call_reference: RpcReference, event: E) -> Self {
        Self {
            call_reference,
            event,
        }
    }
}

/// One envelope exchanged over the connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RpcFrame {
    /// Caller to callee.
    Upstream(FrameHeader<UpstreamEvent>),
    /// Callee to caller.
    Downstream(FrameHeader<DownstreamEvent>),
}

impl RpcFrame {
    /// Build an upstream frame.
    #[must_use]
    pub const fn upstream(call_reference: RpcReference, event: UpstreamEvent) -> Self {
        Self::Upstream(FrameHeader::new(call_reference, event))
    }

    /// Build a downstream frame.
    #[must_use]
    pub const fn downstream(call_reference: RpcReference, event: DownstreamEvent) -> Self {
        Self::Downstream(FrameHeader::new(call_reference, event))
    }

    /// The call this frame belongs to.
    #[must_use]
    pub const fn call_reference(&self) -> RpcReference {
        match self {
            Self::Upstream(header) => header.call_reference,
            Self::Downstream(header) => header.call_reference,
        }
    }

    /// Short description for logs.
    #[must_use]
    pub const fn describe(&self) -> (&'static str, &'static str) {
        match self {
            Self::Upstream(header) => ("upstream", header.event.name()),
            Self::Downstream(header) => ("downstream", header.event.name()),
        }
    }
}
