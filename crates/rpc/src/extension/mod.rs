//! Per-connection node extensions.
//!
//! A [`NodeExtensionFactory`] is configured on the [`NodeBuilder`]; once the
//! handshake completes it is bound against an [`ExtensionContract`] and the
//! resulting [`NodeExtension`] contributes services, interceptors and
//! faults, then runs for as long as the node is active.
//!
//! [`NodeBuilder`]: crate::node::NodeBuilder

pub mod logging;

use std::any::Any;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::error::Result;
use crate::fault::ErrorRegistry;
use crate::interceptor::Interceptor;
use crate::node::{NodeRole, RpcTransport};
use crate::serialization::SerializationFormat;
use crate::service::ServiceDescription;

pub use logging::{CallLogging, CallLoggingExtension};

/// Stable name of an extension, as advertised in the handshake.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ExtensionIdentifier(String);

impl ExtensionIdentifier {
    /// Create an identifier.
    pub fn new(identifier: impl Into<String>) -> Self {
        Self(identifier.into())
    }

    /// The identifier as a string.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ExtensionIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// What an extension learns about the connection it binds to.
#[derive(Clone)]
pub struct ExtensionContract {
    transport: RpcTransport,
    role: NodeRole,
    protocol_version: u32,
    frame_format: SerializationFormat,
    payload_format: SerializationFormat,
    peer_extensions: Vec<ExtensionIdentifier>,
}

impl ExtensionContract {
    pub(crate) const fn new(
        transport: RpcTransport,
        role: NodeRole,
        protocol_version: u32,
        frame_format: SerializationFormat,
        payload_format: SerializationFormat,
        peer_extensions: Vec<ExtensionIdentifier>,
    ) -> Self {
        Self {
            transport,
            role,
            protocol_version,
            frame_format,
            payload_format,
            peer_extensions,
        }
    }

    /// Handle for calls to the peer.
    #[must_use]
    pub const fn transport(&self) -> &RpcTransport {
        &self.transport
    }

    /// Whether this node connected or accepted.
    #[must_use]
    pub const fn role(&self) -> NodeRole {
        self.role
    }

    /// Negotiated protocol version.
    #[must_use]
    pub const fn protocol_version(&self) -> u32 {
        self.protocol_version
    }

    /// Negotiated frame format.
    #[must_use]
    pub const fn frame_format(&self) -> SerializationFormat {
        self.frame_format
    }

    /// Format this node encodes payloads in.
    #[must_use]
    pub const fn payload_format(&self) -> SerializationFormat {
        self.payload_format
    }

    /// Extensions the peer advertised.
    #[must_use]
    pub fn peer_extensions(&self) -> &[ExtensionIdentifier] {
        &self.peer_extensions
    }

    /// Whether the peer advertised `identifier`.
    #[must_use]
    pub fn peer_has(&self, identifier: &ExtensionIdentifier) -> bool {
        self.peer_extensions.contains(identifier)
    }
}

impl fmt::Debug for ExtensionContract {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExtensionContract")
            .field("role", &self.role)
            .field("protocol_version", &self.protocol_version)
            .field("frame_format", &self.frame_format)
            .field("payload_format", &self.payload_format)
            .field("peer_extensions", &self.peer_extensions)
            .finish_non_exhaustive()
    }
}

/// Creates one extension instance per connection.
pub trait NodeExtensionFactory: Send + Sync + 'static {
    /// Identifier advertised in the handshake.
    fn identifier(&self) -> ExtensionIdentifier;

    /// Whether the handshake fails when the peer lacks this extension.
    fn required_on_peer(&self) -> bool {
        false
    }

    /// Bind to a freshly negotiated connection.
    ///
    /// # Errors
    ///
    /// A failure aborts node startup.
    fn bind(&self, contract: ExtensionContract) -> Result<BoundExtension>;
}

/// A capability bound to one connection.
#[async_trait]
pub trait NodeExtension: Send + Sync + 'static {
    /// Services served by this extension.
    fn services(&self) -> Vec<ServiceDescription> {
        Vec::new()
    }

    /// Interceptors run around incoming calls, outermost first.
    fn incoming_interceptors(&self) -> Vec<Arc<dyn Interceptor>> {
        Vec::new()
    }

    /// Interceptors run around outgoing calls, outermost first.
    fn outgoing_interceptors(&self) -> Vec<Arc<dyn Interceptor>> {
        Vec::new()
    }

    /// Faults this extension may raise.
    fn register_errors(&self, _errors: &mut ErrorRegistry) {}

    /// Runs while the node is active. Returning an error closes the node.
    async fn run(&self, shutdown: CancellationToken) -> Result<()> {
        shutdown.cancelled().await;
        Ok(())
    }
}

/// A bound extension, keeping its concrete type reachable.
#[derive(Clone)]
pub struct BoundExtension {
    identifier: ExtensionIdentifier,
    extension: Arc<dyn NodeExtension>,
    any: Arc<dyn Any + Send + Sync>,
}

impl BoundExtension {
    /// Wrap a concrete extension.
    pub fn new<T: NodeExtension>(identifier: ExtensionIdentifier, extension: Arc<T>) -> Self {
        Self {
            identifier,
            any: Arc::clone(&extension) as Arc<dyn Any + Send + Sync>,
            extension,
        }
    }

    /// The extension's identifier.
    #[must_use]
    pub const fn identifier(&self) -> &ExtensionIdentifier {
        &self.identifier
    }

    /// The extension behind its trait.
    #[must_use]
    pub fn extension(&self) -> &Arc<dyn NodeExtension> {
        &self.extension
    }

    /// The extension as `T`, if it is one.
    #[must_use]
    pub fn downcast<T: NodeExtension>(&self) -> Option<Arc<T>> {
        Arc::clone(&self.any).downcast::<T>().ok()
    }
}

impl fmt::Debug for BoundExtension {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BoundExtension")
            .field("identifier", &self.identifier)
            .finish_non_exhaustive()
    }
}
