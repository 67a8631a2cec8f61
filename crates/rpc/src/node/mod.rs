//! The RPC node: one per connection.
//!
//! A node is built with [`NodeBuilder`], runs the handshake, then serves
//! registered services and carries outgoing calls until it closes.

mod builder;
pub mod config;
pub(crate) mod core;
mod dispatch;
mod transport;

use std::fmt;
use std::sync::Arc;

use tokio::sync::watch;

use crate::extension::{ExtensionIdentifier, NodeExtension};
use crate::serialization::SerializationFormat;

pub use builder::NodeBuilder;
pub use config::NodeConfig;
pub use transport::RpcTransport;

use self::core::NodeCore;

/// Lifecycle of a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NodeState {
    /// Built, not yet talking.
    Created,
    /// Negotiating with the peer.
    Handshaking,
    /// Serving and calling.
    Active,
    /// Terminal.
    Closed,
}

impl fmt::Display for NodeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Created => "created",
            Self::Handshaking => "handshaking",
            Self::Active => "active",
            Self::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// Which end of the connection a node is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NodeRole {
    /// Opened the connection and proposed the handshake.
    Client,
    /// Accepted the connection.
    Server,
}

impl fmt::Display for NodeRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Client => f.write_str("client"),
            Self::Server => f.write_str("server"),
        }
    }
}

/// An active RPC node. Dropping it closes the connection.
pub struct RpcNode {
    core: Arc<NodeCore>,
}

impl RpcNode {
    pub(crate) const fn new(core: Arc<NodeCore>) -> Self {
        Self { core }
    }

    /// Handle for calls to the peer. Clones share the node.
    #[must_use]
    pub fn transport(&self) -> RpcTransport {
        RpcTransport::new(Arc::clone(&self.core))
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> NodeState {
        self.core.state()
    }

    /// Receiver for state changes.
    #[must_use]
    pub fn watch_state(&self) -> watch::Receiver<NodeState> {
        self.core.subscribe_state()
    }

    /// Whether this node connected or accepted.
    #[must_use]
    pub fn role(&self) -> NodeRole {
        self.core.role
    }

    /// Negotiated protocol version.
    #[must_use]
    pub fn protocol_version(&self) -> u32 {
        self.core.negotiated.version
    }

    /// Negotiated frame format.
    #[must_use]
    pub fn frame_format(&self) -> SerializationFormat {
        self.core.negotiated.frame_format
    }

    /// Extensions the peer advertised in the handshake.
    #[must_use]
    pub fn peer_extensions(&self) -> &[ExtensionIdentifier] {
        &self.core.negotiated.peer_extensions
    }

    /// The bound extension of type `T`, while the node is active.
    #[must_use]
    pub fn extension<T: NodeExtension>(&self) -> Option<Arc<T>> {
        self.core
            .extensions()
            .iter()
            .find_map(|bound| bound.downcast::<T>())
    }

    /// Close the node and wait for its tasks to finish.
    pub async fn shutdown(&self) {
        self.core.close("shutdown requested");
        self.core.tasks.wait().await;
    }

    /// Wait until the node closes for any reason and its tasks finished.
    pub async fn closed(&self) {
        let mut state = self.core.subscribe_state();
        let _ = state.wait_for(|s| *s == NodeState::Closed).await;
        self.core.tasks.wait().await;
    }
}

impl fmt::Debug for RpcNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RpcNode")
            .field("role", &self.core.role)
            .field("state", &self.core.state())
            .field("connection", &self.core.connection.describe())
            .finish_non_exhaustive()
    }
}

impl Drop for RpcNode {
    fn drop(&mut self) {
        self.core.close("node dropped");
    }
}
