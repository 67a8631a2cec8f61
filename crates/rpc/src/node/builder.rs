//! Node construction and startup.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tether_transport::Connection;
use tokio::sync::watch;
use tracing::{debug, error, info, instrument, warn};

use crate::error::{CodecError, Error, Result};
use crate::extension::{BoundExtension, ExtensionContract, NodeExtensionFactory};
use crate::fault::{ErrorRegistry, RegisteredFault};
use crate::handshake::{self, ExtensionDescriptor, HandshakeOffer, Negotiated};
use crate::interceptor::{Interceptor, InterceptorRegistry};
use crate::node::core::{Dispatch, NodeCore};
use crate::node::transport::outgoing_chain;
use crate::node::{NodeConfig, NodeRole, NodeState, RpcNode, RpcTransport};
use crate::serialization::{FrameCodec, SerializationFormat};
use crate::service::{ServiceDescription, ServiceRegistry};

/// Collects everything a node needs, then connects or accepts.
pub struct NodeBuilder {
    config: NodeConfig,
    services: Vec<ServiceDescription>,
    interceptors: InterceptorRegistry,
    errors: ErrorRegistry,
    extensions: Vec<Arc<dyn NodeExtensionFactory>>,
}

impl NodeBuilder {
    /// Create a builder with default configuration.
    #[must_use]
    pub fn new() -> Self {
        Self {
            config: NodeConfig::default(),
            services: Vec::new(),
            interceptors: InterceptorRegistry::new(),
            errors: ErrorRegistry::new(),
            extensions: Vec::new(),
        }
    }

    /// Replace the whole configuration.
    #[must_use]
    pub fn with_config(mut self, config: NodeConfig) -> Self {
        self.config = config;
        self
    }

    /// Set the frame format proposed when connecting.
    #[must_use]
    pub const fn frame_format(mut self, format: SerializationFormat) -> Self {
        self.config.frame_format = format;
        self
    }

    /// Set the format payloads are encoded in.
    #[must_use]
    pub const fn payload_format(mut self, format: SerializationFormat) -> Self {
        self.config.payload_format = format;
        self
    }

    /// Set the protocol versions this node speaks.
    #[must_use]
    pub fn protocol_versions(mut self, versions: Vec<u32>) -> Self {
        self.config.protocol_versions = versions;
        self
    }

    /// Set the frame formats accepted from connecting peers.
    #[must_use]
    pub fn accepted_frame_formats(mut self, formats: Vec<SerializationFormat>) -> Self {
        self.config.accepted_frame_formats = formats;
        self
    }

    /// Set the handshake timeout.
    #[must_use]
    pub const fn handshake_timeout(mut self, timeout: Duration) -> Self {
        self.config.handshake_timeout = timeout;
        self
    }

    /// Set how many incoming calls are served at once. Opens beyond the
    /// limit are refused.
    #[must_use]
    pub const fn max_concurrent_calls(mut self, max: usize) -> Self {
        self.config.max_concurrent_calls = max;
        self
    }

    /// Set how long a stream producer waits for the next `Start`.
    #[must_use]
    pub const fn stream_start_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.config.stream_start_timeout = timeout;
        self
    }

    /// Serve a service.
    #[must_use]
    pub fn service(mut self, service: ServiceDescription) -> Self {
        self.services.push(service);
        self
    }

    /// Add an interceptor around incoming calls.
    #[must_use]
    pub fn incoming_interceptor(mut self, interceptor: Arc<dyn Interceptor>) -> Self {
        self.interceptors.add_incoming(interceptor);
        self
    }

    /// Add an interceptor around outgoing calls.
    #[must_use]
    pub fn outgoing_interceptor(mut self, interceptor: Arc<dyn Interceptor>) -> Self {
        self.interceptors.add_outgoing(interceptor);
        self
    }

    /// Make a fault decodable on every call of the node.
    #[must_use]
    pub fn register_error<F: RegisteredFault>(mut self) -> Self {
        self.errors.register::<F>();
        self
    }

    /// Bind an extension to the connection once negotiated.
    #[must_use]
    pub fn extension(mut self, factory: impl NodeExtensionFactory) -> Self {
        self.extensions.push(Arc::new(factory));
        self
    }

    /// Start a node on a connection this side opened.
    ///
    /// # Errors
    ///
    /// Fails if the configuration is invalid or the handshake fails. The
    /// connection is closed on failure.
    pub async fn connect<C: Connection>(self, connection: C) -> Result<RpcNode> {
        self.start(Arc::new(connection), NodeRole::Client).await
    }

    /// Start a node on a connection this side accepted.
    ///
    /// # Errors
    ///
    /// Fails if the configuration is invalid or the handshake fails. The
    /// connection is closed on failure.
    pub async fn accept<C: Connection>(self, connection: C) -> Result<RpcNode> {
        self.start(Arc::new(connection), NodeRole::Server).await
    }

    fn offer(&self) -> HandshakeOffer {
        HandshakeOffer {
            versions: self.config.protocol_versions.clone(),
            frame_format: self.config.frame_format,
            accepted_frame_formats: self.config.accepted_frame_formats.clone(),
            extensions: self
                .extensions
                .iter()
                .map(|factory| ExtensionDescriptor {
                    identifier: factory.identifier(),
                    required: factory.required_on_peer(),
                })
                .collect(),
        }
    }

    fn validate(&self) -> Result<ServiceRegistry> {
        for format in [self.config.frame_format, self.config.payload_format] {
            if !format.is_supported() {
                return Err(CodecError::UnsupportedFormat(format).into());
            }
        }

        let mut services = ServiceRegistry::new();
        for service in &self.services {
            services.register(service)?;
        }
        Ok(services)
    }

    async fn start(self, connection: Arc<dyn Connection>, role: NodeRole) -> Result<RpcNode> {
        let (state, _) = watch::channel(NodeState::Created);

        let services = match self.validate() {
            Ok(services) => services,
            Err(e) => {
                let _ = connection.close().await;
                return Err(e);
            }
        };

        state.send_replace(NodeState::Handshaking);
        debug!("Starting {role} handshake on {}", connection.describe());

        let offer = self.offer();
        let limit = self.config.handshake_timeout;
        let negotiated = match role {
            NodeRole::Client => {
                tokio::time::timeout(limit, handshake::initiate(&*connection, &offer)).await
            }
            NodeRole::Server => {
                tokio::time::timeout(limit, handshake::accept(&*connection, &offer)).await
            }
        }
        .map_err(|_| Error::Timeout(limit))
        .and_then(|result| result);

        let negotiated = match negotiated {
            Ok(negotiated) => negotiated,
            Err(e) => {
                warn!("Handshake as {role} failed: {e}");
                state.send_replace(NodeState::Closed);
                let _ = connection.close().await;
                return Err(e);
            }
        };

        let codec = match FrameCodec::with_max_frame_size(
            negotiated.frame_format,
            self.config.max_frame_size,
        ) {
            Ok(codec) => codec,
            Err(e) => {
                state.send_replace(NodeState::Closed);
                let _ = connection.close().await;
                return Err(e.into());
            }
        };

        let (outbound, queue) = flume::bounded(self.config.outbound_queue_capacity.max(1));
        let core = Arc::new(NodeCore::new(
            self.config.clone(),
            role,
            negotiated.clone(),
            Arc::clone(&connection),
            codec,
            state,
            outbound,
        ));

        // Spawned first so frames queued while extensions bind reach the wire.
        let writer = core.tasks.spawn(write_loop(Arc::clone(&core), queue));
        core.tasks.spawn(supervise(Arc::clone(&core), writer));

        let bound = match self.bind_extensions(&core, &negotiated) {
            Ok(bound) => bound,
            Err(e) => {
                error!("Failed to bind extensions: {e}");
                core.close("extension binding failed");
                return Err(e);
            }
        };

        let dispatch = match self.dispatch(&core, services, &bound) {
            Ok(dispatch) => dispatch,
            Err(e) => {
                error!("Failed to assemble services: {e}");
                core.close("service registration failed");
                return Err(e);
            }
        };

        core.activate(dispatch, bound.clone());
        core.tasks.spawn(read_loop(Arc::clone(&core)));
        for extension in bound {
            core.tasks.spawn(run_extension(Arc::clone(&core), extension));
        }

        info!(
            "Node active as {role} on {}: protocol {}, frames {}, payloads {}",
            core.connection.describe(),
            negotiated.version,
            negotiated.frame_format,
            core.serializer.format()
        );

        Ok(RpcNode::new(core))
    }

    fn bind_extensions(
        &self,
        core: &Arc<NodeCore>,
        negotiated: &Negotiated,
    ) -> Result<Vec<BoundExtension>> {
        self.extensions
            .iter()
            .map(|factory| {
                let contract = ExtensionContract::new(
                    RpcTransport::new(Arc::clone(core)),
                    core.role,
                    negotiated.version,
                    negotiated.frame_format,
                    core.serializer.format(),
                    negotiated.peer_extensions.clone(),
                );
                let bound = factory.bind(contract)?;
                debug!("Bound extension {}", bound.identifier());
                Ok(bound)
            })
            .collect()
    }

    fn dispatch(
        &self,
        core: &Arc<NodeCore>,
        mut services: ServiceRegistry,
        bound: &[BoundExtension],
    ) -> Result<Dispatch> {
        let mut errors = ErrorRegistry::with_builtin();
        let mut interceptors = InterceptorRegistry::new();

        for extension in bound.iter().map(BoundExtension::extension) {
            for service in extension.services() {
                services.register(&service)?;
            }
            for interceptor in extension.incoming_interceptors() {
                interceptors.add_incoming(interceptor);
            }
            for interceptor in extension.outgoing_interceptors() {
                interceptors.add_outgoing(interceptor);
            }
            extension.register_errors(&mut errors);
        }

        interceptors.extend(&self.interceptors);
        errors.extend(&self.errors);
        errors.extend(&services.declared_errors());

        Ok(Dispatch {
            services: services.intercepted(interceptors.incoming()),
            outgoing: outgoing_chain(&Arc::downgrade(core), &interceptors),
            errors,
        })
    }
}

impl Default for NodeBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for NodeBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NodeBuilder")
            .field("config", &self.config)
            .field("services", &self.services.len())
            .field("interceptors", &self.interceptors)
            .field("errors", &self.errors)
            .field("extensions", &self.extensions.len())
            .finish()
    }
}

#[instrument(skip_all, fields(role = %core.role))]
async fn write_loop(core: Arc<NodeCore>, queue: flume::Receiver<Bytes>) {
    loop {
        let message = tokio::select! {
            biased;
            message = queue.recv_async() => message,
            () = core.shutdown.cancelled() => break,
        };
        let Ok(message) = message else {
            break;
        };
        if let Err(e) = core.connection.send(message).await {
            warn!("Write failed: {e}");
            core.close("write failed");
            return;
        }
    }

    // Flush what was queued before the node closed, such as a final Cancel.
    let mut flushed = 0usize;
    while let Ok(message) = queue.try_recv() {
        if core.connection.send(message).await.is_err() {
            break;
        }
        flushed += 1;
    }
    debug!("Writer stopped after flushing {flushed} frames");
}

#[instrument(skip_all, fields(role = %core.role))]
async fn read_loop(core: Arc<NodeCore>) {
    loop {
        let message = tokio::select! {
            message = core.connection.recv() => message,
            () = core.shutdown.cancelled() => break,
        };

        let message = match message {
            Ok(message) => message,
            Err(e) => {
                debug!("Read loop ended: {e}");
                core.close("connection closed by peer");
                break;
            }
        };

        match core.codec.decode(&message) {
            Ok(frame) => core.dispatch_frame(frame),
            Err(e) => warn!("Dropping undecodable frame of {} bytes: {e}", message.len()),
        }
    }
    debug!("Reader stopped");
}

async fn run_extension(core: Arc<NodeCore>, extension: BoundExtension) {
    let identifier = extension.identifier().clone();
    let shutdown = core.shutdown.child_token();
    match extension.extension().run(shutdown).await {
        Ok(()) => debug!("Extension {identifier} stopped"),
        Err(e) => {
            error!("Extension {identifier} failed: {e}");
            core.close("extension failed");
        }
    }
}

/// Close the connection once the node shut down and the writer flushed.
async fn supervise(core: Arc<NodeCore>, writer: tokio::task::JoinHandle<()>) {
    core.shutdown.cancelled().await;
    let _ = writer.await;
    if let Err(e) = core.connection.close().await {
        debug!("Closing connection failed: {e}");
    }
    info!("Node closed");
}
