//! Node extension wiring a [`Session`] into a connection.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use tether_rpc::call::{
    BistreamHandler, DownstreamHandler, PayloadStream, SingleHandler, UpstreamHandler,
};
use tether_rpc::{
    BoundExtension, CallContext, ExtensionContract, ExtensionIdentifier, Interceptor,
    NodeExtension, NodeExtensionFactory, RpcError, SerializedPayload, ServiceDescription,
};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::config::SessionConfig;
use crate::mutator::OutgoingContextUpdate;
use crate::plugin::SessionPlugin;
use crate::session::{SESSION_SERVICE, Session, update_call};

/// Identifier the session extension advertises.
pub const SESSION_EXTENSION: &str = "tether.session";

/// Adds a synchronized [`Session`] to every connection.
///
/// The peer must install it too; the handshake fails otherwise.
#[derive(Clone, Default)]
pub struct SessionSync {
    config: SessionConfig,
    plugins: Vec<Arc<dyn SessionPlugin>>,
}

impl SessionSync {
    /// Default configuration, no plugins.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the configuration.
    #[must_use]
    pub fn with_config(mut self, config: SessionConfig) -> Self {
        self.config = config;
        self
    }

    /// Register a plugin on every session.
    #[must_use]
    pub fn plugin(mut self, plugin: impl SessionPlugin) -> Self {
        self.plugins.push(Arc::new(plugin));
        self
    }
}

impl fmt::Debug for SessionSync {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionSync")
            .field("config", &self.config)
            .field("plugins", &self.plugins.len())
            .finish()
    }
}

impl NodeExtensionFactory for SessionSync {
    fn identifier(&self) -> ExtensionIdentifier {
        ExtensionIdentifier::new(SESSION_EXTENSION)
    }

    fn required_on_peer(&self) -> bool {
        true
    }

    fn bind(&self, contract: ExtensionContract) -> tether_rpc::Result<BoundExtension> {
        let session = Session::new(
            contract.role(),
            contract.payload_format(),
            self.config.clone(),
            self.plugins.clone(),
            Some(contract.transport().clone()),
        );
        debug!("Session bound as {}", contract.role());
        Ok(BoundExtension::new(
            self.identifier(),
            Arc::new(SessionExtension::new(session)),
        ))
    }
}

/// The session extension bound to one connection.
///
/// Reach it through `RpcNode::extension::<SessionExtension>()`.
pub struct SessionExtension {
    session: Session,
    binding: Arc<SessionBinding>,
    ordering: Arc<SessionOrdering>,
}

impl SessionExtension {
    fn new(session: Session) -> Self {
        Self {
            binding: Arc::new(SessionBinding {
                session: session.clone(),
            }),
            ordering: Arc::new(SessionOrdering {
                session: session.clone(),
            }),
            session,
        }
    }

    /// The connection's session.
    #[must_use]
    pub const fn session(&self) -> &Session {
        &self.session
    }
}

impl fmt::Debug for SessionExtension {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionExtension")
            .field("session", &self.session)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl NodeExtension for SessionExtension {
    fn services(&self) -> Vec<ServiceDescription> {
        let session = self.session.clone();
        let update = update_call().calling(move |update: OutgoingContextUpdate| {
            let session = session.clone();
            async move { Ok(session.apply_remote(&update)) }
        });
        vec![ServiceDescription::new(SESSION_SERVICE).with_call(update)]
    }

    fn incoming_interceptors(&self) -> Vec<Arc<dyn Interceptor>> {
        vec![Arc::clone(&self.binding) as Arc<dyn Interceptor>]
    }

    fn outgoing_interceptors(&self) -> Vec<Arc<dyn Interceptor>> {
        vec![Arc::clone(&self.ordering) as Arc<dyn Interceptor>]
    }

    async fn run(&self, shutdown: CancellationToken) -> tether_rpc::Result<()> {
        shutdown.cancelled().await;
        self.session.clear();
        Ok(())
    }
}

/// Makes the session reachable through [`Session::current`] in handlers.
struct SessionBinding {
    session: Session,
}

#[async_trait]
impl Interceptor for SessionBinding {
    async fn intercept_single(
        &self,
        context: CallContext,
        request: SerializedPayload,
        next: SingleHandler,
    ) -> Result<SerializedPayload, RpcError> {
        self.session.scope(next(context, request)).await
    }

    async fn intercept_upstream(
        &self,
        context: CallContext,
        request: SerializedPayload,
        upstream: PayloadStream,
        next: UpstreamHandler,
    ) -> Result<SerializedPayload, RpcError> {
        self.session.scope(next(context, request, upstream)).await
    }

    async fn intercept_downstream(
        &self,
        context: CallContext,
        request: SerializedPayload,
        next: DownstreamHandler,
    ) -> Result<PayloadStream, RpcError> {
        self.session.scope(next(context, request)).await
    }

    async fn intercept_bistream(
        &self,
        context: CallContext,
        request: SerializedPayload,
        upstream: PayloadStream,
        next: BistreamHandler,
    ) -> Result<PayloadStream, RpcError> {
        self.session.scope(next(context, request, upstream)).await
    }
}

/// Holds outgoing application calls back while a context update is in
/// flight, so the peer sees the update first.
struct SessionOrdering {
    session: Session,
}

impl SessionOrdering {
    async fn ready(&self, context: &CallContext) {
        if context.service_call().service_id != SESSION_SERVICE {
            self.session.settled().await;
        }
    }
}

#[async_trait]
impl Interceptor for SessionOrdering {
    async fn intercept_single(
        &self,
        context: CallContext,
        request: SerializedPayload,
        next: SingleHandler,
    ) -> Result<SerializedPayload, RpcError> {
        self.ready(&context).await;
        next(context, request).await
    }

    async fn intercept_upstream(
        &self,
        context: CallContext,
        request: SerializedPayload,
        upstream: PayloadStream,
        next: UpstreamHandler,
    ) -> Result<SerializedPayload, RpcError> {
        self.ready(&context).await;
        next(context, request, upstream).await
    }

    async fn intercept_downstream(
        &self,
        context: CallContext,
        request: SerializedPayload,
        next: DownstreamHandler,
    ) -> Result<PayloadStream, RpcError> {
        self.ready(&context).await;
        next(context, request).await
    }

    async fn intercept_bistream(
        &self,
        context: CallContext,
        request: SerializedPayload,
        upstream: PayloadStream,
        next: BistreamHandler,
    ) -> Result<PayloadStream, RpcError> {
        self.ready(&context).await;
        next(context, request, upstream).await
    }
}
