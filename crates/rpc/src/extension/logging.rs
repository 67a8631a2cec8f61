//! Call logging extension.
//!
//! Opens a span per call in both directions and logs how each call ended.
//! For streaming calls the logged outcome is that of the call itself; the
//! stream's own elements are not traced.

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use tracing::{Instrument, Level, debug, span, warn};

use crate::call::{
    BistreamHandler, CallContext, CallDirection, DownstreamHandler, PayloadStream, SingleHandler,
    UpstreamHandler,
};
use crate::error::Result;
use crate::extension::{BoundExtension, ExtensionContract, ExtensionIdentifier};
use crate::extension::{NodeExtension, NodeExtensionFactory};
use crate::fault::RpcError;
use crate::interceptor::Interceptor;
use crate::serialization::SerializedPayload;

/// Identifier advertised by [`CallLogging`].
pub const CALL_LOGGING_EXTENSION: &str = "tether.call-logging";

/// Factory for [`CallLoggingExtension`].
#[derive(Debug, Clone, Copy, Default)]
pub struct CallLogging;

impl NodeExtensionFactory for CallLogging {
    fn identifier(&self) -> ExtensionIdentifier {
        ExtensionIdentifier::new(CALL_LOGGING_EXTENSION)
    }

    fn bind(&self, contract: ExtensionContract) -> Result<BoundExtension> {
        debug!("Binding call logging as {}", contract.role());
        Ok(BoundExtension::new(
            self.identifier(),
            Arc::new(CallLoggingExtension {
                incoming: Arc::new(CallLoggingInterceptor),
                outgoing: Arc::new(CallLoggingInterceptor),
            }),
        ))
    }
}

/// Logs every call this node makes or serves.
pub struct CallLoggingExtension {
    incoming: Arc<CallLoggingInterceptor>,
    outgoing: Arc<CallLoggingInterceptor>,
}

#[async_trait]
impl NodeExtension for CallLoggingExtension {
    fn incoming_interceptors(&self) -> Vec<Arc<dyn Interceptor>> {
        vec![Arc::clone(&self.incoming) as Arc<dyn Interceptor>]
    }

    fn outgoing_interceptors(&self) -> Vec<Arc<dyn Interceptor>> {
        vec![Arc::clone(&self.outgoing) as Arc<dyn Interceptor>]
    }
}

struct CallLoggingInterceptor;

impl CallLoggingInterceptor {
    fn span(context: &CallContext) -> tracing::Span {
        let direction = match context.direction() {
            CallDirection::Incoming => "incoming",
            CallDirection::Outgoing => "outgoing",
        };
        span!(
            Level::DEBUG,
            "rpc_call",
            call = %context.service_call(),
            shape = context.shape().name(),
            direction,
        )
    }

    fn finished<T>(started: Instant, result: &std::result::Result<T, RpcError>) {
        let elapsed = started.elapsed();
        match result {
            Ok(_) => debug!("Call finished in {elapsed:?}"),
            Err(error) => warn!("Call failed in {elapsed:?}: {error}"),
        }
    }
}

#[async_trait]
impl Interceptor for CallLoggingInterceptor {
    async fn intercept_single(
        &self,
        context: CallContext,
        request: SerializedPayload,
        next: SingleHandler,
    ) -> std::result::Result<SerializedPayload, RpcError> {
        let span = Self::span(&context);
        async move {
            debug!("Call started");
            let started = Instant::now();
            let result = next(context, request).await;
            Self::finished(started, &result);
            result
        }
        .instrument(span)
        .await
    }

    async fn intercept_upstream(
        &self,
        context: CallContext,
        request: SerializedPayload,
        upstream: PayloadStream,
        next: UpstreamHandler,
    ) -> std::result::Result<SerializedPayload, RpcError> {
        let span = Self::span(&context);
        async move {
            debug!("Call started");
            let started = Instant::now();
            let result = next(context, request, upstream).await;
            Self::finished(started, &result);
            result
        }
        .instrument(span)
        .await
    }

    async fn intercept_downstream(
        &self,
        context: CallContext,
        request: SerializedPayload,
        next: DownstreamHandler,
    ) -> std::result::Result<PayloadStream, RpcError> {
        let span = Self::span(&context);
        async move {
            debug!("Call started");
            let started = Instant::now();
            let result = next(context, request).await;
            Self::finished(started, &result);
            result
        }
        .instrument(span)
        .await
    }

    async fn intercept_bistream(
        &self,
        context: CallContext,
        request: SerializedPayload,
        upstream: PayloadStream,
        next: BistreamHandler,
    ) -> std::result::Result<PayloadStream, RpcError> {
        let span = Self::span(&context);
        async move {
            debug!("Call started");
            let started = Instant::now();
            let result = next(context, request, upstream).await;
            Self::finished(started, &result);
            result
        }
        .instrument(span)
        .await
    }
}
