//! Typed, bidirectional RPC over one duplex connection.
//!
//! Both ends of a connection run an [`RpcNode`]. Each node serves the
//! services registered on its [`NodeBuilder`] and calls the peer's through
//! an [`RpcTransport`]. Calls come in four shapes:
//!
//! - **Single**: one request, one response.
//! - **ColdUpstream**: a request plus a caller stream, one response.
//! - **ColdDownstream**: a request, a callee stream.
//! - **ColdBistream**: a request plus streams both ways.
//!
//! Streams are pulled: the consumer sends a `Start` for every element it
//! wants and may `Close` early. Failures travel as faults resolved against
//! an [`ErrorRegistry`]; faults the receiver does not know arrive as
//! [`UnrecognizedRpcError`] with their status and message intact.
//!
//! ```ignore
//! let echo = SingleCallDescription::<String, String>::new("echo", "say");
//! let server = NodeBuilder::new()
//!     .service(ServiceDescription::new("echo").with_call(echo.calling(|s| async move { Ok(s) })))
//!     .accept(server_connection);
//! let client = NodeBuilder::new().connect(client_connection);
//! let (server, client) = tokio::try_join!(server, client)?;
//! let reply = client.transport().single_call(&echo, "hi".to_string()).await?;
//! ```
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

pub mod call;
pub mod error;
pub mod extension;
pub mod fault;
pub mod handshake;
pub mod interceptor;
pub mod node;
pub mod protocol;
pub(crate) mod runner;
pub mod serialization;
pub mod service;

pub use call::{
    BoxedFuture, CallContext, CallDescription, CallDirection, CallShape,
    ColdBistreamCallDescription, ColdDownstreamCallDescription, ColdUpstreamCallDescription,
    RpcStream, RunnableCallDescription, ServiceCallIdentifier, SingleCallDescription,
};
pub use error::{CodecError, Error, HandshakeError, ProtocolError, Result};
pub use extension::{
    BoundExtension, CallLogging, ExtensionContract, ExtensionIdentifier, NodeExtension,
    NodeExtensionFactory,
};
pub use fault::{
    ErrorRegistry, ErrorSerializer, Fault, FaultEnvelope, RegisteredFault, RpcError, StatusCode,
    UnrecognizedRpcError,
};
pub use interceptor::{Interceptor, InterceptorRegistry};
pub use node::{NodeBuilder, NodeConfig, NodeRole, NodeState, RpcNode, RpcTransport};
pub use serialization::{SerializationFormat, SerializedPayload};
pub use service::{RpcImplementationRegistry, ServiceDescription, ServiceRegistry};
