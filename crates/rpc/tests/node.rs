//! Node lifecycle: handshake, extensions, interceptors, shutdown.

mod common;

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use common::{TIMEOUT, connect, init_tracing};
use parking_lot::Mutex;
use tether_rpc::call::SingleHandler;
use tether_rpc::extension::CallLoggingExtension;
use tether_rpc::fault::{ConnectionClosedError, ProtocolViolationError, TooManyCallsError};
use tether_rpc::serialization::SerializedPayload;
use tether_rpc::{
    BoundExtension, CallContext, CallLogging, Error, ExtensionContract, ExtensionIdentifier,
    HandshakeError, Interceptor, NodeBuilder, NodeExtension, NodeExtensionFactory, NodeRole,
    NodeState, RpcError, SerializationFormat, ServiceDescription, SingleCallDescription,
};
use tether_transport_memory::MemoryConnection;
use tokio::time::timeout;

fn echo() -> SingleCallDescription<String, String> {
    SingleCallDescription::new("echo", "say")
}

fn echo_service() -> ServiceDescription {
    ServiceDescription::new("echo")
        .with_call(echo().calling(|message: String| async move { Ok(message) }))
}

async fn start_pair(
    client: NodeBuilder,
    server: NodeBuilder,
) -> (Result<tether_rpc::RpcNode, Error>, Result<tether_rpc::RpcNode, Error>) {
    init_tracing();
    let (client_end, server_end) = MemoryConnection::pair();
    timeout(TIMEOUT, async {
        tokio::join!(client.connect(client_end), server.accept(server_end))
    })
    .await
    .expect("Timeout during handshake")
}

// ============= Handshake =============

#[tokio::test]
async fn test_handshake_negotiates_highest_common_version() {
    let (client, server) = connect(
        NodeBuilder::new().protocol_versions(vec![1, 2, 3]),
        NodeBuilder::new().protocol_versions(vec![1, 2]),
    )
    .await;

    assert_eq!(client.protocol_version(), 2);
    assert_eq!(server.protocol_version(), 2);
    assert_eq!(client.role(), NodeRole::Client);
    assert_eq!(server.role(), NodeRole::Server);
    assert_eq!(client.state(), NodeState::Active);
}

#[tokio::test]
async fn test_handshake_fails_without_common_version() {
    let (client, server) = start_pair(
        NodeBuilder::new().protocol_versions(vec![1]),
        NodeBuilder::new().protocol_versions(vec![2]),
    )
    .await;

    assert!(matches!(
        server,
        Err(Error::Handshake(HandshakeError::NoCommonVersion { .. }))
    ));
    assert!(matches!(
        client,
        Err(Error::Handshake(HandshakeError::Rejected(_)))
    ));
}

#[tokio::test]
async fn test_handshake_uses_client_frame_format() {
    let (client, server) = connect(
        NodeBuilder::new()
            .frame_format(SerializationFormat::JSON)
            .payload_format(SerializationFormat::JSON),
        NodeBuilder::new().service(echo_service()),
    )
    .await;

    assert_eq!(client.frame_format(), SerializationFormat::JSON);
    assert_eq!(server.frame_format(), SerializationFormat::JSON);

    // Payload formats may differ per side; each decodes the other's.
    let reply = client
        .transport()
        .single_call(&echo(), "json".to_string())
        .await
        .expect("Call failed");
    assert_eq!(reply, "json");
}

#[tokio::test]
async fn test_handshake_rejects_unaccepted_frame_format() {
    let (client, server) = start_pair(
        NodeBuilder::new().frame_format(SerializationFormat::JSON),
        NodeBuilder::new().accepted_frame_formats(vec![SerializationFormat::CBOR]),
    )
    .await;

    assert!(matches!(
        server,
        Err(Error::Handshake(HandshakeError::UnsupportedFrameFormat(_)))
    ));
    assert!(client.is_err());
}

#[tokio::test]
async fn test_unsupported_payload_format_is_refused_locally() {
    let (client, _server) = start_pair(
        NodeBuilder::new().payload_format(SerializationFormat::PROTOBUF),
        NodeBuilder::new().handshake_timeout(std::time::Duration::from_millis(200)),
    )
    .await;

    assert!(matches!(client, Err(Error::Codec(_))));
}

// ============= Extensions =============

struct Marker {
    required: bool,
    bound: Arc<AtomicUsize>,
}

struct MarkerExtension {
    peer_has_marker: bool,
}

#[async_trait]
impl NodeExtension for MarkerExtension {
    fn services(&self) -> Vec<ServiceDescription> {
        let answer = self.peer_has_marker;
        let call = SingleCallDescription::<(), bool>::new("marker", "peer");
        vec![
            ServiceDescription::new("marker")
                .with_call(call.calling(move |()| async move { Ok(answer) })),
        ]
    }
}

impl NodeExtensionFactory for Marker {
    fn identifier(&self) -> ExtensionIdentifier {
        ExtensionIdentifier::new("test.marker")
    }

    fn required_on_peer(&self) -> bool {
        self.required
    }

    fn bind(&self, contract: ExtensionContract) -> tether_rpc::Result<BoundExtension> {
        self.bound.fetch_add(1, Ordering::SeqCst);
        let extension = MarkerExtension {
            peer_has_marker: contract.peer_has(&self.identifier()),
        };
        Ok(BoundExtension::new(self.identifier(), Arc::new(extension)))
    }
}

#[tokio::test]
async fn test_required_extension_missing_on_peer() {
    let bound = Arc::new(AtomicUsize::new(0));
    let (client, server) = start_pair(
        NodeBuilder::new().extension(Marker {
            required: true,
            bound: Arc::clone(&bound),
        }),
        NodeBuilder::new(),
    )
    .await;

    assert!(matches!(
        server,
        Err(Error::Handshake(HandshakeError::MissingExtensions(ref missing)))
            if missing == &[ExtensionIdentifier::new("test.marker")]
    ));
    assert!(matches!(
        client,
        Err(Error::Handshake(HandshakeError::Rejected(_)))
    ));
    assert_eq!(bound.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_server_required_extension_checked_by_client() {
    let (client, server) = start_pair(
        NodeBuilder::new(),
        NodeBuilder::new().extension(Marker {
            required: true,
            bound: Arc::new(AtomicUsize::new(0)),
        }),
    )
    .await;

    assert!(matches!(
        client,
        Err(Error::Handshake(HandshakeError::MissingExtensions(_)))
    ));
    assert!(matches!(
        server,
        Err(Error::Handshake(HandshakeError::Rejected(_)))
    ));
}

#[tokio::test]
async fn test_extension_contributes_services_and_sees_peer() {
    let bound = Arc::new(AtomicUsize::new(0));
    let (client, server) = connect(
        NodeBuilder::new().extension(CallLogging),
        NodeBuilder::new().extension(Marker {
            required: false,
            bound: Arc::clone(&bound),
        }),
    )
    .await;

    assert_eq!(bound.load(Ordering::SeqCst), 1);
    assert!(client.extension::<CallLoggingExtension>().is_some());
    assert!(client.extension::<MarkerExtension>().is_none());
    assert!(server.extension::<MarkerExtension>().is_some());
    assert_eq!(
        client.peer_extensions(),
        &[ExtensionIdentifier::new("test.marker")]
    );

    let call = SingleCallDescription::<(), bool>::new("marker", "peer");
    let peer_has_marker = client
        .transport()
        .single_call(&call, ())
        .await
        .expect("Call failed");
    assert!(!peer_has_marker);
}

// ============= Interceptors =============

/// Records calls and refuses anything on the `admin` service.
struct Gatekeeper {
    seen: Mutex<Vec<String>>,
}

#[async_trait]
impl Interceptor for Gatekeeper {
    async fn intercept_single(
        &self,
        context: CallContext,
        request: SerializedPayload,
        next: SingleHandler,
    ) -> Result<SerializedPayload, RpcError> {
        self.seen.lock().push(context.service_call().to_string());
        if context.service_call().service_id == "admin" {
            return Err(RpcError::protocol_violation("admin calls are not allowed"));
        }
        next(context, request).await
    }
}

/// Appends a suffix to every response.
struct Suffix(&'static str);

#[async_trait]
impl Interceptor for Suffix {
    async fn intercept_single(
        &self,
        context: CallContext,
        request: SerializedPayload,
        next: SingleHandler,
    ) -> Result<SerializedPayload, RpcError> {
        let response = next(context.clone(), request).await?;
        let text: String = context.decode(&response)?;
        context.encode(&format!("{text}{}", self.0))
    }
}

#[tokio::test]
async fn test_incoming_interceptor_guards_calls() {
    let gatekeeper = Arc::new(Gatekeeper {
        seen: Mutex::new(Vec::new()),
    });
    let admin = SingleCallDescription::<String, String>::new("admin", "say");
    let server = NodeBuilder::new()
        .service(echo_service())
        .service(
            ServiceDescription::new("admin")
                .with_call(admin.calling(|message: String| async move { Ok(message) })),
        )
        .incoming_interceptor(gatekeeper.clone());
    let (client, _server) = connect(NodeBuilder::new(), server).await;

    let reply = client
        .transport()
        .single_call(&echo(), "hi".to_string())
        .await
        .expect("Call failed");
    assert_eq!(reply, "hi");

    let error = client
        .transport()
        .single_call(&admin, "hi".to_string())
        .await
        .expect_err("Call should be refused");
    assert!(error.is::<ProtocolViolationError>());

    assert_eq!(*gatekeeper.seen.lock(), vec!["echo/say", "admin/say"]);
}

#[tokio::test]
async fn test_interceptors_compose_in_order() {
    let (client, _server) = connect(
        NodeBuilder::new()
            .outgoing_interceptor(Arc::new(Suffix("-a")))
            .outgoing_interceptor(Arc::new(Suffix("-b"))),
        NodeBuilder::new()
            .service(echo_service())
            .incoming_interceptor(Arc::new(Suffix("-x")))
            .incoming_interceptor(Arc::new(Suffix("-y"))),
    )
    .await;

    let reply = client
        .transport()
        .single_call(&echo(), "m".to_string())
        .await
        .expect("Call failed");

    // The innermost interceptor sees the response first.
    assert_eq!(reply, "m-y-x-b-a");
}

// ============= Concurrency =============

#[tokio::test]
async fn test_calls_beyond_limit_are_refused() {
    let started = Arc::new(tokio::sync::Notify::new());
    let release = Arc::new(tokio::sync::Notify::new());
    let hold = || SingleCallDescription::<(), ()>::new("gate", "hold");
    let service = {
        let (started, release) = (Arc::clone(&started), Arc::clone(&release));
        ServiceDescription::new("gate").with_call(hold().calling(move |()| {
            let (started, release) = (Arc::clone(&started), Arc::clone(&release));
            async move {
                started.notify_one();
                release.notified().await;
                Ok(())
            }
        }))
    };
    let (client, server) = connect(
        NodeBuilder::new(),
        NodeBuilder::new()
            .max_concurrent_calls(1)
            .service(service)
            .service(echo_service()),
    )
    .await;

    let held = {
        let transport = client.transport();
        tokio::spawn(async move { transport.single_call(&hold(), ()).await })
    };
    timeout(TIMEOUT, started.notified())
        .await
        .expect("First call never started");

    let error = client
        .transport()
        .single_call(&echo(), "second".to_string())
        .await
        .expect_err("Second call should be refused");
    let refused = error
        .downcast_ref::<TooManyCallsError>()
        .expect("Expected TooManyCallsError");
    assert_eq!(refused.limit, 1);
    assert_eq!(server.state(), NodeState::Active);

    release.notify_one();
    timeout(TIMEOUT, held)
        .await
        .expect("Held call timed out")
        .expect("Held call panicked")
        .expect("Held call failed");

    // The slot frees up once the first call's task ends.
    let reply = timeout(TIMEOUT, async {
        loop {
            match client
                .transport()
                .single_call(&echo(), "third".to_string())
                .await
            {
                Ok(reply) => break reply,
                Err(error) if error.is::<TooManyCallsError>() => {
                    tokio::time::sleep(std::time::Duration::from_millis(5)).await;
                }
                Err(error) => panic!("Unexpected error: {error}"),
            }
        }
    })
    .await
    .expect("Slot was never released");
    assert_eq!(reply, "third");
}

// ============= Lifecycle =============

#[tokio::test]
async fn test_shutdown_closes_both_nodes() {
    let (client, server) =
        connect(NodeBuilder::new(), NodeBuilder::new().service(echo_service())).await;
    let transport = client.transport();

    timeout(TIMEOUT, client.shutdown())
        .await
        .expect("Timeout during shutdown");
    assert_eq!(client.state(), NodeState::Closed);

    timeout(TIMEOUT, server.closed())
        .await
        .expect("Server did not notice the close");
    assert_eq!(server.state(), NodeState::Closed);

    let error = transport
        .single_call(&echo(), "late".to_string())
        .await
        .expect_err("Call after shutdown should fail");
    assert!(error.is::<ConnectionClosedError>());
}

#[tokio::test]
async fn test_pending_call_fails_when_peer_goes_away() {
    let hang = SingleCallDescription::<(), ()>::new("slow", "hang");
    let service = ServiceDescription::new("slow")
        .with_call(hang.calling(|()| futures::future::pending::<Result<(), RpcError>>()));
    let (client, server) = connect(NodeBuilder::new(), NodeBuilder::new().service(service)).await;

    let transport = client.transport();
    let pending = tokio::spawn(async move { transport.single_call(&hang, ()).await });
    tokio::time::sleep(std::time::Duration::from_millis(100)).await;
    drop(server);

    let error = timeout(TIMEOUT, pending)
        .await
        .expect("Pending call never resolved")
        .expect("Task panicked")
        .expect_err("Call should fail");
    assert!(error.is::<ConnectionClosedError>());
}

#[tokio::test]
async fn test_dropping_node_closes_connection() {
    init_tracing();
    let (client_end, server_end) = MemoryConnection::pair();
    let (client, server) = tokio::join!(
        NodeBuilder::new().connect(client_end),
        NodeBuilder::new().accept(server_end)
    );
    let client = client.expect("Client failed to start");
    let server = server.expect("Server failed to start");

    let mut state = server.watch_state();
    drop(client);

    timeout(TIMEOUT, state.wait_for(|s| *s == NodeState::Closed))
        .await
        .expect("Server did not close")
        .expect("State channel closed");
}
