//! Faults across the wire, and serialization laws.

mod common;

use common::{InsufficientFunds, connect};
use proptest::prelude::*;
use serde::{Deserialize, Serialize};
use tether_rpc::fault::NotFoundError;
use tether_rpc::{
    ErrorRegistry, NodeBuilder, RpcError, SerializationFormat, ServiceCallIdentifier,
    ServiceDescription, SingleCallDescription, StatusCode, UnrecognizedRpcError,
};

fn withdraw() -> SingleCallDescription<u64, u64> {
    SingleCallDescription::new("bank", "withdraw")
}

fn bank() -> ServiceDescription {
    ServiceDescription::new("bank").with_call(withdraw().declaring::<InsufficientFunds>().calling(
        |amount: u64| async move {
            Err::<u64, _>(RpcError::new(InsufficientFunds {
                balance: 5,
                required: amount,
            }))
        },
    ))
}

// ============= Faults across nodes =============

#[tokio::test]
async fn test_declared_error_round_trips_with_fields() {
    let (client, _server) = connect(NodeBuilder::new(), NodeBuilder::new().service(bank())).await;

    let error = client
        .transport()
        .single_call(&withdraw().declaring::<InsufficientFunds>(), 42)
        .await
        .expect_err("Withdraw should fail");

    assert_eq!(
        error.downcast_ref::<InsufficientFunds>(),
        Some(&InsufficientFunds {
            balance: 5,
            required: 42
        })
    );
    assert_eq!(error.status_code(), StatusCode::CONFLICT);
}

#[tokio::test]
async fn test_node_registered_error_is_recognized() {
    let (client, _server) = connect(
        NodeBuilder::new().register_error::<InsufficientFunds>(),
        NodeBuilder::new().service(bank()),
    )
    .await;

    let error = client
        .transport()
        .single_call(&withdraw(), 7)
        .await
        .expect_err("Withdraw should fail");

    assert!(error.is::<InsufficientFunds>());
}

#[tokio::test]
async fn test_unregistered_error_becomes_unrecognized() {
    let (client, _server) = connect(NodeBuilder::new(), NodeBuilder::new().service(bank())).await;

    let error = client
        .transport()
        .single_call(&withdraw(), 42)
        .await
        .expect_err("Withdraw should fail");

    let unrecognized = error
        .downcast_ref::<UnrecognizedRpcError>()
        .expect("Should be unrecognized");
    assert_eq!(unrecognized.discriminator, "bank.InsufficientFunds");
    assert_eq!(unrecognized.status_code, StatusCode::CONFLICT);
    assert_eq!(unrecognized.debug_message, "balance 5 is below 42");
    assert_eq!(error.discriminator(), "bank.InsufficientFunds");

    // A relay that knows the type recovers it from the preserved body.
    let relayed = ErrorRegistry::new()
        .with::<InsufficientFunds>()
        .decode(error.to_envelope(SerializationFormat::CBOR));
    assert_eq!(relayed.downcast_ref::<InsufficientFunds>().map(|f| f.required), Some(42));
}

// ============= Serialization laws =============

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Order {
    id: u64,
    customer: String,
    lines: Vec<(String, u32)>,
    note: Option<String>,
    paid: bool,
}

fn order() -> impl Strategy<Value = Order> {
    (
        any::<u64>(),
        ".{0,24}",
        prop::collection::vec((".{0,12}", any::<u32>()), 0..6),
        prop::option::of(".{0,24}"),
        any::<bool>(),
    )
        .prop_map(|(id, customer, lines, note, paid)| Order {
            id,
            customer,
            lines,
            note,
            paid,
        })
}

fn formats() -> impl Strategy<Value = SerializationFormat> {
    prop_oneof![Just(SerializationFormat::CBOR), Just(SerializationFormat::JSON)]
}

proptest! {
    #[test]
    fn payloads_survive_every_builtin_format(order in order(), format in formats()) {
        let payload = format.encode(&order).unwrap();
        prop_assert_eq!(payload.format(), format);

        let decoded: Order = SerializationFormat::decode(&payload).unwrap();
        prop_assert_eq!(decoded, order);
    }

    #[test]
    fn registered_faults_survive_every_builtin_format(
        balance in any::<u64>(),
        required in any::<u64>(),
        format in formats(),
    ) {
        let registry = ErrorRegistry::with_builtin().with::<InsufficientFunds>();
        let original = InsufficientFunds { balance, required };

        let decoded = registry.decode(RpcError::new(original.clone()).to_envelope(format));

        prop_assert_eq!(decoded.downcast_ref::<InsufficientFunds>(), Some(&original));
        prop_assert_eq!(decoded.status_code(), StatusCode::CONFLICT);
    }

    #[test]
    fn builtin_faults_survive_every_builtin_format(
        service_id in "[a-z]{1,8}",
        call_id in "[a-z]{1,8}",
        format in formats(),
    ) {
        let identifier = ServiceCallIdentifier::new(service_id, call_id);
        let decoded = ErrorRegistry::with_builtin()
            .decode(RpcError::not_found(identifier.clone()).to_envelope(format));

        let not_found = decoded.downcast_ref::<NotFoundError>();
        prop_assert_eq!(not_found.map(|f| &f.service_call), Some(&identifier));
    }

    #[test]
    fn unknown_faults_keep_status_and_message(
        status in 400u16..600,
        message in ".{0,32}",
        format in formats(),
    ) {
        let envelope = tether_rpc::FaultEnvelope {
            discriminator: "elsewhere.Unknown".to_string(),
            status_code: StatusCode::new(status),
            debug_message: message.clone(),
            body: None,
        };

        let decoded = ErrorRegistry::with_builtin().decode(envelope);
        prop_assert!(decoded.is::<UnrecognizedRpcError>());
        prop_assert_eq!(decoded.status_code().as_u16(), status);
        prop_assert_eq!(decoded.debug_message(), message);
        prop_assert_eq!(decoded.to_envelope(format).discriminator, "elsewhere.Unknown");
    }
}
