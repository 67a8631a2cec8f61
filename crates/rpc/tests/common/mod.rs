//! Shared harness: two nodes joined by an in-memory connection.

#![allow(dead_code)]

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tether_rpc::{Fault, NodeBuilder, RegisteredFault, RpcNode, StatusCode};
use tether_transport_memory::MemoryConnection;
use thiserror::Error;

pub const TIMEOUT: Duration = Duration::from_secs(5);

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Run both handshakes concurrently and return `(client, server)`.
pub async fn connect(client: NodeBuilder, server: NodeBuilder) -> (RpcNode, RpcNode) {
    init_tracing();
    let (client_end, server_end) = MemoryConnection::pair();

    let (client, server) = tokio::time::timeout(TIMEOUT, async {
        tokio::join!(client.connect(client_end), server.accept(server_end))
    })
    .await
    .expect("Timeout during handshake");

    (
        client.expect("Client failed to start"),
        server.expect("Server failed to start"),
    )
}

/// A fault both test nodes declare.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error("balance {balance} is below {required}")]
pub struct InsufficientFunds {
    pub balance: u64,
    pub required: u64,
}

impl Fault for InsufficientFunds {
    fn status_code(&self) -> StatusCode {
        StatusCode::CONFLICT
    }
}

impl RegisteredFault for InsufficientFunds {
    const DISCRIMINATOR: &'static str = "bank.InsufficientFunds";
}
