#![allow(dead_code)] // each test binary uses a different slice of the harness
//! Shared harness for relay integration tests.
//!
//! Spins up real servers on ephemeral ports with an in-memory durable
//! store, a fixed owner registry, and a shared cache+bus handle so that
//! several nodes form a cluster.

use std::net::SocketAddr;
use std::sync::Arc;

use serde_json::{json, Value};
use weft_sdk::client::RelayClient;
use weft_sdk::did::KeyPair;
use weft_sdk::token::{Capability, CapabilityToken};
use weft_server::bus::MemoryBus;
use weft_server::config::ServerConfig;
use weft_server::registry::{OwnerRegistry, StaticRegistry};
use weft_server::server::Server;

pub const CONTRACT: &str = "0xAA";
pub const OWNER_ADDRESS: &str = "0xBB";
pub const DOCUMENT: &str = "d1";

pub struct Harness {
    pub server: KeyPair,
    pub owner: KeyPair,
    pub session: KeyPair,
    pub registry: Arc<dyn OwnerRegistry>,
    /// Shared transport: every node started from this harness gets its
    /// cache and bus handles from the same `MemoryBus`.
    pub transport: Arc<MemoryBus>,
}

impl Harness {
    pub fn new() -> Self {
        let server = KeyPair::generate();
        let owner = KeyPair::generate();
        let session = KeyPair::generate();
        let registry: Arc<dyn OwnerRegistry> = Arc::new(StaticRegistry::new([(
            (CONTRACT.to_lowercase(), OWNER_ADDRESS.to_lowercase()),
            owner.did.clone(),
        )]));
        Self {
            server,
            owner,
            session,
            registry,
            transport: MemoryBus::new(),
        }
    }

    /// Start one relay node of the cluster.
    pub async fn start_node(&self) -> SocketAddr {
        let config = ServerConfig::for_tests(&self.server.did);
        let (addr, _handle) = Server::new(config)
            .with_registry(Arc::clone(&self.registry))
            .with_cache_bus(self.transport.clone(), self.transport.clone())
            .start()
            .await
            .expect("server start");
        addr
    }

    pub async fn connect(&self, addr: SocketAddr) -> RelayClient {
        let client = RelayClient::connect(&format!("ws://{addr}/"))
            .await
            .expect("client connect");
        assert_eq!(client.server_did, self.server.did);
        client
    }

    pub fn owner_token(&self) -> String {
        CapabilityToken::issue(
            &self.owner,
            &self.server.did,
            Capability::new("storage", &CONTRACT.to_lowercase(), "collaboration.CREATE"),
            None,
        )
        .encode()
    }

    pub fn collab_token(&self) -> String {
        CapabilityToken::issue(
            &self.session,
            &self.server.did,
            Capability::new("storage", "collaboration", "collaboration.COLLABORATE"),
            None,
        )
        .encode()
    }

    pub fn owner_auth_args(&self, room_info: Option<Value>) -> Value {
        let mut args = json!({
            "documentId": DOCUMENT,
            "sessionDid": self.session.did,
            "ownerToken": self.owner_token(),
            "contractAddress": CONTRACT,
            "ownerAddress": OWNER_ADDRESS,
        });
        if let Some(info) = room_info {
            args["roomInfo"] = info;
        }
        args
    }

    pub fn editor_auth_args(&self) -> Value {
        json!({
            "documentId": DOCUMENT,
            "sessionDid": self.session.did,
            "collaborationToken": self.collab_token(),
        })
    }
}

/// Await the next event of the given type, skipping unrelated ones, with a
/// deadline so a missing broadcast fails the test instead of hanging it.
pub async fn expect_event(
    client: &mut RelayClient,
    event_type: &str,
) -> weft_sdk::protocol::EventEnvelope {
    tokio::time::timeout(std::time::Duration::from_secs(5), async {
        loop {
            let event = client.next_event().await.expect("event stream");
            if event.event_type == event_type {
                return event;
            }
        }
    })
    .await
    .unwrap_or_else(|_| panic!("timed out waiting for {event_type}"))
}
