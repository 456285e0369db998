//! Server-plus-clients fixture over loopback UDP
//!
//! # Example
//!
//! ```no_run
//! use rudp_core::Role;
//! use rudp_integration_tests::fixtures::LoopbackFixture;
//!
//! # async fn demo() {
//! let fixture = LoopbackFixture::start(Role::Source).await;
//! fixture.store.insert("report.txt", "hello\n");
//!
//! let mut client = fixture.client().await;
//! let outcome = client.fetch("report.txt").await.unwrap();
//! assert_eq!(outcome.bytes(), b"hello\n");
//!
//! fixture.shutdown().await;
//! # }
//! ```

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use rudp_core::{Client, MemoryStore, ProtocolConfig, Role, Server, ServerHandle, SessionState};
use rudp_transport::{AsyncUdpTransport, DropPolicy, LossyTransport};

use super::RawPeer;

/// Timeouts short enough for tests, long enough for a loaded CI box.
pub fn fast_config(role: Role) -> ProtocolConfig {
    ProtocolConfig {
        role,
        ack_timeout: Duration::from_millis(150),
        handshake_timeout: Duration::from_millis(300),
        ..ProtocolConfig::default()
    }
}

fn loopback() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 0))
}

/// A running server with an in-memory store.
pub struct LoopbackFixture {
    /// Server task
    pub server: ServerHandle,
    /// Resources the server reads and writes
    pub store: Arc<MemoryStore>,
    /// Config shared by server and clients
    pub config: ProtocolConfig,
}

impl LoopbackFixture {
    /// Start a server in `role` with [`fast_config`].
    pub async fn start(role: Role) -> Self {
        Self::start_with(fast_config(role)).await
    }

    /// Start a server with `config`.
    pub async fn start_with(config: ProtocolConfig) -> Self {
        Self::start_lossy(config, DropPolicy::None).await
    }

    /// Start a server whose outgoing datagrams are dropped per `policy`.
    pub async fn start_lossy(config: ProtocolConfig, policy: DropPolicy) -> Self {
        let store = Arc::new(MemoryStore::new());
        let transport = AsyncUdpTransport::bind(loopback())
            .await
            .expect("Failed to bind server");
        let server = Server::new(LossyTransport::new(transport, policy), store.clone(), config.clone())
            .expect("Invalid config")
            .spawn()
            .expect("Failed to spawn server");

        Self {
            server,
            store,
            config,
        }
    }

    /// Server address.
    pub fn addr(&self) -> SocketAddr {
        self.server.local_addr()
    }

    /// A client using the fixture's config.
    pub async fn client(&self) -> Client<AsyncUdpTransport> {
        Client::connect(self.addr(), self.config.clone())
            .await
            .expect("Failed to bind client")
    }

    /// A client whose outgoing datagrams are dropped per `policy`.
    pub async fn lossy_client(&self, policy: DropPolicy) -> Client<LossyTransport<AsyncUdpTransport>> {
        let transport = AsyncUdpTransport::bind(loopback())
            .await
            .expect("Failed to bind client");
        Client::with_transport(LossyTransport::new(transport, policy), self.addr(), self.config.clone())
            .expect("Invalid config")
    }

    /// A hand-driven peer.
    pub async fn raw_peer(&self) -> RawPeer {
        RawPeer::connect(self.addr()).await
    }

    /// State of `peer`'s session, if it has one.
    pub async fn session_state(&self, peer: SocketAddr) -> Option<SessionState> {
        let handle = self.server.registry().get(&peer)?;
        let state = handle.lock().await.state();
        Some(state)
    }

    /// Wait until the registry is empty or `within` elapses.
    pub async fn wait_for_no_sessions(&self, within: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + within;
        while tokio::time::Instant::now() < deadline {
            if self.server.registry().is_empty() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        self.server.registry().is_empty()
    }

    /// Stop the server.
    pub async fn shutdown(self) {
        self.server.shutdown().await.expect("Server failed");
    }
}
