//! End-to-end transfers between a real client and server over loopback.

use std::time::Duration;

use rudp_core::{ProtocolConfig, ProtocolError, ResourceStore, Role, SessionState, split_units};
use rudp_integration_tests::fixtures::{LoopbackFixture, fast_config};
use rudp_transport::DropPolicy;

const POEM: &str = "Whose woods these are I think I know.\n\
His house is in the village though;\n\
\n\
He will not see me stopping here\n\
To watch his woods fill up with snow.\n";

// ============================================================================
// Plaintext
// ============================================================================

#[tokio::test]
async fn test_fetch_plaintext() {
    let fixture = LoopbackFixture::start(Role::Source).await;
    fixture.store.insert("poem.txt", POEM);

    let mut client = fixture.client().await;
    let outcome = client.fetch("poem.txt").await.unwrap();

    assert_eq!(outcome.bytes(), POEM.as_bytes());
    assert_eq!(outcome.units.len(), 5);
    assert_eq!(outcome.decrypt_failures(), 0);
    assert!(fixture.wait_for_no_sessions(Duration::from_secs(1)).await);
    fixture.shutdown().await;
}

#[tokio::test]
async fn test_fetch_empty_resource() {
    let fixture = LoopbackFixture::start(Role::Source).await;
    fixture.store.insert("empty.txt", "");

    let mut client = fixture.client().await;
    let outcome = client.fetch("empty.txt").await.unwrap();

    assert!(outcome.units.is_empty());
    fixture.shutdown().await;
}

#[tokio::test]
async fn test_push_plaintext() {
    let fixture = LoopbackFixture::start(Role::Sink).await;

    let mut client = fixture.client().await;
    let report = client
        .push("poem.txt", &split_units(POEM.as_bytes()))
        .await
        .unwrap();

    assert_eq!(report.units, 5);
    assert_eq!(report.retransmissions, 0);
    assert_eq!(fixture.store.get("poem.txt").unwrap(), POEM.as_bytes());
    assert!(fixture.wait_for_no_sessions(Duration::from_secs(1)).await);
    fixture.shutdown().await;
}

#[tokio::test]
async fn test_list_then_fetch_same_client() {
    let fixture = LoopbackFixture::start(Role::Source).await;
    fixture.store.insert("one.txt", "1\n");
    fixture.store.insert("two.txt", "2\n");

    let mut client = fixture.client().await;
    assert_eq!(client.list().await.unwrap(), vec!["one.txt", "two.txt"]);
    assert_eq!(client.fetch("one.txt").await.unwrap().bytes(), b"1\n");
    assert_eq!(client.fetch("two.txt").await.unwrap().bytes(), b"2\n");
    fixture.shutdown().await;
}

#[tokio::test]
async fn test_concurrent_clients_are_isolated() {
    let fixture = LoopbackFixture::start(Role::Source).await;
    for i in 0..4 {
        fixture
            .store
            .insert(format!("file{i}.txt"), format!("client {i}\nline two\n"));
    }

    let mut tasks = Vec::new();
    for i in 0..4 {
        let mut client = fixture.client().await;
        tasks.push(tokio::spawn(async move {
            client.fetch(&format!("file{i}.txt")).await.map(|o| o.bytes())
        }));
    }
    for (i, task) in tasks.into_iter().enumerate() {
        let bytes = task.await.unwrap().unwrap();
        assert_eq!(bytes, format!("client {i}\nline two\n").into_bytes());
    }
    assert!(fixture.wait_for_no_sessions(Duration::from_secs(1)).await);
    fixture.shutdown().await;
}

#[tokio::test]
async fn test_fetch_missing_resource_reports_remote_error() {
    let fixture = LoopbackFixture::start(Role::Source).await;

    let mut client = fixture.client().await;
    let err = client.fetch("nope.txt").await.unwrap_err();
    assert!(matches!(err, ProtocolError::Remote(ref reason) if reason.starts_with("ResourceUnavailable")));
    fixture.shutdown().await;
}

#[tokio::test]
async fn test_oversized_unit_rejected_before_data() {
    let config = ProtocolConfig {
        max_datagram_size: 128,
        ..fast_config(Role::Sink)
    };
    let fixture = LoopbackFixture::start_with(config).await;

    let mut client = fixture.client().await;
    let err = client
        .push("big.txt", &[vec![b'x'; 200]])
        .await
        .unwrap_err();
    assert!(matches!(err, ProtocolError::UnitTooLarge { limit: 128, .. }));
    assert!(fixture.store.get("big.txt").is_none());
    fixture.shutdown().await;
}

// ============================================================================
// Loss
// ============================================================================

#[tokio::test]
async fn test_fetch_survives_server_loss() {
    let fixture =
        LoopbackFixture::start_lossy(fast_config(Role::Source), DropPolicy::EveryNth(3)).await;
    fixture.store.insert("poem.txt", POEM);

    let mut client = fixture.client().await;
    let outcome = client.fetch("poem.txt").await.unwrap();

    assert_eq!(outcome.bytes(), POEM.as_bytes());
    fixture.shutdown().await;
}

#[tokio::test]
async fn test_push_survives_client_loss() {
    let fixture = LoopbackFixture::start(Role::Sink).await;
    let units: Vec<Vec<u8>> = (0..10).map(|i| format!("unit {i}\n").into_bytes()).collect();

    let mut client = fixture.lossy_client(DropPolicy::EveryNth(4)).await;
    let report = client.push("units.txt", &units).await.unwrap();

    assert_eq!(report.units, 10);
    assert!(report.retransmissions > 0);
    let stored = fixture.store.get("units.txt").unwrap();
    assert_eq!(stored, units.concat());
    fixture.shutdown().await;
}

// ============================================================================
// Encryption
// ============================================================================

#[tokio::test]
async fn test_encrypted_fetch() {
    let fixture = LoopbackFixture::start(Role::Source).await;
    fixture.store.insert("poem.txt", POEM);

    let mut client = fixture.client().await;
    client.secure().await.unwrap();
    assert_eq!(client.crypto_generation(), Some(0));

    let outcome = client.fetch("poem.txt").await.unwrap();
    assert_eq!(outcome.bytes(), POEM.as_bytes());
    assert_eq!(outcome.decrypt_failures(), 0);
    assert!(fixture.wait_for_no_sessions(Duration::from_secs(1)).await);
    fixture.shutdown().await;
}

#[tokio::test]
async fn test_encrypted_push_then_fetch_again() {
    let fixture = LoopbackFixture::start(Role::Sink).await;

    let mut client = fixture.client().await;
    client.secure().await.unwrap();
    client
        .push("a.txt", &split_units(b"first\n"))
        .await
        .unwrap();
    // The close tore down the key; the next transfer negotiates a new one.
    client
        .push("b.txt", &split_units(b"second\n"))
        .await
        .unwrap();

    assert_eq!(fixture.store.get("a.txt").unwrap(), b"first\n");
    assert_eq!(fixture.store.get("b.txt").unwrap(), b"second\n");
    fixture.shutdown().await;
}

#[tokio::test]
async fn test_explicit_rekey() {
    let fixture = LoopbackFixture::start(Role::Source).await;
    fixture.store.insert("poem.txt", POEM);

    let mut client = fixture.client().await;
    client.secure().await.unwrap();
    client.rekey().await.unwrap();
    assert_eq!(client.crypto_generation(), Some(1));

    let peer = client.local_addr().unwrap();
    let peer = std::net::SocketAddr::from(([127, 0, 0, 1], peer.port()));
    {
        let handle = fixture.server.registry().get(&peer).unwrap();
        assert_eq!(handle.lock().await.crypto().unwrap().generation(), 1);
    }

    assert_eq!(client.list().await.unwrap(), fixture.store.list());
    assert_eq!(client.fetch("poem.txt").await.unwrap().bytes(), POEM.as_bytes());
    fixture.shutdown().await;
}

#[tokio::test]
async fn test_rekey_mid_transfer() {
    let fixture = LoopbackFixture::start(Role::Source).await;
    fixture.store.insert("poem.txt", POEM);

    // Every unit finds the key expired and rekeys before acknowledging.
    let config = ProtocolConfig {
        key_lifetime: Duration::from_millis(1),
        ..fast_config(Role::Source)
    };
    let mut client = rudp_core::Client::connect(fixture.addr(), config).await.unwrap();
    client.secure().await.unwrap();
    tokio::time::sleep(Duration::from_millis(5)).await;

    let outcome = client.fetch("poem.txt").await.unwrap();
    assert_eq!(outcome.bytes(), POEM.as_bytes());
    fixture.shutdown().await;
}

#[tokio::test]
async fn test_rekey_mid_push() {
    let fixture = LoopbackFixture::start(Role::Sink).await;

    let config = ProtocolConfig {
        key_lifetime: Duration::from_millis(1),
        ..fast_config(Role::Sink)
    };
    let mut client = rudp_core::Client::connect(fixture.addr(), config).await.unwrap();
    client.secure().await.unwrap();
    tokio::time::sleep(Duration::from_millis(5)).await;

    client
        .push("poem.txt", &split_units(POEM.as_bytes()))
        .await
        .unwrap();
    assert_eq!(fixture.store.get("poem.txt").unwrap(), POEM.as_bytes());
    fixture.shutdown().await;
}

// ============================================================================
// Idle sweep
// ============================================================================

#[tokio::test]
async fn test_idle_sessions_evicted() {
    let config = ProtocolConfig {
        idle_timeout: Duration::from_millis(300),
        sweep_interval: Duration::from_millis(100),
        ..fast_config(Role::Sink)
    };
    let fixture = LoopbackFixture::start_with(config).await;

    let peer = fixture.raw_peer().await;
    peer.send("OPEN:stale.txt:1").await;
    peer.expect("OPEN_ACK:stale.txt:2").await;
    peer.send("ACK:2").await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(
        fixture.session_state(peer.addr()).await,
        Some(SessionState::Established)
    );

    let mut keyed = fixture.raw_peer().await;
    keyed.key_exchange().await;
    assert_eq!(fixture.server.registry().len(), 2);

    assert!(fixture.wait_for_no_sessions(Duration::from_secs(2)).await);

    // An evicted peer is unknown afterwards.
    peer.send("DATA:3:1:x").await;
    assert!(peer.recv().await.starts_with("ERROR:UnknownSession"));
    fixture.shutdown().await;
}
