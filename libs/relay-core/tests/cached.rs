//! Caching session variant over real sockets.


use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;

use harness::{spawn_relay, FixedResponseBackend};
use relay_core::{CacheStore, CachedSessionFactory, ListenerConfig, StopMode, CACHE_KEY};

const TEST_TIMEOUT: Duration = Duration::from_secs(5);

async fn fetch(addr: std::net::SocketAddr) -> Vec<u8> {
    let mut client = TcpStream::connect(addr).await.unwrap();
    client.write_all(b"req").await.unwrap();
    let mut received = Vec::new();
    timeout(TEST_TIMEOUT, client.read_to_end(&mut received))
        .await
        .unwrap()
        .unwrap();
    received
}

#[tokio::test]
async fn second_connection_is_served_from_the_recording() {
    let backend = FixedResponseBackend::spawn(b"cached response body")
        .await
        .unwrap();
    let store = Arc::new(CacheStore::default());
    let factory = Arc::new(CachedSessionFactory::new(Arc::clone(&store)));

    let config = ListenerConfig::new(
        "127.0.0.1:0".parse().unwrap(),
        backend.addr.ip().to_string(),
        backend.addr.port(),
    );
    let (manager, addr) = spawn_relay(config, factory).await.unwrap();

    // First connection goes to the target and gets recorded.
    assert_eq!(fetch(addr).await, b"cached response body");
    assert_eq!(backend.connection_count(), 1);

    // The recording lands when the target-side close is processed;
    // wait for it before reconnecting.
    timeout(TEST_TIMEOUT, async {
        while store.lookup(CACHE_KEY).is_none() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();

    // Second connection replays the recording without dialing out.
    assert_eq!(fetch(addr).await, b"cached response body");
    assert_eq!(backend.connection_count(), 1);

    manager.stop(StopMode::Drain(Some(Duration::from_secs(2))));
    timeout(TEST_TIMEOUT, manager.wait_stopped()).await.unwrap();
}

#[tokio::test]
async fn expired_recording_falls_back_to_the_target() {
    let backend = FixedResponseBackend::spawn(b"fresh body").await.unwrap();
    let store = Arc::new(CacheStore::new(Duration::from_millis(50)));
    let factory = Arc::new(CachedSessionFactory::new(Arc::clone(&store)));

    let config = ListenerConfig::new(
        "127.0.0.1:0".parse().unwrap(),
        backend.addr.ip().to_string(),
        backend.addr.port(),
    );
    let (manager, addr) = spawn_relay(config, factory).await.unwrap();

    assert_eq!(fetch(addr).await, b"fresh body");
    timeout(TEST_TIMEOUT, async {
        while store.lookup(CACHE_KEY).is_none() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();

    // Let the recording age out, then connect again.
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(fetch(addr).await, b"fresh body");
    assert_eq!(backend.connection_count(), 2);

    manager.stop(StopMode::Drain(Some(Duration::from_secs(2))));
    timeout(TEST_TIMEOUT, manager.wait_stopped()).await.unwrap();
}
