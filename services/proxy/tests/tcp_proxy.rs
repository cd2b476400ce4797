//! TCP data path: proxying, candidate fall-through and balancing.


use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

use harness::{closed_addr, eventually, free_addr, roundtrip, TcpEchoBackend};
use plfm_proxy::{Balance, BackendConfig, ServiceConfig, ServiceRegistry};

async fn service_with(
    registry: &ServiceRegistry,
    balance: Balance,
    backends: Vec<BackendConfig>,
) -> String {
    let addr = free_addr().await;
    let mut config = ServiceConfig::new("tcp", addr.clone());
    config.balance = balance;
    config.backends = backends;
    registry.add_service(config).await.unwrap();
    addr
}

#[tokio::test]
async fn proxies_bytes_in_both_directions() {
    let echo = TcpEchoBackend::spawn().await.unwrap();
    let registry = ServiceRegistry::new();
    let addr = service_with(
        &registry,
        Balance::RoundRobin,
        vec![BackendConfig::new("b1", echo.addr.to_string())],
    )
    .await;

    let mut client = TcpStream::connect(&addr).await.unwrap();
    assert_eq!(roundtrip(&mut client, b"hello").await.unwrap(), b"hello");

    // Half-close: the echo sees EOF, finishes, and the proxy tears down.
    client.shutdown().await.unwrap();
    let mut rest = Vec::new();
    client.read_to_end(&mut rest).await.unwrap();
    assert!(rest.is_empty());

    let done = eventually(Duration::from_secs(5), || async {
        let stats = registry.backend_stats("tcp", "b1").await.unwrap();
        stats.active == 0 && stats.sent >= 5 && stats.rcvd >= 5
    })
    .await;
    assert!(done, "traffic counters never settled");

    let stats = registry.backend_stats("tcp", "b1").await.unwrap();
    assert_eq!(stats.conns, 1);
    assert_eq!(echo.bytes_received.load(std::sync::atomic::Ordering::Relaxed), 5);
    registry.shutdown().await;
}

#[tokio::test]
async fn half_close_still_delivers_pending_response() {
    let echo = TcpEchoBackend::spawn().await.unwrap();
    let registry = ServiceRegistry::new();
    let addr = service_with(
        &registry,
        Balance::RoundRobin,
        vec![BackendConfig::new("b1", echo.addr.to_string())],
    )
    .await;

    let mut client = TcpStream::connect(&addr).await.unwrap();
    client.write_all(b"request-then-eof").await.unwrap();
    client.shutdown().await.unwrap();

    let mut reply = Vec::new();
    tokio::time::timeout(Duration::from_secs(5), client.read_to_end(&mut reply))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(reply, b"request-then-eof");
    registry.shutdown().await;
}

#[tokio::test]
async fn no_backend_closes_without_data() {
    let registry = ServiceRegistry::new();
    let addr = service_with(&registry, Balance::RoundRobin, Vec::new()).await;

    let mut client = TcpStream::connect(&addr).await.unwrap();
    let mut buf = [0u8; 16];
    let n = tokio::time::timeout(Duration::from_secs(5), client.read(&mut buf))
        .await
        .unwrap()
        .unwrap_or(0);
    assert_eq!(n, 0);
    registry.shutdown().await;
}

#[tokio::test]
async fn dial_failure_falls_through_to_next_candidate() {
    let echo = TcpEchoBackend::spawn().await.unwrap();
    let dead = closed_addr().await;
    let registry = ServiceRegistry::new();
    let addr = service_with(
        &registry,
        Balance::RoundRobin,
        vec![
            BackendConfig::new("dead", dead.to_string()),
            BackendConfig::new("live", echo.addr.to_string()),
        ],
    )
    .await;

    for i in 0..4u8 {
        let mut client = TcpStream::connect(&addr).await.unwrap();
        assert_eq!(roundtrip(&mut client, &[i]).await.unwrap(), vec![i]);
    }

    let dead_stats = registry.backend_stats("tcp", "dead").await.unwrap();
    assert!(dead_stats.errors >= 1);
    assert_eq!(dead_stats.conns, 0);
    assert_eq!(echo.connection_count(), 4);
    registry.shutdown().await;
}

#[tokio::test]
async fn weighted_round_robin_over_connections() {
    let light = TcpEchoBackend::spawn().await.unwrap();
    let heavy = TcpEchoBackend::spawn().await.unwrap();
    let registry = ServiceRegistry::new();

    let mut heavy_config = BackendConfig::new("heavy", heavy.addr.to_string());
    heavy_config.weight = 2;
    let addr = service_with(
        &registry,
        Balance::RoundRobin,
        vec![BackendConfig::new("light", light.addr.to_string()), heavy_config],
    )
    .await;

    for _ in 0..6 {
        let mut client = TcpStream::connect(&addr).await.unwrap();
        roundtrip(&mut client, b"x").await.unwrap();
    }

    assert_eq!(light.connection_count(), 2);
    assert_eq!(heavy.connection_count(), 4);
    registry.shutdown().await;
}

#[tokio::test]
async fn least_conn_prefers_fresh_backend() {
    let b0 = TcpEchoBackend::spawn().await.unwrap();
    let b1 = TcpEchoBackend::spawn().await.unwrap();
    let b2 = TcpEchoBackend::spawn().await.unwrap();
    let registry = ServiceRegistry::new();
    let addr = service_with(
        &registry,
        Balance::LeastConn,
        vec![
            BackendConfig::new("b0", b0.addr.to_string()),
            BackendConfig::new("b1", b1.addr.to_string()),
        ],
    )
    .await;

    // Hold four connections open across b0 and b1.
    let mut held = Vec::new();
    for _ in 0..4 {
        let mut client = TcpStream::connect(&addr).await.unwrap();
        roundtrip(&mut client, b"hold").await.unwrap();
        held.push(client);
    }
    let stats = registry.service_stats("tcp").await.unwrap();
    assert_eq!(stats.active, 4);

    registry
        .add_backend("tcp", BackendConfig::new("b2", b2.addr.to_string()))
        .await
        .unwrap();

    // b2 stays the minimum for two more connections.
    for expected in 1..=2u64 {
        let mut client = TcpStream::connect(&addr).await.unwrap();
        roundtrip(&mut client, b"new").await.unwrap();
        held.push(client);
        assert_eq!(b2.connection_count(), expected);
    }

    // Now b2 ties with b0 and b1; list order picks b0.
    let mut client = TcpStream::connect(&addr).await.unwrap();
    roundtrip(&mut client, b"tie").await.unwrap();
    assert_eq!(b2.connection_count(), 2);
    assert_eq!(b0.connection_count(), 3);

    drop(held);
    registry.shutdown().await;
}

/// Backend that writes `reply` to every connection and then either closes
/// it or, when `hold` is set, keeps it open without reading.
async fn scripted_backend(reply: &'static [u8], hold: bool) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    tokio::spawn(async move {
        let mut held = Vec::new();
        while let Ok((mut stream, _)) = listener.accept().await {
            let _ = stream.write_all(reply).await;
            if hold {
                held.push(stream);
            }
        }
    });
    addr
}

#[tokio::test]
async fn backend_close_reclaims_idle_client_connection() {
    let backend = scripted_backend(b"bye", false).await;
    let registry = ServiceRegistry::new();
    let addr = service_with(
        &registry,
        Balance::RoundRobin,
        vec![BackendConfig::new("b1", backend)],
    )
    .await;

    // The client never writes or shuts down its side.
    let mut client = TcpStream::connect(&addr).await.unwrap();
    let mut reply = Vec::new();
    tokio::time::timeout(Duration::from_secs(5), client.read_to_end(&mut reply))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(reply, b"bye");

    let reclaimed = eventually(Duration::from_secs(3), || async {
        registry.backend_stats("tcp", "b1").await.unwrap().active == 0
    })
    .await;
    assert!(reclaimed, "connection still active after backend closed");
    assert_eq!(registry.service_stats("tcp").await.unwrap().active, 0);

    drop(client);
    registry.shutdown().await;
}

#[tokio::test]
async fn stalled_backend_is_torn_down_after_server_timeout() {
    let backend = scripted_backend(b"", true).await;
    let registry = ServiceRegistry::new();
    let addr = free_addr().await;
    let mut config = ServiceConfig::new("tcp", addr.clone());
    config.server_timeout = 200;
    config.backends = vec![BackendConfig::new("b1", backend)];
    registry.add_service(config).await.unwrap();

    let mut client = TcpStream::connect(&addr).await.unwrap();
    let mut rest = Vec::new();
    let closed = tokio::time::timeout(Duration::from_secs(3), client.read_to_end(&mut rest))
        .await
        .expect("stalled backend kept the connection open");
    assert!(closed.map(|n| n == 0).unwrap_or(true));

    let reclaimed = eventually(Duration::from_secs(2), || async {
        let stats = registry.backend_stats("tcp", "b1").await.unwrap();
        stats.active == 0 && stats.errors >= 1
    })
    .await;
    assert!(reclaimed, "deadline did not end the connection");
    registry.shutdown().await;
}

#[tokio::test]
async fn connections_over_the_cap_are_dropped() {
    let echo = TcpEchoBackend::spawn().await.unwrap();
    let registry = ServiceRegistry::with_max_connections(1);
    let addr = service_with(
        &registry,
        Balance::RoundRobin,
        vec![BackendConfig::new("b1", echo.addr.to_string())],
    )
    .await;

    let mut first = TcpStream::connect(&addr).await.unwrap();
    assert_eq!(roundtrip(&mut first, b"one").await.unwrap(), b"one");

    let mut second = TcpStream::connect(&addr).await.unwrap();
    let _ = second.write_all(b"two").await;
    let mut buf = [0u8; 16];
    let n = tokio::time::timeout(Duration::from_secs(5), second.read(&mut buf))
        .await
        .unwrap()
        .unwrap_or(0);
    assert_eq!(n, 0);
    assert_eq!(echo.connection_count(), 1);

    // The held connection is unaffected, and its slot frees on close.
    assert_eq!(roundtrip(&mut first, b"still").await.unwrap(), b"still");
    first.shutdown().await.unwrap();
    let mut rest = Vec::new();
    first.read_to_end(&mut rest).await.unwrap();

    let reopened = eventually(Duration::from_secs(3), || {
        let addr = addr.clone();
        async move {
            match TcpStream::connect(&addr).await {
                Ok(mut stream) => roundtrip(&mut stream, b"three").await.is_ok(),
                Err(_) => false,
            }
        }
    })
    .await;
    assert!(reopened, "slot was not released");
    registry.shutdown().await;
}
