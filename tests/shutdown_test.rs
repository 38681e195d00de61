//! Tests for server stop, teardown completeness, and restart

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use otpgate::config::ServerConfig;
use otpgate::{EchoHandlerFactory, Server, ShutdownCoordinator};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::{sleep, timeout};
use tokio_test::assert_ok;

fn test_config() -> ServerConfig {
    ServerConfig {
        bind_addr: "127.0.0.1".parse().unwrap(),
        port: 0,
        max_connections: 8,
        max_client_age: Duration::from_secs(60),
        maintenance_interval: Duration::from_millis(20),
        buffer_size: 1024,
    }
}

async fn start_server() -> (Server, SocketAddr) {
    let server = Server::new(test_config(), Arc::new(EchoHandlerFactory::new(1024)));
    server.start().await.unwrap();
    let addr = server.local_addr().unwrap();
    (server, addr)
}

async fn wait_for_count(server: &Server, expected: usize) {
    for _ in 0..200 {
        if server.connection_count() == expected {
            return;
        }
        sleep(Duration::from_millis(10)).await;
    }
    panic!(
        "connection count never reached {}, still {}",
        expected,
        server.connection_count()
    );
}

async fn expect_eof(client: &mut TcpStream) {
    let mut buf = [0u8; 1];
    let n = timeout(Duration::from_secs(2), client.read(&mut buf))
        .await
        .expect("expected EOF, read timed out")
        .expect("expected EOF, read failed");
    assert_eq!(n, 0);
}

#[tokio::test]
async fn test_stop_tears_down_every_session() {
    let (server, addr) = start_server().await;

    let mut c1 = TcpStream::connect(addr).await.unwrap();
    let mut c2 = TcpStream::connect(addr).await.unwrap();
    let mut c3 = TcpStream::connect(addr).await.unwrap();
    wait_for_count(&server, 3).await;

    server.stop().await;

    assert!(!server.is_active());
    assert_eq!(server.connection_count(), 0);
    expect_eof(&mut c1).await;
    expect_eof(&mut c2).await;
    expect_eof(&mut c3).await;
}

#[tokio::test]
async fn test_stop_is_idempotent() {
    let (server, _addr) = start_server().await;

    server.stop().await;
    server.stop().await;

    assert!(!server.is_active());
}

#[tokio::test]
async fn test_listener_port_is_released_on_stop() {
    // No client ever connects, so nothing lingers on the port after stop.
    let (server, addr) = start_server().await;
    server.stop().await;

    let rebound = tokio_test::assert_ok!(TcpListener::bind(addr).await);
    drop(rebound);

    // And a whole new server instance can claim the same port.
    let mut config = test_config();
    config.port = addr.port();
    let second = Server::new(config, Arc::new(EchoHandlerFactory::new(1024)));
    tokio_test::assert_ok!(second.start().await);
    assert_eq!(second.local_addr(), Some(addr));
    second.stop().await;
}

#[tokio::test]
async fn test_same_instance_restarts_cleanly() {
    let (server, first_addr) = start_server().await;

    let mut client = TcpStream::connect(first_addr).await.unwrap();
    wait_for_count(&server, 1).await;
    server.stop().await;
    expect_eof(&mut client).await;

    // Second run of the same instance gets a fresh listener.
    server.start().await.unwrap();
    assert!(server.is_active());
    let second_addr = server.local_addr().unwrap();

    let mut client = TcpStream::connect(second_addr).await.unwrap();
    wait_for_count(&server, 1).await;

    client.write_all(b"again").await.unwrap();
    let mut buf = [0u8; 5];
    timeout(Duration::from_secs(2), client.read_exact(&mut buf))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(&buf, b"again");

    // Counters accumulate across runs of the same instance.
    assert_eq!(server.get_stats().admitted, 2);

    server.stop().await;
}

#[tokio::test]
async fn test_coordinator_drives_server_shutdown() {
    let (server, addr) = start_server().await;
    let coordinator = ShutdownCoordinator::new();

    let mut client = TcpStream::connect(addr).await.unwrap();
    wait_for_count(&server, 1).await;

    coordinator.shutdown_server(&server).await.unwrap();

    assert!(!server.is_active());
    assert_eq!(server.connection_count(), 0);
    expect_eof(&mut client).await;
}
