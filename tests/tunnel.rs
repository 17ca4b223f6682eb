//! Integration tests for the tunnel engine's stream plumbing and the
//! connection manager's lifecycle edges. Everything here runs against
//! in-process duplex pairs and loopback sockets; no SSH server is needed.

use std::{sync::Arc, time::Duration};

use burrow::{
    client::{ClientConfig, ConnectionManager, ConnectionStatus}, endpoint::Endpoint, error::TunnelError, tunnel::{Tunnel, splice}
};
use tokio::{
    io::{self, AsyncReadExt, AsyncWriteExt}, net::TcpListener, time::timeout
};

fn test_config(dir: &tempfile::TempDir, server_url: &str) -> ClientConfig {
    ClientConfig {
        server_url: server_url.to_string(),
        username: Some("test".to_string()),
        identity: dir.path().join("id_rsa"),
        password: None,
        known_hosts: dir.path().join("known_hosts"),
        jump_hosts: Vec::new(),
        insecure: false,
        keepalive_interval: Duration::from_millis(100),
        reconnect_interval: Duration::from_millis(50),
    }
}

#[tokio::test]
async fn splice_round_trips_bytes_in_order() {
    let (mut near, far_a) = io::duplex(64);
    let (mut peer, far_b) = io::duplex(64);
    let proxy = tokio::spawn(async move {
        let mut a = far_a;
        let mut b = far_b;
        let _ = splice(&mut a, &mut b).await;
    });

    near.write_all(b"ping").await.unwrap();
    let mut buf = [0u8; 4];
    peer.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"ping");

    peer.write_all(b"pong").await.unwrap();
    near.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"pong");

    drop(near);
    drop(peer);
    let _ = proxy.await;
}

#[tokio::test]
async fn splice_propagates_half_close() {
    let (mut near, far_a) = io::duplex(64);
    let (mut peer, far_b) = io::duplex(64);
    let proxy = tokio::spawn(async move {
        let mut a = far_a;
        let mut b = far_b;
        let _ = splice(&mut a, &mut b).await;
    });

    // FIN one direction; the other side must see the data then EOF while
    // its own write path keeps working
    near.write_all(b"request").await.unwrap();
    near.shutdown().await.unwrap();

    let mut buf = vec![0u8; 7];
    peer.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"request");
    assert_eq!(peer.read(&mut [0u8; 1]).await.unwrap(), 0);

    peer.write_all(b"response").await.unwrap();
    let mut buf = vec![0u8; 8];
    near.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"response");

    drop(peer);
    let _ = timeout(Duration::from_secs(1), proxy).await.expect("proxy exits");
}

#[tokio::test]
async fn forward_tunnel_bind_conflict_is_reported() {
    let dir = tempfile::tempdir().unwrap();
    let manager = Arc::new(ConnectionManager::new(test_config(&dir, "test@127.0.0.1:2222")).unwrap());

    let occupied = TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
    let port = occupied.local_addr().unwrap().port();

    let tunnel = Tunnel::forward(
        Endpoint::new("127.0.0.1", port),
        Endpoint::new("127.0.0.1", 80),
        manager,
    );
    match tunnel.run().await {
        Err(TunnelError::Bind { .. }) => {}
        other => panic!("expected bind error, got {other:?}"),
    }
}

#[tokio::test]
async fn stop_is_idempotent_and_unblocks_waiters() {
    let dir = tempfile::tempdir().unwrap();
    let manager = Arc::new(ConnectionManager::new(test_config(&dir, "test@127.0.0.1:2222")).unwrap());

    let waiter = tokio::spawn({
        let manager = manager.clone();
        async move { manager.wait_ready().await }
    });

    manager.stop().await;
    manager.stop().await;
    assert_eq!(manager.status(), ConnectionStatus::Closed);

    let result = timeout(Duration::from_secs(1), waiter)
        .await
        .expect("waiter unblocked")
        .expect("waiter not cancelled");
    assert!(matches!(result, Err(TunnelError::Stopped)));

    // and a late waiter bails out immediately
    assert!(matches!(manager.wait_ready().await, Err(TunnelError::Stopped)));
}

#[tokio::test]
async fn client_accessor_errors_when_not_connected() {
    let dir = tempfile::tempdir().unwrap();
    let manager = ConnectionManager::new(test_config(&dir, "test@127.0.0.1:2222")).unwrap();

    match manager.client().await {
        Err(TunnelError::NotConnected) => {}
        Err(other) => panic!("expected NotConnected, got {other}"),
        Ok(_) => panic!("no client should be available before connect"),
    }
}

#[tokio::test]
async fn supervision_loop_retries_unreachable_server() {
    let dir = tempfile::tempdir().unwrap();
    // nothing listens on this port; every attempt fails fast
    let unreachable = {
        let probe = TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
        let port = probe.local_addr().unwrap().port();
        drop(probe);
        format!("test@127.0.0.1:{port}")
    };
    let manager = Arc::new(ConnectionManager::new(test_config(&dir, &unreachable)).unwrap());
    manager.start();

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_ne!(manager.status(), ConnectionStatus::Connected);

    // the loop is still alive and responsive to stop
    timeout(Duration::from_secs(1), manager.stop())
        .await
        .expect("stop completes");
    assert_eq!(manager.status(), ConnectionStatus::Closed);
}
