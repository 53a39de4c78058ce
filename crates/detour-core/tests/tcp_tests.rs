//! End-to-end tests over real loopback sockets

mod common;

use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use async_trait::async_trait;
use common::{MockDial, GET, OK};
use detour_core::{Dial, Dialer, Network, PathKind, RawStream, TcpRawStream};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;

/// Answer one HTTP request with `OK`, then close
async fn http_server() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.unwrap();
        let mut buf = [0u8; 1024];
        let _ = socket.read(&mut buf).await.unwrap();
        socket.write_all(OK).await.unwrap();
        socket.shutdown().await.unwrap();
    });
    addr
}

/// An address nothing listens on
async fn closed_port() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap()
}

/// Detour that reaches a fixed server whatever address is asked for
struct FixedTarget(SocketAddr);

#[async_trait]
impl Dial for FixedTarget {
    async fn dial(&self, _network: Network, _addr: &str) -> io::Result<Box<dyn RawStream>> {
        let stream = TcpStream::connect(self.0).await?;
        Ok(Box::new(TcpRawStream::new(stream)?))
    }
}

async fn read_all(conn: &detour_core::Conn) -> Vec<u8> {
    let mut got = Vec::new();
    let mut buf = [0u8; 512];
    loop {
        let n = conn.read(&mut buf).await.unwrap();
        if n == 0 {
            return got;
        }
        got.extend_from_slice(&buf[..n]);
    }
}

#[tokio::test]
async fn test_direct_over_tcp() {
    let server = http_server().await;
    let detour = MockDial::default();
    let (tx, mut rx) = mpsc::channel(1);
    let dialer = Dialer::builder(detour.clone())
        .delay_before_detour(Duration::from_secs(10))
        .notify_direct_ok(tx)
        .build();

    let addr = server.to_string();
    let conn = dialer.dial(Network::Tcp, &addr).await.unwrap();
    assert_eq!(conn.peer_addr().await.unwrap(), server);

    conn.write(GET).await.unwrap();
    assert_eq!(read_all(&conn).await, OK);
    conn.close().await.unwrap();

    assert_eq!(rx.recv().await, Some(addr.clone()));
    assert_eq!(detour.calls(), 0);
    assert!(!dialer.whitelist().contains(&addr));
}

#[tokio::test]
async fn test_refused_direct_falls_back_to_detour() {
    let server = http_server().await;
    let target = closed_port().await.to_string();
    let dialer = Dialer::builder(FixedTarget(server))
        .timeout_to_connect(Duration::from_secs(5))
        .delay_before_detour(Duration::from_secs(10))
        .build();

    let conn = dialer.dial(Network::Tcp, &target).await.unwrap();
    assert_eq!(conn.paths().await.unwrap(), vec![PathKind::Detour]);

    conn.write(GET).await.unwrap();
    assert_eq!(read_all(&conn).await, OK);
    conn.close().await.unwrap();

    assert!(dialer.whitelist().is_permanent(&target));

    // Next dial goes straight through detour
    let server = http_server().await;
    let dialer = Dialer::builder(FixedTarget(server))
        .whitelist(dialer.whitelist().clone())
        .build();
    let conn = dialer.dial(Network::Tcp, &target).await.unwrap();
    assert_eq!(conn.peer_addr().await.unwrap(), server);
    conn.close().await.unwrap();
}

#[tokio::test]
async fn test_ipv6_only_network_rejects_ipv4_literal() {
    let server = http_server().await;
    let dialer = Dialer::builder(MockDial::default())
        .delay_before_detour(Duration::from_secs(10))
        .timeout_to_connect(Duration::from_secs(1))
        .build();

    let err = dialer.dial(Network::Tcp6, &server.to_string()).await.unwrap_err();
    let err: io::Error = err.into();
    assert_ne!(err.kind(), io::ErrorKind::TimedOut);
}
