//! HTTP CONNECT upstream proxy used as the detour transport

use async_trait::async_trait;
use detour_core::{Dial, Network, RawStream, TcpDial};
use std::io;
use tracing::{debug, trace};

/// Longest proxy response header accepted
const MAX_RESPONSE_HEADER: usize = 8 * 1024;

/// Detour dialer tunnelling through an HTTP proxy with `CONNECT`
///
/// The requested network picks the address family used to reach the proxy.
/// The proxy alone decides how it reaches the destination.
#[derive(Debug, Clone)]
pub struct HttpConnectDial {
    proxy: String,
    tcp: TcpDial,
}

impl HttpConnectDial {
    /// Tunnel through the proxy at `proxy` (host:port)
    pub fn new(proxy: impl Into<String>) -> Self {
        Self {
            proxy: proxy.into(),
            tcp: TcpDial::new().with_nodelay(true),
        }
    }
}

#[async_trait]
impl Dial for HttpConnectDial {
    async fn dial(&self, network: Network, addr: &str) -> io::Result<Box<dyn RawStream>> {
        trace!(proxy = %self.proxy, addr, %network, "Opening CONNECT tunnel");
        let stream = self.tcp.dial(network, &self.proxy).await?;
        stream
            .write(format!("CONNECT {addr} HTTP/1.1\r\nHost: {addr}\r\n\r\n").as_bytes())
            .await?;

        let header = read_response_header(stream.as_ref()).await?;
        let status = parse_status(&header)?;
        if !(200..300).contains(&status) {
            debug!(proxy = %self.proxy, addr, status, "Proxy refused tunnel");
            return Err(io::Error::new(
                io::ErrorKind::ConnectionRefused,
                format!("proxy answered CONNECT with status {status}"),
            ));
        }

        Ok(stream)
    }
}

/// Read up to and including the blank line, never past it
async fn read_response_header(stream: &dyn RawStream) -> io::Result<Vec<u8>> {
    let mut header = Vec::with_capacity(128);
    let mut byte = [0u8; 1];
    while !header.ends_with(b"\r\n\r\n") {
        if header.len() >= MAX_RESPONSE_HEADER {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "proxy response header too long",
            ));
        }
        if stream.read(&mut byte).await? == 0 {
            return Err(io::ErrorKind::UnexpectedEof.into());
        }
        header.push(byte[0]);
    }
    Ok(header)
}

fn parse_status(header: &[u8]) -> io::Result<u16> {
    let invalid = || io::Error::new(io::ErrorKind::InvalidData, "malformed proxy status line");
    let line = header
        .split(|&b| b == b'\r')
        .next()
        .and_then(|line| std::str::from_utf8(line).ok())
        .ok_or_else(invalid)?;
    let mut parts = line.split_whitespace();
    match (parts.next(), parts.next()) {
        (Some(version), Some(code)) if version.starts_with("HTTP/") => {
            code.parse().map_err(|_| invalid())
        }
        _ => Err(invalid()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use detour_core::TcpRawStream;
    use tokio::net::TcpListener;

    #[test]
    fn test_parse_status() {
        assert_eq!(parse_status(b"HTTP/1.1 200 Connection established\r\n\r\n").unwrap(), 200);
        assert_eq!(parse_status(b"HTTP/1.0 407 Proxy Auth\r\n\r\n").unwrap(), 407);
        assert!(parse_status(b"SSH-2.0\r\n\r\n").is_err());
        assert!(parse_status(b"HTTP/1.1 abc\r\n\r\n").is_err());
    }

    async fn proxy(answer: &'static [u8]) -> (String, tokio::task::JoinHandle<Vec<u8>>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let task = tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            let socket = TcpRawStream::new(socket).unwrap();
            let mut request = read_response_header(&socket).await.unwrap();
            socket.write(answer).await.unwrap();
            let mut rest = [0u8; 64];
            let n = socket.read(&mut rest).await.unwrap();
            request.extend_from_slice(&rest[..n]);
            request
        });
        (addr, task)
    }

    #[tokio::test]
    async fn test_tunnel_established() {
        let (addr, task) = proxy(b"HTTP/1.1 200 Connection established\r\n\r\n").await;
        let stream = HttpConnectDial::new(addr)
            .dial(Network::Tcp, "example.com:443")
            .await
            .unwrap();
        stream.write(b"hello").await.unwrap();

        let seen = task.await.unwrap();
        let seen = String::from_utf8(seen).unwrap();
        assert!(seen.starts_with("CONNECT example.com:443 HTTP/1.1\r\n"));
        assert!(seen.ends_with("\r\n\r\nhello"));
    }

    #[tokio::test]
    async fn test_tunnel_refused() {
        let (addr, _task) = proxy(b"HTTP/1.1 403 Forbidden\r\n\r\n").await;
        let err = HttpConnectDial::new(addr)
            .dial(Network::Tcp, "example.com:443")
            .await
            .err()
            .unwrap();
        assert_eq!(err.kind(), io::ErrorKind::ConnectionRefused);
    }

    #[tokio::test]
    async fn test_proxy_reached_over_requested_family() {
        let (addr, task) = proxy(b"HTTP/1.1 200 Connection established\r\n\r\n").await;
        let dial = HttpConnectDial::new(addr);

        let err = dial
            .dial(Network::Tcp6, "example.com:443")
            .await
            .err()
            .unwrap();
        assert_eq!(err.kind(), io::ErrorKind::AddrNotAvailable);

        let stream = dial.dial(Network::Tcp4, "example.com:443").await.unwrap();
        assert!(stream.peer_addr().unwrap().is_ipv4());
        stream.write(b"hello").await.unwrap();
        assert!(task.await.unwrap().ends_with(b"hello"));
    }
}
