//! Raw byte-stream and dialer seams
//!
//! The engine never touches sockets directly. Direct connections come from a
//! [`Dial`] implementation (by default [`TcpDial`]) and detour connections from
//! whatever [`Dial`] the embedding application supplies (a SOCKS or TLS tunnel,
//! an HTTP CONNECT proxy, ...). Both hand back a [`RawStream`].

use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::str::FromStr;

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tracing::trace;

use crate::error::Error;

/// Network family requested by the caller
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Network {
    /// Any address family
    #[default]
    Tcp,
    /// IPv4 only
    Tcp4,
    /// IPv6 only
    Tcp6,
}

impl Network {
    /// Check if `addr` belongs to this network
    pub fn accepts(self, addr: &SocketAddr) -> bool {
        match self {
            Self::Tcp => true,
            Self::Tcp4 => addr.is_ipv4(),
            Self::Tcp6 => addr.is_ipv6(),
        }
    }

    /// Name as accepted by [`FromStr`]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Tcp => "tcp",
            Self::Tcp4 => "tcp4",
            Self::Tcp6 => "tcp6",
        }
    }
}

impl FromStr for Network {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "tcp" => Ok(Self::Tcp),
            "tcp4" => Ok(Self::Tcp4),
            "tcp6" => Ok(Self::Tcp6),
            _ => Err(Error::UnsupportedNetwork(s.to_string())),
        }
    }
}

impl fmt::Display for Network {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A connected bidirectional byte stream
///
/// Methods take `&self` so one task can read while another writes.
#[async_trait]
pub trait RawStream: Send + Sync {
    /// Read into `buf`, returning `Ok(0)` at end of stream
    async fn read(&self, buf: &mut [u8]) -> io::Result<usize>;

    /// Write all of `buf`, returning its length
    async fn write(&self, buf: &[u8]) -> io::Result<usize>;

    /// Close the stream
    async fn shutdown(&self) -> io::Result<()>;

    /// Local socket address
    fn local_addr(&self) -> io::Result<SocketAddr>;

    /// Remote socket address
    fn peer_addr(&self) -> io::Result<SocketAddr>;
}

/// Something that can open a [`RawStream`] to `host:port`
#[async_trait]
pub trait Dial: Send + Sync {
    /// Open a connection to `addr`
    async fn dial(&self, network: Network, addr: &str) -> io::Result<Box<dyn RawStream>>;
}

/// [`RawStream`] over a tokio TCP socket
pub struct TcpRawStream {
    reader: Mutex<OwnedReadHalf>,
    writer: Mutex<OwnedWriteHalf>,
    local_addr: SocketAddr,
    peer_addr: SocketAddr,
}

impl TcpRawStream {
    /// Wrap a connected socket
    pub fn new(stream: TcpStream) -> io::Result<Self> {
        let local_addr = stream.local_addr()?;
        let peer_addr = stream.peer_addr()?;
        let (reader, writer) = stream.into_split();
        Ok(Self {
            reader: Mutex::new(reader),
            writer: Mutex::new(writer),
            local_addr,
            peer_addr,
        })
    }
}

#[async_trait]
impl RawStream for TcpRawStream {
    async fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        self.reader.lock().await.read(buf).await
    }

    async fn write(&self, buf: &[u8]) -> io::Result<usize> {
        self.writer.lock().await.write_all(buf).await?;
        Ok(buf.len())
    }

    async fn shutdown(&self) -> io::Result<()> {
        self.writer.lock().await.shutdown().await
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        Ok(self.local_addr)
    }

    fn peer_addr(&self) -> io::Result<SocketAddr> {
        Ok(self.peer_addr)
    }
}

/// Plain TCP dialer used for the direct path
#[derive(Debug, Clone, Copy, Default)]
pub struct TcpDial {
    nodelay: bool,
}

impl TcpDial {
    /// Create a dialer
    pub fn new() -> Self {
        Self::default()
    }

    /// Set `TCP_NODELAY` on dialed sockets
    pub fn with_nodelay(mut self, nodelay: bool) -> Self {
        self.nodelay = nodelay;
        self
    }
}

#[async_trait]
impl Dial for TcpDial {
    async fn dial(&self, network: Network, addr: &str) -> io::Result<Box<dyn RawStream>> {
        let mut last_err = None;
        for target in tokio::net::lookup_host(addr).await? {
            if !network.accepts(&target) {
                continue;
            }
            trace!(addr, %target, "Connecting");
            match TcpStream::connect(target).await {
                Ok(stream) => {
                    if self.nodelay {
                        stream.set_nodelay(true)?;
                    }
                    return Ok(Box::new(TcpRawStream::new(stream)?));
                }
                Err(e) => last_err = Some(e),
            }
        }
        Err(last_err.unwrap_or_else(|| {
            io::Error::new(
                io::ErrorKind::AddrNotAvailable,
                format!("no {network} address found for {addr}"),
            )
        }))
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_network_from_str() {
        assert_eq!("tcp".parse::<Network>().unwrap(), Network::Tcp);
        assert_eq!("TCP4".parse::<Network>().unwrap(), Network::Tcp4);
        assert_eq!("tcp6".parse::<Network>().unwrap(), Network::Tcp6);
        assert!(matches!(
            "udp".parse::<Network>(),
            Err(Error::UnsupportedNetwork(n)) if n == "udp"
        ));
    }

    #[test]
    fn test_network_accepts() {
        let v4: SocketAddr = "1.2.3.4:80".parse().unwrap();
        let v6: SocketAddr = "[::1]:80".parse().unwrap();
        assert!(Network::Tcp.accepts(&v4) && Network::Tcp.accepts(&v6));
        assert!(Network::Tcp4.accepts(&v4) && !Network::Tcp4.accepts(&v6));
        assert!(!Network::Tcp6.accepts(&v4) && Network::Tcp6.accepts(&v6));
    }

    #[tokio::test]
    async fn test_tcp_dial_roundtrip() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 4];
            sock.read_exact(&mut buf).await.unwrap();
            sock.write_all(b"pong").await.unwrap();
            buf
        });

        let stream = TcpDial::new()
            .dial(Network::Tcp4, &addr.to_string())
            .await
            .unwrap();
        assert_eq!(stream.peer_addr().unwrap(), addr);
        assert_eq!(stream.write(b"ping").await.unwrap(), 4);

        let mut buf = [0u8; 4];
        let mut got = 0;
        while got < 4 {
            got += stream.read(&mut buf[got..]).await.unwrap();
        }
        assert_eq!(&buf, b"pong");
        assert_eq!(&server.await.unwrap(), b"ping");
    }

    #[tokio::test]
    async fn test_tcp_dial_wrong_family() {
        let err = TcpDial::new()
            .dial(Network::Tcp6, "127.0.0.1:9")
            .await
            .err()
            .unwrap();
        assert_eq!(err.kind(), io::ErrorKind::AddrNotAvailable);
    }
}
