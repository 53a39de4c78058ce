//! Classified connections
//!
//! A [`PathConn`] wraps one [`RawStream`] and tags it as [`PathKind::Direct`]
//! or [`PathKind::Detour`]. The kind decides which interference checks run on
//! reads and what the whitelist learns when the path closes:
//!
//! | kind   | read                                             | close (data, no error)          |
//! |--------|--------------------------------------------------|---------------------------------|
//! | direct | fake-page check on first read, tampering checks  | notify "works directly"         |
//! | detour | failure removes the address from the whitelist   | add address permanently         |
//!
//! A path dropped because another path won ([`PathConn::discard`]) closes
//! without teaching the whitelist anything.

pub(crate) mod detour;
pub(crate) mod direct;

use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::{mpsc, watch};
use tracing::{debug, trace};

use crate::detector::DetectorHandle;
use crate::error::Error;
use crate::stream::RawStream;
use crate::whitelist::Whitelist;

static NEXT_PATH_ID: AtomicU64 = AtomicU64::new(1);

/// Which route a path takes to the destination
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PathKind {
    /// Straight to the destination
    Direct,
    /// Through the detour dialer
    Detour,
}

impl fmt::Display for PathKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Direct => f.write_str("direct"),
            Self::Detour => f.write_str("detour"),
        }
    }
}

/// State shared by every path of every connection made by one dialer
pub(crate) struct PathContext {
    pub whitelist: Arc<Whitelist>,
    pub detector: Arc<DetectorHandle>,
    /// Receives addresses that closed cleanly over the direct path
    pub direct_ok: Option<mpsc::Sender<String>>,
}

/// One classified connection
pub(crate) struct PathConn {
    id: u64,
    kind: PathKind,
    addr: String,
    stream: Box<dyn RawStream>,
    ctx: Arc<PathContext>,
    bytes_read: AtomicU64,
    errored: AtomicBool,
    closed: watch::Sender<bool>,
}

impl PathConn {
    pub(crate) fn new(
        kind: PathKind,
        addr: &str,
        stream: Box<dyn RawStream>,
        ctx: Arc<PathContext>,
    ) -> Self {
        Self {
            id: NEXT_PATH_ID.fetch_add(1, Ordering::Relaxed),
            kind,
            addr: addr.to_string(),
            stream,
            ctx,
            bytes_read: AtomicU64::new(0),
            errored: AtomicBool::new(false),
            closed: watch::Sender::new(false),
        }
    }

    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    pub(crate) fn kind(&self) -> PathKind {
        self.kind
    }

    pub(crate) fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    /// Read, running the checks for this path's kind.
    ///
    /// Fails with a closed error as soon as the path is closed, even if the
    /// underlying read is still pending.
    pub(crate) async fn read(&self, buf: &mut [u8], first: bool) -> io::Result<usize> {
        let mut closed = self.closed.subscribe();
        let result = tokio::select! {
            _ = closed.wait_for(|c| *c) => return Err(Error::closed(&self.addr).into()),
            r = self.stream.read(&mut *buf) => r,
        };

        let result = match self.kind {
            PathKind::Direct => direct::check_read(self, buf, result, first),
            PathKind::Detour => detour::check_read(self, result),
        };
        if let Ok(n) = result {
            self.bytes_read.fetch_add(n as u64, Ordering::Relaxed);
        }
        result
    }

    pub(crate) async fn write(&self, buf: &[u8]) -> io::Result<usize> {
        let mut closed = self.closed.subscribe();
        tokio::select! {
            _ = closed.wait_for(|c| *c) => Err(Error::closed(&self.addr).into()),
            r = self.stream.write(buf) => r.map_err(|e| {
                self.mark_errored();
                e
            }),
        }
    }

    /// Skip the race for this address for the rest of the process
    pub(crate) fn whitelist_temporarily(&self) {
        self.ctx.whitelist.add(&self.addr, false);
    }

    /// Close and let the whitelist learn from this path. Returns false if already closed.
    pub(crate) async fn close(&self) -> bool {
        if !self.shutdown().await {
            return false;
        }
        let clean = self.bytes_read.load(Ordering::Relaxed) > 0 && !self.errored();
        match self.kind {
            PathKind::Direct => direct::on_close(self, clean),
            PathKind::Detour => detour::on_close(self, clean),
        }
        true
    }

    /// Close without whitelist side effects. Returns false if already closed.
    pub(crate) async fn discard(&self) -> bool {
        self.shutdown().await
    }

    async fn shutdown(&self) -> bool {
        if self.closed.send_replace(true) {
            return false;
        }
        trace!(addr = %self.addr, kind = %self.kind, id = self.id, "Closing path");
        if let Err(e) = self.stream.shutdown().await {
            debug!(addr = %self.addr, kind = %self.kind, "Error closing path: {}", e);
        }
        true
    }

    pub(crate) fn local_addr(&self) -> io::Result<SocketAddr> {
        self.stream.local_addr()
    }

    pub(crate) fn peer_addr(&self) -> io::Result<SocketAddr> {
        self.stream.peer_addr()
    }

    fn mark_errored(&self) {
        self.errored.store(true, Ordering::Relaxed);
    }

    fn errored(&self) -> bool {
        self.errored.load(Ordering::Relaxed)
    }
}

impl fmt::Debug for PathConn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PathConn")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("addr", &self.addr)
            .field("bytes_read", &self.bytes_read.load(Ordering::Relaxed))
            .field("closed", &self.is_closed())
            .finish()
    }
}
