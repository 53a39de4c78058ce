//! Dual-path connection
//!
//! A [`Conn`] looks like one ordinary connection to the caller while up to
//! two paths (direct and detour) race underneath it. All per-connection state
//! is owned by a single coordination task (see `ioloop`); the methods here
//! only post events to it and wait for the answer.
//!
//! ## Lifecycle
//!
//! 1. [`Dialer::dial`] spawns the coordination task and the path dials
//! 2. The first admitted path makes `dial` return
//! 3. Reads fan out to every admitted path until one delivers data, after
//!    which the others are dropped
//! 4. [`Conn::close`] (or dropping the last handle) tears everything down

mod dial;
mod ioloop;
mod merge;
mod replay;
mod stream;

pub use dial::{Dialer, DialerBuilder};
pub use replay::is_nonidempotent_request;
pub use stream::ConnStream;

use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot, watch, Notify};
use tokio::task::JoinHandle;
use tracing::trace;

use crate::error::Error;
use crate::path::PathKind;
use ioloop::Event;

/// Cross-task signals of one connection
pub(crate) struct ConnState {
    addr: String,
    read_bytes: AtomicU64,
    closed: watch::Sender<bool>,
    /// Direct path failed, start the detour dial without waiting
    dial_detour_now: Notify,
    buffer_size: usize,
}

impl ConnState {
    pub(crate) fn new(addr: &str, buffer_size: usize) -> Self {
        Self {
            addr: addr.to_string(),
            read_bytes: AtomicU64::new(0),
            closed: watch::Sender::new(false),
            dial_detour_now: Notify::new(),
            buffer_size: buffer_size.max(1),
        }
    }

    pub(crate) fn addr(&self) -> &str {
        &self.addr
    }

    pub(crate) fn data_received(&self) -> bool {
        self.read_bytes.load(Ordering::SeqCst) > 0
    }

    pub(crate) fn add_read_bytes(&self, n: usize) {
        self.read_bytes.fetch_add(n as u64, Ordering::SeqCst);
    }

    pub(crate) fn read_bytes(&self) -> u64 {
        self.read_bytes.load(Ordering::SeqCst)
    }

    pub(crate) fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    /// Signal close. Returns true for the first caller only.
    pub(crate) fn close(&self) -> bool {
        !self.closed.send_replace(true)
    }

    pub(crate) fn subscribe_closed(&self) -> watch::Receiver<bool> {
        self.closed.subscribe()
    }

    pub(crate) fn hint_dial_detour(&self) {
        self.dial_detour_now.notify_one();
    }

    pub(crate) async fn dial_detour_hinted(&self) {
        self.dial_detour_now.notified().await;
    }

    pub(crate) fn closed_error(&self) -> io::Error {
        Error::closed(&self.addr).into()
    }
}

/// Handle shared by [`Conn`] and [`ConnStream`]
pub(crate) struct Inner {
    state: Arc<ConnState>,
    events: mpsc::UnboundedSender<Event>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl Inner {
    fn send(&self, event: Event) -> io::Result<()> {
        if self.state.is_closed() {
            return Err(self.state.closed_error());
        }
        self.events
            .send(event)
            .map_err(|_| self.state.closed_error())
    }

    async fn wait<T>(&self, reply: oneshot::Receiver<io::Result<T>>) -> io::Result<T> {
        let mut closed = self.state.subscribe_closed();
        tokio::select! {
            r = reply => r.unwrap_or_else(|_| Err(self.state.closed_error())),
            _ = closed.wait_for(|c| *c) => Err(self.state.closed_error()),
        }
    }

    pub(crate) async fn read_bytes(&self, len: usize) -> io::Result<Bytes> {
        let (reply, rx) = oneshot::channel();
        self.send(Event::Read { len, reply })?;
        self.wait(rx).await
    }

    pub(crate) async fn write(&self, data: Bytes) -> io::Result<usize> {
        let (reply, rx) = oneshot::channel();
        self.send(Event::Write { data, reply })?;
        self.wait(rx).await
    }

    pub(crate) async fn close(&self) -> io::Result<()> {
        if !self.state.close() {
            return Ok(());
        }
        trace!(addr = %self.state.addr, "Closing connection");
        let task = self.task.lock().take();
        if let Some(task) = task {
            // Teardown panics are not the caller's problem
            let _ = task.await;
        }
        Ok(())
    }

    async fn addr(&self, local: bool) -> io::Result<SocketAddr> {
        let (reply, rx) = oneshot::channel();
        self.send(Event::Addr { local, reply })?;
        self.wait(rx).await
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        self.state.close();
    }
}

/// A connection raced over the direct and detour paths
///
/// Dropping the last handle closes it.
pub struct Conn {
    inner: Arc<Inner>,
}

impl Conn {
    pub(crate) fn new(
        state: Arc<ConnState>,
        events: mpsc::UnboundedSender<Event>,
        task: JoinHandle<()>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                state,
                events,
                task: Mutex::new(Some(task)),
            }),
        }
    }

    /// Destination address as given to [`Dialer::dial`]
    pub fn addr(&self) -> &str {
        self.inner.state.addr()
    }

    /// Read into `buf`. `Ok(0)` means end of stream.
    ///
    /// Not cancel safe: bytes arriving for a dropped call are lost. Concurrent
    /// calls are served one after the other.
    pub async fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        let len = buf.len().min(self.inner.state.buffer_size);
        let data = self.inner.read_bytes(len).await?;
        let n = data.len().min(buf.len());
        buf[..n].copy_from_slice(&data[..n]);
        Ok(n)
    }

    /// Write `buf` to every admitted path
    pub async fn write(&self, buf: &[u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        self.inner.write(Bytes::copy_from_slice(buf)).await
    }

    /// Close every path and stop the coordination task. Idempotent.
    pub async fn close(&self) -> io::Result<()> {
        self.inner.close().await
    }

    /// True once [`Conn::close`] has been called
    pub fn is_closed(&self) -> bool {
        self.inner.state.is_closed()
    }

    /// Bytes delivered to the caller so far
    pub fn bytes_received(&self) -> u64 {
        self.inner.state.read_bytes()
    }

    /// Local address of an admitted path
    pub async fn local_addr(&self) -> io::Result<SocketAddr> {
        self.inner.addr(true).await
    }

    /// Remote address of an admitted path
    pub async fn peer_addr(&self) -> io::Result<SocketAddr> {
        self.inner.addr(false).await
    }

    /// Kinds of the currently admitted paths
    pub async fn paths(&self) -> io::Result<Vec<PathKind>> {
        let (reply, rx) = oneshot::channel();
        self.inner.send(Event::Paths { reply })?;
        self.inner.wait(rx).await
    }

    /// Not supported; deadlines must be layered on top
    pub fn set_deadline(&self, _deadline: Instant) -> io::Result<()> {
        Err(Error::NotImplemented("set_deadline").into())
    }

    /// Not supported; deadlines must be layered on top
    pub fn set_read_deadline(&self, _deadline: Instant) -> io::Result<()> {
        Err(Error::NotImplemented("set_read_deadline").into())
    }

    /// Not supported; deadlines must be layered on top
    pub fn set_write_deadline(&self, _deadline: Instant) -> io::Result<()> {
        Err(Error::NotImplemented("set_write_deadline").into())
    }

    /// Turn into a tokio `AsyncRead + AsyncWrite` stream
    pub fn into_stream(self) -> ConnStream {
        ConnStream::new(self.inner)
    }
}

impl fmt::Debug for Conn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Conn")
            .field("addr", &self.inner.state.addr)
            .field("bytes_received", &self.bytes_received())
            .field("closed", &self.is_closed())
            .finish()
    }
}
