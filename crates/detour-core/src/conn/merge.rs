//! Read fan-out and first-winner merge
//!
//! Each idle path gets one reader task per read request; results flow into
//! one [`Merger`] per request. The merger hands the first trustworthy result
//! to the caller and drops every path whose data arrives after that, since
//! bytes that were read cannot be un-read.

use std::io;
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, trace};

use super::ioloop::Event;
use super::ConnState;
use crate::detector::FailureKind;
use crate::error::Error;
use crate::path::{PathConn, PathKind};

/// Only timeouts leave a path usable after a failed read
pub(crate) fn keeps_path(err: &io::Error) -> bool {
    FailureKind::of(err).is_timeout()
}

pub(crate) struct ReadResult {
    path: Arc<PathConn>,
    result: io::Result<Bytes>,
    /// The path had already been closed by us when the read returned
    stale: bool,
}

pub(crate) enum MergeMsg {
    Result(ReadResult),
    /// Another reader will report to this merge
    Join,
    /// No more readers will join
    Seal,
}

/// Read once from `path` on behalf of a merge
pub(crate) fn spawn_reader(
    path: Arc<PathConn>,
    len: usize,
    first: bool,
    state: Arc<ConnState>,
    events: mpsc::UnboundedSender<Event>,
    merge: mpsc::UnboundedSender<MergeMsg>,
) {
    tokio::spawn(async move {
        trace!(addr = state.addr(), kind = %path.kind(), first, "Reading");
        let mut buf = BytesMut::zeroed(len);
        let result = path.read(&mut buf, first).await;
        let _ = events.send(Event::ReadDone(path.id()));
        let stale = result.is_err() && path.is_closed();
        if result.is_err() && !stale && path.kind() == PathKind::Direct {
            // Just a hint, the detour dial may already be running
            state.hint_dial_detour();
        }
        let result = result.map(|n| {
            buf.truncate(n);
            buf.freeze()
        });
        let _ = merge.send(MergeMsg::Result(ReadResult {
            path,
            result,
            stale,
        }));
    });
}

pub(crate) struct Merger {
    state: Arc<ConnState>,
    events: mpsc::UnboundedSender<Event>,
    rx: mpsc::UnboundedReceiver<MergeMsg>,
    reply: Option<oneshot::Sender<io::Result<Bytes>>>,
    /// Readers that have not reported yet
    awaiting: usize,
    sealed: bool,
    received: usize,
    last_err: Option<io::Error>,
}

impl Merger {
    pub(crate) fn new(
        state: Arc<ConnState>,
        events: mpsc::UnboundedSender<Event>,
        rx: mpsc::UnboundedReceiver<MergeMsg>,
        reply: oneshot::Sender<io::Result<Bytes>>,
        readers: usize,
        sealed: bool,
    ) -> Self {
        Self {
            state,
            events,
            rx,
            reply: Some(reply),
            awaiting: readers,
            sealed,
            received: 0,
            last_err: None,
        }
    }

    pub(crate) async fn run(mut self) {
        let mut closed = self.state.subscribe_closed();
        while self.awaiting > 0 || !self.sealed {
            let msg = tokio::select! {
                _ = closed.wait_for(|c| *c) => {
                    if let Some(reply) = self.reply.take() {
                        let _ = reply.send(Err(self.state.closed_error()));
                    }
                    return;
                }
                msg = self.rx.recv() => msg,
            };
            match msg {
                Some(MergeMsg::Join) => self.awaiting += 1,
                Some(MergeMsg::Seal) => self.sealed = true,
                Some(MergeMsg::Result(result)) => {
                    self.awaiting = self.awaiting.saturating_sub(1);
                    self.merge(result).await;
                }
                None => break,
            }
        }

        if let Some(reply) = self.reply.take() {
            let err = self.last_err.take().unwrap_or_else(|| {
                Error::NoActivePath {
                    addr: self.state.addr().to_string(),
                }
                .into()
            });
            trace!(addr = self.state.addr(), "Nothing left to read from: {}", err);
            let _ = reply.send(Err(err));
        }
    }

    async fn merge(&mut self, read: ReadResult) {
        let ReadResult {
            path,
            result,
            stale,
        } = read;
        let index = self.received;
        self.received += 1;
        let addr = self.state.addr();
        let kind = path.kind();

        match result {
            Err(e) if stale => {
                trace!(addr, %kind, "Read on closed connection: {}", e);
                self.remove(&path);
                self.last_err.get_or_insert(e);
            }
            Err(e) => {
                if !keeps_path(&e) {
                    trace!(addr, %kind, "Read failed, closing: {}", e);
                    path.close().await;
                    self.remove(&path);
                }
                if index == 0 && kind == PathKind::Direct {
                    debug!(addr, %kind, "Ignoring first error: {}", e);
                    self.last_err = Some(e);
                } else if self.reply.is_some() {
                    self.deliver(Err(e));
                } else {
                    trace!(addr, %kind, "Ignoring late error: {}", e);
                }
            }
            Ok(data) => {
                if self.reply.is_none() {
                    trace!(addr, %kind, "Ignoring late copy of response, closing");
                    path.discard().await;
                    self.remove(&path);
                } else {
                    trace!(addr, %kind, "Read {} bytes", data.len());
                    self.deliver(Ok(data));
                }
            }
        }
    }

    fn deliver(&mut self, result: io::Result<Bytes>) {
        if let Some(reply) = self.reply.take() {
            if let Ok(data) = &result {
                self.state.add_read_bytes(data.len());
            }
            let _ = reply.send(result);
        }
    }

    fn remove(&self, path: &PathConn) {
        let _ = self.events.send(Event::Remove(path.id()));
    }
}
