//! Per-connection coordination task
//!
//! Owns the admitted paths, the replay buffer and the race counters. Every
//! state change goes through [`Event`]s posted by the caller, the dial tasks
//! and the read mergers, so nothing here needs a lock.
//!
//! A path has at most one read outstanding. Reads only go to idle paths; a
//! busy path keeps reporting to the merge that started its read. When every
//! path is busy the request waits until one of them finishes.

use std::collections::{HashSet, VecDeque};
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinSet;
use tracing::{debug, trace};

use super::merge::{self, MergeMsg, Merger};
use super::replay::ReplayBuffer;
use super::ConnState;
use crate::error::Error;
use crate::path::{PathConn, PathKind};

/// Everything the coordination task reacts to
pub(crate) enum Event {
    /// A dial produced a path
    Admit(PathConn),
    /// A dial failed or was skipped
    DialFailed(Error),
    /// Drop a path that was closed during a read
    Remove(u64),
    /// A path's outstanding read returned
    ReadDone(u64),
    Read {
        len: usize,
        reply: oneshot::Sender<io::Result<Bytes>>,
    },
    Write {
        data: Bytes,
        reply: oneshot::Sender<io::Result<usize>>,
    },
    Addr {
        local: bool,
        reply: oneshot::Sender<io::Result<SocketAddr>>,
    },
    Paths {
        reply: oneshot::Sender<io::Result<Vec<PathKind>>>,
    },
}

/// Progress reported back to the waiting dial call
#[derive(Debug)]
pub(crate) enum DialOutcome {
    /// A path was admitted
    Ready,
    /// A dial failed
    Failed(Error),
    /// A dial succeeded but its path was not admitted
    Rejected,
}

/// The live merge of the connection's first read, which late paths may join
struct FirstRead {
    merge: mpsc::UnboundedSender<MergeMsg>,
    len: usize,
}

pub(crate) struct IoLoop {
    state: Arc<ConnState>,
    events_tx: mpsc::UnboundedSender<Event>,
    events: mpsc::UnboundedReceiver<Event>,
    outcome: mpsc::UnboundedSender<DialOutcome>,
    paths: Vec<Arc<PathConn>>,
    replay: ReplayBuffer,
    /// Paths with a read outstanding
    reading: HashSet<u64>,
    /// Reads waiting for a path to become idle
    parked: VecDeque<(usize, oneshot::Sender<io::Result<Bytes>>)>,
    /// Dials that have neither been admitted nor failed
    pending_dials: usize,
    ever_admitted: bool,
    ready_sent: bool,
    first_read: Option<FirstRead>,
}

impl IoLoop {
    pub(crate) fn new(
        state: Arc<ConnState>,
        events_tx: mpsc::UnboundedSender<Event>,
        events: mpsc::UnboundedReceiver<Event>,
        outcome: mpsc::UnboundedSender<DialOutcome>,
        dials: usize,
    ) -> Self {
        Self {
            state,
            events_tx,
            events,
            outcome,
            paths: Vec::with_capacity(dials),
            replay: ReplayBuffer::default(),
            reading: HashSet::new(),
            parked: VecDeque::new(),
            pending_dials: dials,
            ever_admitted: false,
            ready_sent: false,
            first_read: None,
        }
    }

    pub(crate) async fn run(mut self) {
        let mut closed = self.state.subscribe_closed();
        loop {
            let event = tokio::select! {
                biased;
                _ = closed.wait_for(|c| *c) => break,
                event = self.events.recv() => match event {
                    Some(event) => event,
                    None => break,
                },
            };
            tokio::select! {
                biased;
                _ = closed.wait_for(|c| *c) => break,
                _ = self.handle(event) => {}
            }
        }
        self.teardown().await;
    }

    async fn handle(&mut self, event: Event) {
        match event {
            Event::Admit(path) => self.admit(Arc::new(path)).await,
            Event::DialFailed(err) => {
                trace!(addr = self.state.addr(), "Dial failed: {}", err);
                let _ = self.outcome.send(DialOutcome::Failed(err));
                self.dial_resolved();
            }
            Event::Remove(id) => self.remove(id),
            Event::ReadDone(id) => self.read_done(id),
            Event::Read { len, reply } => self.read(len, reply),
            Event::Write { data, reply } => {
                let result = self.write(data).await;
                let _ = reply.send(result);
            }
            Event::Addr { local, reply } => {
                let _ = reply.send(self.addr(local));
            }
            Event::Paths { reply } => {
                let _ = reply.send(Ok(self.paths.iter().map(|p| p.kind()).collect()));
            }
        }
    }

    async fn admit(&mut self, path: Arc<PathConn>) {
        let addr = self.state.addr();
        let kind = path.kind();

        let replayed = if self.state.data_received() {
            trace!(addr, %kind, "Connection available after data received, closing");
            None
        } else if self.replay.is_blocked() {
            trace!(addr, %kind, "Not replaying nonidempotent request, only adding to whitelist");
            path.whitelist_temporarily();
            None
        } else if self.replay.is_empty() {
            Some(false)
        } else {
            trace!(addr, %kind, "Replaying {} previous bytes", self.replay.len());
            match path.write(&self.replay.contents()).await {
                Ok(_) => Some(true),
                Err(e) => {
                    debug!(addr, %kind, "Failed to replay: {}", e);
                    None
                }
            }
        };

        match replayed {
            None => {
                path.discard().await;
                let _ = self.outcome.send(DialOutcome::Rejected);
            }
            Some(replayed) => {
                trace!(addr, %kind, replayed, "Admitting connection");
                self.paths.push(Arc::clone(&path));
                self.ever_admitted = true;
                if !self.ready_sent {
                    self.ready_sent = true;
                    let _ = self.outcome.send(DialOutcome::Ready);
                }
                self.join_first_read(path);
            }
        }
        self.dial_resolved();
    }

    /// Let a newly admitted path answer a first read that is still waiting
    fn join_first_read(&mut self, path: Arc<PathConn>) {
        let Some(first) = &self.first_read else {
            return;
        };
        if first.merge.send(MergeMsg::Join).is_err() {
            self.first_read = None;
            return;
        }
        trace!(addr = self.state.addr(), kind = %path.kind(), "Re-reading on late connection");
        self.reading.insert(path.id());
        merge::spawn_reader(
            path,
            first.len,
            true,
            Arc::clone(&self.state),
            self.events_tx.clone(),
            first.merge.clone(),
        );
    }

    fn dial_resolved(&mut self) {
        self.pending_dials = self.pending_dials.saturating_sub(1);
        if self.pending_dials == 0 {
            self.seal_first_read();
        }
    }

    fn seal_first_read(&mut self) {
        if let Some(first) = self.first_read.take() {
            let _ = first.merge.send(MergeMsg::Seal);
        }
    }

    fn remove(&mut self, id: u64) {
        if let Some(pos) = self.paths.iter().position(|p| p.id() == id) {
            let path = self.paths.remove(pos);
            trace!(addr = self.state.addr(), kind = %path.kind(), "Removed connection");
        }
        if self.paths.is_empty() {
            for (_, reply) in std::mem::take(&mut self.parked) {
                let _ = reply.send(Err(self.no_path()));
            }
        }
    }

    /// Forget paths closed by a merger whose removal has not arrived yet
    fn prune(&mut self) {
        self.paths.retain(|p| !p.is_closed());
    }

    fn read_done(&mut self, id: u64) {
        self.reading.remove(&id);
        while let Some((len, reply)) = self.parked.pop_front() {
            if reply.is_closed() {
                continue;
            }
            self.read(len, reply);
            break;
        }
    }

    fn read(&mut self, len: usize, reply: oneshot::Sender<io::Result<Bytes>>) {
        self.prune();
        if self.paths.is_empty() {
            let _ = reply.send(Err(self.no_path()));
            return;
        }

        let idle: Vec<Arc<PathConn>> = self
            .paths
            .iter()
            .filter(|p| !self.reading.contains(&p.id()))
            .cloned()
            .collect();
        if idle.is_empty() {
            trace!(addr = self.state.addr(), "Every connection is busy reading, waiting");
            self.parked.push_back((len, reply));
            return;
        }
        self.reading.extend(idle.iter().map(|p| p.id()));

        let first = !self.state.data_received();
        if idle.len() == 1 && (self.pending_dials == 0 || !first) {
            let path = Arc::clone(&idle[0]);
            tokio::spawn(read_single(
                path,
                len,
                first,
                Arc::clone(&self.state),
                self.events_tx.clone(),
                reply,
            ));
            return;
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let sealed = !first || self.pending_dials == 0;
        if first {
            self.seal_first_read();
            if !sealed {
                self.first_read = Some(FirstRead {
                    merge: tx.clone(),
                    len,
                });
            }
        }
        trace!(
            addr = self.state.addr(),
            readers = idle.len(),
            busy = self.paths.len() - idle.len(),
            first,
            "Fanning out read"
        );
        for path in &idle {
            merge::spawn_reader(
                Arc::clone(path),
                len,
                first,
                Arc::clone(&self.state),
                self.events_tx.clone(),
                tx.clone(),
            );
        }
        let merger = Merger::new(
            Arc::clone(&self.state),
            self.events_tx.clone(),
            rx,
            reply,
            idle.len(),
            sealed,
        );
        tokio::spawn(merger.run());
    }

    async fn write(&mut self, data: Bytes) -> io::Result<usize> {
        if !self.state.data_received() {
            self.replay.record(&data);
        }
        self.prune();
        if self.paths.is_empty() {
            return Err(self.no_path());
        }

        let mut writes = JoinSet::new();
        for path in &self.paths {
            let path = Arc::clone(path);
            let data = data.clone();
            writes.spawn(async move {
                let result = path.write(&data).await;
                (path, result)
            });
        }

        let mut last_n = None;
        let mut failed = Vec::new();
        while let Some(joined) = writes.join_next().await {
            match joined {
                Ok((path, Ok(n))) => {
                    trace!(addr = self.state.addr(), kind = %path.kind(), "Wrote {} bytes", n);
                    last_n = Some(n);
                }
                Ok((path, Err(e))) => {
                    debug!(addr = self.state.addr(), kind = %path.kind(), "Error writing: {}", e);
                    path.close().await;
                    failed.push(path.id());
                }
                Err(e) => debug!(addr = self.state.addr(), "Write task failed: {}", e),
            }
        }
        for id in failed {
            self.remove(id);
        }

        last_n.ok_or_else(|| {
            Error::WriteFailed {
                addr: self.state.addr().to_string(),
            }
            .into()
        })
    }

    fn addr(&self, local: bool) -> io::Result<SocketAddr> {
        let path = self
            .paths
            .iter()
            .find(|p| !p.is_closed())
            .or_else(|| self.paths.first());
        match path {
            Some(p) if local => p.local_addr(),
            Some(p) => p.peer_addr(),
            None if !self.ever_admitted => {
                panic!("address of {} queried with no admitted connection", self.state.addr())
            }
            None => Err(self.no_path()),
        }
    }

    fn no_path(&self) -> io::Error {
        Error::NoActivePath {
            addr: self.state.addr().to_string(),
        }
        .into()
    }

    async fn teardown(mut self) {
        trace!(addr = self.state.addr(), paths = self.paths.len(), "Tearing down");
        self.seal_first_read();
        for path in self.paths.drain(..) {
            path.close().await;
        }
        // Paths admitted after close was signalled are dropped unused
        self.events.close();
        while let Ok(event) = self.events.try_recv() {
            if let Event::Admit(path) = event {
                path.discard().await;
            }
        }
    }
}

/// Steady-state read: one path, relayed 1:1
async fn read_single(
    path: Arc<PathConn>,
    len: usize,
    first: bool,
    state: Arc<ConnState>,
    events: mpsc::UnboundedSender<Event>,
    reply: oneshot::Sender<io::Result<Bytes>>,
) {
    let mut buf = vec![0u8; len];
    let result = match path.read(&mut buf, first).await {
        Ok(n) => {
            state.add_read_bytes(n);
            buf.truncate(n);
            Ok(Bytes::from(buf))
        }
        Err(e) => {
            if !merge::keeps_path(&e) {
                trace!(addr = state.addr(), kind = %path.kind(), "Read failed, closing: {}", e);
                path.close().await;
                let _ = events.send(Event::Remove(path.id()));
            }
            Err(e)
        }
    };
    // Before the reply, so the caller's next read finds the path idle
    let _ = events.send(Event::ReadDone(path.id()));
    let _ = reply.send(result);
}
