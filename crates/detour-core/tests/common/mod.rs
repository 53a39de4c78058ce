//! Scripted streams and dialers shared by the integration tests

#![allow(dead_code)]

use std::collections::VecDeque;
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use detour_core::{Detector, Dial, FailureKind, Network, RawStream};
use parking_lot::Mutex;
use tokio::sync::Notify;

/// What the next read on a [`MockStream`] does
pub enum ReadStep {
    Data(&'static [u8]),
    Fail(io::ErrorKind),
    /// Never completes
    Hang,
    /// Wait for the notify, then run the next step
    WaitFor(Arc<Notify>),
}

/// What a test can observe about a [`MockStream`]
#[derive(Default)]
pub struct StreamProbe {
    written: Mutex<Vec<u8>>,
    shutdowns: AtomicUsize,
    reads: AtomicUsize,
}

impl StreamProbe {
    pub fn written(&self) -> Vec<u8> {
        self.written.lock().clone()
    }

    pub fn shutdowns(&self) -> usize {
        self.shutdowns.load(Ordering::SeqCst)
    }

    pub fn reads(&self) -> usize {
        self.reads.load(Ordering::SeqCst)
    }
}

pub struct MockStream {
    steps: Mutex<VecDeque<ReadStep>>,
    fail_writes: Option<io::ErrorKind>,
    peer: SocketAddr,
    probe: Arc<StreamProbe>,
}

impl MockStream {
    pub fn new(peer: &str, steps: Vec<ReadStep>) -> (Self, Arc<StreamProbe>) {
        let probe = Arc::new(StreamProbe::default());
        let stream = Self {
            steps: Mutex::new(steps.into()),
            fail_writes: None,
            peer: peer.parse().expect("peer address"),
            probe: Arc::clone(&probe),
        };
        (stream, probe)
    }

    pub fn failing_writes(mut self, kind: io::ErrorKind) -> Self {
        self.fail_writes = Some(kind);
        self
    }
}

#[async_trait]
impl RawStream for MockStream {
    async fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        self.probe.reads.fetch_add(1, Ordering::SeqCst);
        loop {
            let step = self.steps.lock().pop_front();
            match step {
                Some(ReadStep::Data(d)) => {
                    let n = d.len().min(buf.len());
                    buf[..n].copy_from_slice(&d[..n]);
                    return Ok(n);
                }
                Some(ReadStep::Fail(kind)) => return Err(kind.into()),
                Some(ReadStep::Hang) => std::future::pending::<()>().await,
                Some(ReadStep::WaitFor(notify)) => notify.notified().await,
                None => return Ok(0),
            }
        }
    }

    async fn write(&self, buf: &[u8]) -> io::Result<usize> {
        if let Some(kind) = self.fail_writes {
            return Err(kind.into());
        }
        self.probe.written.lock().extend_from_slice(buf);
        Ok(buf.len())
    }

    async fn shutdown(&self) -> io::Result<()> {
        self.probe.shutdowns.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        Ok("127.0.0.1:50000".parse().expect("local address"))
    }

    fn peer_addr(&self) -> io::Result<SocketAddr> {
        Ok(self.peer)
    }
}

/// What the next dial on a [`MockDial`] does
pub enum DialStep {
    Connect(MockStream),
    Refuse(io::ErrorKind),
    Hang,
    After(Duration, Box<DialStep>),
}

impl DialStep {
    pub fn after(delay_ms: u64, step: DialStep) -> Self {
        Self::After(Duration::from_millis(delay_ms), Box::new(step))
    }
}

#[derive(Default)]
struct DialState {
    steps: Mutex<VecDeque<DialStep>>,
    calls: AtomicUsize,
    addrs: Mutex<Vec<String>>,
}

/// Dialer replaying a fixed script; clones share the script and counters
#[derive(Clone, Default)]
pub struct MockDial {
    state: Arc<DialState>,
}

impl MockDial {
    pub fn new(steps: Vec<DialStep>) -> Self {
        let dial = Self::default();
        *dial.state.steps.lock() = steps.into();
        dial
    }

    pub fn calls(&self) -> usize {
        self.state.calls.load(Ordering::SeqCst)
    }

    pub fn addrs(&self) -> Vec<String> {
        self.state.addrs.lock().clone()
    }
}

#[async_trait]
impl Dial for MockDial {
    async fn dial(&self, _network: Network, addr: &str) -> io::Result<Box<dyn RawStream>> {
        self.state.calls.fetch_add(1, Ordering::SeqCst);
        self.state.addrs.lock().push(addr.to_string());
        let step = self.state.steps.lock().pop_front();
        let mut step = step.unwrap_or(DialStep::Refuse(io::ErrorKind::ConnectionRefused));
        loop {
            match step {
                DialStep::Connect(stream) => return Ok(Box::new(stream)),
                DialStep::Refuse(kind) => return Err(kind.into()),
                DialStep::Hang => std::future::pending::<()>().await,
                DialStep::After(delay, next) => {
                    tokio::time::sleep(delay).await;
                    step = *next;
                }
            }
        }
    }
}

/// Detector treating a fixed set of failure kinds as tampering and counting
/// fake-page checks
#[derive(Default)]
pub struct ScriptedDetector {
    tampering: Vec<FailureKind>,
    fake_checks: AtomicUsize,
}

impl ScriptedDetector {
    pub fn tampering(kinds: &[FailureKind]) -> Self {
        Self {
            tampering: kinds.to_vec(),
            fake_checks: AtomicUsize::new(0),
        }
    }

    pub fn fake_checks(&self) -> usize {
        self.fake_checks.load(Ordering::SeqCst)
    }
}

impl Detector for ScriptedDetector {
    fn resolution_is_poisoned(&self, _peer: SocketAddr) -> bool {
        false
    }

    fn tampering_suspected(&self, kind: FailureKind) -> bool {
        self.tampering.contains(&kind)
    }

    fn fake_response(&self, _first_bytes: &[u8]) -> bool {
        self.fake_checks.fetch_add(1, Ordering::SeqCst);
        false
    }
}

/// Poll `check` until it holds or a second has passed
pub async fn eventually<F, Fut>(mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    for _ in 0..100 {
        if check().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}

pub const GET: &[u8] = b"GET / HTTP/1.1\r\nHost: example.com\r\n\r\n";
pub const POST: &[u8] = b"POST /x HTTP/1.1\r\nHost: example.com\r\nContent-Length: 0\r\n\r\n";
pub const OK: &[u8] = b"HTTP/1.1 200 OK\r\nContent-Length: 0\r\n\r\n";
