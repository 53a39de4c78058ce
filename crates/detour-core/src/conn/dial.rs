//! Dial orchestration
//!
//! Decides how many paths to race, starts their dials and waits for the
//! first one to be admitted.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::sync::mpsc::error::SendError;
use tokio::time::{sleep, timeout};
use tracing::{debug, instrument, trace};

use super::ioloop::{DialOutcome, Event, IoLoop};
use super::{Conn, ConnState};
use crate::config::{Config, DialSettings};
use crate::detector::DetectorHandle;
use crate::error::{Error, Result};
use crate::path::{detour, direct, PathConn, PathContext};
use crate::stream::{Dial, Network, TcpDial};
use crate::whitelist::Whitelist;

/// Opens [`Conn`]s, racing direct against detour unless the address is whitelisted
///
/// One dialer is meant to be shared by every connection of an application so
/// they all learn from the same whitelist and detector.
pub struct Dialer {
    direct: Arc<dyn Dial>,
    detour: Arc<dyn Dial>,
    ctx: Arc<PathContext>,
    settings: DialSettings,
}

impl Dialer {
    /// Start building a dialer around the detour transport
    pub fn builder<D: Dial + 'static>(detour: D) -> DialerBuilder {
        DialerBuilder::new(Arc::new(detour))
    }

    /// Shared whitelist
    pub fn whitelist(&self) -> &Arc<Whitelist> {
        &self.ctx.whitelist
    }

    /// Shared detector handle
    pub fn detector(&self) -> &Arc<DetectorHandle> {
        &self.ctx.detector
    }

    /// Timing and buffering in use
    pub fn settings(&self) -> DialSettings {
        self.settings
    }

    /// Dial with a network name (`tcp`, `tcp4` or `tcp6`)
    pub async fn dial_network(&self, network: &str, addr: &str) -> Result<Conn> {
        self.dial(network.parse()?, addr).await
    }

    /// Dial `addr`, returning as soon as one path is admitted
    #[instrument(level = "trace", skip(self))]
    pub async fn dial(&self, network: Network, addr: &str) -> Result<Conn> {
        let race = !self.ctx.whitelist.contains(addr);
        let dials = if race { 2 } else { 1 };
        trace!(race, "Dialing");

        let state = Arc::new(ConnState::new(addr, self.settings.buffer_size));
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (outcome_tx, mut outcome_rx) = mpsc::unbounded_channel();

        let io_loop = IoLoop::new(
            Arc::clone(&state),
            events_tx.clone(),
            events_rx,
            outcome_tx,
            dials,
        );
        let conn = Conn::new(Arc::clone(&state), events_tx.clone(), tokio::spawn(io_loop.run()));

        if race {
            self.spawn_direct(network, &state, events_tx.clone());
        }
        self.spawn_detour(network, race, &state, events_tx);

        let wait = async {
            let mut failures = 0;
            let mut last_err = None;
            while let Some(outcome) = outcome_rx.recv().await {
                match outcome {
                    DialOutcome::Ready => return Ok(()),
                    DialOutcome::Failed(e) => last_err = Some(e),
                    DialOutcome::Rejected => {}
                }
                failures += 1;
                if failures >= dials {
                    break;
                }
            }
            Err(last_err.unwrap_or_else(|| Error::closed(addr)))
        };

        match timeout(self.settings.timeout_to_connect, wait).await {
            Ok(Ok(())) => Ok(conn),
            Ok(Err(e)) => {
                debug!("Dial failed: {}", e);
                let _ = conn.close().await;
                Err(e)
            }
            Err(_) => {
                debug!("Timeout dialing any connection");
                let _ = conn.close().await;
                Err(Error::DialTimeout {
                    addr: addr.to_string(),
                    timeout: self.settings.timeout_to_connect,
                })
            }
        }
    }

    fn spawn_direct(
        &self,
        network: Network,
        state: &Arc<ConnState>,
        events: mpsc::UnboundedSender<Event>,
    ) {
        let dialer = Arc::clone(&self.direct);
        let ctx = Arc::clone(&self.ctx);
        let state = Arc::clone(state);
        let connect_timeout = self.settings.timeout_to_connect;

        tokio::spawn(async move {
            let mut closed = state.subscribe_closed();
            let result = tokio::select! {
                _ = closed.wait_for(|c| *c) => return,
                r = direct::dial(dialer.as_ref(), network, state.addr(), connect_timeout, ctx) => r,
            };
            if result.is_err() {
                state.hint_dial_detour();
            }
            submit(result, &events).await;
        });
    }

    fn spawn_detour(
        &self,
        network: Network,
        race: bool,
        state: &Arc<ConnState>,
        events: mpsc::UnboundedSender<Event>,
    ) {
        let dialer = Arc::clone(&self.detour);
        let ctx = Arc::clone(&self.ctx);
        let state = Arc::clone(state);
        let delay = self.settings.delay_before_detour;

        tokio::spawn(async move {
            let mut closed = state.subscribe_closed();
            if race {
                tokio::select! {
                    _ = closed.wait_for(|c| *c) => return,
                    _ = sleep(delay) => {}
                    _ = state.dial_detour_hinted() => {
                        trace!(addr = state.addr(), "Dialing detour now");
                    }
                }
                if state.data_received() {
                    let _ = events.send(Event::DialFailed(Error::DetourSkipped {
                        addr: state.addr().to_string(),
                    }));
                    return;
                }
            }
            let result = tokio::select! {
                _ = closed.wait_for(|c| *c) => return,
                r = detour::dial(dialer.as_ref(), network, state.addr(), ctx) => r,
            };
            submit(result, &events).await;
        });
    }
}

/// Hand a dial result to the coordination task, closing the path if it is gone
async fn submit(result: Result<PathConn>, events: &mpsc::UnboundedSender<Event>) {
    let event = match result {
        Ok(path) => Event::Admit(path),
        Err(e) => Event::DialFailed(e),
    };
    if let Err(SendError(Event::Admit(path))) = events.send(event) {
        trace!(kind = %path.kind(), "Connection established too late, closing");
        path.discard().await;
    }
}

impl fmt::Debug for Dialer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dialer")
            .field("settings", &self.settings)
            .field("whitelist_len", &self.ctx.whitelist.len())
            .finish_non_exhaustive()
    }
}

/// Builder for [`Dialer`]
pub struct DialerBuilder {
    detour: Arc<dyn Dial>,
    direct: Option<Arc<dyn Dial>>,
    whitelist: Option<Arc<Whitelist>>,
    detector: Option<Arc<DetectorHandle>>,
    direct_ok: Option<mpsc::Sender<String>>,
    settings: DialSettings,
}

impl DialerBuilder {
    fn new(detour: Arc<dyn Dial>) -> Self {
        Self {
            detour,
            direct: None,
            whitelist: None,
            detector: None,
            direct_ok: None,
            settings: DialSettings::default(),
        }
    }

    /// Replace the plain TCP dialer used for the direct path
    pub fn direct<D: Dial + 'static>(mut self, direct: D) -> Self {
        self.direct = Some(Arc::new(direct));
        self
    }

    /// Share an existing whitelist
    pub fn whitelist(mut self, whitelist: Arc<Whitelist>) -> Self {
        self.whitelist = Some(whitelist);
        self
    }

    /// Share an existing detector handle
    pub fn detector(mut self, detector: Arc<DetectorHandle>) -> Self {
        self.detector = Some(detector);
        self
    }

    /// Receive addresses whose direct connection closed cleanly
    pub fn notify_direct_ok(mut self, tx: mpsc::Sender<String>) -> Self {
        self.direct_ok = Some(tx);
        self
    }

    /// Set all timing and buffering at once
    pub fn settings(mut self, settings: DialSettings) -> Self {
        self.settings = settings;
        self
    }

    /// Overall bound on establishing a connection
    pub fn timeout_to_connect(mut self, timeout: Duration) -> Self {
        self.settings.timeout_to_connect = timeout;
        self
    }

    /// Head start given to the direct path
    pub fn delay_before_detour(mut self, delay: Duration) -> Self {
        self.settings.delay_before_detour = delay;
        self
    }

    /// Per-path read buffer size
    pub fn buffer_size(mut self, size: usize) -> Self {
        self.settings.buffer_size = size;
        self
    }

    /// Apply the `[dial]` and `[detector]` sections of a configuration
    pub fn config(mut self, config: &Config) -> Self {
        self.settings = DialSettings::from(&config.dial);
        self.detector = Some(Arc::new(DetectorHandle::for_country(&config.detector.country)));
        self
    }

    /// Build the dialer
    pub fn build(self) -> Dialer {
        Dialer {
            direct: self.direct.unwrap_or_else(|| Arc::new(TcpDial::new())),
            detour: self.detour,
            ctx: Arc::new(PathContext {
                whitelist: self.whitelist.unwrap_or_default(),
                detector: self.detector.unwrap_or_default(),
                direct_ok: self.direct_ok,
            }),
            settings: self.settings,
        }
    }
}
