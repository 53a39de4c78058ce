//! Interference detection
//!
//! A [`Detector`] answers three questions for the direct path:
//! - did name resolution land on a hijack address
//! - does a dial/read failure look like active tampering
//! - do the first response bytes match an injected page
//!
//! Detectors only ever see values: the peer address of a fresh connection,
//! a [`FailureKind`] tag and a byte slice. The active detector lives behind a
//! [`DetectorHandle`] and can be swapped at runtime (e.g. on country change).

mod rules;

pub use rules::{CountryRules, GENERIC};

use parking_lot::RwLock;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::debug;

/// Closed classification of dial and read failures
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailureKind {
    /// Operation timed out
    Timeout,
    /// Remote refused the connection
    ConnectionRefused,
    /// Connection reset or aborted
    Reset,
    /// Write side broken
    BrokenPipe,
    /// Anything else
    Other,
}

impl FailureKind {
    /// Classify an I/O error
    pub fn of(err: &io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock => Self::Timeout,
            io::ErrorKind::ConnectionRefused => Self::ConnectionRefused,
            io::ErrorKind::ConnectionReset | io::ErrorKind::ConnectionAborted => Self::Reset,
            io::ErrorKind::BrokenPipe => Self::BrokenPipe,
            _ => Self::Other,
        }
    }

    /// Check if this is a timeout
    pub fn is_timeout(self) -> bool {
        self == Self::Timeout
    }
}

/// Interference detection policy
#[cfg_attr(test, mockall::automock)]
pub trait Detector: Send + Sync {
    /// True if a freshly dialed connection to `peer` shows DNS-hijack evidence
    fn resolution_is_poisoned(&self, peer: SocketAddr) -> bool;

    /// True if a failure of this kind indicates active interference
    fn tampering_suspected(&self, kind: FailureKind) -> bool;

    /// True if the first bytes of a response match an injected page
    fn fake_response(&self, first_bytes: &[u8]) -> bool;
}

/// Detector driven by a country rule table
#[derive(Debug, Clone, Copy)]
pub struct CountryDetector {
    rules: &'static CountryRules,
}

impl CountryDetector {
    /// Detector for an ISO 3166-1 alpha-2 country code; unknown codes get generic rules
    pub fn new(country: &str) -> Self {
        Self {
            rules: rules::for_country(country),
        }
    }

    /// Country code of the rule table in use, empty for generic rules
    pub fn country(&self) -> &'static str {
        self.rules.country
    }
}

impl Default for CountryDetector {
    fn default() -> Self {
        Self { rules: &GENERIC }
    }
}

impl Detector for CountryDetector {
    fn resolution_is_poisoned(&self, peer: SocketAddr) -> bool {
        self.rules.dns_redirects.contains(&peer.ip())
    }

    fn tampering_suspected(&self, kind: FailureKind) -> bool {
        self.rules.tampering.contains(&kind)
    }

    fn fake_response(&self, first_bytes: &[u8]) -> bool {
        self.rules
            .fake_responses
            .iter()
            .any(|sig| first_bytes.starts_with(sig))
    }
}

/// Atomically swappable handle to the active detector
///
/// Every check should [`load`](DetectorHandle::load) once and use that
/// snapshot, so a concurrent swap is never observed halfway.
pub struct DetectorHandle {
    current: RwLock<Arc<dyn Detector>>,
}

impl DetectorHandle {
    /// Create a handle around a detector
    pub fn new(detector: Arc<dyn Detector>) -> Self {
        Self {
            current: RwLock::new(detector),
        }
    }

    /// Create a handle using the rules for `country`
    pub fn for_country(country: &str) -> Self {
        Self::new(Arc::new(CountryDetector::new(country)))
    }

    /// Snapshot of the active detector
    pub fn load(&self) -> Arc<dyn Detector> {
        Arc::clone(&self.current.read())
    }

    /// Replace the active detector
    pub fn store(&self, detector: Arc<dyn Detector>) {
        *self.current.write() = detector;
    }

    /// Switch to the rules for `country`
    pub fn set_country(&self, country: &str) {
        let detector = CountryDetector::new(country);
        debug!(requested = country, using = detector.country(), "Switching detector");
        self.store(Arc::new(detector));
    }
}

impl Default for DetectorHandle {
    fn default() -> Self {
        Self::new(Arc::new(CountryDetector::default()))
    }
}

impl std::fmt::Debug for DetectorHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DetectorHandle").finish_non_exhaustive()
    }
}
