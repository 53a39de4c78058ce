//! Direct path: raw connect plus interference checks

use std::io;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::timeout;
use tracing::{debug, trace};

use super::{PathConn, PathContext, PathKind};
use crate::detector::FailureKind;
use crate::error::{Error, Result};
use crate::stream::{Dial, Network};

/// Dial `addr` directly, whitelisting it temporarily on detected interference
pub(crate) async fn dial(
    dialer: &dyn Dial,
    network: Network,
    addr: &str,
    connect_timeout: Duration,
    ctx: Arc<PathContext>,
) -> Result<PathConn> {
    trace!(addr, "Dialing direct connection");
    let detector = ctx.detector.load();

    let result = match timeout(connect_timeout, dialer.dial(network, addr)).await {
        Ok(r) => r,
        Err(_) => Err(io::Error::new(
            io::ErrorKind::TimedOut,
            format!("direct dial to {addr} timed out"),
        )),
    };

    match result {
        Ok(stream) => {
            let poisoned = stream
                .peer_addr()
                .map(|peer| detector.resolution_is_poisoned(peer))
                .unwrap_or(false);
            if poisoned {
                if let Err(e) = stream.shutdown().await {
                    debug!(addr, "Error closing direct connection: {}", e);
                }
                debug!(addr, "Dial directly, DNS hijacked");
                ctx.whitelist.add(addr, false);
                return Err(Error::DnsHijacked {
                    addr: addr.to_string(),
                });
            }
            trace!(addr, "Dial directly succeeded");
            Ok(PathConn::new(PathKind::Direct, addr, stream, ctx))
        }
        Err(e) => {
            if detector.tampering_suspected(FailureKind::of(&e)) {
                debug!(addr, "Dial directly, tampering suspected: {}", e);
                ctx.whitelist.add(addr, false);
            } else {
                debug!(addr, "Dial directly failed: {}", e);
            }
            Err(Error::Io(e))
        }
    }
}

/// Classify a direct read
pub(super) fn check_read(
    conn: &PathConn,
    buf: &[u8],
    result: io::Result<usize>,
    first: bool,
) -> io::Result<usize> {
    let addr = conn.addr.as_str();
    let detector = conn.ctx.detector.load();

    match result {
        Ok(n) if first && detector.fake_response(&buf[..n]) => {
            debug!(addr, "Read {} bytes directly, response is hijacked", n);
            conn.mark_errored();
            conn.ctx.whitelist.add(addr, false);
            Err(Error::FakeResponse {
                addr: addr.to_string(),
            }
            .into())
        }
        Ok(n) => {
            trace!(addr, first, "Read {} bytes directly", n);
            Ok(n)
        }
        Err(e) => {
            conn.mark_errored();
            if detector.tampering_suspected(FailureKind::of(&e)) {
                debug!(addr, "Read directly, tampering suspected: {}", e);
                conn.ctx.whitelist.add(addr, false);
            } else {
                trace!(addr, "Read directly failed: {}", e);
            }
            Err(e)
        }
    }
}

pub(super) fn on_close(conn: &PathConn, clean: bool) {
    let addr = conn.addr.as_str();
    if !clean || conn.ctx.whitelist.is_temporary(addr) {
        return;
    }
    if let Some(tx) = &conn.ctx.direct_ok {
        trace!(addr, "No error till closing, notifying that it can be dialed directly");
        // Never block on a slow or absent reader
        let _ = tx.try_send(addr.to_string());
    }
}
