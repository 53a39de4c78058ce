//! Detour path: trusted, no interference checks

use std::io;
use std::sync::Arc;

use tracing::{debug, trace};

use super::{PathConn, PathContext, PathKind};
use crate::error::{Error, Result};
use crate::stream::{Dial, Network};

pub(crate) async fn dial(
    dialer: &dyn Dial,
    network: Network,
    addr: &str,
    ctx: Arc<PathContext>,
) -> Result<PathConn> {
    trace!(addr, "Dialing detour connection");
    match dialer.dial(network, addr).await {
        Ok(stream) => {
            trace!(addr, "Dial detour succeeded");
            Ok(PathConn::new(PathKind::Detour, addr, stream, ctx))
        }
        Err(e) => {
            debug!(addr, "Dial detour failed: {}", e);
            Err(Error::Io(e))
        }
    }
}

/// A failing detour means the address should not have been forced through it
pub(super) fn check_read(conn: &PathConn, result: io::Result<usize>) -> io::Result<usize> {
    if let Err(e) = &result {
        debug!(addr = %conn.addr, "Read from detour failed: {}", e);
        conn.mark_errored();
        conn.ctx.whitelist.remove(&conn.addr);
    }
    result
}

pub(super) fn on_close(conn: &PathConn, clean: bool) {
    if clean {
        trace!(addr = %conn.addr, "No error till closing, adding to whitelist");
        conn.ctx.whitelist.add(&conn.addr, true);
    }
}
