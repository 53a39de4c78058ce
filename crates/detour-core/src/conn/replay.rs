//! Write-replay buffer

use bytes::{Bytes, BytesMut};

const NONIDEMPOTENT_METHODS: [&[u8]; 3] = [b"PUT ", b"POST ", b"PATCH "];

/// True if `payload` starts a PUT, POST or PATCH request.
///
/// The TLS handshake and every other method are considered safe to resend.
pub fn is_nonidempotent_request(payload: &[u8]) -> bool {
    payload.len() > 4
        && NONIDEMPOTENT_METHODS
            .iter()
            .any(|method| payload.starts_with(method))
}

/// Writes made before any response arrived, kept for late paths
#[derive(Debug, Default)]
pub(crate) struct ReplayBuffer {
    buf: BytesMut,
    blocked: bool,
}

impl ReplayBuffer {
    /// Classify and record one write. Once blocked, nothing more is kept.
    pub(crate) fn record(&mut self, payload: &[u8]) {
        if self.blocked {
            return;
        }
        if is_nonidempotent_request(payload) {
            self.blocked = true;
            self.buf.clear();
        } else {
            self.buf.extend_from_slice(payload);
        }
    }

    /// A non-idempotent request was written; late paths must not replay
    pub(crate) fn is_blocked(&self) -> bool {
        self.blocked
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub(crate) fn len(&self) -> usize {
        self.buf.len()
    }

    /// Everything recorded so far, in write order
    pub(crate) fn contents(&self) -> Bytes {
        Bytes::copy_from_slice(&self.buf)
    }
}
