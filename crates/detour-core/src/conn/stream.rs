//! tokio I/O adapter for [`Conn`](super::Conn)

use std::fmt;
use std::future::Future;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{ready, Context, Poll};

use bytes::{Buf, Bytes};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

use super::Inner;

type BoxFuture<T> = Pin<Box<dyn Future<Output = io::Result<T>> + Send>>;

/// [`Conn`](super::Conn) as `AsyncRead + AsyncWrite`
///
/// Shutting down the write side closes the whole connection.
pub struct ConnStream {
    inner: Arc<Inner>,
    read: Option<BoxFuture<Bytes>>,
    /// Bytes read that did not fit the caller's buffer
    leftover: Bytes,
    write: Option<BoxFuture<usize>>,
    close: Option<BoxFuture<()>>,
}

impl ConnStream {
    pub(crate) fn new(inner: Arc<Inner>) -> Self {
        Self {
            inner,
            read: None,
            leftover: Bytes::new(),
            write: None,
            close: None,
        }
    }

    /// Destination address
    pub fn addr(&self) -> &str {
        self.inner.state.addr()
    }
}

impl AsyncRead for ConnStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        if buf.remaining() == 0 {
            return Poll::Ready(Ok(()));
        }
        if self.leftover.is_empty() {
            let len = buf.remaining().min(self.inner.state.buffer_size);
            let inner = Arc::clone(&self.inner);
            let fut = self
                .read
                .get_or_insert_with(|| Box::pin(async move { inner.read_bytes(len).await }));
            let result = ready!(fut.as_mut().poll(cx));
            self.read = None;
            self.leftover = result?;
        }

        let n = self.leftover.len().min(buf.remaining());
        buf.put_slice(&self.leftover[..n]);
        self.leftover.advance(n);
        Poll::Ready(Ok(()))
    }
}

impl AsyncWrite for ConnStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        if buf.is_empty() {
            return Poll::Ready(Ok(0));
        }
        let inner = Arc::clone(&self.inner);
        let fut = self.write.get_or_insert_with(|| {
            let data = Bytes::copy_from_slice(buf);
            Box::pin(async move { inner.write(data).await })
        });
        let result = ready!(fut.as_mut().poll(cx));
        self.write = None;
        Poll::Ready(result)
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let inner = Arc::clone(&self.inner);
        let fut = self
            .close
            .get_or_insert_with(|| Box::pin(async move { inner.close().await }));
        let result = ready!(fut.as_mut().poll(cx));
        self.close = None;
        Poll::Ready(result)
    }
}

impl fmt::Debug for ConnStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnStream")
            .field("addr", &self.inner.state.addr())
            .field("leftover", &self.leftover.len())
            .finish_non_exhaustive()
    }
}
