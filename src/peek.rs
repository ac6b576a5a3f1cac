//! Peekable byte stream
//!
//! Lets the sniffer look at the first bytes of a connection without losing
//! them: peeked bytes stay buffered and are replayed by subsequent reads.
//! Writes pass straight through to the inner stream.

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, ReadBuf};

const READ_CHUNK: usize = 1024;

pub struct PeekStream<S> {
    inner: S,
    buf: Vec<u8>,
    pos: usize,
}

impl<S> PeekStream<S> {
    pub fn new(inner: S) -> Self {
        Self {
            inner,
            buf: Vec::new(),
            pos: 0,
        }
    }

    /// Bytes read from the inner stream but not yet consumed
    pub fn buffered(&self) -> &[u8] {
        &self.buf[self.pos..]
    }
}

impl<S: AsyncRead + Unpin> PeekStream<S> {
    /// Return up to `n` leading bytes without consuming them.
    ///
    /// Reads from the inner stream until `n` bytes are buffered or EOF. A
    /// result shorter than `n` means the peer closed early.
    pub async fn peek(&mut self, n: usize) -> io::Result<&[u8]> {
        let mut chunk = [0u8; READ_CHUNK];
        while self.buf.len() - self.pos < n {
            let read = self.inner.read(&mut chunk).await?;
            if read == 0 {
                break;
            }
            self.buf.extend_from_slice(&chunk[..read]);
        }
        let end = (self.pos + n).min(self.buf.len());
        Ok(&self.buf[self.pos..end])
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for PeekStream<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        out: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if this.pos < this.buf.len() {
            let pending = &this.buf[this.pos..];
            let n = pending.len().min(out.remaining());
            out.put_slice(&pending[..n]);
            this.pos += n;
            if this.pos == this.buf.len() {
                this.buf.clear();
                this.pos = 0;
            }
            return Poll::Ready(Ok(()));
        }
        Pin::new(&mut this.inner).poll_read(cx, out)
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for PeekStream<S> {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}
