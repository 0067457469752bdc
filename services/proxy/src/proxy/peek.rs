//! Buffered look-ahead over a raw stream.
//!
//! `PeekReader` lets classification inspect the first bytes of a connection
//! without losing them. Whatever has been peeked but not consumed is handed to
//! the next consumer: the HTTP parser consumes it through [`PeekReader::consume`],
//! the tunnel gets it back through [`PeekReader::into_parts`] or by reading
//! from the reader itself, which replays the buffer before touching the inner
//! stream again.

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::{Buf, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, ReadBuf};
use tracing::debug;

use crate::error::ProxyError;

/// Bytes requested from the inner stream per fill.
const READ_CHUNK: usize = 4096;

/// A reader that supports non-destructive look-ahead.
#[derive(Debug)]
pub struct PeekReader<S> {
    inner: S,
    buf: BytesMut,
}

impl<S> PeekReader<S> {
    /// Wrap a stream with an empty look-ahead buffer.
    pub fn new(inner: S) -> Self {
        Self {
            inner,
            buf: BytesMut::new(),
        }
    }

    /// Rebuild a reader whose first bytes are `buffered`, followed by `inner`.
    pub fn from_parts(inner: S, buffered: Bytes) -> Self {
        Self {
            inner,
            buf: BytesMut::from(&buffered[..]),
        }
    }

    /// Bytes read from the inner stream but not yet consumed.
    pub fn buffered(&self) -> &[u8] {
        &self.buf
    }

    /// Mark the first `n` buffered bytes as consumed.
    ///
    /// # Panics
    /// Panics if `n` exceeds the number of buffered bytes.
    pub fn consume(&mut self, n: usize) {
        self.buf.advance(n);
    }

    pub fn get_mut(&mut self) -> &mut S {
        &mut self.inner
    }

    /// Split into the inner stream and the bytes that still have to be
    /// delivered before anything read from it.
    pub fn into_parts(self) -> (S, Bytes) {
        (self.inner, self.buf.freeze())
    }
}

impl<S: AsyncRead + Unpin> PeekReader<S> {
    /// Read one more chunk from the inner stream into the buffer.
    ///
    /// Returns the number of bytes added; `0` means end of stream.
    pub async fn fill(&mut self) -> io::Result<usize> {
        self.buf.reserve(READ_CHUNK);
        self.inner.read_buf(&mut self.buf).await
    }

    /// Return the next `n` bytes without consuming them.
    ///
    /// Blocks until `n` bytes are buffered. Fails with
    /// [`ProxyError::PeekShortRead`] if the stream ends or errors first.
    pub async fn peek(&mut self, n: usize) -> Result<&[u8], ProxyError> {
        while self.buf.len() < n {
            match self.fill().await {
                Ok(0) => {
                    return Err(ProxyError::PeekShortRead {
                        wanted: n,
                        got: self.buf.len(),
                    });
                }
                Ok(_) => {}
                Err(e) => {
                    debug!(
                        error = %e,
                        wanted = n,
                        got = self.buf.len(),
                        "Read error while peeking"
                    );
                    return Err(ProxyError::PeekShortRead {
                        wanted: n,
                        got: self.buf.len(),
                    });
                }
            }
        }
        Ok(&self.buf[..n])
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for PeekReader<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        out: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();

        // Replay look-ahead first
        if !this.buf.is_empty() {
            let n = this.buf.len().min(out.remaining());
            out.put_slice(&this.buf[..n]);
            this.buf.advance(n);
            return Poll::Ready(Ok(()));
        }

        Pin::new(&mut this.inner).poll_read(cx, out)
    }
}
