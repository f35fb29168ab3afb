//! A manually controllable prebuffer for Tokio `AsyncRead`.
//!
//! [`Prebuffered`] accumulates input ahead of parsing (proxy handshakes,
//! upgrade responses), lets callers inspect and partially consume it, and
//! then falls through to the inner reader. It doubles as a prefix replayer:
//! bytes read past a handshake boundary are handed back out first.

use std::{
    pin::Pin,
    task::{Context, Poll},
};

use bytes::{Bytes, BytesMut};
use tokio::io::{self, AsyncRead, AsyncReadExt, AsyncWrite, ReadBuf};

pub struct Prebuffered<R> {
    inner: R,
    buf: BytesMut,
    max_len: usize,
}

impl<R: AsyncRead + Unpin> Prebuffered<R> {
    pub(crate) fn new(inner: R, max_len: usize) -> Self {
        Self {
            inner,
            buf: BytesMut::with_capacity(max_len.min(4096)),
            max_len,
        }
    }

    /// Wraps a reader so that `prefix` is yielded before any fresh reads.
    ///
    /// Used to preserve bytes that were read past a handshake boundary.
    pub(crate) fn with_prefix(prefix: impl Into<Bytes>, inner: R) -> Self {
        let prefix = prefix.into();
        Self {
            inner,
            buf: BytesMut::from(&prefix[..]),
            max_len: 0,
        }
    }

    /// Returns the unconsumed buffered bytes.
    pub(crate) fn buffer(&self) -> &[u8] {
        &self.buf[..]
    }

    pub(crate) fn is_full(&self) -> bool {
        self.buf.len() >= self.max_len
    }

    /// Discards `n` bytes from the front of the buffer.
    pub(crate) fn discard(&mut self, n: usize) {
        let _ = self.buf.split_to(n.min(self.buf.len()));
    }

    /// Reads more data from the inner reader into the buffer, up to the cap.
    ///
    /// Returns the number of freshly buffered bytes; `0` at EOF or when full.
    pub(crate) async fn buffer_more(&mut self) -> io::Result<usize> {
        let room = self.max_len.saturating_sub(self.buf.len());
        if room == 0 {
            return Ok(0);
        }
        (&mut self.inner).take(room as u64).read_buf(&mut self.buf).await
    }

    /// Returns the remaining buffered bytes and the inner reader.
    pub(crate) fn into_parts(self) -> (Bytes, R) {
        (self.buf.freeze(), self.inner)
    }
}

impl<R: AsyncRead + Unpin> AsyncRead for Prebuffered<R> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        out: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        if out.remaining() == 0 {
            return Poll::Ready(Ok(()));
        }
        if !self.buf.is_empty() {
            let n = self.buf.len().min(out.remaining());
            let chunk = self.buf.split_to(n);
            out.put_slice(&chunk);
            return Poll::Ready(Ok(()));
        }
        Pin::new(&mut self.inner).poll_read(cx, out)
    }
}

/// Writes pass straight through, so a prebuffered handshake reader can keep
/// serving as the full-duplex transport afterwards.
impl<R: AsyncWrite + Unpin> AsyncWrite for Prebuffered<R> {
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

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use tokio::io::AsyncReadExt;

    use super::*;

    #[tokio::test]
    async fn buffer_then_fallthrough() {
        let mut p = Prebuffered::new(Cursor::new(b"hello world".to_vec()), 5);
        p.buffer_more().await.unwrap();
        assert_eq!(p.buffer(), b"hello");
        assert!(p.is_full());
        let mut out = Vec::new();
        p.read_to_end(&mut out).await.unwrap();
        assert_eq!(out, b"hello world");
    }

    #[tokio::test]
    async fn discard_consumes_front() {
        let mut p = Prebuffered::new(Cursor::new(b"abcdef".to_vec()), 4);
        p.buffer_more().await.unwrap();
        p.discard(2);
        assert_eq!(p.buffer(), b"cd");
        let mut out = Vec::new();
        p.read_to_end(&mut out).await.unwrap();
        assert_eq!(out, b"cdef");
    }

    #[tokio::test]
    async fn prefix_replayed_before_inner() {
        let mut p = Prebuffered::with_prefix(&b"head"[..], Cursor::new(b"tail".to_vec()));
        let mut out = Vec::new();
        p.read_to_end(&mut out).await.unwrap();
        assert_eq!(out, b"headtail");
    }

    #[tokio::test]
    async fn buffer_more_stops_at_cap() {
        let mut p = Prebuffered::new(Cursor::new(b"abcdefgh".to_vec()), 3);
        let n = p.buffer_more().await.unwrap();
        assert_eq!(n, 3);
        assert_eq!(p.buffer_more().await.unwrap(), 0);
    }
}
