//! Token-bucket read throttling for relayed streams.

use std::{
    future::Future,
    pin::Pin,
    task::{Context, Poll, ready},
    time::Duration,
};

use tokio::{
    io::{self, AsyncRead, ReadBuf},
    time::{Instant, Sleep},
};

/// Refill window of the token bucket. Sub-second so that small limits do
/// not produce second-long stalls.
const WINDOW: Duration = Duration::from_millis(100);

const SCRATCH_SIZE: usize = 16 * 1024;

/// An `AsyncRead` wrapper that caps throughput at `bytes_per_sec`.
///
/// A rate of `0` disables throttling entirely. Tokens refill once per
/// [`WINDOW`], so delivered bytes over an interval `T` stay within
/// `rate * T` plus one window's burst.
pub(crate) struct RateLimitedReader<R> {
    inner: R,
    rate: u64,
    budget: u64,
    window_end: Instant,
    delay: Option<Pin<Box<Sleep>>>,
    scratch: Box<[u8]>,
}

impl<R> RateLimitedReader<R> {
    pub(crate) fn new(inner: R, bytes_per_sec: u64) -> Self {
        let per_window =
            (bytes_per_sec as u128 * WINDOW.as_millis() / 1000).max(1) as u64;
        Self {
            inner,
            rate: bytes_per_sec,
            budget: per_window,
            window_end: Instant::now() + WINDOW,
            delay: None,
            scratch: if bytes_per_sec == 0 {
                Box::new([])
            } else {
                vec![0u8; SCRATCH_SIZE].into_boxed_slice()
            },
        }
    }

    fn per_window(&self) -> u64 {
        (self.rate as u128 * WINDOW.as_millis() / 1000).max(1) as u64
    }
}

impl<R: AsyncRead + Unpin> AsyncRead for RateLimitedReader<R> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        out: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if this.rate == 0 {
            return Pin::new(&mut this.inner).poll_read(cx, out);
        }

        loop {
            let now = Instant::now();
            if now >= this.window_end {
                this.budget = this.per_window();
                this.window_end = now + WINDOW;
                this.delay = None;
            }

            if this.budget == 0 {
                let delay = this
                    .delay
                    .get_or_insert_with(|| Box::pin(tokio::time::sleep_until(this.window_end)));
                ready!(delay.as_mut().poll(cx));
                this.delay = None;
                continue;
            }

            let allowed = (this.budget as usize)
                .min(out.remaining())
                .min(this.scratch.len());
            let mut tmp = ReadBuf::new(&mut this.scratch[..allowed]);
            ready!(Pin::new(&mut this.inner).poll_read(cx, &mut tmp))?;
            let filled = tmp.filled();
            out.put_slice(filled);
            this.budget -= filled.len() as u64;
            return Poll::Ready(Ok(()));
        }
    }
}
