use n0_error::{Result, StackResultExt};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tracing::trace;

pub(crate) use self::limit::RateLimitedReader;
pub(crate) use self::memory_listener::MemoryListener;
pub(crate) use self::mirror::{MirrorConn, sniff_client_hello_sni};
pub(crate) use self::prebuffered::Prebuffered;

mod limit;
mod memory_listener;
mod mirror;
mod prebuffered;

/// Bidirectionally forward data between a client and an origin stream pair.
///
/// The origin-to-client direction is throttled to `speed_limit` bytes per
/// second (`0` means unlimited). Each direction shuts down its write side
/// once its read side reaches EOF, which unblocks the peer copy.
///
/// Returns `(client_to_origin, origin_to_client)` byte counts.
pub(crate) async fn forward_bidi(
    client_recv: &mut (impl AsyncRead + Send + Unpin),
    client_send: &mut (impl AsyncWrite + Send + Unpin),
    origin_recv: &mut (impl AsyncRead + Send + Unpin),
    origin_send: &mut (impl AsyncWrite + Send + Unpin),
    speed_limit: u64,
) -> Result<(u64, u64)> {
    let mut origin_recv = RateLimitedReader::new(origin_recv, speed_limit);
    let (up, down) = tokio::join!(
        async {
            let res = tokio::io::copy(client_recv, origin_send).await;
            origin_send.shutdown().await.ok();
            trace!(?res, "forward client-to-origin finished");
            res
        },
        async {
            let res = tokio::io::copy(&mut origin_recv, client_send).await;
            client_send.shutdown().await.ok();
            trace!(?res, "forward origin-to-client finished");
            res
        }
    );
    let up = up.context("failed to copy client-to-origin")?;
    let down = down.context("failed to copy origin-to-client")?;
    Ok((up, down))
}
