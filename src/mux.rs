//! Stream multiplexing for reverse tunnels.
//!
//! Wraps a yamux connection behind an accept/open API. The poll-driven
//! connection is owned by a single driver task; stream opens are requested
//! over a command channel and inbound streams are queued on a bounded
//! accept backlog.

use std::{future::poll_fn, pin::Pin, task::{Context, Poll}};

use n0_error::{AnyError, Result, anyerr};
use tokio::{
    io::{self, AsyncRead, AsyncWrite, ReadBuf},
    sync::{Mutex, mpsc, oneshot},
};
use tokio_util::compat::{Compat, FuturesAsyncReadCompatExt, TokioAsyncReadCompatExt};
use tracing::debug;

use crate::dialer::StreamIo;

/// Inbound streams queued before `accept` picks them up.
const ACCEPT_BACKLOG: usize = 256;

/// Streams allowed per session.
const MAX_STREAMS: usize = 1000;

type OpenReply = oneshot::Sender<Result<MuxStream, AnyError>>;

/// One yamux session bound to one physical connection.
///
/// Destroyed when the transport errors; `open` fails and `accept` drains
/// from then on, and the owner is expected to reconnect.
pub struct MuxSession {
    cmd_tx: mpsc::Sender<OpenReply>,
    accept_rx: Mutex<mpsc::Receiver<MuxStream>>,
}

impl MuxSession {
    /// Speaks yamux in server mode: the remote edge originates streams.
    pub fn server(io: impl StreamIo + 'static) -> Self {
        Self::new(io, yamux::Mode::Server)
    }

    /// Speaks yamux in client mode: this side originates streams.
    pub fn client(io: impl StreamIo + 'static) -> Self {
        Self::new(io, yamux::Mode::Client)
    }

    fn new(io: impl StreamIo + 'static, mode: yamux::Mode) -> Self {
        let mut config = yamux::Config::default();
        config.set_max_num_streams(MAX_STREAMS);
        let connection = yamux::Connection::new(io.compat(), config, mode);

        let (cmd_tx, cmd_rx) = mpsc::channel(16);
        let (accept_tx, accept_rx) = mpsc::channel(ACCEPT_BACKLOG);
        tokio::spawn(drive(connection, cmd_rx, accept_tx));

        Self {
            cmd_tx,
            accept_rx: Mutex::new(accept_rx),
        }
    }

    /// Opens a new outbound stream on the session.
    pub async fn open(&self) -> Result<MuxStream> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.cmd_tx
            .send(reply_tx)
            .await
            .map_err(|_| anyerr!("mux session is closed"))?;
        reply_rx
            .await
            .map_err(|_| anyerr!("mux session is closed"))?
    }

    /// Next inbound stream, or `None` once the session is dead.
    pub async fn accept(&self) -> Option<MuxStream> {
        self.accept_rx.lock().await.recv().await
    }

    /// True once the underlying transport has failed or closed.
    pub fn is_closed(&self) -> bool {
        self.cmd_tx.is_closed()
    }
}

async fn drive<T>(
    mut connection: yamux::Connection<Compat<T>>,
    mut cmd_rx: mpsc::Receiver<OpenReply>,
    accept_tx: mpsc::Sender<MuxStream>,
) where
    T: StreamIo,
{
    loop {
        tokio::select! {
            cmd = cmd_rx.recv() => {
                let Some(reply) = cmd else {
                    break;
                };
                match poll_fn(|cx| connection.poll_new_outbound(cx)).await {
                    Ok(stream) => {
                        reply.send(Ok(MuxStream::new(stream))).ok();
                    }
                    Err(err) => {
                        debug!("mux outbound open failed: {err}");
                        reply.send(Err(anyerr!(err))).ok();
                        break;
                    }
                }
            }
            inbound = poll_fn(|cx| connection.poll_next_inbound(cx)) => {
                match inbound {
                    Some(Ok(stream)) => {
                        if accept_tx.send(MuxStream::new(stream)).await.is_err() {
                            break;
                        }
                    }
                    Some(Err(err)) => {
                        debug!("mux transport failed: {err}");
                        break;
                    }
                    None => break,
                }
            }
        }
    }
    let _ = poll_fn(|cx| connection.poll_close(cx)).await;
    // dropping cmd_rx/accept_tx flips the session to closed
}

/// One multiplexed byte stream.
pub struct MuxStream(Compat<yamux::Stream>);

impl MuxStream {
    fn new(stream: yamux::Stream) -> Self {
        Self(stream.compat())
    }
}

impl AsyncRead for MuxStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.0).poll_read(cx, buf)
    }
}

impl AsyncWrite for MuxStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.0).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.0).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.0).poll_shutdown(cx)
    }
}

#[cfg(test)]
mod tests {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    use super::*;

    fn session_pair() -> (MuxSession, MuxSession) {
        let (a, b) = tokio::io::duplex(64 * 1024);
        (MuxSession::client(a), MuxSession::server(b))
    }

    #[tokio::test]
    async fn open_accept_round_trip() {
        let (client, server) = session_pair();

        let server_task = tokio::spawn(async move {
            let mut stream = server.accept().await.expect("inbound stream");
            let mut buf = [0u8; 4];
            stream.read_exact(&mut buf).await.unwrap();
            assert_eq!(&buf, b"PING");
            stream.write_all(b"PONG").await.unwrap();
            stream.shutdown().await.unwrap();
        });

        let mut stream = client.open().await.unwrap();
        stream.write_all(b"PING").await.unwrap();
        let mut buf = [0u8; 4];
        stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"PONG");
        server_task.await.unwrap();
    }

    #[tokio::test]
    async fn transport_loss_closes_session() {
        let (a, b) = tokio::io::duplex(4096);
        let client = MuxSession::client(a);
        drop(b);

        // the first open may race transport teardown, the second must fail
        let _ = client.open().await;
        assert!(client.open().await.is_err());
        assert!(client.is_closed());
    }

    #[tokio::test]
    async fn concurrent_streams_are_isolated() {
        let (client, server) = session_pair();

        let echo = tokio::spawn(async move {
            let mut tasks = Vec::new();
            for _ in 0..3 {
                let mut stream = server.accept().await.expect("inbound stream");
                tasks.push(tokio::spawn(async move {
                    let mut buf = Vec::new();
                    stream.read_to_end(&mut buf).await.unwrap();
                    stream.write_all(&buf).await.unwrap();
                    stream.shutdown().await.unwrap();
                }));
            }
            for task in tasks {
                task.await.unwrap();
            }
        });

        let mut streams = Vec::new();
        for i in 0..3u8 {
            let mut stream = client.open().await.unwrap();
            let payload = vec![i; 128];
            stream.write_all(&payload).await.unwrap();
            stream.shutdown().await.unwrap();
            streams.push((stream, payload));
        }
        for (mut stream, payload) in streams {
            let mut buf = Vec::new();
            stream.read_to_end(&mut buf).await.unwrap();
            assert_eq!(buf, payload);
        }
        echo.await.unwrap();
    }
}
