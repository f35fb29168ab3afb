//! In-process listener backed by a bounded queue.

use tokio::sync::{Mutex, mpsc};

/// Queue depth before [`MemoryListener::add`] applies backpressure.
const BACKLOG: usize = 2048;

/// An in-process listener: connections injected by one component (for
/// example streams accepted off a reverse tunnel) are handed out through
/// an `accept`-shaped API to another component's accept loop.
pub(crate) struct MemoryListener<T> {
    tx: mpsc::Sender<T>,
    rx: Mutex<mpsc::Receiver<T>>,
}

impl<T> MemoryListener<T> {
    pub(crate) fn new() -> Self {
        let (tx, rx) = mpsc::channel(BACKLOG);
        Self {
            tx,
            rx: Mutex::new(rx),
        }
    }

    /// Injects a connection into the accept queue.
    ///
    /// Suspends when the backlog is full; fails only after [`close`].
    pub(crate) async fn add(&self, conn: T) -> bool {
        self.tx.send(conn).await.is_ok()
    }

    /// Takes the next queued connection, or `None` once closed and drained.
    pub(crate) async fn accept(&self) -> Option<T> {
        self.rx.lock().await.recv().await
    }

    /// Closes the queue for new connections. Already queued connections
    /// are still handed out until drained.
    pub(crate) async fn close(&self) {
        self.rx.lock().await.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn add_then_accept_in_order() {
        let ln = MemoryListener::new();
        assert!(ln.add(1u32).await);
        assert!(ln.add(2u32).await);
        assert_eq!(ln.accept().await, Some(1));
        assert_eq!(ln.accept().await, Some(2));
    }

    #[tokio::test]
    async fn close_rejects_new_then_drains() {
        let ln = MemoryListener::new();
        assert!(ln.add(1u32).await);
        ln.close().await;
        assert!(!ln.add(2u32).await);
        assert_eq!(ln.accept().await, Some(1));
        assert_eq!(ln.accept().await, None);
    }
}
