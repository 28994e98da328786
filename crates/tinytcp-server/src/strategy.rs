//! Connection strategies.
//!
//! A strategy decides what runs for each admitted socket. The server calls
//! it from the accept loop, so `on_accept` must hand the socket off quickly.
//!
//! [`TaskPerConnection`] is the default: one Tokio task per connection, with
//! panic recovery and a live task count reported through the metrics.

use std::{
    future::Future,
    panic::AssertUnwindSafe,
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
};

use async_trait::async_trait;
use futures::FutureExt;
use tracing::error;

use crate::{
    ServerMetrics, Socket,
    util::{panic_message, record_panic_backtraces, take_panic_backtrace},
};

/// Serves one connection until it is done.
#[async_trait]
pub trait SocketHandler: Send + Sync + 'static {
    /// Handle `socket`. The socket is closed after this returns or panics.
    async fn handle(&self, socket: Arc<Socket>);
}

#[async_trait]
impl<F, Fut> SocketHandler for F
where
    F: Fn(Arc<Socket>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    async fn handle(&self, socket: Arc<Socket>) {
        (self)(socket).await;
    }
}

/// Lifecycle hooks the server drives.
pub trait ConnectionStrategy: Send + Sync + 'static {
    /// Called once, after the listener is bound.
    fn on_start(&self) {}

    /// Called for every admitted socket, on the accept task.
    fn on_accept(&self, socket: Arc<Socket>);

    /// Called on every background tick with the server metrics.
    fn on_metrics_update(&self, _metrics: &mut ServerMetrics) {}

    /// Called once, after every socket was closed.
    fn on_stop(&self) {}
}

/// Spawns one task per connection.
pub struct TaskPerConnection<H> {
    handler: Arc<H>,
    live: Arc<AtomicUsize>,
}

impl<H: SocketHandler> TaskPerConnection<H> {
    /// Serve every connection with `handler`.
    pub fn new(handler: H) -> Self {
        record_panic_backtraces();
        Self { handler: Arc::new(handler), live: Arc::new(AtomicUsize::new(0)) }
    }

    /// Connection tasks currently running.
    pub fn live_tasks(&self) -> usize {
        self.live.load(Ordering::Acquire)
    }
}

struct LiveTask(Arc<AtomicUsize>);

impl Drop for LiveTask {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

impl<H: SocketHandler> ConnectionStrategy for TaskPerConnection<H> {
    fn on_accept(&self, socket: Arc<Socket>) {
        let handler = Arc::clone(&self.handler);
        self.live.fetch_add(1, Ordering::AcqRel);
        let live = LiveTask(Arc::clone(&self.live));

        tokio::spawn(async move {
            let _live = live;
            let served = AssertUnwindSafe(handler.handle(Arc::clone(&socket))).catch_unwind().await;
            if let Err(panic) = served {
                let stack =
                    take_panic_backtrace().map(|trace| trace.to_string()).unwrap_or_default();
                error!(
                    socket_id = socket.id(),
                    remote = %socket.remote_address(),
                    panic = %panic_message(&*panic),
                    stack = %stack,
                    "Panic while handling TCP connection"
                );
            }
            socket.close().await;
        });
    }

    fn on_metrics_update(&self, metrics: &mut ServerMetrics) {
        let live = self.live_tasks();
        metrics.execution_units = live;
        metrics.max_execution_units = metrics.max_execution_units.max(live);
    }
}

#[cfg(test)]
mod tests {
    use std::{net::SocketAddr, time::Duration};

    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    use super::*;

    fn socket() -> (Arc<Socket>, tokio::io::DuplexStream) {
        let (near, far) = tokio::io::duplex(64);
        let peer = Some(SocketAddr::from(([127, 0, 0, 1], 5000)));
        (Arc::new(Socket::new(near, peer)), far)
    }

    async fn wait_until(mut condition: impl FnMut() -> bool) {
        for _ in 0..200 {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(condition(), "condition not reached");
    }

    #[tokio::test]
    async fn handler_runs_and_socket_closes_after() {
        let strategy = TaskPerConnection::new(|socket: Arc<Socket>| async move {
            let _ = socket.write(b"hello").await;
        });
        let (socket, mut peer) = socket();

        strategy.on_accept(Arc::clone(&socket));

        let mut buf = Vec::new();
        peer.read_to_end(&mut buf).await.unwrap();
        assert_eq!(buf, b"hello");
        wait_until(|| socket.is_closed() && strategy.live_tasks() == 0).await;
    }

    async fn explode(_socket: Arc<Socket>) {
        std::panic::panic_any("handler failure")
    }

    #[tokio::test]
    async fn panicking_handler_closes_socket() {
        let strategy = TaskPerConnection::new(explode);
        let (socket, _peer) = socket();

        strategy.on_accept(Arc::clone(&socket));

        wait_until(|| socket.is_closed() && strategy.live_tasks() == 0).await;
    }

    #[tokio::test]
    async fn metrics_report_live_tasks() {
        let strategy = TaskPerConnection::new(|socket: Arc<Socket>| async move {
            let mut buf = [0u8; 1];
            let _ = socket.read(&mut buf).await;
        });
        let (first, mut first_peer) = socket();
        let (second, _second_peer) = socket();
        strategy.on_accept(first);
        strategy.on_accept(second);

        let mut metrics = ServerMetrics::default();
        strategy.on_metrics_update(&mut metrics);
        assert_eq!(metrics.execution_units, 2);

        first_peer.write_all(b"x").await.unwrap();
        wait_until(|| strategy.live_tasks() == 1).await;

        strategy.on_metrics_update(&mut metrics);
        assert_eq!(metrics.execution_units, 1);
        assert_eq!(metrics.max_execution_units, 2);
    }
}
