//! TCP server lifecycle: bind, accept, admit, tick, stop.
//!
//! # State machine
//!
//! ```text
//! NotStarted ──start──► Listening ──stop──► Stopped
//!     │                     │
//!     └──────stop───────────┼──────────────► Stopped
//!                           └──abort───────► Aborted
//! ```
//!
//! `Stopped` and `Aborted` are terminal. Stop and abort share one teardown
//! path guarded by a lock, so repeated or concurrent calls are no-ops after
//! the first. `start()` returns only after teardown has completed.
//!
//! # Tasks
//!
//! - The accept loop runs inside `start()`. Accept errors are logged and
//!   retried after a short backoff; they never end the loop.
//! - TLS handshakes run on their own tasks under a timeout, so a slow client
//!   cannot stall the accept loop.
//! - The ticker refreshes metrics and sweeps closed sockets once per
//!   `tick_interval`. A panic in the ticker aborts the server.

use std::{
    fmt,
    net::SocketAddr,
    panic::{AssertUnwindSafe, catch_unwind},
    sync::{Arc, Mutex},
    time::Duration,
};

use async_trait::async_trait;
use tokio::{
    net::{TcpListener, TcpStream},
    sync::{Mutex as AsyncMutex, watch},
    time::{Instant, MissedTickBehavior},
};
use tokio_rustls::TlsAcceptor;
use tracing::{debug, error, info, warn};

use crate::{
    ConnectionStrategy, ServerConfig, ServerError, ServerMetrics, Socket,
    registry::SocketRegistry,
    service::Service,
    socket::Connection,
    util::{lock, panic_message},
};

/// Pause after a failed accept before trying again.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(50);

/// Callback receiving a metrics snapshot on every tick.
pub type MetricsHandler = Arc<dyn Fn(&ServerMetrics) + Send + Sync + 'static>;

/// Lifecycle state of a [`Server`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerState {
    /// Created, `start()` not yet called.
    NotStarted,
    /// Accepting connections on the bound address.
    Listening(SocketAddr),
    /// Stopped by `stop()`.
    Stopped,
    /// Stopped by an internal failure.
    Aborted(String),
}

impl ServerState {
    /// True while accepting connections.
    pub fn is_listening(&self) -> bool {
        matches!(self, Self::Listening(_))
    }

    /// True once stopped or aborted.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Stopped | Self::Aborted(_))
    }
}

/// Raw TCP server.
///
/// Cheap to clone; clones share the same server.
#[derive(Clone)]
pub struct Server {
    inner: Arc<Inner>,
}

struct Inner {
    config: ServerConfig,
    strategy: Box<dyn ConnectionStrategy>,
    registry: SocketRegistry,
    tls_acceptor: Option<TlsAcceptor>,
    state: watch::Sender<ServerState>,
    open_listeners: watch::Sender<usize>,
    teardown: AsyncMutex<()>,
    metrics: Mutex<ServerMetrics>,
    metrics_handler: Mutex<Option<MetricsHandler>>,
}

/// Bound listener, counted in `open_listeners` until it is closed.
struct OpenListener<'a> {
    listener: Option<TcpListener>,
    open: &'a watch::Sender<usize>,
}

impl<'a> OpenListener<'a> {
    fn new(listener: TcpListener, open: &'a watch::Sender<usize>) -> Self {
        open.send_modify(|count| *count += 1);
        Self { listener: Some(listener), open }
    }
}

impl Drop for OpenListener<'_> {
    fn drop(&mut self) {
        drop(self.listener.take());
        self.open.send_modify(|count| *count = count.saturating_sub(1));
    }
}

impl Server {
    /// Create a server. TLS material named in `config.tls` is loaded at
    /// `start()`.
    pub fn new(config: ServerConfig, strategy: impl ConnectionStrategy) -> Self {
        Self::build(config, Box::new(strategy), None)
    }

    /// Create a TLS server with a prebuilt acceptor. `config.tls` is ignored.
    pub fn with_tls_acceptor(
        config: ServerConfig,
        strategy: impl ConnectionStrategy,
        acceptor: TlsAcceptor,
    ) -> Self {
        Self::build(config, Box::new(strategy), Some(acceptor))
    }

    fn build(
        config: ServerConfig,
        strategy: Box<dyn ConnectionStrategy>,
        tls_acceptor: Option<TlsAcceptor>,
    ) -> Self {
        let registry = SocketRegistry::new(config.max_clients);
        Self {
            inner: Arc::new(Inner {
                config,
                strategy,
                registry,
                tls_acceptor,
                state: watch::Sender::new(ServerState::NotStarted),
                open_listeners: watch::Sender::new(0),
                teardown: AsyncMutex::new(()),
                metrics: Mutex::new(ServerMetrics::default()),
                metrics_handler: Mutex::new(None),
            }),
        }
    }

    /// Server configuration.
    pub fn config(&self) -> &ServerConfig {
        &self.inner.config
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ServerState {
        self.inner.state.borrow().clone()
    }

    /// Bound address while listening.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        match *self.inner.state.borrow() {
            ServerState::Listening(addr) => Some(addr),
            _ => None,
        }
    }

    /// Wait until the server is listening and return the bound address.
    ///
    /// Returns `None` if the server stopped without ever listening.
    pub async fn ready(&self) -> Option<SocketAddr> {
        let mut state = self.inner.state.subscribe();
        let reached = state.wait_for(|s| s.is_listening() || s.is_terminal()).await.ok()?;
        match *reached {
            ServerState::Listening(addr) => Some(addr),
            _ => None,
        }
    }

    /// Metrics from the most recent tick.
    pub fn metrics(&self) -> ServerMetrics {
        *lock(&self.inner.metrics)
    }

    /// Connections currently registered.
    pub fn connections(&self) -> usize {
        self.inner.registry.len()
    }

    /// Open sockets, e.g. as broadcast targets.
    pub fn sockets(&self) -> Vec<Arc<Socket>> {
        self.inner.registry.snapshot()
    }

    /// Register a callback receiving the metrics after every tick.
    pub fn on_metrics_update(&self, handler: impl Fn(&ServerMetrics) + Send + Sync + 'static) {
        *lock(&self.inner.metrics_handler) = Some(Arc::new(handler));
    }

    /// Bind and serve until stopped.
    ///
    /// Returns after the listener is closed and teardown has finished.
    /// Returns `Ok(())` immediately if the server was stopped before start.
    ///
    /// # Errors
    ///
    /// - [`ServerError::Config`] / [`ServerError::Tls`] for invalid settings
    /// - [`ServerError::Bind`] if the address cannot be bound
    /// - [`ServerError::AlreadyStarted`] if the server is already listening
    /// - [`ServerError::Aborted`] if an internal failure stopped the server
    pub async fn start(&self) -> Result<(), ServerError> {
        match self.state() {
            ServerState::NotStarted => {},
            ServerState::Listening(_) => return Err(ServerError::AlreadyStarted),
            ServerState::Stopped | ServerState::Aborted(_) => {
                warn!("start() called on a stopped server");
                return Ok(());
            },
        }

        let inner = &self.inner;
        inner.config.validate()?;
        let tls = match (&inner.tls_acceptor, &inner.config.tls) {
            (Some(acceptor), _) => Some(acceptor.clone()),
            (None, Some(tls)) => Some(tls.build_acceptor()?),
            (None, None) => None,
        };

        let listener = bind(&inner.config).await?;
        let local_addr = listener.local_addr()?;
        let listener = OpenListener::new(listener, &inner.open_listeners);

        let started = inner.state.send_if_modified(|state| {
            if *state == ServerState::NotStarted {
                *state = ServerState::Listening(local_addr);
                true
            } else {
                false
            }
        });
        if !started {
            drop(listener);
            return match self.state() {
                ServerState::Listening(_) => Err(ServerError::AlreadyStarted),
                _ => Ok(()),
            };
        }

        Arc::clone(inner).spawn_ticker();
        inner.strategy.on_start();
        info!(address = %local_addr, tls = tls.is_some(), "TCP server started");

        if let Some(tcp) = listener.listener.as_ref() {
            inner.accept_loop(tcp, tls.as_ref()).await;
        }
        drop(listener);

        let _teardown = inner.teardown.lock().await;
        match self.state() {
            ServerState::Aborted(reason) => Err(ServerError::Aborted(reason)),
            _ => Ok(()),
        }
    }

    /// Stop the server: close the listener and every connection.
    ///
    /// Idempotent. Calling it before `start()` makes the later `start()`
    /// return immediately.
    pub async fn stop(&self) {
        self.inner.shutdown(ServerState::Stopped).await;
    }
}

impl Inner {
    async fn accept_loop(self: &Arc<Self>, listener: &TcpListener, tls: Option<&TlsAcceptor>) {
        let mut state = self.state.subscribe();
        loop {
            if !state.borrow_and_update().is_listening() {
                break;
            }
            tokio::select! {
                changed = state.changed() => {
                    if changed.is_err() {
                        break;
                    }
                },
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => self.on_connection(stream, peer, tls).await,
                    Err(err) => {
                        error!(error = %err, "Error while accepting TCP connection");
                        tokio::time::sleep(ACCEPT_BACKOFF).await;
                    },
                },
            }
        }
    }

    async fn on_connection(
        self: &Arc<Self>,
        stream: TcpStream,
        peer: SocketAddr,
        tls: Option<&TlsAcceptor>,
    ) {
        if self.config.no_delay {
            if let Err(err) = stream.set_nodelay(true) {
                debug!(%peer, error = %err, "Failed to set TCP_NODELAY");
            }
        }

        let Some(acceptor) = tls else {
            self.admit(stream, peer, false).await;
            return;
        };

        let acceptor = acceptor.clone();
        let inner = Arc::clone(self);
        let timeout = self.config.tls_handshake_timeout;
        tokio::spawn(async move {
            match tokio::time::timeout(timeout, acceptor.accept(stream)).await {
                Ok(Ok(stream)) => inner.admit(stream, peer, true).await,
                Ok(Err(err)) => debug!(%peer, error = %err, "TLS handshake failed"),
                Err(_) => debug!(%peer, "TLS handshake timed out"),
            }
        });
    }

    async fn admit(&self, conn: impl Connection, peer: SocketAddr, tls: bool) {
        if !self.state.borrow().is_listening() {
            return;
        }
        let Some(socket) = self.registry.admit(conn, Some(peer), tls) else {
            return;
        };
        // A handshake can finish while teardown drains the registry.
        if !self.state.borrow().is_listening() {
            socket.close().await;
            return;
        }
        debug!(socket_id = socket.id(), remote = %peer, tls, "Opening TCP client connection");
        self.strategy.on_accept(socket);
    }

    fn spawn_ticker(self: Arc<Self>) {
        tokio::spawn(async move {
            let period = self.config.tick_interval;
            let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            let mut state = self.state.subscribe();
            let mut last = Instant::now();

            loop {
                if !state.borrow_and_update().is_listening() {
                    break;
                }
                tokio::select! {
                    _ = state.changed() => continue,
                    _ = ticker.tick() => {},
                }

                let now = Instant::now();
                let elapsed = now - last;
                last = now;

                if let Err(panic) = catch_unwind(AssertUnwindSafe(|| self.run_background_job(elapsed))) {
                    let reason = panic_message(&*panic);
                    error!(panic = %reason, "Panic inside TCP server background job");
                    self.abort(ServerError::BackgroundJob(reason)).await;
                    break;
                }
            }
        });
    }

    fn run_background_job(&self, elapsed: Duration) {
        let snapshot = {
            let mut metrics = lock(&self.metrics);
            metrics.record_tick(&self.registry, elapsed);
            self.strategy.on_metrics_update(&mut metrics);
            *metrics
        };

        let handler = lock(&self.metrics_handler).clone();
        if let Some(handler) = handler {
            handler(&snapshot);
        }

        let swept = self.registry.sweep();
        if swept > 0 {
            debug!(swept, connections = snapshot.connections, "Removed closed TCP connections");
        }
    }

    async fn abort(&self, reason: ServerError) {
        error!(error = %reason, "Aborting TCP server");
        self.shutdown(ServerState::Aborted(reason.to_string())).await;
    }

    async fn shutdown(&self, target: ServerState) {
        let _teardown = self.teardown.lock().await;

        let mut previous = None;
        self.state.send_if_modified(|state| {
            if state.is_terminal() {
                return false;
            }
            previous = Some(std::mem::replace(state, target));
            true
        });
        let Some(previous) = previous else {
            return;
        };
        if !previous.is_listening() {
            debug!("TCP server stopped before start");
            return;
        }

        let mut open = self.open_listeners.subscribe();
        let _ = open.wait_for(|count| *count == 0).await;

        let sockets = self.registry.snapshot();
        let closing = sockets.len();
        futures::future::join_all(sockets.iter().map(|socket| socket.close())).await;
        drop(sockets);
        self.registry.drain();

        self.strategy.on_stop();
        info!(closed = closing, "TCP server stopped");
    }
}

async fn bind(config: &ServerConfig) -> Result<TcpListener, ServerError> {
    let mut candidates = tokio::net::lookup_host(config.address.as_str()).await.map_err(|e| {
        ServerError::Config(format!("invalid bind address '{}': {e}", config.address))
    })?;
    let addr = candidates.find(|addr| config.mode.accepts(addr)).ok_or_else(|| {
        ServerError::Config(format!(
            "no address for '{}' matches listen mode {:?}",
            config.address, config.mode
        ))
    })?;

    TcpListener::bind(addr)
        .await
        .map_err(|source| ServerError::Bind { address: addr.to_string(), source })
}

#[async_trait]
impl Service for Server {
    async fn start(&self) -> Result<(), ServerError> {
        Server::start(self).await
    }

    async fn stop(&self) {
        Server::stop(self).await;
    }
}

impl fmt::Debug for Server {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Server")
            .field("state", &*self.inner.state.borrow())
            .field("registry", &self.inner.registry)
            .finish_non_exhaustive()
    }
}
