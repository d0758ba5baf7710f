//! ROUTER-socket server.

use crate::dispatcher::Dispatcher;
use crate::error::ServerError;
use crate::metrics::Metrics;
use crate::service::Service;
use crate::strategy::{ExecutionStrategy, ServeContext};
use parking_lot::Mutex;
use protorpc_protocol::validate_endpoint;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;
use zeromq::{RouterSocket, Socket};

/// Server statistics.
#[derive(Debug, Default)]
pub struct ServerStats {
    /// Well-formed requests received.
    pub received: AtomicU64,
    /// Replies sent.
    pub replied: AtomicU64,
    /// Inbound messages or replies dropped.
    pub dropped: AtomicU64,
}

impl ServerStats {
    pub(crate) fn record_received(&self) {
        self.received.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_replied(&self) {
        self.replied.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_dropped(&self, metrics: Option<&Metrics>) {
        self.dropped.fetch_add(1, Ordering::Relaxed);
        if let Some(metrics) = metrics {
            metrics.frames_dropped_total.inc();
        }
    }

    pub fn received(&self) -> u64 {
        self.received.load(Ordering::Relaxed)
    }

    pub fn replied(&self) -> u64 {
        self.replied.load(Ordering::Relaxed)
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

/// Serves one service on one ROUTER socket using strategy `S`.
pub struct Server<S: ExecutionStrategy> {
    strategy: S,
    dispatcher: Arc<Dispatcher>,
    stats: Arc<ServerStats>,
    shutdown: broadcast::Sender<()>,
    shutdown_rx: Mutex<Option<broadcast::Receiver<()>>>,
    socket: Mutex<Option<RouterSocket>>,
    local_endpoint: Mutex<Option<String>>,
    running: AtomicBool,
}

impl<S: ExecutionStrategy> Server<S> {
    /// Creates a new server.
    pub fn new(service: Arc<dyn Service>, strategy: S) -> Self {
        Self::with_dispatcher(Dispatcher::new(service), strategy)
    }

    /// Creates a new server that records calls in `metrics`.
    pub fn with_metrics(service: Arc<dyn Service>, strategy: S, metrics: Arc<Metrics>) -> Self {
        Self::with_dispatcher(Dispatcher::new(service).with_metrics(metrics), strategy)
    }

    fn with_dispatcher(dispatcher: Dispatcher, strategy: S) -> Self {
        // Subscribe now so a shutdown requested before `run` is not lost.
        let (shutdown, shutdown_rx) = broadcast::channel(1);
        Self {
            strategy,
            dispatcher: Arc::new(dispatcher),
            stats: Arc::new(ServerStats::default()),
            shutdown,
            shutdown_rx: Mutex::new(Some(shutdown_rx)),
            socket: Mutex::new(None),
            local_endpoint: Mutex::new(None),
            running: AtomicBool::new(false),
        }
    }

    /// Binds the ROUTER socket and returns the resolved endpoint (with the
    /// actual port when binding port 0).
    pub async fn bind(&self, endpoint: &str) -> Result<String, ServerError> {
        validate_endpoint(endpoint)?;
        let mut socket = RouterSocket::new();
        let bound = socket.bind(endpoint).await?.to_string();
        tracing::info!(
            "Server bound to {} ({} strategy)",
            bound,
            self.strategy.name()
        );

        *self.socket.lock() = Some(socket);
        *self.local_endpoint.lock() = Some(bound.clone());
        Ok(bound)
    }

    /// Serves until [`shutdown`](Self::shutdown) is called or the socket
    /// fails. [`bind`](Self::bind) must have been called.
    pub async fn run(&self) -> Result<(), ServerError> {
        let (socket, shutdown) = {
            let mut shutdown_rx = self.shutdown_rx.lock();
            let Some(shutdown) = shutdown_rx.take() else {
                return Err(ServerError::AlreadyRunning);
            };
            let Some(socket) = self.socket.lock().take() else {
                // Keep the receiver so a later bind + run still works.
                *shutdown_rx = Some(shutdown);
                return Err(ServerError::NotBound);
            };
            (socket, shutdown)
        };

        self.running.store(true, Ordering::SeqCst);
        let ctx = ServeContext {
            socket,
            dispatcher: self.dispatcher.clone(),
            stats: self.stats.clone(),
            shutdown,
        };
        let result = self.strategy.serve(ctx).await;
        self.running.store(false, Ordering::SeqCst);

        match &result {
            Ok(()) => tracing::info!("Server stopped"),
            Err(e) => tracing::error!("Server stopped with error: {}", e),
        }
        result
    }

    /// Initiates server shutdown.
    pub fn shutdown(&self) {
        let _ = self.shutdown.send(());
    }

    /// Returns a receiver that fires when shutdown is requested, for
    /// companion tasks such as the metrics server.
    pub fn subscribe_shutdown(&self) -> broadcast::Receiver<()> {
        self.shutdown.subscribe()
    }

    /// Returns whether the server is running.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// The endpoint the socket is bound to, once bound.
    pub fn local_endpoint(&self) -> Option<String> {
        self.local_endpoint.lock().clone()
    }

    /// Returns server statistics.
    pub fn stats(&self) -> &ServerStats {
        &self.stats
    }

    pub fn strategy(&self) -> &S {
        &self.strategy
    }
}
