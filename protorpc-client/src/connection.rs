//! Connection management.

use crate::error::ClientError;
use bytes::Bytes;
use futures::future::BoxFuture;
use futures::FutureExt;
use protorpc_protocol::validate_endpoint;
use rand::seq::SliceRandom;
use std::time::{Duration, Instant};
use zeromq::{ReqSocket, Socket, SocketRecv, SocketSend, ZmqMessage};

/// Default maximum connection age (60 seconds).
pub const DEFAULT_MAX_AGE: Duration = Duration::from_secs(60);

/// Default receive timeout (2 seconds).
pub const DEFAULT_RECV_TIMEOUT: Duration = Duration::from_millis(2000);

/// Default per-host connect timeout (2 seconds).
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(2);

/// Connection configuration.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Server endpoints (`tcp://host:port` or `ipc://path`).
    pub hosts: Vec<String>,
    /// Maximum lifetime of a connection. `None` disables age-based reaping.
    pub maxage: Option<Duration>,
    /// Maximum idle time of a connection. `None` disables idle reaping.
    pub maxidle: Option<Duration>,
    /// How long to wait for a reply.
    pub recv_timeout: Duration,
    /// How long to wait for each host to accept the connection.
    pub connect_timeout: Duration,
}

impl ConnectionConfig {
    pub fn new<I, S>(hosts: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            hosts: hosts.into_iter().map(Into::into).collect(),
            maxage: Some(DEFAULT_MAX_AGE),
            maxidle: None,
            recv_timeout: DEFAULT_RECV_TIMEOUT,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }

    pub fn with_maxage(mut self, maxage: Option<Duration>) -> Self {
        self.maxage = maxage;
        self
    }

    pub fn with_maxidle(mut self, maxidle: Option<Duration>) -> Self {
        self.maxidle = maxidle;
        self
    }

    pub fn with_recv_timeout(mut self, timeout: Duration) -> Self {
        self.recv_timeout = timeout;
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }
}

/// A resource the pool can hold: it can report (and lazily decide) whether
/// it is closed, and it can be closed.
pub trait PoolableConnection: Send + 'static {
    /// Returns whether the connection is unusable. May close it as a side
    /// effect when an expiry limit has passed.
    fn is_closed(&mut self) -> bool;

    /// Closes the connection. Idempotent.
    fn close(&mut self);
}

/// A pooled connection that performs one request/reply exchange at a time.
pub trait Exchange: PoolableConnection {
    /// Sends `payload` and waits up to `timeout` for the reply payload.
    fn exchange(
        &mut self,
        payload: Bytes,
        timeout: Duration,
    ) -> BoxFuture<'_, Result<Bytes, ClientError>>;
}

/// A request/response connection to one or more protorpc servers.
///
/// One request may be outstanding at a time; a reply must be received
/// before the next request is sent.
pub struct Connection {
    config: ConnectionConfig,
    socket: Option<ReqSocket>,
    created_at: Instant,
    last_used: Instant,
    awaiting_reply: bool,
}

impl Connection {
    /// Opens a REQ socket connected to every configured host, in random
    /// order so that load spreads across servers.
    pub async fn connect(config: ConnectionConfig) -> Result<Self, ClientError> {
        if config.hosts.is_empty() {
            return Err(ClientError::Transport("no hosts configured".to_string()));
        }
        for host in &config.hosts {
            validate_endpoint(host)?;
        }

        let mut hosts = config.hosts.clone();
        hosts.shuffle(&mut rand::thread_rng());

        let mut socket = ReqSocket::new();
        let mut connected = 0usize;
        let mut last_error = None;
        for host in &hosts {
            tracing::debug!("Connecting to {}...", host);
            let result = tokio::time::timeout(config.connect_timeout, socket.connect(host)).await;
            match result {
                Ok(Ok(())) => connected += 1,
                Ok(Err(e)) => {
                    tracing::debug!("Connection to {} failed: {}", host, e);
                    last_error = Some(e.to_string());
                }
                Err(_) => {
                    tracing::debug!("Connection to {} timed out", host);
                    last_error = Some(format!("connect to {} timed out", host));
                }
            }
        }

        if connected == 0 {
            return Err(ClientError::Transport(
                last_error.unwrap_or_else(|| "no reachable host".to_string()),
            ));
        }

        let now = Instant::now();
        Ok(Self {
            config,
            socket: Some(socket),
            created_at: now,
            last_used: now,
            awaiting_reply: false,
        })
    }

    /// Sends one request payload.
    pub async fn send(&mut self, payload: Bytes) -> Result<(), ClientError> {
        if self.awaiting_reply {
            return Err(ClientError::Transport(
                "send while a reply is outstanding".to_string(),
            ));
        }
        let socket = self
            .socket
            .as_mut()
            .ok_or_else(|| ClientError::Transport("connection closed".to_string()))?;

        self.last_used = Instant::now();
        // Set before the write so a send cancelled midway is reaped too.
        self.awaiting_reply = true;
        let result = socket.send(ZmqMessage::from(payload)).await;
        if let Err(e) = result {
            tracing::debug!("Send failed: {}", e);
            self.close();
            return Err(ClientError::Transport(e.to_string()));
        }
        Ok(())
    }

    /// Waits for the reply to the last request. On timeout or socket error
    /// the connection closes itself.
    pub async fn recv(&mut self, timeout: Duration) -> Result<Bytes, ClientError> {
        let socket = self
            .socket
            .as_mut()
            .ok_or_else(|| ClientError::Transport("connection closed".to_string()))?;

        let result = tokio::time::timeout(timeout, socket.recv()).await;
        let message = match result {
            Ok(Ok(message)) => message,
            Ok(Err(e)) => {
                tracing::debug!("Receive failed: {}", e);
                self.close();
                return Err(ClientError::Transport(e.to_string()));
            }
            Err(_) => {
                tracing::debug!("Receive timed out after {:?}", timeout);
                self.close();
                return Err(ClientError::Timeout);
            }
        };

        self.last_used = Instant::now();
        self.awaiting_reply = false;
        let mut frames = message.into_vec();
        frames
            .pop()
            .ok_or_else(|| ClientError::BadResponse("empty reply".to_string()))
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    /// Time since the connection was opened.
    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }

    /// Time since the last send or receive.
    pub fn idle_time(&self) -> Duration {
        self.last_used.elapsed()
    }

    fn expired(&self) -> bool {
        self.config.maxage.is_some_and(|max| self.age() > max)
            || self.config.maxidle.is_some_and(|max| self.idle_time() > max)
    }
}

impl PoolableConnection for Connection {
    fn is_closed(&mut self) -> bool {
        if self.socket.is_none() {
            return true;
        }
        if self.awaiting_reply {
            // The exchange was abandoned; its reply may still arrive.
            tracing::debug!("Reaping connection with an outstanding reply");
            self.close();
            return true;
        }
        if self.expired() {
            tracing::debug!("Reaping expired connection (age {:?})", self.age());
            self.close();
            return true;
        }
        false
    }

    fn close(&mut self) {
        if self.socket.take().is_some() {
            tracing::debug!("Connection closed");
        }
        self.awaiting_reply = false;
    }
}

impl Exchange for Connection {
    fn exchange(
        &mut self,
        payload: Bytes,
        timeout: Duration,
    ) -> BoxFuture<'_, Result<Bytes, ClientError>> {
        async move {
            self.send(payload).await?;
            self.recv(timeout).await
        }
        .boxed()
    }
}
