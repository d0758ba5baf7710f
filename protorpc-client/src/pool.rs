//! Bounded connection pool.
//!
//! The pool creates connections on demand up to `maxsize`, hands each one to
//! at most one leaseholder at a time, and rotates returned connections
//! through a FIFO idle queue. Expired or closed connections are reaped
//! lazily: they are discarded when they reach the front of the queue.

use crate::connection::PoolableConnection;
use crate::error::ClientError;
use futures::future::BoxFuture;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;

/// Creates a new connection for the pool.
pub type ConnectionFactory<C> =
    Arc<dyn Fn() -> BoxFuture<'static, Result<C, ClientError>> + Send + Sync>;

/// Default pool capacity.
pub const DEFAULT_MAX_SIZE: usize = 10;

/// How a lease waits when the pool is at capacity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LeaseOptions {
    /// Wait for a connection to be returned. When false, a full pool fails
    /// immediately with `PoolExhausted`.
    pub block: bool,
    /// Upper bound on the wait. `None` waits indefinitely.
    pub timeout: Option<Duration>,
}

impl Default for LeaseOptions {
    fn default() -> Self {
        Self {
            block: true,
            timeout: None,
        }
    }
}

impl LeaseOptions {
    /// Fails immediately instead of waiting.
    pub fn non_blocking() -> Self {
        Self {
            block: false,
            timeout: None,
        }
    }

    /// Waits at most `timeout`.
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            block: true,
            timeout: Some(timeout),
        }
    }
}

/// Point-in-time pool counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    pub size: usize,
    pub idle: usize,
    pub leased: usize,
    pub maxsize: usize,
}

struct State<C> {
    idle: VecDeque<C>,
    size: usize,
    leased: usize,
}

/// A bounded, FIFO-rotating pool of connections.
pub struct ConnectionPool<C> {
    factory: ConnectionFactory<C>,
    maxsize: usize,
    state: Mutex<State<C>>,
    available: Notify,
}

impl<C: PoolableConnection> ConnectionPool<C> {
    /// Creates an empty pool. `maxsize` is raised to at least one.
    pub fn new<F>(factory: F, maxsize: usize) -> Self
    where
        F: Fn() -> BoxFuture<'static, Result<C, ClientError>> + Send + Sync + 'static,
    {
        Self {
            factory: Arc::new(factory),
            maxsize: maxsize.max(1),
            state: Mutex::new(State {
                idle: VecDeque::new(),
                size: 0,
                leased: 0,
            }),
            available: Notify::new(),
        }
    }

    /// Takes a connection out of the pool. The caller must hand it back with
    /// [`release`](Self::release) or [`discard`](Self::discard).
    pub async fn acquire(&self, options: LeaseOptions) -> Result<C, ClientError> {
        let deadline = options.timeout.map(|t| tokio::time::Instant::now() + t);

        loop {
            // Register interest before inspecting state so a release between
            // the check and the wait is not missed.
            let notified = self.available.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let reserved = {
                let mut state = self.state.lock();
                while let Some(mut conn) = state.idle.pop_front() {
                    if conn.is_closed() {
                        state.size -= 1;
                        tracing::debug!("Discarded closed connection, pool size {}", state.size);
                        continue;
                    }
                    state.leased += 1;
                    return Ok(conn);
                }
                if state.size < self.maxsize {
                    state.size += 1;
                    state.leased += 1;
                    true
                } else {
                    false
                }
            };

            if reserved {
                let mut reservation = Reservation {
                    pool: self,
                    armed: true,
                };
                let conn = (self.factory)().await?;
                reservation.armed = false;
                tracing::debug!("Created pooled connection");
                return Ok(conn);
            }

            if !options.block {
                return Err(ClientError::PoolExhausted);
            }

            match deadline {
                Some(deadline) => {
                    if tokio::time::timeout_at(deadline, notified).await.is_err() {
                        return Err(ClientError::PoolExhausted);
                    }
                }
                None => notified.await,
            }
        }
    }

    /// Returns a connection to the back of the idle queue. Closed
    /// connections are accepted too; they are reaped on a later lease.
    pub fn release(&self, conn: C) {
        {
            let mut state = self.state.lock();
            state.leased = state.leased.saturating_sub(1);
            state.idle.push_back(conn);
        }
        self.available.notify_one();
    }

    /// Closes a leased connection and frees its slot.
    pub fn discard(&self, mut conn: C) {
        conn.close();
        self.free_slot();
    }

    /// Leases a connection for the lifetime of the returned guard.
    pub async fn lease(&self, options: LeaseOptions) -> Result<Lease<'_, C>, ClientError> {
        let conn = self.acquire(options).await?;
        Ok(Lease {
            pool: self,
            conn: Some(conn),
        })
    }

    fn free_slot(&self) {
        {
            let mut state = self.state.lock();
            state.leased = state.leased.saturating_sub(1);
            state.size = state.size.saturating_sub(1);
        }
        self.available.notify_one();
    }

    /// Connections created and not yet discarded.
    pub fn size(&self) -> usize {
        self.state.lock().size
    }

    pub fn idle(&self) -> usize {
        self.state.lock().idle.len()
    }

    pub fn leased(&self) -> usize {
        self.state.lock().leased
    }

    pub fn maxsize(&self) -> usize {
        self.maxsize
    }

    pub fn stats(&self) -> PoolStats {
        let state = self.state.lock();
        PoolStats {
            size: state.size,
            idle: state.idle.len(),
            leased: state.leased,
            maxsize: self.maxsize,
        }
    }
}

/// Rolls back a capacity reservation if connection creation fails or is
/// cancelled.
struct Reservation<'a, C: PoolableConnection> {
    pool: &'a ConnectionPool<C>,
    armed: bool,
}

impl<C: PoolableConnection> Drop for Reservation<'_, C> {
    fn drop(&mut self) {
        if self.armed {
            tracing::debug!("Connection creation failed, releasing reserved slot");
            self.pool.free_slot();
        }
    }
}

/// Exclusive use of one pooled connection. Dropping the lease returns the
/// connection to the pool.
pub struct Lease<'a, C: PoolableConnection> {
    pool: &'a ConnectionPool<C>,
    conn: Option<C>,
}

impl<C: PoolableConnection> Lease<'_, C> {
    /// Poisons the leased connection: it is closed and removed from the pool
    /// instead of being returned.
    pub fn remove(mut self) {
        if let Some(conn) = self.conn.take() {
            self.pool.discard(conn);
        }
    }
}

impl<C: PoolableConnection> Deref for Lease<'_, C> {
    type Target = C;

    fn deref(&self) -> &C {
        // Only `remove` and `drop` take the connection, and both consume
        // the lease.
        match &self.conn {
            Some(conn) => conn,
            None => unreachable!("lease used after its connection was taken"),
        }
    }
}

impl<C: PoolableConnection> DerefMut for Lease<'_, C> {
    fn deref_mut(&mut self) -> &mut C {
        match &mut self.conn {
            Some(conn) => conn,
            None => unreachable!("lease used after its connection was taken"),
        }
    }
}

impl<C: PoolableConnection> Drop for Lease<'_, C> {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            self.pool.release(conn);
        }
    }
}
