//! Server concurrency architectures.
//!
//! Both strategies receive multipart requests on one ROUTER socket, hand the
//! payload to the shared [`Dispatcher`], and reply with the routing frames
//! the request arrived with.
//!
//! - [`PooledStrategy`]: one task per request, bounded by a semaphore.
//! - [`BrokerStrategy`]: a broker loop fanning requests out round-robin to a
//!   fixed set of long-lived OS worker threads.

use crate::dispatcher::Dispatcher;
use crate::error::ServerError;
use crate::server::ServerStats;
use protorpc_protocol::RoutedFrame;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use futures::future::select_all;
use tokio::runtime::Handle;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{broadcast, mpsc, Semaphore};
use zeromq::{RouterSocket, SocketRecv, SocketSend, ZmqMessage};

/// Default in-flight call limit for [`PooledStrategy`].
pub const DEFAULT_POOL_SIZE: usize = 100;

/// Default broker worker count.
pub const DEFAULT_WORKERS: usize = 4;

/// Default interval at which broker workers re-check the stop flag.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Default bound on joining broker workers at shutdown.
pub const DEFAULT_JOIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Pending requests per broker worker.
const WORKER_QUEUE_DEPTH: usize = 64;

/// Everything a strategy needs to serve one bound socket.
pub struct ServeContext {
    pub socket: RouterSocket,
    pub dispatcher: Arc<Dispatcher>,
    pub stats: Arc<ServerStats>,
    pub shutdown: broadcast::Receiver<()>,
}

impl ServeContext {
    fn record_dropped(&self) {
        self.stats.record_dropped(self.dispatcher.metrics().map(|m| m.as_ref()));
    }

    /// Sends one reply; a failed send drops the reply, not the server.
    async fn send_reply(&mut self, reply: ZmqMessage) {
        let result = self.socket.send(reply).await;
        match result {
            Ok(()) => self.stats.record_replied(),
            Err(e) => {
                tracing::warn!("Dropping reply: {}", e);
                self.record_dropped();
            }
        }
    }

    /// Splits a received message, dropping malformed ones.
    fn accept(&self, message: ZmqMessage) -> Option<RoutedFrame> {
        match RoutedFrame::from_message(message) {
            Ok(frame) => {
                self.stats.record_received();
                tracing::debug!("Received {} byte request", frame.payload.len());
                Some(frame)
            }
            Err(e) => {
                tracing::warn!("Dropping malformed message: {}", e);
                self.record_dropped();
                None
            }
        }
    }
}

/// A server concurrency architecture.
pub trait ExecutionStrategy: Send + Sync + 'static {
    /// Short name used in logs.
    fn name(&self) -> &'static str;

    /// Serves requests until the shutdown signal fires or the socket fails.
    fn serve(&self, ctx: ServeContext) -> impl Future<Output = Result<(), ServerError>> + Send;
}

/// Runs each request on its own task, with at most `pool_size` in flight.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PooledStrategy {
    pub pool_size: usize,
}

impl PooledStrategy {
    pub fn new(pool_size: usize) -> Self {
        Self {
            pool_size: pool_size.max(1),
        }
    }
}

impl Default for PooledStrategy {
    fn default() -> Self {
        Self::new(DEFAULT_POOL_SIZE)
    }
}

impl ExecutionStrategy for PooledStrategy {
    fn name(&self) -> &'static str {
        "pooled"
    }

    async fn serve(&self, mut ctx: ServeContext) -> Result<(), ServerError> {
        let permits = Arc::new(Semaphore::new(self.pool_size));
        // Every in-flight task holds a permit, so replies never outnumber
        // the channel capacity.
        let (reply_tx, mut reply_rx) = mpsc::channel::<ZmqMessage>(self.pool_size);

        loop {
            tokio::select! {
                biased;

                _ = ctx.shutdown.recv() => {
                    tracing::info!("Pooled strategy draining");
                    break;
                }

                Some(reply) = reply_rx.recv() => {
                    ctx.send_reply(reply).await;
                }

                result = ctx.socket.recv() => {
                    let message = result?;
                    let Some(frame) = ctx.accept(message) else {
                        continue;
                    };

                    let permit = tokio::select! {
                        permit = permits.clone().acquire_owned() => match permit {
                            Ok(permit) => permit,
                            Err(_) => break,
                        },
                        _ = ctx.shutdown.recv() => {
                            tracing::info!("Pooled strategy draining");
                            break;
                        }
                    };

                    let dispatcher = ctx.dispatcher.clone();
                    let reply_tx = reply_tx.clone();
                    tokio::spawn(async move {
                        let _permit = permit;
                        let response = dispatcher.handle(&frame.payload).await;
                        match frame.reply(response) {
                            Ok(reply) => {
                                // Fails only once the socket loop has stopped.
                                let _ = reply_tx.send(reply).await;
                            }
                            Err(e) => tracing::warn!("Failed to build reply: {}", e),
                        }
                    });
                }
            }
        }

        // In-flight tasks finish on their own; their replies go nowhere.
        drop(reply_rx);
        tracing::info!("Pooled strategy stopped");
        Ok(())
    }
}

/// Fans requests out to long-lived worker threads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BrokerStrategy {
    pub workers: usize,
    pub poll_interval: Duration,
    pub join_timeout: Duration,
}

impl BrokerStrategy {
    pub fn new(workers: usize) -> Self {
        Self {
            workers: workers.max(1),
            poll_interval: DEFAULT_POLL_INTERVAL,
            join_timeout: DEFAULT_JOIN_TIMEOUT,
        }
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_join_timeout(mut self, timeout: Duration) -> Self {
        self.join_timeout = timeout;
        self
    }

    fn spawn_workers(
        &self,
        dispatcher: &Arc<Dispatcher>,
        stop: &Arc<AtomicBool>,
        replies: &mpsc::UnboundedSender<ZmqMessage>,
    ) -> Result<(Vec<mpsc::Sender<RoutedFrame>>, Vec<JoinHandle<()>>), ServerError> {
        let handle = Handle::current();
        let mut queues = Vec::with_capacity(self.workers);
        let mut threads = Vec::with_capacity(self.workers);

        for id in 0..self.workers {
            let (tx, rx) = mpsc::channel(WORKER_QUEUE_DEPTH);
            let worker = Worker {
                id,
                queue: rx,
                replies: replies.clone(),
                dispatcher: dispatcher.clone(),
                stop: stop.clone(),
                poll_interval: self.poll_interval,
                runtime: handle.clone(),
            };
            let spawned = std::thread::Builder::new()
                .name(format!("protorpc-worker-{}", id))
                .spawn(move || worker.run());
            match spawned {
                Ok(thread) => {
                    queues.push(tx);
                    threads.push(thread);
                }
                Err(e) => {
                    stop.store(true, Ordering::SeqCst);
                    return Err(ServerError::Io(e));
                }
            }
        }

        Ok((queues, threads))
    }
}

impl Default for BrokerStrategy {
    fn default() -> Self {
        Self::new(DEFAULT_WORKERS)
    }
}

impl ExecutionStrategy for BrokerStrategy {
    fn name(&self) -> &'static str {
        "broker"
    }

    async fn serve(&self, mut ctx: ServeContext) -> Result<(), ServerError> {
        let stop = Arc::new(AtomicBool::new(false));
        let (reply_tx, mut reply_rx) = mpsc::unbounded_channel();
        let (queues, threads) = self.spawn_workers(&ctx.dispatcher, &stop, &reply_tx)?;
        drop(reply_tx);
        tracing::info!("Broker started {} workers", queues.len());

        let mut assigner = Assigner::new(queues);
        let result = 'serve: loop {
            if stop.load(Ordering::SeqCst) {
                break Err(ServerError::Worker("a worker raised stop".to_string()));
            }

            tokio::select! {
                biased;

                _ = ctx.shutdown.recv() => {
                    tracing::info!("Broker stopping");
                    break Ok(());
                }

                Some(reply) = reply_rx.recv() => {
                    ctx.send_reply(reply).await;
                }

                result = ctx.socket.recv() => {
                    let message = match result {
                        Ok(message) => message,
                        Err(e) => break Err(e.into()),
                    };
                    let Some(frame) = ctx.accept(message) else {
                        continue;
                    };

                    let frame = match assigner.try_assign(frame) {
                        Assignment::Queued(worker) => {
                            tracing::debug!(worker, "Queued request");
                            continue;
                        }
                        Assignment::Closed(worker) => {
                            tracing::error!(worker, "Worker queue closed, dropping request");
                            ctx.record_dropped();
                            stop.store(true, Ordering::SeqCst);
                            continue;
                        }
                        Assignment::Full(frame) => frame,
                    };

                    // Every queue is full: wait for room anywhere while
                    // still forwarding finished replies.
                    tracing::debug!("All worker queues full, waiting");
                    loop {
                        tokio::select! {
                            biased;

                            _ = ctx.shutdown.recv() => {
                                tracing::info!("Broker stopping");
                                break 'serve Ok(());
                            }

                            Some(reply) = reply_rx.recv() => {
                                ctx.send_reply(reply).await;
                            }

                            permit = assigner.reserve_any() => {
                                match permit {
                                    Some((worker, permit)) => {
                                        permit.send(frame);
                                        tracing::debug!(worker, "Queued request");
                                    }
                                    None => {
                                        tracing::error!("Worker queues closed, dropping request");
                                        ctx.record_dropped();
                                        stop.store(true, Ordering::SeqCst);
                                    }
                                }
                                break;
                            }

                            _ = tokio::time::sleep(self.poll_interval) => {
                                if stop.load(Ordering::SeqCst) {
                                    ctx.record_dropped();
                                    break;
                                }
                            }
                        }
                    }
                }

                // Wake periodically so a stop raised by a worker is noticed.
                _ = tokio::time::sleep(self.poll_interval) => {}
            }
        };

        stop.store(true, Ordering::SeqCst);
        drop(assigner);
        join_workers(threads, self.join_timeout).await;
        tracing::info!("Broker stopped");
        result
    }
}

/// Outcome of handing a request to a worker queue.
enum Assignment {
    Queued(usize),
    /// The worker's queue is gone.
    Closed(usize),
    /// Every queue is full; the frame is handed back.
    Full(RoutedFrame),
}

/// Round-robin over worker queues, skipping workers with no room.
struct Assigner {
    queues: Vec<mpsc::Sender<RoutedFrame>>,
    next: usize,
}

impl Assigner {
    fn new(queues: Vec<mpsc::Sender<RoutedFrame>>) -> Self {
        Self { queues, next: 0 }
    }

    fn try_assign(&mut self, mut frame: RoutedFrame) -> Assignment {
        for _ in 0..self.queues.len() {
            let worker = self.next;
            self.next = (self.next + 1) % self.queues.len();
            match self.queues[worker].try_send(frame) {
                Ok(()) => return Assignment::Queued(worker),
                Err(TrySendError::Full(returned)) => frame = returned,
                Err(TrySendError::Closed(_)) => return Assignment::Closed(worker),
            }
        }
        Assignment::Full(frame)
    }

    /// Waits for room in any queue. `None` once every queue is closed.
    async fn reserve_any(&self) -> Option<(usize, mpsc::Permit<'_, RoutedFrame>)> {
        let mut pending: Vec<_> = self
            .queues
            .iter()
            .enumerate()
            .map(|(worker, queue)| Box::pin(async move { (worker, queue.reserve().await) }))
            .collect();

        while !pending.is_empty() {
            let ((worker, reserved), _, rest) = select_all(pending).await;
            if let Ok(permit) = reserved {
                return Some((worker, permit));
            }
            pending = rest;
        }
        None
    }
}

/// Waits up to `timeout` for worker threads to exit; stragglers are left
/// detached.
async fn join_workers(threads: Vec<JoinHandle<()>>, timeout: Duration) {
    let deadline = Instant::now() + timeout;
    let mut pending = threads;

    loop {
        let (finished, running): (Vec<_>, Vec<_>) =
            pending.into_iter().partition(|t| t.is_finished());
        for thread in finished {
            if thread.join().is_err() {
                tracing::error!("Worker thread panicked");
            }
        }
        pending = running;

        if pending.is_empty() {
            return;
        }
        if Instant::now() >= deadline {
            tracing::warn!("{} workers did not stop in time", pending.len());
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// One broker worker: owns its request queue and runs on a dedicated thread.
struct Worker {
    id: usize,
    queue: mpsc::Receiver<RoutedFrame>,
    replies: mpsc::UnboundedSender<ZmqMessage>,
    dispatcher: Arc<Dispatcher>,
    stop: Arc<AtomicBool>,
    poll_interval: Duration,
    runtime: Handle,
}

impl Worker {
    fn run(mut self) {
        tracing::debug!(worker = self.id, "Worker started");
        let _stop_on_exit = StopOnExit(self.stop.clone());

        while !self.stop.load(Ordering::SeqCst) {
            let interval = self.poll_interval;
            let queue = &mut self.queue;
            // The timer must be created inside the runtime context.
            let polled = self
                .runtime
                .block_on(async { tokio::time::timeout(interval, queue.recv()).await });
            let frame = match polled {
                Err(_) => continue,
                Ok(None) => break,
                Ok(Some(frame)) => frame,
            };

            let response = self.runtime.block_on(self.dispatcher.handle(&frame.payload));
            let sent = frame
                .reply(response)
                .map_err(|e| e.to_string())
                .and_then(|reply| {
                    self.replies
                        .send(reply)
                        .map_err(|_| "broker is gone".to_string())
                });
            if let Err(e) = sent {
                tracing::error!(worker = self.id, "Worker failed: {}", e);
                self.stop.store(true, Ordering::SeqCst);
                break;
            }
        }

        self.queue.close();
        tracing::debug!(worker = self.id, "Worker stopped");
    }
}

/// Raises the shared stop flag when a worker exits, including by panic.
struct StopOnExit(Arc<AtomicBool>);

impl Drop for StopOnExit {
    fn drop(&mut self) {
        self.0.store(true, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    #[test]
    fn test_strategy_defaults() {
        let pooled = PooledStrategy::default();
        assert_eq!(pooled.pool_size, 100);
        assert_eq!(pooled.name(), "pooled");
        assert_eq!(PooledStrategy::new(0).pool_size, 1);

        let broker = BrokerStrategy::default();
        assert_eq!(broker.workers, 4);
        assert_eq!(broker.poll_interval, Duration::from_secs(1));
        assert_eq!(broker.join_timeout, Duration::from_secs(5));
        assert_eq!(broker.name(), "broker");
    }

    #[test]
    fn test_broker_builders() {
        let broker = BrokerStrategy::new(0)
            .with_poll_interval(Duration::from_millis(50))
            .with_join_timeout(Duration::from_millis(200));
        assert_eq!(broker.workers, 1);
        assert_eq!(broker.poll_interval, Duration::from_millis(50));
        assert_eq!(broker.join_timeout, Duration::from_millis(200));
    }

    fn frame(n: u8) -> RoutedFrame {
        RoutedFrame::new(vec![Bytes::from(vec![n])], Bytes::from(vec![n]))
    }

    #[tokio::test]
    async fn test_assigner_skips_a_stalled_worker() {
        let (stalled_tx, _stalled_rx) = mpsc::channel(1);
        let (busy_tx, mut busy_rx) = mpsc::channel(8);
        let mut assigner = Assigner::new(vec![stalled_tx, busy_tx]);

        // Worker 0 never drains its queue.
        assert!(matches!(assigner.try_assign(frame(0)), Assignment::Queued(0)));
        for n in 1..=4 {
            assert!(matches!(assigner.try_assign(frame(n)), Assignment::Queued(1)));
        }

        let mut served = Vec::new();
        while let Ok(frame) = busy_rx.try_recv() {
            served.push(frame.payload[0]);
        }
        assert_eq!(served, vec![1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn test_assigner_waits_for_room_when_all_full() {
        let (a_tx, _a_rx) = mpsc::channel(1);
        let (b_tx, mut b_rx) = mpsc::channel(1);
        let mut assigner = Assigner::new(vec![a_tx, b_tx]);

        assert!(matches!(assigner.try_assign(frame(1)), Assignment::Queued(0)));
        assert!(matches!(assigner.try_assign(frame(2)), Assignment::Queued(1)));
        let Assignment::Full(rejected) = assigner.try_assign(frame(3)) else {
            panic!("expected every queue to be full");
        };

        let mut reserve = tokio_test::task::spawn(assigner.reserve_any());
        tokio_test::assert_pending!(reserve.poll());

        // Worker 1 takes a request; its queue has room again.
        assert_eq!(b_rx.recv().await.unwrap().payload[0], 2);
        assert!(reserve.is_woken());
        let (worker, permit) = tokio_test::assert_ready!(reserve.poll()).unwrap();
        assert_eq!(worker, 1);
        permit.send(rejected);
        drop(reserve);
        assert_eq!(b_rx.recv().await.unwrap().payload[0], 3);
    }

    #[tokio::test]
    async fn test_assigner_reports_closed_queues() {
        let (tx, rx) = mpsc::channel(1);
        let mut assigner = Assigner::new(vec![tx]);
        drop(rx);
        assert!(matches!(assigner.try_assign(frame(1)), Assignment::Closed(0)));
        assert!(assigner.reserve_any().await.is_none());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_worker_serves_from_its_own_thread() {
        let service = crate::service::ServiceBuilder::new("test.Empty").build();
        let dispatcher = Arc::new(Dispatcher::new(Arc::new(service)));
        let stop = Arc::new(AtomicBool::new(false));
        let (reply_tx, mut reply_rx) = mpsc::unbounded_channel();
        let strategy = BrokerStrategy::new(1).with_poll_interval(Duration::from_millis(20));
        let (queues, threads) = strategy
            .spawn_workers(&dispatcher, &stop, &reply_tx)
            .unwrap();

        // Let the worker time out on an empty queue at least once.
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(!threads[0].is_finished());

        queues[0]
            .send(RoutedFrame::new(vec![Bytes::from_static(b"peer")], Bytes::from_static(b"\xff")))
            .await
            .unwrap();
        let reply = tokio::time::timeout(Duration::from_secs(2), reply_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(reply.into_vec()[0], Bytes::from_static(b"peer"));

        drop(queues);
        join_workers(threads, Duration::from_secs(2)).await;
        assert!(stop.load(Ordering::SeqCst));
    }

    #[test]
    fn test_worker_panic_raises_stop() {
        let stop = Arc::new(AtomicBool::new(false));
        let guard_stop = stop.clone();
        let thread = std::thread::spawn(move || {
            let _stop_on_exit = StopOnExit(guard_stop);
            panic!("worker bug");
        });
        assert!(thread.join().is_err());
        assert!(stop.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_join_workers_waits_for_exit() {
        let thread = std::thread::spawn(|| std::thread::sleep(Duration::from_millis(20)));
        let start = Instant::now();
        join_workers(vec![thread], Duration::from_secs(2)).await;
        assert!(start.elapsed() >= Duration::from_millis(15));
    }

    #[tokio::test]
    async fn test_join_workers_is_bounded() {
        let (tx, rx) = std::sync::mpsc::channel::<()>();
        let thread = std::thread::spawn(move || {
            let _ = rx.recv();
        });
        let start = Instant::now();
        join_workers(vec![thread], Duration::from_millis(50)).await;
        assert!(start.elapsed() < Duration::from_secs(1));
        drop(tx);
    }
}
