//! Per-worker pool of streaming channels
//!
//! Keeps a bounded set of long-lived [`WorkerStream`]s per worker and lends
//! one out for the duration of a single submission. A fair semaphore
//! provides the FIFO waiter queue and bounds `acquire`; a mutex guards the
//! idle set and the open-stream count. Disconnected streams are evicted
//! and recreated with capped exponential back-off.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::stream::WorkerStream;
use crate::config::Args;
use crate::health::BreakerRegistry;
use crate::types::{GatewayError, Result};
use crate::workers::{Worker, WorkerRegistry};

/// Pool tuning knobs
#[derive(Debug, Clone)]
pub struct StreamPoolConfig {
    /// Streams kept per worker, bounded [1,10]
    pub max_streams: usize,
    /// How long a caller may wait for a stream
    pub acquire_timeout: Duration,
    /// Deadline for opening a new connection
    pub connect_timeout: Duration,
    /// Idle liveness probe interval
    pub health_tick: Duration,
    /// Reconnect attempts after an unexpected close
    pub max_reconnect_attempts: u32,
}

impl Default for StreamPoolConfig {
    fn default() -> Self {
        Self {
            max_streams: 3,
            acquire_timeout: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(10),
            health_tick: Duration::from_secs(30),
            max_reconnect_attempts: 5,
        }
    }
}

impl StreamPoolConfig {
    pub fn from_args(args: &Args) -> Self {
        Self {
            max_streams: args.max_streams_per_worker.clamp(1, 10),
            acquire_timeout: args.acquire_timeout(),
            connect_timeout: Duration::from_secs(args.stream_connect_timeout_secs),
            health_tick: Duration::from_secs(30),
            max_reconnect_attempts: 5,
        }
    }
}

/// Reconnect delay: min(1s * 2^(attempt-1), 30s)
fn reconnect_backoff(attempt: u32) -> Duration {
    let exp = Duration::from_secs(1) * 2u32.saturating_pow(attempt.saturating_sub(1));
    exp.min(Duration::from_secs(30))
}

/// Serializable pool state for the status endpoint
#[derive(Debug, Clone, Serialize)]
pub struct PoolStatus {
    pub worker: String,
    pub open: usize,
    pub idle: usize,
    pub in_use: usize,
    pub max: usize,
}

struct PoolInner {
    idle: VecDeque<WorkerStream>,
    open_count: usize,
    next_stream_id: u64,
}

/// A stream on loan from the pool. Holds the capacity permit for the
/// duration of the lease; returning it through `release` wakes the oldest
/// waiter.
#[derive(Debug)]
pub struct PooledStream {
    pub stream: WorkerStream,
    _permit: OwnedSemaphorePermit,
}

impl std::ops::Deref for PooledStream {
    type Target = WorkerStream;
    fn deref(&self) -> &WorkerStream {
        &self.stream
    }
}

impl std::ops::DerefMut for PooledStream {
    fn deref_mut(&mut self) -> &mut WorkerStream {
        &mut self.stream
    }
}

/// Bounded pool of streaming channels to one worker
pub struct StreamPool {
    worker: Arc<Worker>,
    config: StreamPoolConfig,
    semaphore: Arc<Semaphore>,
    inner: Mutex<PoolInner>,
    closed: AtomicBool,
}

impl StreamPool {
    pub fn new(worker: Arc<Worker>, config: StreamPoolConfig) -> Self {
        let semaphore = Arc::new(Semaphore::new(config.max_streams));
        Self {
            worker,
            config,
            semaphore,
            inner: Mutex::new(PoolInner {
                idle: VecDeque::new(),
                open_count: 0,
                next_stream_id: 0,
            }),
            closed: AtomicBool::new(false),
        }
    }

    pub fn worker_id(&self) -> &str {
        &self.worker.id
    }

    /// Borrow a stream: an idle one if available, a fresh connection while
    /// under the cap, otherwise wait FIFO up to `acquire_timeout`.
    pub async fn acquire(self: &Arc<Self>) -> Result<PooledStream> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(GatewayError::Internal(format!(
                "Stream pool for {} is closed",
                self.worker.id
            )));
        }

        let permit = match tokio::time::timeout(
            self.config.acquire_timeout,
            Arc::clone(&self.semaphore).acquire_owned(),
        )
        .await
        {
            Ok(Ok(permit)) => permit,
            Ok(Err(_)) => {
                return Err(GatewayError::Internal(format!(
                    "Stream pool for {} is closed",
                    self.worker.id
                )))
            }
            Err(_) => {
                // Pool exhausted for the whole wait; surfaces as transport
                return Err(GatewayError::Transport(format!(
                    "Timed out waiting for a stream to {}",
                    self.worker.id
                )));
            }
        };

        // Prefer idle streams, discarding any that died while parked
        loop {
            let candidate = {
                let mut inner = self.lock();
                match inner.idle.pop_front() {
                    Some(stream) if stream.is_connected() => Some(stream),
                    Some(dead) => {
                        inner.open_count = inner.open_count.saturating_sub(1);
                        debug!(worker = %self.worker.id, stream_id = dead.id, "Discarding dead idle stream");
                        drop(inner);
                        self.spawn_reconnect(1);
                        continue;
                    }
                    None => None,
                }
            };

            if let Some(mut stream) = candidate {
                stream.mark_used();
                stream.drain();
                return Ok(PooledStream {
                    stream,
                    _permit: permit,
                });
            }
            break;
        }

        // Nothing idle: open a new connection while under the cap
        let reserved_id = {
            let mut inner = self.lock();
            if inner.open_count < self.config.max_streams {
                inner.open_count += 1;
                inner.next_stream_id += 1;
                Some(inner.next_stream_id)
            } else {
                None
            }
        };

        let id = reserved_id.ok_or_else(|| {
            GatewayError::Internal(format!("No stream slot available for {}", self.worker.id))
        })?;

        match WorkerStream::connect(
            id,
            &self.worker.id,
            &self.worker.ws_url,
            self.config.connect_timeout,
        )
        .await
        {
            Ok(mut stream) => {
                stream.mark_used();
                Ok(PooledStream {
                    stream,
                    _permit: permit,
                })
            }
            Err(e) => {
                self.lock().open_count -= 1;
                Err(e)
            }
        }
    }

    /// Return a lent stream. A live stream goes back to the idle set; a
    /// dead one is dropped and its slot recreated with back-off.
    pub fn release(self: &Arc<Self>, lent: PooledStream) {
        let PooledStream { mut stream, _permit } = lent;

        if self.closed.load(Ordering::SeqCst) {
            let mut inner = self.lock();
            inner.open_count = inner.open_count.saturating_sub(1);
            drop(inner);
            tokio::spawn(async move { stream.close().await });
            return;
        }

        if stream.is_connected() {
            self.lock().idle.push_back(stream);
        } else {
            debug!(worker = %self.worker.id, stream_id = stream.id, "Lent stream died, scheduling reconnect");
            let mut inner = self.lock();
            inner.open_count = inner.open_count.saturating_sub(1);
            drop(inner);
            self.spawn_reconnect(1);
        }

        // Dropping the permit here wakes the oldest waiter
    }

    /// Shut the pool down. Outstanding and future acquires fail.
    pub async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.semaphore.close();

        let streams: Vec<WorkerStream> = {
            let mut inner = self.lock();
            let drained: Vec<WorkerStream> = inner.idle.drain(..).collect();
            inner.open_count = inner.open_count.saturating_sub(drained.len());
            drained
        };

        for mut stream in streams {
            stream.close().await;
        }
        info!(worker = %self.worker.id, "Stream pool closed");
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn status(&self) -> PoolStatus {
        let inner = self.lock();
        PoolStatus {
            worker: self.worker.id.clone(),
            open: inner.open_count,
            idle: inner.idle.len(),
            in_use: inner.open_count.saturating_sub(inner.idle.len()),
            max: self.config.max_streams,
        }
    }

    /// Recreate a lost stream after capped exponential back-off
    fn spawn_reconnect(self: &Arc<Self>, first_attempt: u32) {
        let pool = Arc::clone(self);
        tokio::spawn(async move {
            for attempt in first_attempt..=pool.config.max_reconnect_attempts {
                tokio::time::sleep(reconnect_backoff(attempt)).await;
                if pool.closed.load(Ordering::SeqCst) {
                    return;
                }

                // Reserve a slot; another path may have refilled the pool
                let reserved_id = {
                    let mut inner = pool.lock();
                    if inner.open_count < pool.config.max_streams {
                        inner.open_count += 1;
                        inner.next_stream_id += 1;
                        Some(inner.next_stream_id)
                    } else {
                        None
                    }
                };
                let Some(id) = reserved_id else { return };

                match WorkerStream::connect(
                    id,
                    &pool.worker.id,
                    &pool.worker.ws_url,
                    pool.config.connect_timeout,
                )
                .await
                {
                    Ok(stream) => {
                        pool.lock().idle.push_back(stream);
                        info!(
                            worker = %pool.worker.id,
                            attempt,
                            "Stream reconnected"
                        );
                        return;
                    }
                    Err(e) => {
                        pool.lock().open_count -= 1;
                        warn!(
                            worker = %pool.worker.id,
                            attempt,
                            max = pool.config.max_reconnect_attempts,
                            "Stream reconnect failed: {e}"
                        );
                    }
                }
            }
            warn!(worker = %pool.worker.id, "Giving up on stream reconnect");
        });
    }

    fn lock(&self) -> MutexGuard<'_, PoolInner> {
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Ping idle streams periodically; evict the dead and refill with back-off.
/// Ping failures count toward the worker's stream breaker.
pub fn spawn_maintenance_task(
    pool: Arc<StreamPool>,
    breakers: Arc<BreakerRegistry>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(pool.config.health_tick);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let breaker = breakers.breaker(&BreakerRegistry::stream_name(&pool.worker.id));

        loop {
            interval.tick().await;
            if pool.is_closed() {
                return;
            }

            // Snapshot liveness handles without removing streams from the
            // idle set, so concurrent acquires stay unaffected.
            let handles: Vec<_> = {
                let inner = pool.lock();
                inner.idle.iter().map(|s| s.liveness_handle()).collect()
            };

            let mut dead: Vec<u64> = Vec::new();
            for (id, sink, connected) in handles {
                if !connected.load(Ordering::SeqCst) {
                    dead.push(id);
                    continue;
                }
                let ping = async {
                    let mut sink = sink.lock().await;
                    use futures_util::SinkExt;
                    sink.send(tokio_tungstenite::tungstenite::protocol::Message::Ping(
                        Vec::new(),
                    ))
                    .await
                };
                match tokio::time::timeout(Duration::from_secs(5), ping).await {
                    Ok(Ok(())) => {}
                    _ => {
                        breaker.record_failure();
                        dead.push(id);
                    }
                }
            }

            if !dead.is_empty() {
                let evicted = {
                    let mut inner = pool.lock();
                    let before = inner.idle.len();
                    inner.idle.retain(|s| !dead.contains(&s.id));
                    let evicted = before - inner.idle.len();
                    inner.open_count = inner.open_count.saturating_sub(evicted);
                    evicted
                };
                warn!(worker = %pool.worker.id, evicted, "Evicted dead idle streams");
                for _ in 0..evicted {
                    pool.spawn_reconnect(1);
                }
            }
        }
    })
}

/// All per-worker pools, keyed by worker id
pub struct StreamPools {
    pools: dashmap::DashMap<String, Arc<StreamPool>>,
}

impl StreamPools {
    pub fn new(
        registry: &WorkerRegistry,
        config: StreamPoolConfig,
        breakers: &Arc<BreakerRegistry>,
    ) -> Self {
        let pools = dashmap::DashMap::new();
        for worker in registry.all() {
            let pool = Arc::new(StreamPool::new(Arc::clone(worker), config.clone()));
            spawn_maintenance_task(Arc::clone(&pool), Arc::clone(breakers));
            pools.insert(worker.id.clone(), pool);
        }
        Self { pools }
    }

    pub fn get(&self, worker_id: &str) -> Option<Arc<StreamPool>> {
        self.pools.get(worker_id).map(|e| Arc::clone(e.value()))
    }

    pub fn statuses(&self) -> Vec<PoolStatus> {
        let mut out: Vec<PoolStatus> = self.pools.iter().map(|e| e.status()).collect();
        out.sort_by(|a, b| a.worker.cmp(&b.worker));
        out
    }

    pub async fn close_all(&self) {
        let pools: Vec<Arc<StreamPool>> =
            self.pools.iter().map(|e| Arc::clone(e.value())).collect();
        for pool in pools {
            pool.close().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unroutable_pool(config: StreamPoolConfig) -> Arc<StreamPool> {
        // Port 1 refuses connections immediately
        let worker = Arc::new(Worker::new("127.0.0.1:1", "http", "ws"));
        Arc::new(StreamPool::new(worker, config))
    }

    #[test]
    fn test_reconnect_backoff_caps_at_thirty_seconds() {
        assert_eq!(reconnect_backoff(1), Duration::from_secs(1));
        assert_eq!(reconnect_backoff(2), Duration::from_secs(2));
        assert_eq!(reconnect_backoff(3), Duration::from_secs(4));
        assert_eq!(reconnect_backoff(5), Duration::from_secs(16));
        assert_eq!(reconnect_backoff(6), Duration::from_secs(30));
        assert_eq!(reconnect_backoff(30), Duration::from_secs(30));
    }

    #[tokio::test]
    async fn test_acquire_failure_releases_slot() {
        let pool = unroutable_pool(StreamPoolConfig {
            connect_timeout: Duration::from_millis(300),
            ..StreamPoolConfig::default()
        });

        let err = pool.acquire().await.unwrap_err();
        assert_eq!(err.kind(), "transport");

        // The reserved slot was returned
        let status = pool.status();
        assert_eq!(status.open, 0);
        assert_eq!(status.idle, 0);
    }

    #[tokio::test]
    async fn test_acquire_after_close_fails() {
        let pool = unroutable_pool(StreamPoolConfig::default());
        pool.close().await;
        let err = pool.acquire().await.unwrap_err();
        assert_eq!(err.kind(), "internal");
    }

    #[tokio::test]
    async fn test_status_reports_capacity() {
        let pool = unroutable_pool(StreamPoolConfig {
            max_streams: 5,
            ..StreamPoolConfig::default()
        });
        let status = pool.status();
        assert_eq!(status.max, 5);
        assert_eq!(status.open, 0);
        assert_eq!(status.in_use, 0);
    }
}
