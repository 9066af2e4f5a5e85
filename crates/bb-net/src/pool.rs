//! Outbound connection pool keyed by peer address, with idle eviction.

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Shortest period the evictor accepts; `interval_at` panics on zero.
pub const MIN_EVICT_INTERVAL: Duration = Duration::from_secs(1);

struct PooledConnection<C> {
    conn: C,
    last_used: Instant,
}

/// At most one live connection per address is handed out. `C` is a cheap
/// handle (e.g. a tonic `Channel`); dropping the pool's copy closes the
/// pooled reference while callers keep theirs.
pub struct ConnectionPool<C> {
    entries: Mutex<HashMap<String, PooledConnection<C>>>,
}

impl<C: Clone + Send + 'static> ConnectionPool<C> {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Return the pooled connection for `addr`, or dial one.
    ///
    /// The dial runs without holding the pool lock. If another caller
    /// inserted a connection for `addr` in the meantime, the fresh one is
    /// dropped and the winner is returned.
    pub async fn get_or_dial<F, Fut, E>(&self, addr: &str, dial: F) -> Result<C, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<C, E>>,
    {
        if let Some(entry) = self.entries.lock().await.get_mut(addr) {
            entry.last_used = Instant::now();
            return Ok(entry.conn.clone());
        }

        let conn = dial().await?;

        let mut entries = self.entries.lock().await;
        match entries.entry(addr.to_string()) {
            Entry::Occupied(mut winner) => {
                debug!(addr, "concurrent dial lost the race, dropping redundant connection");
                winner.get_mut().last_used = Instant::now();
                Ok(winner.get().conn.clone())
            }
            Entry::Vacant(slot) => {
                debug!(addr, "pooled new connection");
                slot.insert(PooledConnection {
                    conn: conn.clone(),
                    last_used: Instant::now(),
                });
                Ok(conn)
            }
        }
    }

    /// Drop every connection unused for longer than `idle`. Returns how many
    /// were removed.
    pub async fn evict_idle(&self, idle: Duration) -> usize {
        let now = Instant::now();
        let mut entries = self.entries.lock().await;
        let before = entries.len();
        entries.retain(|addr, entry| {
            let keep = now.duration_since(entry.last_used) <= idle;
            if !keep {
                debug!(addr = %addr, "evicting idle connection");
            }
            keep
        });
        before - entries.len()
    }

    /// Drop every pooled connection.
    pub async fn close_all(&self) -> usize {
        let mut entries = self.entries.lock().await;
        let count = entries.len();
        entries.clear();
        count
    }

    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.lock().await.is_empty()
    }

    /// Start the periodic eviction task. It runs until [`Evictor::stop`].
    /// Intervals below [`MIN_EVICT_INTERVAL`] are raised to it.
    pub fn spawn_evictor(self: &Arc<Self>, interval: Duration, idle: Duration) -> Evictor {
        let interval = if interval < MIN_EVICT_INTERVAL {
            warn!(?interval, "evict interval too short, using {MIN_EVICT_INTERVAL:?}");
            MIN_EVICT_INTERVAL
        } else {
            interval
        };
        let token = CancellationToken::new();
        let cancel = token.clone();
        let pool = Arc::clone(self);

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        let evicted = pool.evict_idle(idle).await;
                        if evicted > 0 {
                            info!(evicted, "evicted idle peer connections");
                        }
                    }
                }
            }
            debug!("evictor stopped");
        });

        Evictor { token, handle }
    }
}

impl<C: Clone + Send + 'static> Default for ConnectionPool<C> {
    fn default() -> Self {
        Self::new()
    }
}

/// Handle to the background eviction task.
pub struct Evictor {
    token: CancellationToken,
    handle: JoinHandle<()>,
}

impl Evictor {
    /// Signal the task and wait until it has exited.
    pub async fn stop(self) {
        self.token.cancel();
        if let Err(e) = self.handle.await {
            warn!(error = %e, "evictor task failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// A connection stand-in that counts live copies and dials.
    #[derive(Clone)]
    struct FakeConn {
        id: usize,
        live: Arc<()>,
    }

    fn dialer(
        dials: &Arc<AtomicUsize>,
    ) -> impl FnOnce() -> std::future::Ready<Result<FakeConn, ()>> {
        let id = dials.fetch_add(1, Ordering::SeqCst);
        move || {
            std::future::ready(Ok(FakeConn {
                id,
                live: Arc::new(()),
            }))
        }
    }

    #[tokio::test]
    async fn test_reuses_pooled_connection() {
        let pool = ConnectionPool::new();
        let dials = Arc::new(AtomicUsize::new(0));

        let a = pool.get_or_dial("peer.onion", dialer(&dials)).await.unwrap();
        let b = pool
            .get_or_dial("peer.onion", || async { Err::<FakeConn, ()>(()) })
            .await
            .unwrap();
        assert_eq!(a.id, b.id);
        assert_eq!(pool.len().await, 1);
    }

    #[tokio::test]
    async fn test_dial_error_leaves_pool_empty() {
        let pool: ConnectionPool<FakeConn> = ConnectionPool::new();
        let res = pool
            .get_or_dial("peer.onion", || async { Err::<FakeConn, &str>("unreachable") })
            .await;
        assert_eq!(res.err(), Some("unreachable"));
        assert!(pool.is_empty().await);
    }

    #[tokio::test]
    async fn test_concurrent_first_dial_keeps_one() {
        let pool = Arc::new(ConnectionPool::new());
        let barrier = Arc::new(tokio::sync::Barrier::new(2));

        let mut tasks = Vec::new();
        for id in 0..2 {
            let pool = pool.clone();
            let barrier = barrier.clone();
            tasks.push(tokio::spawn(async move {
                pool.get_or_dial("peer.onion", || async move {
                    // Both dials are in flight before either inserts.
                    barrier.wait().await;
                    Ok::<_, ()>(FakeConn {
                        id,
                        live: Arc::new(()),
                    })
                })
                .await
                .unwrap()
            }));
        }

        let a = tasks.remove(0).await.unwrap();
        let b = tasks.remove(0).await.unwrap();
        assert_eq!(a.id, b.id);
        // The loser's connection is gone: only pool + two callers hold the winner.
        assert_eq!(Arc::strong_count(&a.live), 3);
        assert_eq!(pool.len().await, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_evict_idle_keeps_recent() {
        let pool = ConnectionPool::new();
        let dials = Arc::new(AtomicUsize::new(0));

        let stale = pool.get_or_dial("stale.onion", dialer(&dials)).await.unwrap();
        tokio::time::advance(Duration::from_secs(200)).await;
        pool.get_or_dial("fresh.onion", dialer(&dials)).await.unwrap();
        tokio::time::advance(Duration::from_secs(150)).await;

        assert_eq!(pool.evict_idle(Duration::from_secs(300)).await, 1);
        assert_eq!(pool.len().await, 1);
        // The caller's copy outlives eviction.
        assert_eq!(Arc::strong_count(&stale.live), 1);

        // Reuse refreshes the timestamp.
        pool.get_or_dial("fresh.onion", dialer(&dials)).await.unwrap();
        tokio::time::advance(Duration::from_secs(250)).await;
        assert_eq!(pool.evict_idle(Duration::from_secs(300)).await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_evictor_runs_and_stops() {
        let pool = Arc::new(ConnectionPool::new());
        let dials = Arc::new(AtomicUsize::new(0));
        pool.get_or_dial("peer.onion", dialer(&dials)).await.unwrap();

        let evictor = pool.spawn_evictor(Duration::from_secs(60), Duration::from_secs(300));

        tokio::time::sleep(Duration::from_secs(240)).await;
        assert_eq!(pool.len().await, 1);

        tokio::time::sleep(Duration::from_secs(130)).await;
        assert!(pool.is_empty().await);

        evictor.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_interval_still_evicts() {
        let pool = Arc::new(ConnectionPool::new());
        let dials = Arc::new(AtomicUsize::new(0));
        pool.get_or_dial("peer.onion", dialer(&dials)).await.unwrap();

        let evictor = pool.spawn_evictor(Duration::ZERO, Duration::from_secs(1));
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert!(pool.is_empty().await);

        // The task is alive and answers the stop signal.
        assert!(!evictor.handle.is_finished());
        evictor.stop().await;
    }

    #[tokio::test]
    async fn test_close_all() {
        let pool = ConnectionPool::new();
        let dials = Arc::new(AtomicUsize::new(0));
        let a = pool.get_or_dial("a.onion", dialer(&dials)).await.unwrap();
        pool.get_or_dial("b.onion", dialer(&dials)).await.unwrap();

        assert_eq!(pool.close_all().await, 2);
        assert!(pool.is_empty().await);
        assert_eq!(Arc::strong_count(&a.live), 1);
    }
}
