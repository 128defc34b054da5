//! Connection pooling for WCDB Rust.
//!
//! A blocking pool of native connections shared by every handle of one
//! database. It enforces the engine's concurrency rules on top of plain
//! threads:
//!
//! - at most `max_connections` connections are alive at once
//! - at most one connection is leased for writing at a time; the number of
//!   threads waiting for that slot is observable
//! - a blockade stops all new leases until it is lifted, which is how
//!   maintenance operations get the database to themselves
//!
//! Leases are returned on drop.

use std::ops::{Deref, DerefMut};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use wcdb_core::{Error, HandleErrorKind, Result};

/// Opens and checks the connections a pool hands out.
pub trait ConnectionManager: Send + Sync + 'static {
    type Connection: Send;

    /// Open a new connection.
    fn connect(&self) -> Result<Self::Connection>;

    /// Is an idle connection still usable? Only consulted when
    /// `test_on_checkout` is enabled.
    fn is_valid(&self, _conn: &mut Self::Connection) -> bool {
        true
    }

    /// Prepare a connection for reuse before it goes back to the idle list.
    fn recycle(&self, _conn: &mut Self::Connection) {}
}

/// Connection pool configuration.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Maximum number of connections allowed
    pub max_connections: usize,
    /// Maximum time to wait for a connection in milliseconds
    pub acquire_timeout_ms: u64,
    /// Test connections before giving them out
    pub test_on_checkout: bool,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_connections: 4,
            acquire_timeout_ms: 30_000, // 30 seconds
            test_on_checkout: false,
        }
    }
}

impl PoolConfig {
    /// Create a new pool configuration with the given max connections.
    pub fn new(max_connections: usize) -> Self {
        Self {
            max_connections: max_connections.max(1),
            ..Default::default()
        }
    }

    /// Set acquire timeout.
    pub fn acquire_timeout(mut self, ms: u64) -> Self {
        self.acquire_timeout_ms = ms;
        self
    }

    /// Enable/disable test on checkout.
    pub fn test_on_checkout(mut self, enabled: bool) -> Self {
        self.test_on_checkout = enabled;
        self
    }

    fn timeout(&self) -> Duration {
        Duration::from_millis(self.acquire_timeout_ms)
    }
}

/// Pool statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PoolStats {
    /// Total number of connections (active + idle)
    pub total_connections: usize,
    /// Number of idle connections
    pub idle_connections: usize,
    /// Number of leased connections
    pub active_connections: usize,
    /// Number of threads waiting for a lease
    pub pending_requests: usize,
    /// Number of threads waiting for the writer slot
    pub pending_writers: usize,
}

struct PoolState<C> {
    idle: Vec<C>,
    total: usize,
    writer_busy: bool,
    pending_writers: usize,
    waiting: usize,
    blockaded: bool,
}

struct Shared<M: ConnectionManager> {
    manager: M,
    config: PoolConfig,
    state: Mutex<PoolState<M::Connection>>,
    available: Condvar,
}

impl<M: ConnectionManager> Shared<M> {
    fn lock(&self) -> MutexGuard<'_, PoolState<M::Connection>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

enum Slot<C> {
    Idle(C),
    New,
    TimedOut(HandleErrorKind),
}

/// A blocking connection pool.
pub struct Pool<M: ConnectionManager> {
    shared: Arc<Shared<M>>,
}

impl<M: ConnectionManager> Clone for Pool<M> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<M: ConnectionManager> std::fmt::Debug for Pool<M> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pool")
            .field("config", &self.shared.config)
            .field("stats", &self.stats())
            .finish()
    }
}

impl<M: ConnectionManager> Pool<M> {
    /// Create a new connection pool. No connection is opened up front.
    pub fn new(manager: M, config: PoolConfig) -> Self {
        Self {
            shared: Arc::new(Shared {
                manager,
                config,
                state: Mutex::new(PoolState {
                    idle: Vec::new(),
                    total: 0,
                    writer_busy: false,
                    pending_writers: 0,
                    waiting: 0,
                    blockaded: false,
                }),
                available: Condvar::new(),
            }),
        }
    }

    /// Get the pool configuration.
    pub fn config(&self) -> &PoolConfig {
        &self.shared.config
    }

    pub fn manager(&self) -> &M {
        &self.shared.manager
    }

    /// Lease a connection, waiting up to the acquire timeout.
    ///
    /// A write lease additionally waits for the writer slot.
    pub fn acquire(&self, write: bool) -> Result<PooledConnection<M>> {
        let shared = &self.shared;
        let deadline = Instant::now() + shared.config.timeout();
        let mut state = shared.lock();
        if write {
            state.pending_writers += 1;
        }

        let slot = loop {
            let gate_open = !state.blockaded && !(write && state.writer_busy);
            if gate_open {
                if let Some(conn) = state.idle.pop() {
                    break Slot::Idle(conn);
                }
                if state.total < shared.config.max_connections {
                    state.total += 1;
                    break Slot::New;
                }
            }

            let now = Instant::now();
            if now >= deadline {
                break Slot::TimedOut(if state.blockaded {
                    HandleErrorKind::Blockaded
                } else if write && state.writer_busy {
                    HandleErrorKind::Timeout
                } else {
                    HandleErrorKind::Exhausted
                });
            }
            state.waiting += 1;
            let (guard, _) = shared
                .available
                .wait_timeout(state, deadline - now)
                .unwrap_or_else(PoisonError::into_inner);
            state = guard;
            state.waiting -= 1;
        };

        if write {
            state.pending_writers -= 1;
        }

        let idle = match slot {
            Slot::TimedOut(kind) => {
                drop(state);
                tracing::debug!(?kind, write, "connection acquire timed out");
                return Err(Error::unavailable(
                    kind,
                    format!(
                        "no connection available within {} ms",
                        shared.config.acquire_timeout_ms
                    ),
                ));
            }
            Slot::Idle(conn) => Some(conn),
            Slot::New => None,
        };
        if write {
            state.writer_busy = true;
        }
        drop(state);

        let conn = match idle {
            Some(mut conn) => {
                if !shared.config.test_on_checkout || shared.manager.is_valid(&mut conn) {
                    Ok(conn)
                } else {
                    tracing::debug!("discarding invalid idle connection");
                    drop(conn);
                    shared.manager.connect()
                }
            }
            None => shared.manager.connect(),
        };

        match conn {
            Ok(conn) => Ok(PooledConnection {
                conn: Some(conn),
                shared: Arc::clone(shared),
                writer: write,
                discard: false,
            }),
            Err(err) => {
                let mut state = shared.lock();
                state.total -= 1;
                if write {
                    state.writer_busy = false;
                }
                drop(state);
                shared.available.notify_all();
                Err(err)
            }
        }
    }

    /// Close every idle connection. Leased connections are unaffected.
    pub fn purge(&self) -> usize {
        let idle = {
            let mut state = self.shared.lock();
            let idle = std::mem::take(&mut state.idle);
            state.total -= idle.len();
            idle
        };
        let purged = idle.len();
        drop(idle);
        if purged > 0 {
            tracing::debug!(purged, "idle connections purged");
        }
        self.shared.available.notify_all();
        purged
    }

    /// Stop handing out connections until `unblockade`.
    pub fn blockade(&self) {
        self.shared.lock().blockaded = true;
        tracing::debug!("pool blockaded");
    }

    /// Blockade unless someone else already has; returns whether this call did.
    pub fn try_blockade(&self) -> bool {
        let mut state = self.shared.lock();
        if state.blockaded {
            return false;
        }
        state.blockaded = true;
        drop(state);
        tracing::debug!("pool blockaded");
        true
    }

    pub fn unblockade(&self) {
        self.shared.lock().blockaded = false;
        self.shared.available.notify_all();
        tracing::debug!("pool unblockaded");
    }

    pub fn is_blockaded(&self) -> bool {
        self.shared.lock().blockaded
    }

    /// Wait until at most `allowed` connections are leased.
    ///
    /// Returns false when the timeout elapses first.
    pub fn wait_for_leases(&self, allowed: usize, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut state = self.shared.lock();
        loop {
            if state.total - state.idle.len() <= allowed {
                return true;
            }
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            let (guard, _) = self
                .shared
                .available
                .wait_timeout(state, deadline - now)
                .unwrap_or_else(PoisonError::into_inner);
            state = guard;
        }
    }

    /// Number of connections currently alive, leased or idle.
    pub fn alive_count(&self) -> usize {
        self.shared.lock().total
    }

    /// Is any thread waiting for the writer slot?
    pub fn has_pending_writer(&self) -> bool {
        self.shared.lock().pending_writers > 0
    }

    /// Get the current pool statistics.
    pub fn stats(&self) -> PoolStats {
        let state = self.shared.lock();
        PoolStats {
            total_connections: state.total,
            idle_connections: state.idle.len(),
            active_connections: state.total - state.idle.len(),
            pending_requests: state.waiting,
            pending_writers: state.pending_writers,
        }
    }

    /// Check if the pool is at capacity.
    pub fn at_capacity(&self) -> bool {
        self.shared.lock().total >= self.shared.config.max_connections
    }
}

/// A connection leased from the pool.
///
/// Returned to the idle list on drop, or closed when marked with `discard`.
pub struct PooledConnection<M: ConnectionManager> {
    conn: Option<M::Connection>,
    shared: Arc<Shared<M>>,
    writer: bool,
    discard: bool,
}

impl<M: ConnectionManager> PooledConnection<M> {
    /// Does this lease hold the writer slot?
    pub fn is_writer(&self) -> bool {
        self.writer
    }

    /// Close the connection instead of returning it to the pool.
    pub fn discard(&mut self) {
        self.discard = true;
    }
}

impl<M: ConnectionManager> std::fmt::Debug for PooledConnection<M> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledConnection")
            .field("writer", &self.writer)
            .field("discard", &self.discard)
            .finish_non_exhaustive()
    }
}

impl<M: ConnectionManager> Deref for PooledConnection<M> {
    type Target = M::Connection;

    fn deref(&self) -> &Self::Target {
        self.conn.as_ref().expect("connection is present until drop")
    }
}

impl<M: ConnectionManager> DerefMut for PooledConnection<M> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.conn.as_mut().expect("connection is present until drop")
    }
}

impl<M: ConnectionManager> Drop for PooledConnection<M> {
    fn drop(&mut self) {
        let Some(mut conn) = self.conn.take() else {
            return;
        };
        if !self.discard {
            self.shared.manager.recycle(&mut conn);
        }
        let closed = {
            let mut state = self.shared.lock();
            if self.writer {
                state.writer_busy = false;
            }
            if self.discard {
                state.total -= 1;
                Some(conn)
            } else {
                state.idle.push(conn);
                None
            }
        };
        drop(closed);
        self.shared.available.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::thread;
    use wcdb_core::HandleError;

    #[derive(Default)]
    struct Counter {
        opened: AtomicUsize,
        fail: AtomicBool,
    }

    impl ConnectionManager for Arc<Counter> {
        type Connection = usize;

        fn connect(&self) -> Result<usize> {
            if self.fail.load(Ordering::SeqCst) {
                return Err(Error::HandleUnavailable(HandleError::new(
                    HandleErrorKind::OpenFailed,
                    "refused",
                )));
            }
            Ok(self.opened.fetch_add(1, Ordering::SeqCst))
        }
    }

    fn pool(max: usize, timeout_ms: u64) -> (Pool<Arc<Counter>>, Arc<Counter>) {
        let counter = Arc::new(Counter::default());
        let pool = Pool::new(
            Arc::clone(&counter),
            PoolConfig::new(max).acquire_timeout(timeout_ms),
        );
        (pool, counter)
    }

    fn kind(err: Error) -> HandleErrorKind {
        match err {
            Error::HandleUnavailable(h) => h.kind,
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_idle_connection_is_reused() {
        let (pool, counter) = pool(4, 100);
        let first = *pool.acquire(false).unwrap();
        let second = *pool.acquire(false).unwrap();
        assert_eq!(first, second);
        assert_eq!(counter.opened.load(Ordering::SeqCst), 1);
        assert_eq!(pool.alive_count(), 1);
    }

    #[test]
    fn test_single_writer() {
        let (pool, _) = pool(4, 50);
        let writer = pool.acquire(true).unwrap();
        assert!(writer.is_writer());
        // readers are not blocked by the writer
        let reader = pool.acquire(false).unwrap();
        assert!(!reader.is_writer());
        assert_eq!(kind(pool.acquire(true).unwrap_err()), HandleErrorKind::Timeout);
        drop(writer);
        assert!(pool.acquire(true).is_ok());
    }

    #[test]
    fn test_capacity_exhausted() {
        let (pool, _) = pool(2, 30);
        let _a = pool.acquire(false).unwrap();
        let _b = pool.acquire(false).unwrap();
        assert!(pool.at_capacity());
        assert_eq!(kind(pool.acquire(false).unwrap_err()), HandleErrorKind::Exhausted);
    }

    #[test]
    fn test_blockade_waits_for_unblockade() {
        let (pool, _) = pool(4, 5_000);
        pool.blockade();
        assert!(pool.is_blockaded());
        let waiter = {
            let pool = pool.clone();
            thread::spawn(move || pool.acquire(false).map(|c| *c))
        };
        while pool.stats().pending_requests == 0 {
            thread::sleep(Duration::from_millis(1));
        }
        pool.unblockade();
        assert!(waiter.join().unwrap().is_ok());
    }

    #[test]
    fn test_blockade_timeout() {
        let (pool, _) = pool(4, 20);
        pool.blockade();
        assert_eq!(kind(pool.acquire(false).unwrap_err()), HandleErrorKind::Blockaded);
        assert!(!pool.try_blockade());
        pool.unblockade();
        assert!(pool.try_blockade());
        pool.unblockade();
        assert!(pool.acquire(false).is_ok());
    }

    #[test]
    fn test_pending_writer_is_observable() {
        let (pool, _) = pool(4, 5_000);
        let writer = pool.acquire(true).unwrap();
        assert!(!pool.has_pending_writer());
        let waiter = {
            let pool = pool.clone();
            thread::spawn(move || pool.acquire(true).map(|c| c.is_writer()))
        };
        while !pool.has_pending_writer() {
            thread::sleep(Duration::from_millis(1));
        }
        drop(writer);
        assert!(waiter.join().unwrap().unwrap());
        assert!(!pool.has_pending_writer());
    }

    #[test]
    fn test_purge_and_discard() {
        let (pool, _) = pool(4, 100);
        {
            let _a = pool.acquire(false).unwrap();
            let _b = pool.acquire(false).unwrap();
        }
        assert_eq!(pool.alive_count(), 2);
        let mut leased = pool.acquire(false).unwrap();
        assert_eq!(pool.purge(), 1);
        assert_eq!(pool.alive_count(), 1);
        leased.discard();
        drop(leased);
        assert_eq!(pool.alive_count(), 0);
        assert_eq!(pool.stats(), PoolStats::default());
    }

    #[test]
    fn test_connect_failure_releases_slot() {
        let (pool, counter) = pool(1, 50);
        counter.fail.store(true, Ordering::SeqCst);
        assert_eq!(kind(pool.acquire(true).unwrap_err()), HandleErrorKind::OpenFailed);
        assert_eq!(pool.alive_count(), 0);
        counter.fail.store(false, Ordering::SeqCst);
        assert!(pool.acquire(true).is_ok());
    }

    #[test]
    fn test_wait_for_leases() {
        let (pool, _) = pool(4, 100);
        let lease = pool.acquire(false).unwrap();
        assert!(!pool.wait_for_leases(0, Duration::from_millis(10)));
        assert!(pool.wait_for_leases(1, Duration::from_millis(10)));
        let releaser = thread::spawn(move || {
            thread::sleep(Duration::from_millis(10));
            drop(lease);
        });
        assert!(pool.wait_for_leases(0, Duration::from_secs(5)));
        releaser.join().unwrap();
    }
}
