//! Bounded connection pool over the embedded database.
//!
//! The pool owns every connection handle. Checkout prefers a probed idle
//! connection, then opens a fresh one under `max_connections`, then parks
//! the caller in a FIFO waiter queue until a release hands a connection
//! over or the deadline passes. A background reaper shrinks the idle set
//! after bursts, down to a floor of two connections. Shutdown is
//! idempotent: waiters are rejected, idle handles close immediately, and
//! checked-out handles close as they are released.

use rusqlite::{Connection, Transaction};
use serde::Serialize;
use std::collections::VecDeque;
use std::ops::{Deref, DerefMut};
use std::sync::{Arc, Condvar, Mutex, Weak};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::config::DatabaseConfig;
use crate::db;
use crate::error::{Error, Result};

/// Idle connections kept through reaping, so the pool does not thrash after
/// a burst drains.
const IDLE_FLOOR: usize = 2;

/// Gauges reported by [`ConnectionPool::stats`].
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct PoolStats {
    pub active_connections: usize,
    pub idle_connections: usize,
    pub total_connections: usize,
    pub max_connections: usize,
    pub waiting_requests: usize,
}

struct IdleConn {
    conn: Connection,
    idle_since: Instant,
}

enum WaiterState {
    Waiting,
    /// A releasing caller handed its connection directly to this waiter.
    Served(Connection),
    PoolClosed,
}

struct Waiter {
    state: Mutex<WaiterState>,
    ready: Condvar,
}

impl Waiter {
    fn new() -> Self {
        Self {
            state: Mutex::new(WaiterState::Waiting),
            ready: Condvar::new(),
        }
    }
}

struct PoolInner {
    idle: Vec<IdleConn>,
    total: usize,
    active: usize,
    waiters: VecDeque<Arc<Waiter>>,
    shutting_down: bool,
}

pub struct ConnectionPool {
    database: DatabaseConfig,
    inner: Mutex<PoolInner>,
    reaper: Mutex<Option<thread::JoinHandle<()>>>,
    // true once the reaper should stop
    reaper_stop: Arc<(Mutex<bool>, Condvar)>,
}

impl ConnectionPool {
    /// Create an empty pool. Connections open lazily on checkout; the idle
    /// reaper starts immediately and fires every `idle_timeout / 2`.
    pub fn new(database: DatabaseConfig) -> Arc<Self> {
        let pool = Arc::new(Self {
            database,
            inner: Mutex::new(PoolInner {
                idle: Vec::new(),
                total: 0,
                active: 0,
                waiters: VecDeque::new(),
                shutting_down: false,
            }),
            reaper: Mutex::new(None),
            reaper_stop: Arc::new((Mutex::new(false), Condvar::new())),
        });
        Self::spawn_reaper(&pool);
        pool
    }

    pub fn max_connections(&self) -> usize {
        self.database.max_connections
    }

    /// Check out a connection, waiting up to `timeout` behind earlier
    /// waiters. Unhealthy idle connections are discarded and replaced
    /// transparently.
    pub fn get(self: &Arc<Self>, timeout: Duration) -> Result<PooledConnection> {
        let deadline = Instant::now() + timeout;
        loop {
            enum Action {
                Probe(Connection),
                Open,
                Wait(Arc<Waiter>),
            }

            let action = {
                let mut inner = self.inner.lock().expect("pool lock poisoned");
                if inner.shutting_down {
                    return Err(Error::PoolShuttingDown);
                }
                if let Some(idle) = inner.idle.pop() {
                    inner.active += 1;
                    Action::Probe(idle.conn)
                } else if inner.total < self.database.max_connections {
                    inner.total += 1;
                    inner.active += 1;
                    Action::Open
                } else {
                    let waiter = Arc::new(Waiter::new());
                    inner.waiters.push_back(waiter.clone());
                    Action::Wait(waiter)
                }
            };

            match action {
                Action::Probe(conn) => {
                    if health_probe(&conn) {
                        return Ok(PooledConnection::new(self.clone(), conn));
                    }
                    warn!("discarding idle connection that failed its health probe");
                    let mut inner = self.inner.lock().expect("pool lock poisoned");
                    inner.active -= 1;
                    inner.total -= 1;
                    // retry from the top; conn drops (closes) here
                }
                Action::Open => match db::open_connection(&self.database) {
                    Ok(conn) => {
                        debug!("opened new pooled connection");
                        return Ok(PooledConnection::new(self.clone(), conn));
                    }
                    Err(e) => {
                        let mut inner = self.inner.lock().expect("pool lock poisoned");
                        inner.active -= 1;
                        inner.total -= 1;
                        return Err(e);
                    }
                },
                Action::Wait(waiter) => {
                    return self.wait_for_handoff(&waiter, deadline, timeout);
                }
            }
        }
    }

    /// Park on a waiter slot until a release hands over a connection, the
    /// pool shuts down, or the deadline passes.
    fn wait_for_handoff(
        self: &Arc<Self>,
        waiter: &Arc<Waiter>,
        deadline: Instant,
        timeout: Duration,
    ) -> Result<PooledConnection> {
        let mut state = waiter.state.lock().expect("waiter lock poisoned");
        loop {
            match std::mem::replace(&mut *state, WaiterState::Waiting) {
                WaiterState::Served(conn) => {
                    return Ok(PooledConnection::new(self.clone(), conn));
                }
                WaiterState::PoolClosed => return Err(Error::PoolShuttingDown),
                WaiterState::Waiting => {}
            }

            let now = Instant::now();
            if now >= deadline {
                // Leave the queue, unless a hand-off won the race, in which
                // case the connection is ours after all. Lock order is pool
                // inner before waiter state, same as the release path.
                drop(state);
                let mut inner = self.inner.lock().expect("pool lock poisoned");
                let mut state = waiter.state.lock().expect("waiter lock poisoned");
                match std::mem::replace(&mut *state, WaiterState::Waiting) {
                    WaiterState::Served(conn) => {
                        return Ok(PooledConnection::new(self.clone(), conn));
                    }
                    WaiterState::PoolClosed => return Err(Error::PoolShuttingDown),
                    WaiterState::Waiting => {
                        inner.waiters.retain(|other| !Arc::ptr_eq(other, waiter));
                        return Err(Error::CheckoutTimeout {
                            waited_ms: timeout.as_millis() as u64,
                        });
                    }
                }
            }

            let (guard, _) = waiter
                .ready
                .wait_timeout(state, deadline - now)
                .expect("waiter lock poisoned");
            state = guard;
        }
    }

    /// Return a connection. The head waiter, if any, receives it directly
    /// and it stays active; otherwise it rejoins the idle set. During
    /// shutdown the connection closes instead.
    fn release(&self, conn: Connection) {
        let mut inner = self.inner.lock().expect("pool lock poisoned");
        if inner.shutting_down {
            inner.active -= 1;
            inner.total -= 1;
            drop(inner);
            drop(conn);
            return;
        }
        if let Some(waiter) = inner.waiters.pop_front() {
            let mut state = waiter.state.lock().expect("waiter lock poisoned");
            *state = WaiterState::Served(conn);
            waiter.ready.notify_one();
            return;
        }
        inner.active -= 1;
        inner.idle.push(IdleConn {
            conn,
            idle_since: Instant::now(),
        });
    }

    /// Check out, run `op`, release on every exit path.
    pub fn with_connection<T>(
        self: &Arc<Self>,
        op: impl FnOnce(&mut Connection) -> Result<T>,
    ) -> Result<T> {
        let mut conn = self.get(self.database.checkout_timeout())?;
        op(&mut conn)
    }

    /// Close idle connections above the floor that have outlived the idle
    /// timeout. Active connections are never touched.
    fn reap_idle(&self) {
        let idle_timeout = self.database.idle_timeout();
        let reaped = {
            let mut inner = self.inner.lock().expect("pool lock poisoned");
            let mut closed = Vec::new();
            // oldest entries sit at the front; checkout pops from the back
            while inner.idle.len() > IDLE_FLOOR
                && inner
                    .idle
                    .first()
                    .is_some_and(|c| c.idle_since.elapsed() >= idle_timeout)
            {
                closed.push(inner.idle.remove(0));
            }
            inner.total -= closed.len();
            closed
        };
        if !reaped.is_empty() {
            debug!(count = reaped.len(), "reaped idle connections");
        }
    }

    fn spawn_reaper(pool: &Arc<Self>) {
        let weak: Weak<Self> = Arc::downgrade(pool);
        let stop = pool.reaper_stop.clone();
        let interval = (pool.database.idle_timeout() / 2).max(Duration::from_millis(10));

        let handle = thread::Builder::new()
            .name("engram-pool-reaper".into())
            .spawn(move || {
                let (lock, cv) = &*stop;
                let mut stopped = lock.lock().expect("reaper lock poisoned");
                loop {
                    let (guard, _) = cv
                        .wait_timeout(stopped, interval)
                        .expect("reaper lock poisoned");
                    stopped = guard;
                    if *stopped {
                        break;
                    }
                    match weak.upgrade() {
                        Some(pool) => pool.reap_idle(),
                        None => break,
                    }
                }
            })
            .expect("failed to spawn pool reaper thread");
        *pool.reaper.lock().expect("pool lock poisoned") = Some(handle);
    }

    /// Begin draining: reject queued and future checkouts with
    /// `PoolShuttingDown`, close idle connections now and active ones as
    /// they are released, and stop the reaper. Safe to call repeatedly.
    pub fn shutdown(&self) {
        let (idle, waiters) = {
            let mut inner = self.inner.lock().expect("pool lock poisoned");
            if inner.shutting_down {
                return;
            }
            inner.shutting_down = true;
            let idle = std::mem::take(&mut inner.idle);
            inner.total -= idle.len();
            let waiters = std::mem::take(&mut inner.waiters);
            (idle, waiters)
        };

        for waiter in waiters {
            let mut state = waiter.state.lock().expect("waiter lock poisoned");
            *state = WaiterState::PoolClosed;
            waiter.ready.notify_one();
        }
        drop(idle);

        let (lock, cv) = &*self.reaper_stop;
        *lock.lock().expect("reaper lock poisoned") = true;
        cv.notify_all();
        let handle = self.reaper.lock().expect("pool lock poisoned").take();
        if let Some(handle) = handle {
            let _ = handle.join();
        }

        info!("connection pool shut down");
    }

    pub fn stats(&self) -> PoolStats {
        let inner = self.inner.lock().expect("pool lock poisoned");
        PoolStats {
            active_connections: inner.active,
            idle_connections: inner.idle.len(),
            total_connections: inner.total,
            max_connections: self.database.max_connections,
            waiting_requests: inner.waiters.len(),
        }
    }
}

impl Drop for ConnectionPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn health_probe(conn: &Connection) -> bool {
    match conn.query_row("SELECT 1", [], |row| row.get::<_, i64>(0)) {
        Ok(1) => true,
        Ok(_) => false,
        Err(e) => {
            warn!(error = %e, "connection health probe failed");
            false
        }
    }
}

/// A checked-out connection. Releases back to the pool on drop.
pub struct PooledConnection {
    pool: Arc<ConnectionPool>,
    conn: Option<Connection>,
}

impl PooledConnection {
    fn new(pool: Arc<ConnectionPool>, conn: Connection) -> Self {
        Self {
            pool,
            conn: Some(conn),
        }
    }
}

impl std::fmt::Debug for PooledConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledConnection").finish_non_exhaustive()
    }
}

impl Deref for PooledConnection {
    type Target = Connection;

    fn deref(&self) -> &Connection {
        self.conn.as_ref().expect("connection already released")
    }
}

impl DerefMut for PooledConnection {
    fn deref_mut(&mut self) -> &mut Connection {
        self.conn.as_mut().expect("connection already released")
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            self.pool.release(conn);
        }
    }
}

/// Run `op` inside `BEGIN … COMMIT`, rolling back if it errors.
pub fn with_transaction<T>(
    conn: &mut Connection,
    op: impl FnOnce(&Transaction<'_>) -> Result<T>,
) -> Result<T> {
    let tx = conn.transaction()?;
    let out = op(&tx)?;
    tx.commit()?;
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;

    fn pool_config(dir: &std::path::Path, max_connections: usize) -> DatabaseConfig {
        DatabaseConfig {
            url: format!("file:{}", dir.join("pool.db").display()),
            max_connections,
            idle_timeout_ms: 100,
            checkout_timeout_ms: 1_000,
            ..DatabaseConfig::default()
        }
    }

    #[test]
    fn checkout_and_release_cycle() {
        let dir = tempfile::tempdir().unwrap();
        let pool = ConnectionPool::new(pool_config(dir.path(), 2));

        {
            let conn = pool.get(Duration::from_secs(1)).unwrap();
            let one: i64 = conn.query_row("SELECT 1", [], |r| r.get(0)).unwrap();
            assert_eq!(one, 1);
            let stats = pool.stats();
            assert_eq!(stats.active_connections, 1);
            assert_eq!(stats.total_connections, 1);
        }

        let stats = pool.stats();
        assert_eq!(stats.active_connections, 0);
        assert_eq!(stats.idle_connections, 1);
    }

    #[test]
    fn pool_never_exceeds_max_connections() {
        let dir = tempfile::tempdir().unwrap();
        let pool = ConnectionPool::new(pool_config(dir.path(), 3));

        let conns: Vec<_> = (0..3)
            .map(|_| pool.get(Duration::from_secs(1)).unwrap())
            .collect();
        let stats = pool.stats();
        assert_eq!(stats.total_connections, 3);
        assert_eq!(stats.active_connections, 3);

        // a fourth checkout must time out rather than over-allocate
        let err = pool.get(Duration::from_millis(50)).unwrap_err();
        assert!(matches!(err, Error::CheckoutTimeout { .. }));
        drop(conns);
    }

    #[test]
    fn checkout_timeout_recovers_cleanly() {
        let dir = tempfile::tempdir().unwrap();
        let pool = ConnectionPool::new(pool_config(dir.path(), 1));

        let held = pool.get(Duration::from_secs(1)).unwrap();
        let started = Instant::now();
        let err = pool.get(Duration::from_millis(100)).unwrap_err();
        let waited = started.elapsed();
        assert!(matches!(err, Error::CheckoutTimeout { .. }));
        assert!(waited >= Duration::from_millis(100));
        assert!(waited < Duration::from_millis(500), "timed out late: {waited:?}");
        assert_eq!(pool.stats().waiting_requests, 0, "waiter must leave the queue");

        drop(held);
        // the pool is usable again with no leaked slots
        let conn = pool.get(Duration::from_secs(1)).unwrap();
        drop(conn);
        assert_eq!(pool.stats().total_connections, 1);
    }

    #[test]
    fn waiters_are_served_fifo() {
        let dir = tempfile::tempdir().unwrap();
        let pool = ConnectionPool::new(pool_config(dir.path(), 1));

        let held = pool.get(Duration::from_secs(1)).unwrap();
        let (tx, rx) = mpsc::channel::<u8>();

        let mut handles = Vec::new();
        for i in 1..=2u8 {
            let pool = pool.clone();
            let tx = tx.clone();
            handles.push(thread::spawn(move || {
                let conn = pool.get(Duration::from_secs(5)).unwrap();
                tx.send(i).unwrap();
                thread::sleep(Duration::from_millis(20));
                drop(conn);
            }));
            // stagger enqueue so the queue order is deterministic
            thread::sleep(Duration::from_millis(50));
        }

        assert_eq!(pool.stats().waiting_requests, 2);
        drop(held);

        let first = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        let second = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!((first, second), (1, 2));
        for h in handles {
            h.join().unwrap();
        }
    }

    #[test]
    fn saturated_pool_serializes_work() {
        let dir = tempfile::tempdir().unwrap();
        let pool = ConnectionPool::new(pool_config(dir.path(), 1));

        let (tx, rx) = mpsc::channel::<u8>();
        let mut handles = Vec::new();
        for i in 0..3u8 {
            let pool = pool.clone();
            let tx = tx.clone();
            handles.push(thread::spawn(move || {
                pool.with_connection(|_conn| {
                    thread::sleep(Duration::from_millis(50));
                    tx.send(i).unwrap();
                    Ok(())
                })
                .unwrap();
            }));
            thread::sleep(Duration::from_millis(10));
        }

        let order: Vec<u8> = (0..3)
            .map(|_| rx.recv_timeout(Duration::from_secs(5)).unwrap())
            .collect();
        assert_eq!(order, vec![0, 1, 2]);
        assert_eq!(pool.stats().total_connections, 1);
        for h in handles {
            h.join().unwrap();
        }
    }

    #[test]
    fn shutdown_rejects_checkouts_and_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let pool = ConnectionPool::new(pool_config(dir.path(), 2));

        // seed an idle connection
        drop(pool.get(Duration::from_secs(1)).unwrap());
        assert_eq!(pool.stats().idle_connections, 1);

        pool.shutdown();
        pool.shutdown(); // second call is a no-op

        let err = pool.get(Duration::from_secs(1)).unwrap_err();
        assert!(matches!(err, Error::PoolShuttingDown));
        let stats = pool.stats();
        assert_eq!(stats.idle_connections, 0);
        assert_eq!(stats.total_connections, 0);
    }

    #[test]
    fn shutdown_wakes_queued_waiters() {
        let dir = tempfile::tempdir().unwrap();
        let pool = ConnectionPool::new(pool_config(dir.path(), 1));

        let held = pool.get(Duration::from_secs(1)).unwrap();
        let waiter_pool = pool.clone();
        let handle = thread::spawn(move || waiter_pool.get(Duration::from_secs(10)));
        while pool.stats().waiting_requests == 0 {
            thread::sleep(Duration::from_millis(5));
        }

        pool.shutdown();
        let result = handle.join().unwrap();
        assert!(matches!(result, Err(Error::PoolShuttingDown)));

        // releasing a held connection during shutdown closes it
        drop(held);
        assert_eq!(pool.stats().total_connections, 0);
    }

    #[test]
    fn reaper_shrinks_idle_set_to_floor() {
        let dir = tempfile::tempdir().unwrap();
        let pool = ConnectionPool::new(pool_config(dir.path(), 5));

        // park five idle connections
        let conns: Vec<_> = (0..5)
            .map(|_| pool.get(Duration::from_secs(1)).unwrap())
            .collect();
        drop(conns);
        assert_eq!(pool.stats().idle_connections, 5);

        // idle_timeout is 100ms, reaper fires every 50ms
        thread::sleep(Duration::from_millis(400));
        let stats = pool.stats();
        assert_eq!(stats.idle_connections, IDLE_FLOOR);
        assert_eq!(stats.total_connections, IDLE_FLOOR);
    }

    #[test]
    fn with_transaction_commits() {
        let dir = tempfile::tempdir().unwrap();
        let pool = ConnectionPool::new(pool_config(dir.path(), 1));

        pool.with_connection(|conn| {
            conn.execute_batch("CREATE TABLE t (id INTEGER PRIMARY KEY)")?;
            with_transaction(conn, |tx| {
                tx.execute("INSERT INTO t (id) VALUES (1)", [])?;
                Ok(())
            })
        })
        .unwrap();

        let count: i64 = pool
            .with_connection(|conn| {
                Ok(conn.query_row("SELECT COUNT(*) FROM t", [], |r| r.get(0))?)
            })
            .unwrap();
        assert_eq!(count, 1);
    }

    #[test]
    fn with_transaction_rolls_back_on_error() {
        let dir = tempfile::tempdir().unwrap();
        let pool = ConnectionPool::new(pool_config(dir.path(), 1));

        pool.with_connection(|conn| {
            conn.execute_batch("CREATE TABLE t (id INTEGER PRIMARY KEY)")
                .map_err(Error::from)
        })
        .unwrap();

        let result: Result<()> = pool.with_connection(|conn| {
            with_transaction(conn, |tx| {
                tx.execute("INSERT INTO t (id) VALUES (1)", [])?;
                Err(Error::UnknownTable("boom".into()))
            })
        });
        assert!(result.is_err());

        let count: i64 = pool
            .with_connection(|conn| {
                Ok(conn.query_row("SELECT COUNT(*) FROM t", [], |r| r.get(0))?)
            })
            .unwrap();
        assert_eq!(count, 0);
    }

    #[test]
    fn pool_invariants_hold_under_concurrency() {
        let dir = tempfile::tempdir().unwrap();
        let pool = ConnectionPool::new(pool_config(dir.path(), 3));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let pool = pool.clone();
            handles.push(thread::spawn(move || {
                for _ in 0..5 {
                    pool.with_connection(|conn| {
                        conn.query_row("SELECT 1", [], |r| r.get::<_, i64>(0))?;
                        Ok(())
                    })
                    .unwrap();
                    let stats = pool.stats();
                    assert!(stats.total_connections <= stats.max_connections);
                    assert!(
                        stats.active_connections + stats.idle_connections
                            <= stats.total_connections
                    );
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
    }
}
