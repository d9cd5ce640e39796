//! Connection pooling for Keel using asupersync.
//!
//! The pool owns every physical connection. [`Pool::acquire`] hands out a
//! [`PooledConnection`] guard that gives one caller exclusive use of a
//! connection; dropping the guard returns the connection exactly once.
//!
//! - The number of open connections never exceeds `max_connections`.
//! - An acquire that finds no idle connection and no free capacity waits
//!   until a connection is released, failing with `PoolError(Exhausted)`
//!   once `acquire_timeout_ms` has passed.
//! - Opening a connection is bounded by `connect_timeout_ms`.
//! - Idle connections are validated before reuse; dead or expired ones are
//!   discarded and replaced.
//! - A connection released in the middle of a transaction (its guard was
//!   marked tainted, e.g. because the owning operation was cancelled) is
//!   rolled back before anyone else gets it.

use std::collections::VecDeque;
use std::future::Future;
use std::ops::Deref;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::task::{Context, Poll, Waker};
use std::time::{Duration, Instant};

use asupersync::time::timeout_at;
use asupersync::{Cx, Outcome};
use keel_core::{
    Connection, ConnectionError, ConnectionErrorKind, DatabaseConfig, Dialect, Error, PoolError,
    PoolErrorKind, clock_now,
};

/// Opens physical connections for a pool.
///
/// Drivers implement this next to their [`Connection`] type.
pub trait Connector: Send + Sync + 'static {
    type Conn: Connection + 'static;

    /// Dialect spoken by the connections this connector opens.
    fn dialect(&self) -> Dialect;

    /// Open a new physical connection.
    fn connect(&self, cx: &Cx) -> impl Future<Output = Outcome<Self::Conn, Error>> + Send;
}

/// Connection pool configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolConfig {
    /// Maximum number of connections allowed
    pub max_connections: usize,
    /// Maximum time to wait for a connection in milliseconds
    pub acquire_timeout_ms: u64,
    /// Maximum time to open a new connection in milliseconds
    pub connect_timeout_ms: u64,
    /// Connection idle timeout in milliseconds
    pub idle_timeout_ms: Option<u64>,
    /// Maximum lifetime of a connection in milliseconds
    pub max_lifetime_ms: Option<u64>,
    /// Ping idle connections before giving them out
    pub validate_on_checkout: bool,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_connections: 10,
            acquire_timeout_ms: 30_000,       // 30 seconds
            connect_timeout_ms: 10_000,       // 10 seconds
            idle_timeout_ms: Some(600_000),   // 10 minutes
            max_lifetime_ms: Some(1_800_000), // 30 minutes
            validate_on_checkout: true,
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

    /// Set connect timeout.
    pub fn connect_timeout(mut self, ms: u64) -> Self {
        self.connect_timeout_ms = ms;
        self
    }

    /// Set idle timeout (`None` keeps idle connections forever).
    pub fn idle_timeout(mut self, ms: Option<u64>) -> Self {
        self.idle_timeout_ms = ms;
        self
    }

    /// Set max lifetime (`None` for unlimited).
    pub fn max_lifetime(mut self, ms: Option<u64>) -> Self {
        self.max_lifetime_ms = ms;
        self
    }

    /// Enable/disable validation on checkout.
    pub fn validate_on_checkout(mut self, enabled: bool) -> Self {
        self.validate_on_checkout = enabled;
        self
    }
}

impl From<&DatabaseConfig> for PoolConfig {
    fn from(config: &DatabaseConfig) -> Self {
        Self::new(config.max_connections)
            .acquire_timeout(config.acquire_timeout_ms)
            .connect_timeout(config.connect_timeout_ms)
            .validate_on_checkout(config.validate_on_checkout)
    }
}

/// Pool statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PoolStats {
    /// Total number of connections (active + idle, including ones being opened)
    pub total_connections: usize,
    /// Number of idle connections
    pub idle_connections: usize,
    /// Number of connections checked out
    pub active_connections: usize,
    /// Number of acquire requests waiting for a connection
    pub pending_requests: usize,
}

struct IdleConn<C> {
    conn: C,
    created_at: Instant,
    idle_since: Instant,
    tainted: bool,
}

struct PoolState<C> {
    idle: VecDeque<IdleConn<C>>,
    total: usize,
    waiters: VecDeque<(u64, Waker)>,
    next_waiter: u64,
    closed: bool,
}

impl<C> PoolState<C> {
    /// Wake the longest-waiting acquirer, if any.
    fn take_waiter(&mut self) -> Option<Waker> {
        self.waiters.pop_front().map(|(_, w)| w)
    }
}

struct Shared<K: Connector> {
    connector: K,
    config: PoolConfig,
    state: Mutex<PoolState<K::Conn>>,
}

impl<K: Connector> Shared<K> {
    fn lock(&self) -> MutexGuard<'_, PoolState<K::Conn>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Give back a capacity slot without a connection.
    fn forget_one(&self) {
        let waiter = {
            let mut state = self.lock();
            state.total = state.total.saturating_sub(1);
            state.take_waiter()
        };
        if let Some(w) = waiter {
            w.wake();
        }
    }
}

/// A bounded pool of connections opened by a [`Connector`].
///
/// Cloning is cheap; clones share the same connections.
pub struct Pool<K: Connector> {
    shared: Arc<Shared<K>>,
}

impl<K: Connector> Clone for Pool<K> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<K: Connector> std::fmt::Debug for Pool<K> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pool")
            .field("config", &self.shared.config)
            .field("stats", &self.stats())
            .finish_non_exhaustive()
    }
}

enum Slot<C> {
    Idle(IdleConn<C>),
    Create,
    Closed,
}

impl<K: Connector> Pool<K> {
    /// Create a pool. No connection is opened until the first acquire.
    pub fn new(connector: K, config: PoolConfig) -> Self {
        let config = PoolConfig {
            max_connections: config.max_connections.max(1),
            ..config
        };
        tracing::debug!(
            dialect = %connector.dialect(),
            max_connections = config.max_connections,
            acquire_timeout_ms = config.acquire_timeout_ms,
            "creating connection pool"
        );
        Self {
            shared: Arc::new(Shared {
                connector,
                config,
                state: Mutex::new(PoolState {
                    idle: VecDeque::new(),
                    total: 0,
                    waiters: VecDeque::new(),
                    next_waiter: 0,
                    closed: false,
                }),
            }),
        }
    }

    /// Get the pool configuration.
    pub fn config(&self) -> &PoolConfig {
        &self.shared.config
    }

    pub fn dialect(&self) -> Dialect {
        self.shared.connector.dialect()
    }

    pub fn connector(&self) -> &K {
        &self.shared.connector
    }

    /// Get the current pool statistics.
    pub fn stats(&self) -> PoolStats {
        let state = self.shared.lock();
        PoolStats {
            total_connections: state.total,
            idle_connections: state.idle.len(),
            active_connections: state.total.saturating_sub(state.idle.len()),
            pending_requests: state.waiters.len(),
        }
    }

    /// Check if the pool is at capacity.
    pub fn at_capacity(&self) -> bool {
        let state = self.shared.lock();
        state.total >= self.shared.config.max_connections && state.idle.is_empty()
    }

    pub fn is_closed(&self) -> bool {
        self.shared.lock().closed
    }

    /// Check out a connection, waiting up to `acquire_timeout_ms`.
    pub async fn acquire(&self, cx: &Cx) -> Outcome<PooledConnection<K>, Error> {
        let timeout = Duration::from_millis(self.shared.config.acquire_timeout_ms);
        let deadline = clock_now() + timeout;

        loop {
            if let Some(reason) = cx.cancel_reason() {
                return Outcome::Cancelled(reason);
            }
            let checkout = Checkout {
                shared: &self.shared,
                waiter: None,
            };

            match timeout_at(deadline, checkout).await {
                Ok(Slot::Idle(idle)) => {
                    if let Some(guard) = self.revive(cx, idle).await {
                        return Outcome::Ok(guard);
                    }
                }
                Ok(Slot::Create) => return self.open(cx).await,
                Ok(Slot::Closed) => return Outcome::Err(closed_error()),
                Err(_) => {
                    tracing::warn!(
                        timeout_ms = self.shared.config.acquire_timeout_ms,
                        max_connections = self.shared.config.max_connections,
                        "connection pool exhausted"
                    );
                    return Outcome::Err(Error::Pool(PoolError {
                        kind: PoolErrorKind::Exhausted,
                        message: format!(
                            "no connection available within {} ms ({} in use)",
                            self.shared.config.acquire_timeout_ms,
                            self.shared.config.max_connections
                        ),
                    }));
                }
            }
        }
    }

    /// Check out an idle connection without waiting or opening a new one.
    ///
    /// The connection is not validated.
    pub fn try_acquire(&self) -> Option<PooledConnection<K>> {
        let idle = {
            let mut state = self.shared.lock();
            if state.closed {
                return None;
            }
            state.idle.pop_front()?
        };
        let mut guard = self.guard(idle.conn, idle.created_at);
        guard.tainted = idle.tainted;
        if guard.tainted {
            // needs an async rollback first
            drop(guard);
            return None;
        }
        Some(guard)
    }

    /// Close the pool: idle connections are closed now, checked-out ones
    /// when they are released. Waiting and future acquires fail with
    /// `PoolError(Closed)`.
    pub async fn close(&self, cx: &Cx) {
        let (idle, waiters) = {
            let mut state = self.shared.lock();
            state.closed = true;
            let idle: Vec<_> = state.idle.drain(..).collect();
            state.total -= idle.len();
            let waiters: Vec<_> = state.waiters.drain(..).map(|(_, w)| w).collect();
            (idle, waiters)
        };
        for w in waiters {
            w.wake();
        }
        tracing::info!(closed = idle.len(), "closing connection pool");
        for entry in idle {
            if let Err(e) = entry.conn.close(cx).await {
                tracing::warn!(error = %e, "error closing pooled connection");
            }
        }
    }

    fn guard(&self, conn: K::Conn, created_at: Instant) -> PooledConnection<K> {
        PooledConnection {
            conn: Some(conn),
            created_at,
            shared: Arc::clone(&self.shared),
            tainted: false,
            broken: false,
        }
    }

    /// Open a connection into a slot already reserved by the checkout.
    async fn open(&self, cx: &Cx) -> Outcome<PooledConnection<K>, Error> {
        let reservation = Reservation {
            shared: &self.shared,
            armed: true,
        };
        let limit = Duration::from_millis(self.shared.config.connect_timeout_ms);
        let connecting = self.shared.connector.connect(cx);
        let Ok(opened) = timeout_at(clock_now() + limit, connecting).await else {
            tracing::warn!(
                timeout_ms = self.shared.config.connect_timeout_ms,
                "timed out opening connection"
            );
            return Outcome::Err(Error::Connection(ConnectionError {
                kind: ConnectionErrorKind::Connect,
                message: format!(
                    "no connection established within {} ms",
                    self.shared.config.connect_timeout_ms
                ),
                transient: true,
                source: None,
            }));
        };
        match opened {
            Outcome::Ok(conn) => {
                reservation.disarm();
                tracing::debug!(stats = ?self.stats(), "opened new connection");
                Outcome::Ok(self.guard(conn, Instant::now()))
            }
            Outcome::Err(e) => {
                tracing::warn!(error = %e, "failed to open connection");
                Outcome::Err(e)
            }
            Outcome::Cancelled(r) => Outcome::Cancelled(r),
            Outcome::Panicked(p) => Outcome::Panicked(p),
        }
    }

    /// Make an idle connection ready for use, or discard it.
    async fn revive(&self, cx: &Cx, idle: IdleConn<K::Conn>) -> Option<PooledConnection<K>> {
        let config = &self.shared.config;
        let now = Instant::now();
        let expired = config
            .max_lifetime_ms
            .is_some_and(|ms| now.duration_since(idle.created_at) >= Duration::from_millis(ms));
        let stale = config
            .idle_timeout_ms
            .is_some_and(|ms| now.duration_since(idle.idle_since) >= Duration::from_millis(ms));

        let mut guard = self.guard(idle.conn, idle.created_at);
        // stays tainted until proven clean, so a cancelled check is retried later
        guard.tainted = true;
        if expired || stale {
            tracing::debug!(expired, stale, "discarding aged connection");
            guard.discard();
            return None;
        }

        if idle.tainted {
            let sql = guard.dialect().rollback_sql();
            match guard.execute(cx, sql, &[]).await {
                Outcome::Ok(_) => {
                    tracing::debug!("rolled back transaction left open on released connection");
                }
                _ => {
                    tracing::warn!("rollback of released connection failed, discarding it");
                    guard.discard();
                    return None;
                }
            }
        }

        if config.validate_on_checkout && !guard.is_valid(cx).await {
            tracing::warn!("pooled connection failed validation, replacing it");
            guard.discard();
            return None;
        }

        guard.tainted = false;
        Some(guard)
    }
}

fn closed_error() -> Error {
    Error::Pool(PoolError {
        kind: PoolErrorKind::Closed,
        message: "connection pool is closed".to_string(),
    })
}

/// Capacity slot taken for a connection being opened.
struct Reservation<'a, K: Connector> {
    shared: &'a Shared<K>,
    armed: bool,
}

impl<K: Connector> Reservation<'_, K> {
    fn disarm(mut self) {
        self.armed = false;
    }
}

impl<K: Connector> Drop for Reservation<'_, K> {
    fn drop(&mut self) {
        if self.armed {
            self.shared.forget_one();
        }
    }
}

/// Waits for an idle connection or free capacity.
///
/// Has no deadline of its own; `acquire` bounds it with a timeout.
struct Checkout<'a, K: Connector> {
    shared: &'a Shared<K>,
    waiter: Option<u64>,
}

impl<K: Connector> Checkout<'_, K> {
    fn unregister(&mut self, state: &mut PoolState<K::Conn>) {
        if let Some(id) = self.waiter.take() {
            state.waiters.retain(|(w, _)| *w != id);
        }
    }
}

impl<K: Connector> Future for Checkout<'_, K> {
    type Output = Slot<K::Conn>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = &mut *self;
        let mut state = this.shared.lock();

        let ready = if state.closed {
            Some(Slot::Closed)
        } else if let Some(idle) = state.idle.pop_front() {
            Some(Slot::Idle(idle))
        } else if state.total < this.shared.config.max_connections {
            state.total += 1;
            Some(Slot::Create)
        } else {
            None
        };
        if let Some(slot) = ready {
            this.unregister(&mut state);
            return Poll::Ready(slot);
        }

        let waker = cx.waker().clone();
        match this.waiter {
            Some(id) => match state.waiters.iter_mut().find(|(w, _)| *w == id) {
                Some(entry) => entry.1 = waker,
                None => state.waiters.push_back((id, waker)),
            },
            None => {
                let id = state.next_waiter;
                state.next_waiter += 1;
                state.waiters.push_back((id, waker));
                this.waiter = Some(id);
            }
        }
        Poll::Pending
    }
}

impl<K: Connector> Drop for Checkout<'_, K> {
    fn drop(&mut self) {
        if self.waiter.is_none() {
            return;
        }
        let next = {
            let mut state = self.shared.lock();
            self.unregister(&mut state);
            // a wakeup meant for this waiter must not be lost
            let available = !state.idle.is_empty()
                || state.total < self.shared.config.max_connections;
            if available { state.take_waiter() } else { None }
        };
        if let Some(w) = next {
            w.wake();
        }
    }
}

/// A connection checked out of a [`Pool`].
///
/// Dereferences to the driver connection. Dropping the guard returns the
/// connection to the pool; a guard marked [tainted](Self::mark_tainted) is
/// rolled back before reuse and a [discarded](Self::discard) one is closed.
pub struct PooledConnection<K: Connector> {
    conn: Option<K::Conn>,
    created_at: Instant,
    shared: Arc<Shared<K>>,
    tainted: bool,
    broken: bool,
}

impl<K: Connector> PooledConnection<K> {
    /// The connection may be inside an open transaction.
    pub fn mark_tainted(&mut self) {
        self.tainted = true;
    }

    /// The connection is back in a clean state.
    pub fn mark_clean(&mut self) {
        self.tainted = false;
    }

    pub fn is_tainted(&self) -> bool {
        self.tainted
    }

    /// Close the connection instead of returning it on release.
    pub fn mark_broken(&mut self) {
        self.broken = true;
    }

    /// Release the connection back to the pool.
    pub fn release(self) {
        drop(self);
    }

    /// Drop the connection and free its capacity slot.
    pub fn discard(mut self) {
        self.broken = true;
    }

    /// How long ago the underlying connection was opened.
    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }
}

impl<K: Connector> Deref for PooledConnection<K> {
    type Target = K::Conn;

    fn deref(&self) -> &Self::Target {
        match &self.conn {
            Some(conn) => conn,
            None => unreachable!("pooled connection used after release"),
        }
    }
}

impl<K: Connector> Drop for PooledConnection<K> {
    fn drop(&mut self) {
        let Some(conn) = self.conn.take() else {
            return;
        };
        let (waiter, dropped) = {
            let mut state = self.shared.lock();
            if self.broken || state.closed {
                state.total = state.total.saturating_sub(1);
                (state.take_waiter(), Some(conn))
            } else {
                state.idle.push_back(IdleConn {
                    conn,
                    created_at: self.created_at,
                    idle_since: Instant::now(),
                    tainted: self.tainted,
                });
                (state.take_waiter(), None)
            }
        };
        if dropped.is_some() {
            tracing::debug!(broken = self.broken, "connection closed on release");
        }
        drop(dropped);
        if let Some(w) = waiter {
            w.wake();
        }
    }
}
