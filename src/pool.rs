//! Bounded connection pool over any `ConnectionFactory`.
//!
//! Connections are created lazily up to `max_size`. The outstanding count
//! (idle plus checked out) and the idle queue live under one mutex that is
//! never held across an `.await`. Callers at capacity wait on a `Notify`
//! that fires whenever a connection is returned or destroyed.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;
use tokio::sync::Notify;
use tracing::{debug, trace};

use crate::error::{DbError, Result};

/// Creates, validates and tears down pooled connections.
#[async_trait]
pub trait ConnectionFactory: Send + Sync + 'static {
    type Connection: Send + 'static;

    async fn create(&self) -> Result<Self::Connection>;

    /// Whether `conn` may be handed out or returned to the idle queue.
    fn is_valid(&self, conn: &Self::Connection) -> bool;

    /// Close `conn`. Failures are the factory's to log.
    async fn destroy(&self, conn: Self::Connection);
}

struct PoolState<C> {
    /// Idle plus checked-out connections.
    size: usize,
    idle: VecDeque<C>,
    closed: bool,
}

struct PoolInner<F: ConnectionFactory> {
    factory: F,
    max_size: usize,
    state: Mutex<PoolState<F::Connection>>,
    /// Fired when a connection is returned or a slot frees up.
    released: Notify,
}

impl<F: ConnectionFactory> PoolInner<F> {
    fn push_idle(&self, conn: F::Connection) {
        self.state.lock().idle.push_back(conn);
        self.released.notify_waiters();
    }

    /// Give up one slot of the outstanding count.
    fn forget_one(&self) {
        {
            let mut state = self.state.lock();
            state.size = state.size.saturating_sub(1);
        }
        self.released.notify_waiters();
    }

    /// Close `conn` and give up its slot, even if this future is dropped
    /// before the factory finishes.
    async fn destroy(&self, conn: F::Connection) {
        let _slot = Reservation {
            inner: self,
            armed: true,
        };
        self.factory.destroy(conn).await;
    }

    /// Return a connection: valid ones go back to the idle queue.
    async fn release(&self, conn: F::Connection, discard: bool) {
        if !discard && self.factory.is_valid(&conn) {
            trace!("returning connection to pool");
            self.push_idle(conn);
        } else {
            debug!(discard, "destroying released connection");
            self.destroy(conn).await;
        }
    }
}

/// Holds one slot of the outstanding count while a connection is created
/// or destroyed. Dropping it without `commit` gives the slot back.
struct Reservation<'a, F: ConnectionFactory> {
    inner: &'a PoolInner<F>,
    armed: bool,
}

impl<F: ConnectionFactory> Reservation<'_, F> {
    fn commit(mut self) {
        self.armed = false;
    }
}

impl<F: ConnectionFactory> Drop for Reservation<'_, F> {
    fn drop(&mut self) {
        if self.armed {
            self.inner.forget_one();
        }
    }
}

/// A bounded pool of connections produced by `F`.
pub struct Pool<F: ConnectionFactory> {
    inner: Arc<PoolInner<F>>,
}

impl<F: ConnectionFactory> Clone for Pool<F> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<F: ConnectionFactory> Pool<F> {
    /// Create an empty pool. Connections are opened on demand.
    pub fn new(factory: F, max_size: usize) -> Result<Self> {
        if max_size == 0 {
            return Err(DbError::ConfigError(
                "pool size must be at least 1".to_string(),
            ));
        }

        Ok(Self {
            inner: Arc::new(PoolInner {
                factory,
                max_size,
                state: Mutex::new(PoolState {
                    size: 0,
                    idle: VecDeque::new(),
                    closed: false,
                }),
                released: Notify::new(),
            }),
        })
    }

    /// Get a valid connection, waiting while the pool is at capacity.
    ///
    /// Invalid candidates are destroyed and the acquisition retried, up to
    /// `max_size` attempts in total.
    pub async fn checkout(&self) -> Result<PooledConnection<F>> {
        for attempt in 1..=self.inner.max_size {
            let conn = self.acquire().await?;
            if self.inner.factory.is_valid(&conn) {
                return Ok(PooledConnection {
                    conn: Some(conn),
                    pool: Arc::clone(&self.inner),
                    discard: false,
                });
            }

            debug!(attempt, "discarding invalid connection at checkout");
            self.inner.destroy(conn).await;
        }

        Err(DbError::PoolExhausted)
    }

    /// Take an idle connection or create one, without validation.
    async fn acquire(&self) -> Result<F::Connection> {
        loop {
            let notified = self.inner.released.notified();
            tokio::pin!(notified);
            // Register before inspecting state so a release in between is not missed
            notified.as_mut().enable();

            let reservation = {
                let mut state = self.inner.state.lock();
                if state.closed {
                    return Err(DbError::PoolClosed);
                }
                if let Some(conn) = state.idle.pop_front() {
                    return Ok(conn);
                }
                if state.size < self.inner.max_size {
                    state.size += 1;
                    Some(Reservation {
                        inner: &*self.inner,
                        armed: true,
                    })
                } else {
                    None
                }
            };

            if let Some(reservation) = reservation {
                debug!(max_size = self.inner.max_size, "opening new pooled connection");
                let conn = self.inner.factory.create().await?;
                reservation.commit();
                return Ok(conn);
            }

            trace!("pool at capacity, waiting for a release");
            notified.await;
        }
    }

    /// Return a connection to the pool, destroying it if it is no longer valid.
    pub async fn release(&self, conn: PooledConnection<F>) {
        conn.release().await;
    }

    /// Refuse new checkouts and destroy every connection as it becomes idle.
    ///
    /// Waits for checked-out connections to come back, so it does not finish
    /// while any are leaked.
    pub async fn close(&self) {
        self.inner.state.lock().closed = true;
        self.inner.released.notify_waiters();

        loop {
            let notified = self.inner.released.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let next = {
                let mut state = self.inner.state.lock();
                if state.size == 0 {
                    break;
                }
                state.idle.pop_front()
            };

            match next {
                Some(conn) => self.inner.destroy(conn).await,
                None => notified.await,
            }
        }

        debug!("pool closed");
    }

    /// Idle plus checked-out connections.
    pub fn size(&self) -> usize {
        self.inner.state.lock().size
    }

    pub fn idle_count(&self) -> usize {
        self.inner.state.lock().idle.len()
    }

    pub fn max_size(&self) -> usize {
        self.inner.max_size
    }

    pub fn is_closed(&self) -> bool {
        self.inner.state.lock().closed
    }

    pub fn factory(&self) -> &F {
        &self.inner.factory
    }
}

impl<F: ConnectionFactory> fmt::Debug for Pool<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("Pool")
            .field("size", &state.size)
            .field("idle", &state.idle.len())
            .field("max_size", &self.inner.max_size)
            .field("closed", &state.closed)
            .finish()
    }
}

// ============================================================================
// Pooled Connection
// ============================================================================

/// A connection checked out from the pool.
///
/// When dropped, a valid connection goes back to the idle queue and an
/// invalid one is destroyed on a background task.
pub struct PooledConnection<F: ConnectionFactory> {
    /// The actual connection (None once handed back)
    conn: Option<F::Connection>,
    pool: Arc<PoolInner<F>>,
    discard: bool,
}

impl<F: ConnectionFactory> PooledConnection<F> {
    /// Destroy the connection on release instead of reusing it.
    pub fn discard(&mut self) {
        self.discard = true;
    }

    pub fn is_discarded(&self) -> bool {
        self.discard
    }

    /// Hand the connection back, awaiting its destruction if it is invalid.
    pub async fn release(mut self) {
        if let Some(conn) = self.conn.take() {
            self.pool.release(conn, self.discard).await;
        }
    }
}

impl<F: ConnectionFactory> Deref for PooledConnection<F> {
    type Target = F::Connection;

    fn deref(&self) -> &Self::Target {
        match &self.conn {
            Some(conn) => conn,
            None => unreachable!("pooled connection used after release"),
        }
    }
}

impl<F: ConnectionFactory> DerefMut for PooledConnection<F> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        match &mut self.conn {
            Some(conn) => conn,
            None => unreachable!("pooled connection used after release"),
        }
    }
}

impl<F: ConnectionFactory> Drop for PooledConnection<F> {
    fn drop(&mut self) {
        let Some(conn) = self.conn.take() else {
            return;
        };

        if !self.discard && self.pool.factory.is_valid(&conn) {
            self.pool.push_idle(conn);
            return;
        }

        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let pool = Arc::clone(&self.pool);
                handle.spawn(async move { pool.destroy(conn).await });
            }
            Err(_) => {
                drop(conn);
                self.pool.forget_one();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::time::Duration;

    #[derive(Debug)]
    struct MockConn {
        id: usize,
        healthy: bool,
    }

    #[derive(Default)]
    struct MockFactory {
        created: AtomicUsize,
        destroyed: AtomicUsize,
        fail_create: AtomicBool,
        create_unhealthy: AtomicBool,
        slow_destroy: AtomicBool,
    }

    #[async_trait]
    impl ConnectionFactory for MockFactory {
        type Connection = MockConn;

        async fn create(&self) -> Result<MockConn> {
            if self.fail_create.load(Ordering::SeqCst) {
                return Err(DbError::ConfigError("connection refused".to_string()));
            }
            tokio::task::yield_now().await;
            let id = self.created.fetch_add(1, Ordering::SeqCst);
            Ok(MockConn {
                id,
                healthy: !self.create_unhealthy.load(Ordering::SeqCst),
            })
        }

        fn is_valid(&self, conn: &MockConn) -> bool {
            conn.healthy
        }

        async fn destroy(&self, _conn: MockConn) {
            self.destroyed.fetch_add(1, Ordering::SeqCst);
            if self.slow_destroy.load(Ordering::SeqCst) {
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        }
    }

    #[test]
    fn test_zero_size_rejected() {
        assert!(matches!(
            Pool::new(MockFactory::default(), 0),
            Err(DbError::ConfigError(_))
        ));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_checkout_respects_max() {
        let pool = Pool::new(MockFactory::default(), 3).unwrap();
        let in_use = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let mut tasks = Vec::new();
        for _ in 0..16 {
            let pool = pool.clone();
            let in_use = Arc::clone(&in_use);
            let peak = Arc::clone(&peak);
            tasks.push(tokio::spawn(async move {
                for _ in 0..20 {
                    let conn = pool.checkout().await.unwrap();
                    let now = in_use.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    assert!(pool.size() <= 3);
                    tokio::task::yield_now().await;
                    in_use.fetch_sub(1, Ordering::SeqCst);
                    pool.release(conn).await;
                }
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }

        assert!(peak.load(Ordering::SeqCst) <= 3);
        assert!(pool.factory().created.load(Ordering::SeqCst) <= 3);

        pool.close().await;
        assert_eq!(pool.size(), 0);
        assert_eq!(pool.idle_count(), 0);
        let factory = pool.factory();
        assert_eq!(
            factory.created.load(Ordering::SeqCst),
            factory.destroyed.load(Ordering::SeqCst)
        );
    }

    #[tokio::test]
    async fn test_idle_connection_reused() {
        let pool = Pool::new(MockFactory::default(), 2).unwrap();

        let conn = pool.checkout().await.unwrap();
        let id = conn.id;
        pool.release(conn).await;
        assert_eq!(pool.idle_count(), 1);

        let conn = pool.checkout().await.unwrap();
        assert_eq!(conn.id, id);
        assert_eq!(pool.factory().created.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_invalid_connection_not_requeued() {
        let pool = Pool::new(MockFactory::default(), 2).unwrap();

        let mut conn = pool.checkout().await.unwrap();
        conn.healthy = false;
        pool.release(conn).await;

        assert_eq!(pool.idle_count(), 0);
        assert_eq!(pool.size(), 0);
        assert_eq!(pool.factory().destroyed.load(Ordering::SeqCst), 1);

        let conn = pool.checkout().await.unwrap();
        assert_eq!(conn.id, 1);
    }

    #[tokio::test]
    async fn test_cancelled_release_frees_slot() {
        let pool = Pool::new(MockFactory::default(), 1).unwrap();
        pool.factory().slow_destroy.store(true, Ordering::SeqCst);

        let mut conn = pool.checkout().await.unwrap();
        conn.healthy = false;
        let cancelled = tokio::time::timeout(Duration::from_millis(10), pool.release(conn)).await;
        assert!(cancelled.is_err());
        assert_eq!(pool.size(), 0);

        let conn = tokio::time::timeout(Duration::from_millis(50), pool.checkout())
            .await
            .expect("checkout blocked on a leaked slot")
            .unwrap();
        assert_eq!(conn.id, 1);
        drop(conn);

        pool.close().await;
        assert_eq!(pool.size(), 0);
    }

    #[tokio::test]
    async fn test_cancelled_checkout_destroy_frees_slot() {
        let pool = Pool::new(MockFactory::default(), 1).unwrap();
        pool.factory().slow_destroy.store(true, Ordering::SeqCst);

        let mut conn = pool.checkout().await.unwrap();
        conn.healthy = false;
        // Bypass validation so the next checkout finds the broken connection idle
        pool.inner.push_idle(conn.conn.take().unwrap());
        drop(conn);

        let cancelled = tokio::time::timeout(Duration::from_millis(10), pool.checkout()).await;
        assert!(cancelled.is_err());
        assert_eq!(pool.size(), 0);
        assert_eq!(pool.factory().destroyed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_discarded_connection_destroyed_on_drop() {
        let pool = Pool::new(MockFactory::default(), 1).unwrap();

        let mut conn = pool.checkout().await.unwrap();
        conn.discard();
        drop(conn);

        // Destruction runs on a spawned task
        pool.checkout().await.unwrap();
        assert_eq!(pool.factory().destroyed.load(Ordering::SeqCst), 1);
        assert_eq!(pool.factory().created.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_create_failure_frees_slot() {
        let pool = Pool::new(MockFactory::default(), 1).unwrap();
        pool.factory().fail_create.store(true, Ordering::SeqCst);

        assert!(matches!(
            pool.checkout().await,
            Err(DbError::ConfigError(_))
        ));
        assert_eq!(pool.size(), 0);

        pool.factory().fail_create.store(false, Ordering::SeqCst);
        assert!(pool.checkout().await.is_ok());
    }

    #[tokio::test]
    async fn test_exhausted_after_max_invalid_attempts() {
        let pool = Pool::new(MockFactory::default(), 3).unwrap();
        pool.factory().create_unhealthy.store(true, Ordering::SeqCst);

        assert!(matches!(pool.checkout().await, Err(DbError::PoolExhausted)));
        assert_eq!(pool.factory().created.load(Ordering::SeqCst), 3);
        assert_eq!(pool.factory().destroyed.load(Ordering::SeqCst), 3);
        assert_eq!(pool.size(), 0);
    }

    #[tokio::test]
    async fn test_checkout_waits_at_capacity() {
        let pool = Pool::new(MockFactory::default(), 1).unwrap();
        let held = pool.checkout().await.unwrap();

        let blocked = tokio::time::timeout(Duration::from_millis(50), pool.checkout()).await;
        assert!(blocked.is_err());
        // The timed-out waiter left no trace
        assert_eq!(pool.size(), 1);

        let waiter = {
            let pool = pool.clone();
            tokio::spawn(async move { pool.checkout().await.map(|c| c.id) })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        drop(held);

        assert_eq!(waiter.await.unwrap().unwrap(), 0);
    }

    #[tokio::test]
    async fn test_close_waits_for_outstanding() {
        let pool = Pool::new(MockFactory::default(), 2).unwrap();
        let held = pool.checkout().await.unwrap();
        pool.release(pool.checkout().await.unwrap()).await;

        let closing = {
            let pool = pool.clone();
            tokio::spawn(async move { pool.close().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!closing.is_finished());
        assert!(matches!(pool.checkout().await, Err(DbError::PoolClosed)));

        pool.release(held).await;
        closing.await.unwrap();

        assert_eq!(pool.size(), 0);
        assert_eq!(pool.factory().destroyed.load(Ordering::SeqCst), 2);
    }
}
