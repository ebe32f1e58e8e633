//! Per-server connection pools.
//!
//! A pool hands out [`Channel`]s: scoped guards around one [`Connection`].
//! A semaphore sized `max_pool_size` bounds checked-out plus connecting
//! connections; idle ones sit on a stack so the most recently returned one
//! is reused first.

mod connection;

pub use connection::{AuthHook, BoxedStream, Connection, Connector, NoAuth, Stream, TcpConnector};

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, info, warn};

use crate::config::PoolOptions;
use crate::error::{CHECKOUT_TIMEOUT, DriverError, DriverResult};
use crate::topology::ServerAddress;

/// Connection pool for one server.
#[derive(Clone)]
pub struct ConnectionPool {
    inner: Arc<PoolInner>,
}

struct PoolInner {
    address: ServerAddress,
    options: PoolOptions,
    connector: Arc<dyn Connector>,
    auth: Arc<dyn AuthHook>,
    idle: Mutex<Vec<Connection>>,
    semaphore: Arc<Semaphore>,
    generation: AtomicU64,
    total_created: AtomicU64,
}

impl ConnectionPool {
    /// Create a pool. When called inside a tokio runtime, a maintenance task
    /// is started that keeps `min_pool_size` connections open and closes
    /// connections past `max_idle_time` or `max_lifetime`.
    pub fn new(
        address: ServerAddress,
        options: PoolOptions,
        connector: Arc<dyn Connector>,
        auth: Arc<dyn AuthHook>,
    ) -> Self {
        info!(
            %address,
            max_pool_size = options.max_pool_size,
            min_pool_size = options.min_pool_size,
            "creating connection pool"
        );
        let inner = Arc::new(PoolInner {
            semaphore: Arc::new(Semaphore::new(options.max_pool_size)),
            address,
            options,
            connector,
            auth,
            idle: Mutex::new(Vec::new()),
            generation: AtomicU64::new(0),
            total_created: AtomicU64::new(0),
        });

        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            let interval = inner.options.maintenance_interval;
            handle.spawn(maintain(Arc::downgrade(&inner), interval));
        }

        Self { inner }
    }

    /// Server this pool connects to.
    pub fn address(&self) -> &ServerAddress {
        &self.inner.address
    }

    /// Check out a channel, waiting at most `timeout` for a free slot.
    pub async fn acquire(&self, timeout: Duration) -> DriverResult<Channel> {
        let permit = tokio::time::timeout(timeout, Arc::clone(&self.inner.semaphore).acquire_owned())
            .await
            .map_err(|_| DriverError::timeout(CHECKOUT_TIMEOUT, timeout))?
            .map_err(|_| DriverError::connection("connection pool is closed"))?;

        let connection = match self.inner.pop_idle() {
            Some(connection) => {
                debug!(connection_id = connection.id(), address = %self.inner.address, "reusing idle connection");
                connection
            }
            None => self.inner.open().await?,
        };

        Ok(Channel {
            connection: Some(connection),
            pool: Arc::clone(&self.inner),
            _permit: permit,
        })
    }

    /// Close every idle connection and mark checked-out ones for closing on
    /// return.
    pub fn clear(&self) {
        let generation = self.inner.generation.fetch_add(1, Ordering::AcqRel) + 1;
        let closed = std::mem::take(&mut *self.inner.idle.lock());
        info!(
            address = %self.inner.address,
            generation,
            closed = closed.len(),
            "connection pool cleared"
        );
    }

    /// Run one maintenance pass now.
    pub async fn maintain(&self) {
        self.inner.maintain().await;
    }

    /// Current pool status.
    pub fn status(&self) -> PoolStatus {
        let max_size = self.inner.options.max_pool_size;
        PoolStatus {
            max_size,
            idle: self.inner.idle.lock().len(),
            in_use: max_size - self.inner.semaphore.available_permits(),
            total_created: self.inner.total_created.load(Ordering::Relaxed),
        }
    }

    /// Pool options.
    pub fn options(&self) -> &PoolOptions {
        &self.inner.options
    }
}

impl fmt::Debug for ConnectionPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("address", &self.inner.address)
            .field("status", &self.status())
            .finish()
    }
}

impl PoolInner {
    fn current_generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    /// Whether a checked-out connection may not go back to the idle stack.
    fn is_retired(&self, connection: &Connection) -> bool {
        connection.generation() != self.current_generation()
            || self
                .options
                .max_lifetime
                .is_some_and(|limit| connection.age() > limit)
    }

    fn is_expired(&self, connection: &Connection) -> bool {
        self.is_retired(connection)
            || self
                .options
                .max_idle_time
                .is_some_and(|limit| connection.idle_time() > limit)
    }

    fn pop_idle(&self) -> Option<Connection> {
        let mut idle = self.idle.lock();
        while let Some(connection) = idle.pop() {
            if !self.is_expired(&connection) {
                return Some(connection);
            }
            debug!(connection_id = connection.id(), "closing expired idle connection");
        }
        None
    }

    async fn open(&self) -> DriverResult<Connection> {
        let stream = self
            .connector
            .connect(&self.address, self.options.connect_timeout)
            .await?;
        let mut connection = Connection::new(self.address.clone(), self.current_generation(), stream);
        self.auth.authenticate(&mut connection).await?;
        self.total_created.fetch_add(1, Ordering::Relaxed);
        Ok(connection)
    }

    fn check_in(&self, mut connection: Connection, healthy: bool) {
        if !healthy {
            warn!(
                connection_id = connection.id(),
                address = %self.address,
                "discarding connection"
            );
            return;
        }
        if self.is_retired(&connection) {
            debug!(
                connection_id = connection.id(),
                generation = connection.generation(),
                age_ms = connection.age().as_millis() as u64,
                "closing retired connection on return"
            );
            return;
        }
        connection.touch();
        self.idle.lock().push(connection);
    }

    async fn maintain(&self) {
        let reaped = {
            let mut idle = self.idle.lock();
            let before = idle.len();
            idle.retain(|c| !self.is_expired(c));
            before - idle.len()
        };
        if reaped > 0 {
            debug!(address = %self.address, reaped, "closed idle connections");
        }

        loop {
            let total = self.idle.lock().len() + self.options.max_pool_size
                - self.semaphore.available_permits();
            if total >= self.options.min_pool_size {
                break;
            }
            // Reserve a slot so filling never pushes the pool past its maximum.
            let Ok(_slot) = Arc::clone(&self.semaphore).try_acquire_owned() else {
                break;
            };
            match self.open().await {
                Ok(connection) => self.idle.lock().push(connection),
                Err(err) => {
                    warn!(address = %self.address, error = %err, "failed to open minimum pool connection");
                    break;
                }
            }
        }
    }
}

async fn maintain(pool: Weak<PoolInner>, interval: Duration) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        let Some(inner) = pool.upgrade() else {
            break;
        };
        inner.maintain().await;
    }
}

/// Pool status information.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStatus {
    /// Maximum connections.
    pub max_size: usize,
    /// Idle connections.
    pub idle: usize,
    /// Checked-out or connecting slots.
    pub in_use: usize,
    /// Connections opened over the pool's lifetime.
    pub total_created: u64,
}

/// A connection checked out of a pool for one exchange.
///
/// Dropping a channel without [`release`](Channel::release) discards its
/// connection.
pub struct Channel {
    connection: Option<Connection>,
    pool: Arc<PoolInner>,
    _permit: OwnedSemaphorePermit,
}

impl Channel {
    /// The checked-out connection.
    pub fn connection_mut(&mut self) -> DriverResult<&mut Connection> {
        self.connection
            .as_mut()
            .ok_or_else(|| DriverError::connection_closed("channel already released"))
    }

    /// Server the channel talks to.
    pub fn address(&self) -> &ServerAddress {
        &self.pool.address
    }

    /// Id of the underlying connection.
    pub fn connection_id(&self) -> Option<u64> {
        self.connection.as_ref().map(Connection::id)
    }

    /// Return the connection. Unhealthy connections are closed.
    pub fn release(mut self, healthy: bool) {
        if let Some(connection) = self.connection.take() {
            self.pool.check_in(connection, healthy);
        }
    }

    /// Close the connection.
    pub fn discard(self) {
        self.release(false);
    }
}

impl Drop for Channel {
    fn drop(&mut self) {
        if let Some(connection) = self.connection.take() {
            self.pool.check_in(connection, false);
        }
    }
}

impl fmt::Debug for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Channel")
            .field("address", &self.pool.address)
            .field("connection", &self.connection)
            .finish()
    }
}

/// Pools for every server, created on first use.
pub struct ConnectionPools {
    options: PoolOptions,
    connector: Arc<dyn Connector>,
    auth: Arc<dyn AuthHook>,
    pools: Mutex<HashMap<ServerAddress, ConnectionPool>>,
}

impl ConnectionPools {
    /// Create an empty set of pools.
    pub fn new(options: PoolOptions, connector: Arc<dyn Connector>, auth: Arc<dyn AuthHook>) -> Self {
        Self {
            options,
            connector,
            auth,
            pools: Mutex::new(HashMap::new()),
        }
    }

    /// The pool for `address`, created if needed.
    pub fn get_or_create(&self, address: &ServerAddress) -> ConnectionPool {
        let mut pools = self.pools.lock();
        pools
            .entry(address.clone())
            .or_insert_with(|| {
                ConnectionPool::new(
                    address.clone(),
                    self.options.clone(),
                    Arc::clone(&self.connector),
                    Arc::clone(&self.auth),
                )
            })
            .clone()
    }

    /// The pool for `address`, if one exists.
    pub fn get(&self, address: &ServerAddress) -> Option<ConnectionPool> {
        self.pools.lock().get(address).cloned()
    }

    /// Clear every pool.
    pub fn clear_all(&self) {
        for pool in self.pools.lock().values() {
            pool.clear();
        }
    }

    /// Number of pools.
    pub fn len(&self) -> usize {
        self.pools.lock().len()
    }

    /// Whether no pool has been created yet.
    pub fn is_empty(&self) -> bool {
        self.pools.lock().is_empty()
    }
}

impl fmt::Debug for ConnectionPools {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionPools")
            .field("pools", &self.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicUsize;
    use tokio::io::{DuplexStream, duplex};

    #[derive(Debug, Default)]
    struct MemoryConnector {
        connects: AtomicUsize,
        servers: Mutex<Vec<DuplexStream>>,
    }

    #[async_trait]
    impl Connector for MemoryConnector {
        async fn connect(&self, _address: &ServerAddress, _timeout: Duration) -> DriverResult<BoxedStream> {
            self.connects.fetch_add(1, Ordering::SeqCst);
            let (client, server) = duplex(1024);
            self.servers.lock().push(server);
            Ok(Box::new(client))
        }
    }

    #[derive(Debug, Default)]
    struct CountingAuth {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl AuthHook for CountingAuth {
        async fn authenticate(&self, _connection: &mut Connection) -> DriverResult<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn pool_with(options: PoolOptions) -> (ConnectionPool, Arc<MemoryConnector>) {
        let connector = Arc::new(MemoryConnector::default());
        let pool = ConnectionPool::new(
            ServerAddress::new("mem", 1),
            options,
            connector.clone(),
            Arc::new(NoAuth),
        );
        (pool, connector)
    }

    const WAIT: Duration = Duration::from_millis(50);

    #[tokio::test]
    async fn test_reuses_most_recent_connection() {
        let (pool, connector) = pool_with(PoolOptions::new().max_pool_size(2));

        let first = pool.acquire(WAIT).await.unwrap();
        let second = pool.acquire(WAIT).await.unwrap();
        let first_id = first.connection_id();
        let second_id = second.connection_id();
        first.release(true);
        second.release(true);

        let again = pool.acquire(WAIT).await.unwrap();
        assert_eq!(again.connection_id(), second_id);
        assert_ne!(again.connection_id(), first_id);
        assert_eq!(connector.connects.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_acquire_blocks_at_max() {
        let (pool, _) = pool_with(PoolOptions::new().max_pool_size(1));

        let held = pool.acquire(WAIT).await.unwrap();
        let err = pool.acquire(WAIT).await.unwrap_err();
        assert!(err.is_timeout());

        let waiter = {
            let pool = pool.clone();
            tokio::spawn(async move { pool.acquire(Duration::from_secs(5)).await })
        };
        tokio::task::yield_now().await;
        let held_id = held.connection_id();
        held.release(true);

        let channel = waiter.await.unwrap().unwrap();
        assert_eq!(channel.connection_id(), held_id);
        assert_eq!(pool.status().in_use, 1);
    }

    #[tokio::test]
    async fn test_unhealthy_connection_is_not_reused() {
        let (pool, connector) = pool_with(PoolOptions::new().max_pool_size(1));

        let channel = pool.acquire(WAIT).await.unwrap();
        let id = channel.connection_id();
        channel.release(false);
        assert_eq!(pool.status().idle, 0);

        let channel = pool.acquire(WAIT).await.unwrap();
        assert_ne!(channel.connection_id(), id);
        assert_eq!(connector.connects.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_drop_discards() {
        let (pool, _) = pool_with(PoolOptions::new());
        let channel = pool.acquire(WAIT).await.unwrap();
        drop(channel);
        let status = pool.status();
        assert_eq!(status.idle, 0);
        assert_eq!(status.in_use, 0);
        assert_eq!(status.total_created, 1);
    }

    #[tokio::test]
    async fn test_clear_closes_checked_out_on_return() {
        let (pool, _) = pool_with(PoolOptions::new());
        let idle = pool.acquire(WAIT).await.unwrap();
        let out = pool.acquire(WAIT).await.unwrap();
        idle.release(true);
        assert_eq!(pool.status().idle, 1);

        pool.clear();
        assert_eq!(pool.status().idle, 0);
        out.release(true);
        assert_eq!(pool.status().idle, 0);
    }

    #[tokio::test]
    async fn test_auth_hook_runs_once_per_connection() {
        let auth = Arc::new(CountingAuth::default());
        let pool = ConnectionPool::new(
            ServerAddress::new("mem", 1),
            PoolOptions::new(),
            Arc::new(MemoryConnector::default()),
            auth.clone(),
        );
        for _ in 0..3 {
            pool.acquire(WAIT).await.unwrap().release(true);
        }
        assert_eq!(auth.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_maintenance_fills_and_reaps() {
        let (pool, connector) = pool_with(
            PoolOptions::new()
                .max_pool_size(4)
                .min_pool_size(2)
                .max_idle_time(Duration::from_millis(30))
                .maintenance_interval(Duration::from_secs(3600)),
        );

        pool.maintain().await;
        assert_eq!(pool.status().idle, 2);
        assert_eq!(connector.connects.load(Ordering::SeqCst), 2);

        tokio::time::sleep(Duration::from_millis(60)).await;
        pool.maintain().await;
        // Both expired and were replaced.
        assert_eq!(pool.status().idle, 2);
        assert_eq!(connector.connects.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn test_connections_past_lifetime_are_replaced() {
        let (pool, connector) = pool_with(
            PoolOptions::new()
                .max_pool_size(1)
                .no_idle_limit()
                .max_lifetime(Duration::from_millis(30)),
        );

        let first = pool.acquire(WAIT).await.unwrap();
        let first_id = first.connection_id();
        first.release(true);
        assert_eq!(pool.acquire(WAIT).await.unwrap().connection_id(), first_id);
        // The dropped channel discarded that one.
        let young = pool.acquire(WAIT).await.unwrap();
        let young_id = young.connection_id();
        young.release(true);
        assert_eq!(pool.status().idle, 1);

        tokio::time::sleep(Duration::from_millis(60)).await;
        let channel = pool.acquire(WAIT).await.unwrap();
        assert_ne!(channel.connection_id(), young_id);
        assert_eq!(connector.connects.load(Ordering::SeqCst), 3);

        tokio::time::sleep(Duration::from_millis(60)).await;
        channel.release(true);
        assert_eq!(pool.status().idle, 0);
    }

    #[tokio::test]
    async fn test_pools_created_on_demand() {
        let pools = ConnectionPools::new(
            PoolOptions::new(),
            Arc::new(MemoryConnector::default()),
            Arc::new(NoAuth),
        );
        let a = ServerAddress::new("a", 1);
        assert!(pools.get(&a).is_none());
        let pool = pools.get_or_create(&a);
        pools.get_or_create(&a);
        pools.get_or_create(&ServerAddress::new("b", 1));
        assert_eq!(pools.len(), 2);
        assert_eq!(pool.address(), &a);
    }
}
