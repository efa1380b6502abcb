//! Pooled broker connections.
//!
//! The [`ConnectionPool`] keeps a warm stack of healthy [`Connection`]s
//! between `min_size` and `max_size` and hands out [`Connector`]s, one per
//! message type and role. Three background loops maintain the pool:
//!
//! - **Fill** creates connections until the idle stack reaches `min_size`.
//!   It runs once at startup, and periodically when `fill_interval` is set.
//! - **Reconnect** checks every live connector and swaps unhealthy
//!   connections for fresh ones. The connector keeps its identity.
//! - **Prune** closes connections idle for longer than `idle_time`. It has
//!   no `min_size` floor; the next fill cycle tops the stack back up.
//!
//! Each loop can also be driven by hand through [`ConnectionPool::fill`],
//! [`ConnectionPool::reconnect_unhealthy`] and [`ConnectionPool::prune`].

mod connection;
mod connector;
mod hook;

use std::{
    sync::{
        Arc, Weak,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
    time::Duration,
};

use dashmap::{DashMap, mapref::entry::Entry};
use parking_lot::Mutex;
use tokio::{
    task::JoinHandle,
    time::{Instant, MissedTickBehavior},
};
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use crate::{Error, config::PoolConfig, transport::Driver};

pub use connection::{Connection, ConnectionId};
pub use connector::{Connector, ConnectorKey, Role};
pub use hook::{DefaultPoolHook, PoolHook};

type Pooled<D> = Arc<Connection<<D as Driver>::Connection>>;

/// Background maintenance loops of the pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Maintenance {
    Fill,
    Prune,
    Reconnect,
}

impl Maintenance {
    pub fn as_str(&self) -> &'static str {
        match self {
            Maintenance::Fill => "fill",
            Maintenance::Prune => "prune",
            Maintenance::Reconnect => "reconnect",
        }
    }
}

impl std::fmt::Display for Maintenance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Aggregate health of a pool or client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthStatus {
    /// Every connection is healthy.
    Healthy,
    /// Some connections are unhealthy.
    Degraded,
    /// Every connection is unhealthy, or the pool is disposed.
    Unhealthy,
}

/// Point-in-time snapshot of the pool's connections.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PoolHealth {
    /// Connections in the idle stack.
    pub idle: usize,
    /// Connections bound to a connector.
    pub leased: usize,
    /// Connections, idle or leased, the driver reports unhealthy.
    pub unhealthy: usize,
}

impl PoolHealth {
    pub fn total(&self) -> usize {
        self.idle + self.leased
    }

    pub fn status(&self) -> HealthStatus {
        if self.unhealthy == 0 {
            HealthStatus::Healthy
        } else if self.unhealthy < self.total() {
            HealthStatus::Degraded
        } else {
            HealthStatus::Unhealthy
        }
    }
}

/// Pool of broker connections shared by a client.
///
/// Cloning is cheap; clones share the same connections.
pub struct ConnectionPool<D: Driver> {
    inner: Arc<PoolInner<D>>,
}

impl<D: Driver> Clone for ConnectionPool<D> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

struct PoolInner<D: Driver> {
    driver: Arc<D>,
    config: PoolConfig,
    /// LIFO stack of idle connections.
    idle: Mutex<Vec<Pooled<D>>>,
    connectors: DashMap<ConnectorKey, Arc<Connector<D::Connection>>>,
    create_lock: tokio::sync::Mutex<()>,
    hook: Arc<dyn PoolHook>,
    cancel: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    next_id: AtomicU64,
    started: AtomicBool,
    disposed: AtomicBool,
}

impl<D: Driver> ConnectionPool<D> {
    pub fn new(driver: Arc<D>, config: PoolConfig) -> Self {
        Self::with_hook(driver, config, Arc::new(DefaultPoolHook))
    }

    /// Create a pool reporting lifecycle events to a custom hook.
    pub fn with_hook(driver: Arc<D>, config: PoolConfig, hook: Arc<dyn PoolHook>) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                driver,
                config,
                idle: Mutex::new(Vec::new()),
                connectors: DashMap::new(),
                create_lock: tokio::sync::Mutex::new(()),
                hook,
                cancel: CancellationToken::new(),
                tasks: Mutex::new(Vec::new()),
                next_id: AtomicU64::new(1),
                started: AtomicBool::new(false),
                disposed: AtomicBool::new(false),
            }),
        }
    }

    pub fn driver(&self) -> &Arc<D> {
        &self.inner.driver
    }

    pub fn config(&self) -> &PoolConfig {
        &self.inner.config
    }

    /// Spawn the maintenance loops. Calling it again is a no-op.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(&self) {
        if self.inner.disposed.load(Ordering::SeqCst) || self.inner.started.swap(true, Ordering::SeqCst) {
            return;
        }
        let config = &self.inner.config;
        let handles = [
            spawn_maintenance(&self.inner, Maintenance::Fill, true, config.fill_interval),
            spawn_maintenance(&self.inner, Maintenance::Reconnect, false, Some(config.reconnect_interval)),
            spawn_maintenance(&self.inner, Maintenance::Prune, false, Some(config.prune_interval)),
        ];
        self.inner.tasks.lock().extend(handles);
        tracing::debug!(
            min_size = config.min_size,
            max_size = config.max_size,
            "Connection pool started"
        );
    }

    /// Return the connector for `key`, binding a new one if needed.
    ///
    /// An existing connector whose connection went unhealthy is rebound to
    /// a fresh connection before it is returned.
    #[tracing::instrument(skip(self), fields(connector = %key))]
    pub async fn get_connector(&self, key: ConnectorKey) -> Result<Arc<Connector<D::Connection>>, Error> {
        loop {
            self.inner.ensure_live()?;

            let existing = self.inner.connectors.get(&key).map(|entry| Arc::clone(entry.value()));
            let Some(connector) = existing else {
                break;
            };
            if self.inner.is_healthy(&connector.connection())
                || self.inner.rebind(&connector).await?
                || self.inner.is_registered(&connector)
            {
                return Ok(connector);
            }
            // Released while we waited to rebind it.
        }

        let connection = self.inner.acquire_connection().await?;
        let (connector, surplus) = match self.inner.connectors.entry(key) {
            Entry::Occupied(entry) => (Arc::clone(entry.get()), Some(connection)),
            Entry::Vacant(entry) => {
                let connector = Arc::new(Connector::new(key, connection));
                entry.insert(Arc::clone(&connector));
                (connector, None)
            }
        };
        // Lost a race with a concurrent caller for the same key.
        if let Some(connection) = surplus {
            connection.mark_released();
            self.inner.recycle(connection).await;
        }
        Ok(connector)
    }

    /// The registered connector for `key`, without creating one.
    pub fn existing_connector(&self, key: ConnectorKey) -> Option<Arc<Connector<D::Connection>>> {
        self.inner.connectors.get(&key).map(|entry| Arc::clone(entry.value()))
    }

    /// Snapshot of every registered connector.
    pub fn connectors(&self) -> Vec<Arc<Connector<D::Connection>>> {
        self.inner.connectors_snapshot()
    }

    /// Unregister a connector and hand its connection back to the idle
    /// stack, or close it when the stack is already at `max_size`.
    ///
    /// Releasing a connector that is no longer registered does nothing.
    #[tracing::instrument(skip_all, fields(connector = %connector.key()))]
    pub async fn release_connector(&self, connector: &Arc<Connector<D::Connection>>) {
        let _rebinding = connector.lock_rebind().await;
        let removed = self
            .inner
            .connectors
            .remove_if(&connector.key(), |_, registered| Arc::ptr_eq(registered, connector))
            .is_some();
        if !removed {
            return;
        }
        connector.clear_rebinders();

        let connection = connector.connection();
        let leased_for = connection.mark_released();
        self.inner.hook.on_connection_released(connection.id(), leased_for);
        self.inner.recycle(connection).await;
    }

    /// Pop a healthy idle connection, or create one.
    ///
    /// Unhealthy idle connections are closed on the way. Creation waits at
    /// most `create_timeout` for the creation lock.
    pub async fn acquire_connection(&self) -> Result<Pooled<D>, Error> {
        self.inner.ensure_live()?;
        self.inner.acquire_connection().await
    }

    /// Run one fill cycle. Returns the number of connections created.
    pub async fn fill(&self) -> usize {
        self.inner.fill().await
    }

    /// Run one prune cycle. Returns the number of connections closed.
    pub async fn prune(&self) -> usize {
        self.inner.prune().await
    }

    /// Run one reconnect cycle. Returns the number of connectors rebound.
    pub async fn reconnect_unhealthy(&self) -> usize {
        self.inner.reconnect_unhealthy().await
    }

    pub fn idle_count(&self) -> usize {
        self.inner.idle.lock().len()
    }

    pub fn connector_count(&self) -> usize {
        self.inner.connectors.len()
    }

    pub fn health(&self) -> PoolHealth {
        let idle: Vec<Pooled<D>> = self.inner.idle.lock().clone();
        let leased: Vec<Pooled<D>> = self
            .inner
            .connectors
            .iter()
            .map(|entry| entry.value().connection())
            .collect();
        let unhealthy = idle
            .iter()
            .chain(leased.iter())
            .filter(|connection| !self.inner.is_healthy(connection))
            .count();
        PoolHealth {
            idle: idle.len(),
            leased: leased.len(),
            unhealthy,
        }
    }

    pub fn is_disposed(&self) -> bool {
        self.inner.disposed.load(Ordering::SeqCst)
    }

    /// Stop the maintenance loops and close every connection.
    ///
    /// Idempotent. Connectors still held elsewhere keep their (now closed)
    /// connection.
    #[tracing::instrument(skip_all)]
    pub async fn dispose(&self) {
        if self.inner.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.inner.cancel.cancel();

        let handles: Vec<JoinHandle<()>> = std::mem::take(&mut *self.inner.tasks.lock());
        for handle in handles {
            if let Err(error) = handle.await {
                tracing::error!(?error, "Pool maintenance task failed");
            }
        }

        let connectors = self.inner.connectors_snapshot();
        self.inner.connectors.clear();
        for connector in connectors {
            let _rebinding = connector.lock_rebind().await;
            connector.clear_rebinders();
            self.inner.close_connection(&connector.connection()).await;
        }

        let idle: Vec<Pooled<D>> = std::mem::take(&mut *self.inner.idle.lock());
        for connection in idle {
            self.inner.close_connection(&connection).await;
        }
        tracing::debug!("Connection pool disposed");
    }
}

impl<D: Driver> PoolInner<D> {
    fn ensure_live(&self) -> Result<(), Error> {
        if self.disposed.load(Ordering::SeqCst) {
            Err(Error::disposed())
        } else {
            Ok(())
        }
    }

    fn is_healthy(&self, connection: &Connection<D::Connection>) -> bool {
        self.driver.is_healthy(connection.handle())
    }

    fn is_registered(&self, connector: &Arc<Connector<D::Connection>>) -> bool {
        self.connectors
            .get(&connector.key())
            .is_some_and(|registered| Arc::ptr_eq(registered.value(), connector))
    }

    fn connectors_snapshot(&self) -> Vec<Arc<Connector<D::Connection>>> {
        self.connectors
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect()
    }

    async fn acquire_connection(&self) -> Result<Pooled<D>, Error> {
        loop {
            let popped = self.idle.lock().pop();
            match popped {
                Some(connection) if self.is_healthy(&connection) => return Ok(connection),
                Some(connection) => self.close_connection(&connection).await,
                None => break,
            }
        }
        self.create_connection().await
    }

    async fn create_connection(&self) -> Result<Pooled<D>, Error> {
        let wait = self.config.create_timeout;
        let _creating = tokio::time::timeout(wait, self.create_lock.lock())
            .await
            .map_err(|_| Error::connection_creation_timeout(wait))?;

        let handle = self.driver.connect().await?;
        let connection = Arc::new(Connection::new(
            self.next_id.fetch_add(1, Ordering::SeqCst),
            handle,
        ));
        self.hook.on_connection_created(connection.id());

        if !self.is_healthy(&connection) {
            self.close_connection(&connection).await;
            return Err(Error::connection_unhealthy());
        }
        Ok(connection)
    }

    async fn close_connection(&self, connection: &Connection<D::Connection>) {
        self.driver.close(connection.handle()).await;
        self.hook.on_connection_closed(connection.id());
    }

    /// Push a released connection onto the idle stack, or close it.
    async fn recycle(&self, connection: Pooled<D>) {
        let rejected = if self.disposed.load(Ordering::SeqCst) || !self.is_healthy(&connection) {
            Some(connection)
        } else {
            let mut idle = self.idle.lock();
            if idle.len() < self.config.max_size {
                idle.push(connection);
                None
            } else {
                Some(connection)
            }
        };
        if let Some(connection) = rejected {
            self.close_connection(&connection).await;
        }
    }

    /// Swap the connector's connection for a fresh one.
    ///
    /// Returns `false` when another caller already rebound it, or when it
    /// was released in the meantime.
    async fn rebind(&self, connector: &Arc<Connector<D::Connection>>) -> Result<bool, Error> {
        let _rebinding = connector.lock_rebind().await;
        if !self.is_registered(connector) || self.is_healthy(&connector.connection()) {
            return Ok(false);
        }

        let fresh = self.acquire_connection().await?;
        let fresh_id = fresh.id();
        let stale = connector.reconnect(fresh);
        self.close_connection(&stale).await;
        self.hook.on_connector_reconnected(connector.key(), stale.id(), fresh_id);

        connector.restore().await;
        Ok(true)
    }

    async fn fill(&self) -> usize {
        let missing = self.config.min_size.saturating_sub(self.idle.lock().len());
        let mut created = 0;
        for _ in 0..missing {
            if self.disposed.load(Ordering::SeqCst) {
                break;
            }
            match self.create_connection().await {
                Ok(connection) => {
                    self.idle.lock().push(connection);
                    created += 1;
                }
                Err(error) => self.hook.on_maintenance_error(Maintenance::Fill, &error),
            }
        }
        created
    }

    async fn prune(&self) -> usize {
        let count = self.idle.lock().len();
        let mut kept = Vec::with_capacity(count);
        let mut pruned = 0;

        for _ in 0..count {
            let popped = self.idle.lock().pop();
            let Some(connection) = popped else {
                break;
            };
            let idle_for = connection.idle_for();
            if self.is_healthy(&connection) && idle_for <= self.config.idle_time {
                kept.push(connection);
                continue;
            }
            self.close_connection(&connection).await;
            self.hook.on_connection_pruned(connection.id(), idle_for);
            pruned += 1;
        }

        // Restore the original stack order of the survivors.
        self.idle.lock().extend(kept.into_iter().rev());
        pruned
    }

    async fn reconnect_unhealthy(&self) -> usize {
        let mut rebound = 0;
        for connector in self.connectors_snapshot() {
            if self.is_healthy(&connector.connection()) {
                continue;
            }
            match self.rebind(&connector).await {
                Ok(true) => rebound += 1,
                Ok(false) => {}
                Err(error) => self.hook.on_maintenance_error(Maintenance::Reconnect, &error),
            }
        }
        rebound
    }

    async fn run(&self, task: Maintenance) {
        match task {
            Maintenance::Fill => {
                self.fill().await;
            }
            Maintenance::Prune => {
                self.prune().await;
            }
            Maintenance::Reconnect => {
                self.reconnect_unhealthy().await;
            }
        }
    }
}

impl<D: Driver> Drop for PoolInner<D> {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Spawn one maintenance loop.
///
/// The task holds a weak reference so a forgotten pool is not kept alive by
/// its own loops. A started cycle always runs to completion.
fn spawn_maintenance<D: Driver>(
    inner: &Arc<PoolInner<D>>,
    task: Maintenance,
    at_startup: bool,
    period: Option<Duration>,
) -> JoinHandle<()> {
    let pool: Weak<PoolInner<D>> = Arc::downgrade(inner);
    let cancel = inner.cancel.child_token();
    let span = tracing::debug_span!("pool_maintenance", task = task.as_str());

    tokio::spawn(
        async move {
            if at_startup {
                match pool.upgrade() {
                    Some(inner) => inner.run(task).await,
                    None => return,
                }
            }
            let Some(period) = period else {
                return;
            };

            let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        let Some(inner) = pool.upgrade() else {
                            break;
                        };
                        inner.run(task).await;
                    }
                }
            }
            tracing::debug!("Pool maintenance stopped");
        }
        .instrument(span),
    )
}
