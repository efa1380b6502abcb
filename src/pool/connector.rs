use std::{
    future::Future,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
};

use arc_swap::ArcSwap;
use futures_core::future::BoxFuture;
use parking_lot::Mutex;

use crate::{pool::Connection, transport::TransportError};

/// What a connector is used for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    /// Publishes messages and sends requests.
    Producer,
    /// Holds the broker subscription of a message type.
    Consumer,
    /// Answers requests of a message type.
    Responder,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Producer => "producer",
            Role::Consumer => "consumer",
            Role::Responder => "responder",
        }
    }
}

/// Key the pool's connector registry is indexed by.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectorKey {
    pub message_type: &'static str,
    pub role: Role,
}

impl ConnectorKey {
    pub fn producer(message_type: &'static str) -> Self {
        Self {
            message_type,
            role: Role::Producer,
        }
    }

    pub fn consumer(message_type: &'static str) -> Self {
        Self {
            message_type,
            role: Role::Consumer,
        }
    }

    pub fn responder(message_type: &'static str) -> Self {
        Self {
            message_type,
            role: Role::Responder,
        }
    }
}

impl std::fmt::Display for ConnectorKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.message_type, self.role.as_str())
    }
}

type Rebind<C> =
    Arc<dyn Fn(Arc<Connection<C>>) -> BoxFuture<'static, Result<(), TransportError>> + Send + Sync>;

/// Binds a message type and role to a pooled [`Connection`].
///
/// The bound connection lives behind an [`ArcSwap`]: when the pool detects
/// it is unhealthy it swaps in a fresh one, and every holder of the
/// connector sees the new connection on its next
/// [`connection`](Connector::connection) call. The connector itself is never
/// replaced while it is registered.
pub struct Connector<C> {
    key: ConnectorKey,
    connection: ArcSwap<Connection<C>>,
    reconnects: AtomicU64,
    rebinders: Mutex<Vec<Rebind<C>>>,
    rebinding: tokio::sync::Mutex<()>,
}

impl<C> Connector<C> {
    pub(crate) fn new(key: ConnectorKey, connection: Arc<Connection<C>>) -> Self {
        connection.mark_taken();
        Self {
            key,
            connection: ArcSwap::new(connection),
            reconnects: AtomicU64::new(0),
            rebinders: Mutex::new(Vec::new()),
            rebinding: tokio::sync::Mutex::new(()),
        }
    }

    pub fn key(&self) -> ConnectorKey {
        self.key
    }

    /// The currently bound connection.
    pub fn connection(&self) -> Arc<Connection<C>> {
        self.connection.load_full()
    }

    /// Bind a fresh connection and return the stale one.
    ///
    /// The caller owns the stale connection and is responsible for closing
    /// it.
    pub fn reconnect(&self, fresh: Arc<Connection<C>>) -> Arc<Connection<C>> {
        fresh.mark_taken();
        self.reconnects.fetch_add(1, Ordering::Relaxed);
        self.connection.swap(fresh)
    }

    /// How many times the connection has been swapped.
    pub fn reconnect_count(&self) -> u64 {
        self.reconnects.load(Ordering::Relaxed)
    }

    /// Register state to rebuild on every reconnect, such as a broker
    /// subscription held on this connector.
    pub fn on_reconnect<F, Fut>(&self, rebind: F)
    where
        F: Fn(Arc<Connection<C>>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), TransportError>> + Send + 'static,
    {
        self.rebinders
            .lock()
            .push(Arc::new(
                move |connection: Arc<Connection<C>>| -> BoxFuture<'static, Result<(), TransportError>> {
                    Box::pin(rebind(connection))
                },
            ));
    }

    /// Re-run every registered rebind against the current connection.
    pub(crate) async fn restore(&self) {
        let rebinders: Vec<Rebind<C>> = self.rebinders.lock().clone();
        let connection = self.connection();
        for rebind in rebinders {
            if let Err(error) = rebind(Arc::clone(&connection)).await {
                tracing::error!(connector = %self.key, ?error, "Failed to restore connector state");
            }
        }
    }

    pub(crate) fn clear_rebinders(&self) {
        self.rebinders.lock().clear();
    }

    /// Serializes concurrent rebinds of this connector.
    pub(crate) async fn lock_rebind(&self) -> tokio::sync::MutexGuard<'_, ()> {
        self.rebinding.lock().await
    }
}

impl<C> std::fmt::Debug for Connector<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connector")
            .field("key", &self.key)
            .field("connection", &self.connection.load().id())
            .field("reconnects", &self.reconnect_count())
            .finish()
    }
}
