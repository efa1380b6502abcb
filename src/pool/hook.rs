use std::time::Duration;

use crate::pool::{ConnectionId, ConnectorKey, Maintenance};

/// Hooks for observing connection pool lifecycle events.
///
/// Implement this trait to customize logging, metrics or alerting around
/// connection churn. All methods are called inline from the pool, so they
/// should return quickly.
pub trait PoolHook: Send + Sync {
    fn on_connection_created(&self, id: ConnectionId);

    fn on_connection_closed(&self, id: ConnectionId);

    /// Called after an idle or unhealthy connection was closed by a prune
    /// cycle.
    fn on_connection_pruned(&self, id: ConnectionId, idle_for: Duration);

    /// Called when a connector hands its connection back to the pool.
    fn on_connection_released(&self, id: ConnectionId, leased_for: Duration);

    fn on_connector_reconnected(&self, key: ConnectorKey, stale: ConnectionId, fresh: ConnectionId);

    /// Called when a maintenance cycle step fails. The loop keeps running.
    fn on_maintenance_error(&self, task: Maintenance, error: &dyn std::error::Error);
}

/// Default implementation of [`PoolHook`] that logs through `tracing` and
/// records `metrics` counters.
pub struct DefaultPoolHook;

impl PoolHook for DefaultPoolHook {
    fn on_connection_created(&self, id: ConnectionId) {
        metrics::counter!("courier_connections_created_total").increment(1);
        tracing::debug!(connection = %id, "Connection created");
    }

    fn on_connection_closed(&self, id: ConnectionId) {
        metrics::counter!("courier_connections_closed_total").increment(1);
        tracing::debug!(connection = %id, "Connection closed");
    }

    fn on_connection_pruned(&self, id: ConnectionId, idle_for: Duration) {
        metrics::counter!("courier_connections_pruned_total").increment(1);
        tracing::info!(connection = %id, ?idle_for, "Connection pruned");
    }

    fn on_connection_released(&self, id: ConnectionId, leased_for: Duration) {
        metrics::histogram!("courier_connection_lease_seconds").record(leased_for.as_secs_f64());
        tracing::trace!(connection = %id, ?leased_for, "Connection released");
    }

    fn on_connector_reconnected(&self, key: ConnectorKey, stale: ConnectionId, fresh: ConnectionId) {
        metrics::counter!("courier_connector_reconnects_total", "role" => key.role.as_str())
            .increment(1);
        tracing::warn!(connector = %key, %stale, %fresh, "Connector reconnected");
    }

    fn on_maintenance_error(&self, task: Maintenance, error: &dyn std::error::Error) {
        tracing::error!(task = task.as_str(), ?error, "Pool maintenance failed");
    }
}
