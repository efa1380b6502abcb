use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::Instant;

/// Pool-assigned connection identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(pub u64);

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

#[derive(Debug)]
struct Lease {
    last_take: Option<Instant>,
    last_release: Instant,
}

/// A broker session owned by the pool.
///
/// Wraps the driver's handle with the bookkeeping the pool needs to decide
/// when to prune it. Only the pool closes connections; everyone else holds
/// them through a [`Connector`](super::Connector).
#[derive(Debug)]
pub struct Connection<C> {
    id: ConnectionId,
    handle: C,
    created_at: Instant,
    lease: Mutex<Lease>,
}

impl<C> Connection<C> {
    pub fn new(id: u64, handle: C) -> Self {
        let now = Instant::now();
        Self {
            id: ConnectionId(id),
            handle,
            created_at: now,
            lease: Mutex::new(Lease {
                last_take: None,
                last_release: now,
            }),
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// The driver's session handle.
    pub fn handle(&self) -> &C {
        &self.handle
    }

    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    pub fn last_taken_at(&self) -> Option<Instant> {
        self.lease.lock().last_take
    }

    /// When the connection last entered the idle set. Creation counts as a
    /// release.
    pub fn last_released_at(&self) -> Instant {
        self.lease.lock().last_release
    }

    /// Time since the connection was last released.
    pub fn idle_for(&self) -> Duration {
        self.last_released_at().elapsed()
    }

    pub(crate) fn mark_taken(&self) {
        self.lease.lock().last_take = Some(Instant::now());
    }

    /// Record a release and return how long the lease lasted.
    pub(crate) fn mark_released(&self) -> Duration {
        let mut lease = self.lease.lock();
        let now = Instant::now();
        lease.last_release = now;
        lease
            .last_take
            .map_or(Duration::ZERO, |taken| now.saturating_duration_since(taken))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_connection_counts_as_released() {
        let conn = Connection::new(7, ());
        assert_eq!(conn.id(), ConnectionId(7));
        assert_eq!(conn.id().to_string(), "conn-7");
        assert!(conn.last_taken_at().is_none());
        assert_eq!(conn.last_released_at(), conn.created_at());
    }

    #[test]
    fn lease_duration_is_measured_from_take() {
        let conn = Connection::new(1, ());
        assert_eq!(conn.mark_released(), Duration::ZERO);

        conn.mark_taken();
        std::thread::sleep(Duration::from_millis(5));
        let lease = conn.mark_released();
        assert!(lease >= Duration::from_millis(5));
        assert!(conn.idle_for() < lease);
    }
}
