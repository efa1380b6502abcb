//! Client, pool and subscription configuration.

use std::time::Duration;

use crate::Error;

/// Connection pool sizing and maintenance schedule.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Idle connections the fill loop keeps warm.
    pub min_size: usize,
    /// Maximum number of idle connections kept after release.
    pub max_size: usize,
    /// Idle time after which a connection is pruned.
    pub idle_time: Duration,
    /// Period of the prune loop.
    pub prune_interval: Duration,
    /// Period of the reconnect monitor.
    pub reconnect_interval: Duration,
    /// Period of the fill loop. `None` fills once at startup only.
    pub fill_interval: Option<Duration>,
    /// Maximum wait for the connection creation lock.
    pub create_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            min_size: 1,
            max_size: 10,
            idle_time: Duration::from_secs(60),
            prune_interval: Duration::from_secs(30),
            reconnect_interval: Duration::from_secs(5),
            fill_interval: None,
            create_timeout: Duration::from_secs(5),
        }
    }
}

impl PoolConfig {
    pub fn with_min_size(mut self, min_size: usize) -> Self {
        self.min_size = min_size;
        self
    }

    pub fn with_max_size(mut self, max_size: usize) -> Self {
        self.max_size = max_size;
        self
    }

    pub fn with_idle_time(mut self, idle_time: Duration) -> Self {
        self.idle_time = idle_time;
        self
    }

    pub fn with_prune_interval(mut self, interval: Duration) -> Self {
        self.prune_interval = interval;
        self
    }

    pub fn with_reconnect_interval(mut self, interval: Duration) -> Self {
        self.reconnect_interval = interval;
        self
    }

    /// Refill the idle set periodically instead of only at startup.
    pub fn with_fill_interval(mut self, interval: Duration) -> Self {
        self.fill_interval = Some(interval);
        self
    }

    pub fn with_create_timeout(mut self, timeout: Duration) -> Self {
        self.create_timeout = timeout;
        self
    }

    /// Reject sizes and periods the maintenance loops cannot run with.
    pub fn validate(&self) -> Result<(), Error> {
        if self.max_size == 0 {
            return Err(Error::configuration("max_size must be greater than zero"));
        }
        if self.min_size > self.max_size {
            return Err(Error::configuration(format!(
                "min_size ({}) exceeds max_size ({})",
                self.min_size, self.max_size
            )));
        }
        let periods = [
            ("prune_interval", Some(self.prune_interval)),
            ("reconnect_interval", Some(self.reconnect_interval)),
            ("fill_interval", self.fill_interval),
        ];
        for (name, period) in periods {
            if period.is_some_and(|p| p.is_zero()) {
                return Err(Error::configuration(format!("{name} must be non-zero")));
            }
        }
        Ok(())
    }
}

/// Acknowledgement behavior requested from the broker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AckMode {
    /// The broker considers a message delivered once handed over.
    #[default]
    Auto,
    /// The subscriber acknowledges explicitly.
    Manual,
    /// No acknowledgement at all.
    None,
}

/// Broker-level options for the subscription of one message type.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SubscriptionOptions {
    /// Survive subscriber restarts.
    pub durable: bool,
    pub ack_mode: AckMode,
    /// Competing-consumer group; `None` gives every client its own copy.
    pub consumer_group: Option<String>,
}

impl SubscriptionOptions {
    pub fn durable(mut self) -> Self {
        self.durable = true;
        self
    }

    pub fn with_ack_mode(mut self, ack_mode: AckMode) -> Self {
        self.ack_mode = ack_mode;
        self
    }

    pub fn with_consumer_group(mut self, group: impl Into<String>) -> Self {
        self.consumer_group = Some(group.into());
        self
    }
}

/// Top-level configuration of a [`QueueClient`](crate::QueueClient).
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Connection pool settings.
    pub pool: PoolConfig,
    /// Default deadline for [`request`](crate::QueueClient::request).
    pub request_timeout: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            pool: PoolConfig::default(),
            request_timeout: Duration::from_secs(5),
        }
    }
}

impl ClientConfig {
    pub fn validate(&self) -> Result<(), Error> {
        if self.request_timeout.is_zero() {
            return Err(Error::configuration("request_timeout must be non-zero"));
        }
        self.pool.validate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ErrorKind;

    #[test]
    fn pool_config_defaults() {
        let config = PoolConfig::default();
        assert_eq!(config.min_size, 1);
        assert_eq!(config.max_size, 10);
        assert_eq!(config.idle_time, Duration::from_secs(60));
        assert_eq!(config.prune_interval, Duration::from_secs(30));
        assert_eq!(config.reconnect_interval, Duration::from_secs(5));
        assert!(config.fill_interval.is_none());
        assert_eq!(config.create_timeout, Duration::from_secs(5));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn client_config_defaults() {
        let config = ClientConfig::default();
        assert_eq!(config.request_timeout, Duration::from_secs(5));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn min_above_max_is_rejected() {
        let err = PoolConfig::default()
            .with_min_size(4)
            .with_max_size(2)
            .validate()
            .unwrap_err();
        assert!(matches!(err.kind(), ErrorKind::Configuration(_)));
    }

    #[test]
    fn zero_periods_are_rejected() {
        assert!(PoolConfig::default()
            .with_prune_interval(Duration::ZERO)
            .validate()
            .is_err());
        assert!(PoolConfig::default()
            .with_fill_interval(Duration::ZERO)
            .validate()
            .is_err());
        assert!(PoolConfig::default().with_max_size(0).validate().is_err());
    }

    #[test]
    fn subscription_options_builders() {
        let options = SubscriptionOptions::default()
            .durable()
            .with_ack_mode(AckMode::Manual)
            .with_consumer_group("billing");
        assert!(options.durable);
        assert_eq!(options.ack_mode, AckMode::Manual);
        assert_eq!(options.consumer_group.as_deref(), Some("billing"));
    }
}
