use std::{
    collections::HashMap,
    sync::{
        Arc,
        atomic::AtomicBool,
    },
    time::Duration,
};

use dashmap::DashMap;
use tower::{Layer, Service};

use crate::{
    Error,
    client::{ClientInner, QueueClient},
    config::{ClientConfig, PoolConfig, SubscriptionOptions},
    message::Message,
    middleware::{Middleware, Pipeline},
    pool::{ConnectionPool, DefaultPoolHook, PoolHook},
    registry::SubscriptionRegistry,
    transport::{Driver, Outbound, OutboundService, Transport},
};

/// Builder for a [`QueueClient`].
///
/// Collects configuration, middleware (in execution order), per-type
/// subscription options and Tower layers for the outbound send stack.
///
/// ```rust
/// use std::time::Duration;
///
/// use courier::{QueueClient, middleware::LoggingMiddleware, transport::InMemoryDriver};
///
/// let client = QueueClient::builder(InMemoryDriver::default())
///     .with_request_timeout(Duration::from_secs(2))
///     .with_middleware(LoggingMiddleware)
///     .build()
///     .unwrap();
/// assert_eq!(client.config().request_timeout, Duration::from_secs(2));
/// ```
pub struct QueueClientBuilder<D: Driver> {
    driver: Arc<D>,
    config: ClientConfig,
    pipeline: Pipeline,
    options: HashMap<&'static str, SubscriptionOptions>,
    hook: Arc<dyn PoolHook>,
    transport: Transport<OutboundService<D::Connection>>,
}

impl<D: Driver> QueueClientBuilder<D> {
    pub fn new(driver: D) -> Self {
        let driver = Arc::new(driver);
        Self {
            transport: Transport::new(Arc::clone(&driver)).boxed::<D::Connection>(),
            driver,
            config: ClientConfig::default(),
            pipeline: Pipeline::new(),
            options: HashMap::new(),
            hook: Arc::new(DefaultPoolHook),
        }
    }

    pub fn with_config(mut self, config: ClientConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_pool_config(mut self, pool: PoolConfig) -> Self {
        self.config.pool = pool;
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.config.request_timeout = timeout;
        self
    }

    /// Append a middleware. Middleware run in the order they are added.
    pub fn with_middleware(mut self, middleware: impl Middleware) -> Self {
        self.pipeline.push(middleware);
        self
    }

    /// Append a middleware shared with other clients.
    pub fn with_shared_middleware(mut self, middleware: Arc<dyn Middleware>) -> Self {
        self.pipeline.push_shared(middleware);
        self
    }

    /// Broker-level options used when the first subscriber of `T` subscribes.
    pub fn with_subscription_options<T: Message>(mut self, options: SubscriptionOptions) -> Self {
        self.options.insert(T::message_type(), options);
        self
    }

    pub fn with_pool_hook(mut self, hook: impl PoolHook + 'static) -> Self {
        self.hook = Arc::new(hook);
        self
    }

    /// Wrap the outbound send stack in a Tower layer.
    ///
    /// Layers added later wrap the ones added earlier.
    pub fn layer<L>(mut self, layer: L) -> Self
    where
        L: Layer<OutboundService<D::Connection>>,
        L::Service: Service<Outbound<D::Connection>, Response = ()> + Clone + Send + Sync + 'static,
        <L::Service as Service<Outbound<D::Connection>>>::Future: Send + 'static,
        <L::Service as Service<Outbound<D::Connection>>>::Error: Into<tower::BoxError>,
    {
        self.transport = self.transport.layer(layer).boxed();
        self
    }

    /// Validate the configuration and create the client.
    ///
    /// The client starts lazily on its first operation.
    pub fn build(self) -> Result<QueueClient<D>, Error> {
        self.config.validate()?;
        Ok(self.assemble())
    }

    pub(super) fn assemble(self) -> QueueClient<D> {
        let pool = ConnectionPool::with_hook(Arc::clone(&self.driver), self.config.pool.clone(), self.hook);
        QueueClient {
            inner: Arc::new(ClientInner {
                driver: self.driver,
                pool,
                transport: self.transport,
                pipeline: self.pipeline,
                registry: SubscriptionRegistry::new(),
                topics: DashMap::new(),
                options: self.options,
                config: self.config,
                started: AtomicBool::new(false),
                disposed: AtomicBool::new(false),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::{
        ErrorKind,
        transport::{InMemoryConnection, InMemoryDriver},
    };

    #[test]
    fn invalid_configuration_is_rejected() {
        let err = QueueClient::builder(InMemoryDriver::default())
            .with_pool_config(PoolConfig::default().with_min_size(20))
            .build()
            .err()
            .unwrap();
        assert!(matches!(err.kind(), ErrorKind::Configuration(_)));
    }

    #[tokio::test]
    async fn layers_see_every_published_message() {
        let driver = InMemoryDriver::default();
        let seen = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&seen);

        let client = QueueClient::builder(driver.clone())
            .layer(tower::layer::layer_fn(move |inner: OutboundService<InMemoryConnection>| {
                let counter = Arc::clone(&counter);
                tower::util::MapRequest::new(inner, move |outbound: Outbound<InMemoryConnection>| {
                    counter.fetch_add(1, Ordering::SeqCst);
                    outbound
                })
            }))
            .build()
            .unwrap();

        assert!(client.publish("one".to_owned(), None).await.is_success());
        assert!(client.publish("two".to_owned(), None).await.is_success());
        assert_eq!(seen.load(Ordering::SeqCst), 2);
        assert_eq!(driver.sent_messages().len(), 2);
    }
}
