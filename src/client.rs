//! The queue client facade.
//!
//! [`QueueClient`] ties the pieces together: messages are wrapped in an
//! [`Envelope`], run through the middleware [`Pipeline`], encoded with the
//! message type's [`Codec`](crate::Codec) and sent over a pooled
//! [`Connector`]. Inbound messages take the reverse path and are dispatched
//! to the subscribers registered for their type.
//!
//! Broker-level subscriptions are reference counted per connector key: the
//! first `subscribe` of a type creates it, the last `unsubscribe` tears it
//! down. Transitions of one key are serialized, so concurrent first
//! subscribers issue a single broker subscribe. A key is owned by one slot
//! type at a time; a second type with the same message type name is
//! rejected while the first is bound.

mod builder;
mod results;

use std::{
    any::TypeId,
    collections::HashMap,
    future::Future,
    sync::{
        Arc, Weak,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use bytes::Bytes;
use dashmap::DashMap;
use futures_core::future::BoxFuture;
use parking_lot::Mutex;

use crate::{
    Envelope, Error, MessageContext,
    config::{ClientConfig, SubscriptionOptions},
    message::Message,
    middleware::{Payload, Pipeline, terminal},
    pool::{Connection, ConnectionPool, Connector, ConnectorKey, HealthStatus, Role},
    registry::{SubscriptionId, SubscriptionRegistry},
    transport::{Driver, InboundHandler, Outbound, OutboundService, ReplyHandler, Transport, TransportError},
};

pub use builder::QueueClientBuilder;
pub use results::{PublishResult, SubscribeResult};

/// Broker-level subscription state of one message type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SubscriptionState {
    #[default]
    Unsubscribed,
    Subscribing,
    Subscribed,
    Unsubscribing,
}

/// Registry slot of a subscriber of `T`.
struct Subscriber<T>(Arc<dyn Fn(Envelope<T>) -> BoxFuture<'static, bool> + Send + Sync>);

/// Registry slot of a responder answering `Req` with `Resp`.
struct Responder<Req, Resp>(Arc<dyn Fn(Envelope<Req>) -> BoxFuture<'static, Resp> + Send + Sync>);

/// Opens the broker-level binding of a topic on a connection. Re-run on
/// every reconnect of the owning connector.
type Attach<C> =
    Arc<dyn Fn(Arc<Connection<C>>) -> BoxFuture<'static, Result<(), TransportError>> + Send + Sync>;

/// A live broker-level binding.
struct Binding<C> {
    topic: &'static str,
    connector: Arc<Connector<C>>,
    slot: TypeId,
    slot_name: &'static str,
}

/// Per-key subscription bookkeeping.
struct Topic<C> {
    /// Serializes broker-level transitions of the key.
    gate: tokio::sync::Mutex<Option<Binding<C>>>,
    /// Slot type holding the binding.
    owner: Mutex<Option<TypeId>>,
    state: Mutex<SubscriptionState>,
}

impl<C> Topic<C> {
    fn transition(&self, owner: Option<TypeId>, state: SubscriptionState) {
        *self.owner.lock() = owner;
        *self.state.lock() = state;
    }
}

impl<C> Default for Topic<C> {
    fn default() -> Self {
        Self {
            gate: tokio::sync::Mutex::new(None),
            owner: Mutex::new(None),
            state: Mutex::new(SubscriptionState::Unsubscribed),
        }
    }
}

/// Publish/subscribe and request/reply client over a pooled [`Driver`].
///
/// Cloning is cheap; clones share pool, pipeline and subscriptions.
///
/// ```rust
/// use courier::{MessageContext, QueueClient, transport::InMemoryDriver};
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() {
/// let client = QueueClient::new(InMemoryDriver::default());
///
/// let subscription = client
///     .subscribe(|greeting: courier::Envelope<String>| async move {
///         println!("{}", greeting.message);
///         true
///     })
///     .await;
/// assert!(subscription.is_success());
///
/// let result = client.publish("hello".to_owned(), None).await;
/// assert!(result.is_success());
///
/// client.dispose().await;
/// # }
/// ```
pub struct QueueClient<D: Driver> {
    inner: Arc<ClientInner<D>>,
}

impl<D: Driver> Clone for QueueClient<D> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

struct ClientInner<D: Driver> {
    driver: Arc<D>,
    pool: ConnectionPool<D>,
    transport: Transport<OutboundService<D::Connection>>,
    pipeline: Pipeline,
    registry: SubscriptionRegistry,
    topics: DashMap<ConnectorKey, Arc<Topic<D::Connection>>>,
    options: HashMap<&'static str, SubscriptionOptions>,
    config: ClientConfig,
    started: AtomicBool,
    disposed: AtomicBool,
}

impl<D: Driver> QueueClient<D> {
    /// Create a client with the default configuration and no middleware.
    pub fn new(driver: D) -> Self {
        QueueClientBuilder::new(driver).assemble()
    }

    pub fn builder(driver: D) -> QueueClientBuilder<D> {
        QueueClientBuilder::new(driver)
    }

    pub fn pool(&self) -> &ConnectionPool<D> {
        &self.inner.pool
    }

    pub fn config(&self) -> &ClientConfig {
        &self.inner.config
    }

    /// Start the pool's maintenance loops.
    ///
    /// Every operation starts the client lazily; calling this is only
    /// needed to warm the pool up front. Idempotent.
    pub fn start(&self) -> Result<(), Error> {
        self.inner.ensure_live()?;
        if !self.inner.started.swap(true, Ordering::SeqCst) {
            self.inner.pool.start();
            tracing::info!("Queue client started");
        }
        Ok(())
    }

    /// Publish a message, optionally as a consequence of `parent`.
    ///
    /// The new context inherits the root and request id of the parent.
    /// Failures, including middleware vetoes, are reported in the result.
    #[tracing::instrument(skip_all, fields(message_type = T::message_type()))]
    pub async fn publish<T: Message>(&self, message: T, parent: Option<&MessageContext>) -> PublishResult {
        if let Err(error) = self.start() {
            return PublishResult::failure(error);
        }
        let envelope = Envelope::new(message, MessageContext::for_message::<T>(parent));
        self.inner.publish(&envelope).await
    }

    /// Register a subscriber for `T`.
    ///
    /// The callback returns `false` to report a processing failure; the
    /// failure is logged and does not affect other subscribers.
    #[tracing::instrument(skip_all, fields(message_type = T::message_type()))]
    pub async fn subscribe<T, F, Fut>(&self, callback: F) -> SubscribeResult
    where
        T: Message,
        F: Fn(Envelope<T>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = bool> + Send + 'static,
    {
        let slot = Subscriber::<T>(Arc::new(move |envelope: Envelope<T>| -> BoxFuture<'static, bool> {
            Box::pin(callback(envelope))
        }));
        let options = self
            .inner
            .options
            .get(T::message_type())
            .cloned()
            .unwrap_or_default();

        let client = Arc::downgrade(&self.inner);
        let driver = Arc::clone(&self.inner.driver);
        let attach: Attach<D::Connection> = Arc::new(move |connection: Arc<Connection<D::Connection>>| {
            let driver = Arc::clone(&driver);
            let options = options.clone();
            let handler = inbound_handler::<D, T>(client.clone());
            let attached: BoxFuture<'static, Result<(), TransportError>> = Box::pin(async move {
                driver
                    .subscribe(connection.handle(), T::topic(), &options, handler)
                    .await
            });
            attached
        });

        let key = ConnectorKey::consumer(T::message_type());
        self.register(slot, key, T::topic(), attach).await
    }

    /// Remove a subscription of `T`.
    ///
    /// Fails with `SubscriptionTypeMismatch` when `id` is a subscription of
    /// another type.
    #[tracing::instrument(skip_all, fields(message_type = T::message_type(), subscription = %id))]
    pub async fn unsubscribe<T: Message>(&self, id: SubscriptionId) -> Result<(), Error> {
        self.inner
            .deregister::<Subscriber<T>>(ConnectorKey::consumer(T::message_type()), id)
            .await
    }

    /// Send a request and wait for the correlated response.
    ///
    /// `timeout` defaults to [`ClientConfig::request_timeout`].
    #[tracing::instrument(skip_all, fields(request_type = Req::message_type()))]
    pub async fn request<Req: Message, Resp: Message>(
        &self,
        message: Req,
        parent: Option<&MessageContext>,
        timeout: Option<Duration>,
    ) -> Result<Envelope<Resp>, Error> {
        self.start()?;
        let timeout = timeout.unwrap_or(self.inner.config.request_timeout);
        let context = MessageContext::for_message::<Req>(parent).with_reply_to(SubscriptionId::new());
        let envelope = Envelope::new(message, context);
        self.inner.request::<Req, Resp>(&envelope, timeout).await
    }

    /// Answer requests of `Req` with the callback's `Resp`.
    ///
    /// When several responders are registered for the same pair, the
    /// earliest one answers. Registering a responder of `Req` with another
    /// `Resp` fails with `Configuration` while the first pair is served.
    #[tracing::instrument(skip_all, fields(request_type = Req::message_type()))]
    pub async fn reply<Req, Resp, F, Fut>(&self, callback: F) -> SubscribeResult
    where
        Req: Message,
        Resp: Message,
        F: Fn(Envelope<Req>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Resp> + Send + 'static,
    {
        let slot = Responder::<Req, Resp>(Arc::new(move |envelope: Envelope<Req>| -> BoxFuture<'static, Resp> {
            Box::pin(callback(envelope))
        }));

        let client = Arc::downgrade(&self.inner);
        let driver = Arc::clone(&self.inner.driver);
        let attach: Attach<D::Connection> = Arc::new(move |connection: Arc<Connection<D::Connection>>| {
            let driver = Arc::clone(&driver);
            let handler = reply_handler::<D, Req, Resp>(client.clone());
            let attached: BoxFuture<'static, Result<(), TransportError>> =
                Box::pin(async move { driver.serve(connection.handle(), Req::topic(), handler).await });
            attached
        });

        let key = ConnectorKey::responder(Req::message_type());
        self.register(slot, key, Req::topic(), attach).await
    }

    /// Remove a responder registered with [`reply`](Self::reply).
    #[tracing::instrument(skip_all, fields(request_type = Req::message_type(), subscription = %id))]
    pub async fn stop_reply<Req: Message, Resp: Message>(&self, id: SubscriptionId) -> Result<(), Error> {
        self.inner
            .deregister::<Responder<Req, Resp>>(ConnectorKey::responder(Req::message_type()), id)
            .await
    }

    /// Run an inbound envelope through the receive chain and the
    /// subscribers of `T`.
    ///
    /// Returns `true` when there is nobody to deliver to or the receive
    /// chain accepted the message, `false` when a middleware vetoed it.
    pub async fn dispatch<T: Message>(&self, envelope: Envelope<T>) -> bool {
        self.inner.dispatch(envelope).await
    }

    /// Broker-level subscription state of `T`.
    pub fn subscription_state<T: Message>(&self) -> SubscriptionState {
        let Some(topic) = self.inner.topics.get(&ConnectorKey::consumer(T::message_type())) else {
            return SubscriptionState::Unsubscribed;
        };
        if *topic.owner.lock() == Some(TypeId::of::<Subscriber<T>>()) {
            *topic.state.lock()
        } else {
            SubscriptionState::Unsubscribed
        }
    }

    /// Number of live subscriptions of `T`.
    pub fn subscriber_count<T: Message>(&self) -> usize {
        self.inner.registry.count::<Subscriber<T>>()
    }

    /// Aggregate health of the pooled connections.
    pub fn check_health(&self) -> HealthStatus {
        if self.inner.disposed.load(Ordering::SeqCst) {
            return HealthStatus::Unhealthy;
        }
        self.inner.pool.health().status()
    }

    /// Tear down every broker binding and dispose the pool. Idempotent.
    #[tracing::instrument(skip_all)]
    pub async fn dispose(&self) {
        if self.inner.disposed.swap(true, Ordering::SeqCst) {
            return;
        }

        let topics: Vec<Arc<Topic<D::Connection>>> = self
            .inner
            .topics
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();
        for topic in topics {
            let mut gate = topic.gate.lock().await;
            if let Some(binding) = gate.take() {
                *topic.state.lock() = SubscriptionState::Unsubscribing;
                if let Err(error) = self.inner.unbind(binding).await {
                    tracing::warn!(?error, "Failed to tear down broker binding");
                }
            }
            topic.transition(None, SubscriptionState::Unsubscribed);
        }

        self.inner.registry.clear();
        self.inner.pool.dispose().await;
        tracing::info!("Queue client disposed");
    }

    async fn register<S: Send + Sync + 'static>(
        &self,
        slot: S,
        key: ConnectorKey,
        topic: &'static str,
        attach: Attach<D::Connection>,
    ) -> SubscribeResult {
        let registered = match self.start() {
            Ok(()) => self.inner.register(slot, key, topic, attach).await,
            Err(error) => Err(error),
        };
        match registered {
            Ok(id) => SubscribeResult::subscribed(id),
            Err(error) => {
                tracing::warn!(?error, "Subscription failed");
                SubscribeResult::failed(error)
            }
        }
    }
}

impl<D: Driver> ClientInner<D> {
    fn ensure_live(&self) -> Result<(), Error> {
        if self.disposed.load(Ordering::SeqCst) {
            Err(Error::disposed())
        } else {
            Ok(())
        }
    }

    fn topic(&self, key: ConnectorKey) -> Arc<Topic<D::Connection>> {
        Arc::clone(self.topics.entry(key).or_default().value())
    }

    async fn register<S: Send + Sync + 'static>(
        &self,
        slot: S,
        key: ConnectorKey,
        topic_name: &'static str,
        attach: Attach<D::Connection>,
    ) -> Result<SubscriptionId, Error> {
        let topic = self.topic(key);
        let mut gate = topic.gate.lock().await;
        self.ensure_live()?;

        let slot_type = TypeId::of::<S>();
        let bound = gate.as_ref().map(|binding| (binding.slot, binding.slot_name));
        match bound {
            Some((slot, owner)) if slot != slot_type => {
                return Err(Error::configuration(format!("{key} is already bound by {owner}")));
            }
            Some(_) => {}
            None => {
                topic.transition(Some(slot_type), SubscriptionState::Subscribing);
                match self.bind(key, topic_name, attach).await {
                    Ok(connector) => {
                        *gate = Some(Binding {
                            topic: topic_name,
                            connector,
                            slot: slot_type,
                            slot_name: std::any::type_name::<S>(),
                        });
                    }
                    Err(error) => {
                        topic.transition(None, SubscriptionState::Unsubscribed);
                        return Err(error);
                    }
                }
            }
        }

        let id = self.registry.insert(slot);
        *topic.state.lock() = SubscriptionState::Subscribed;
        tracing::debug!(subscription = %id, topic = topic_name, "Subscribed");
        Ok(id)
    }

    async fn deregister<S: Send + Sync + 'static>(
        &self,
        key: ConnectorKey,
        id: SubscriptionId,
    ) -> Result<(), Error> {
        let topic = self.topic(key);
        let mut gate = topic.gate.lock().await;
        self.registry.remove::<S>(id)?;

        if self.registry.count::<S>() > 0 {
            return Ok(());
        }
        let Some(binding) = gate.take() else {
            return Ok(());
        };
        *topic.state.lock() = SubscriptionState::Unsubscribing;
        let result = self.unbind(binding).await;
        topic.transition(None, SubscriptionState::Unsubscribed);
        result
    }

    /// Open the broker-level binding on a fresh connector.
    async fn bind(
        &self,
        key: ConnectorKey,
        topic: &'static str,
        attach: Attach<D::Connection>,
    ) -> Result<Arc<Connector<D::Connection>>, Error> {
        let connector = self.pool.get_connector(key).await?;
        if let Err(error) = attach(connector.connection()).await {
            self.pool.release_connector(&connector).await;
            return Err(error.into());
        }
        connector.on_reconnect(move |connection| attach(connection));
        tracing::trace!(connector = %key, topic, "Broker binding opened");
        Ok(connector)
    }

    /// Close the broker-level binding and hand the connector back.
    async fn unbind(&self, binding: Binding<D::Connection>) -> Result<(), Error> {
        let connection = binding.connector.connection();
        let result = match binding.connector.key().role {
            Role::Responder => self.driver.stop_serving(connection.handle(), binding.topic).await,
            Role::Consumer | Role::Producer => {
                self.driver.unsubscribe(connection.handle(), binding.topic).await
            }
        };
        self.pool.release_connector(&binding.connector).await;
        result.map_err(Error::from)
    }

    async fn publish<T: Message>(&self, envelope: &Envelope<T>) -> PublishResult {
        self.pipeline
            .publish(
                Payload::new(envelope),
                Some(terminal(move |_| async move { PublishResult::from(self.send(envelope).await) })),
            )
            .await
    }

    async fn send<T: Message>(&self, envelope: &Envelope<T>) -> Result<(), Error> {
        let payload = T::codec().encode(envelope)?;
        let connector = self
            .pool
            .get_connector(ConnectorKey::producer(T::message_type()))
            .await?;
        self.transport
            .send(Outbound {
                connection: connector.connection(),
                topic: T::topic(),
                payload,
            })
            .await?;
        Ok(())
    }

    async fn request<Req: Message, Resp: Message>(
        &self,
        envelope: &Envelope<Req>,
        timeout: Duration,
    ) -> Result<Envelope<Resp>, Error> {
        let response: Mutex<Option<Envelope<Resp>>> = Mutex::new(None);
        let slot = &response;

        let result = self
            .pipeline
            .publish(
                Payload::new(envelope),
                Some(terminal(move |_| async move {
                    match self.round_trip::<Req, Resp>(envelope, timeout).await {
                        Ok(envelope) => {
                            *slot.lock() = Some(envelope);
                            PublishResult::success()
                        }
                        Err(error) => PublishResult::failure(error),
                    }
                })),
            )
            .await;

        if let Some(error) = result.into_error() {
            return Err(error);
        }
        response
            .into_inner()
            .ok_or_else(|| Error::middleware_rejected("request was not sent"))
    }

    async fn round_trip<Req: Message, Resp: Message>(
        &self,
        envelope: &Envelope<Req>,
        timeout: Duration,
    ) -> Result<Envelope<Resp>, Error> {
        let payload = Req::codec().encode(envelope)?;
        let connector = self
            .pool
            .get_connector(ConnectorKey::producer(Req::message_type()))
            .await?;
        let connection = connector.connection();

        let exchange = self
            .driver
            .request(connection.handle(), Req::topic(), payload, timeout);
        let bytes = match tokio::time::timeout(timeout, exchange).await {
            Ok(Ok(bytes)) => bytes,
            Ok(Err(error)) if !error.is_timeout() => return Err(error.into()),
            Ok(Err(_)) | Err(_) => return Err(Error::request_timeout(timeout)),
        };

        let response: Envelope<Resp> = Resp::codec()
            .decode(&bytes)
            .map_err(Error::deserialization)?;
        if response.context.parent_message_id != Some(envelope.context.id) {
            tracing::warn!(
                request_id = %envelope.context.id,
                parent_message_id = ?response.context.parent_message_id,
                "Response is not linked to its request"
            );
        }

        let accepted = self
            .pipeline
            .receive(Payload::new(&response), Some(terminal(|_| async { true })))
            .await;
        if !accepted {
            return Err(Error::processing());
        }
        Ok(response)
    }

    async fn dispatch<T: Message>(&self, envelope: Envelope<T>) -> bool {
        let subscribers = self.registry.callbacks::<Subscriber<T>>();
        if subscribers.is_empty() {
            tracing::trace!(message_type = T::message_type(), "No subscribers, message dropped");
            return true;
        }

        let message = &envelope;
        self.pipeline
            .receive(
                Payload::new(&envelope),
                Some(terminal(move |_| async move {
                    for subscriber in subscribers {
                        // Each callback runs on its own task so a panic stays contained.
                        match tokio::spawn((subscriber.0)(message.clone())).await {
                            Ok(true) => {}
                            Ok(false) => tracing::warn!(
                                message_id = %message.context.id,
                                "Subscriber failed to process message"
                            ),
                            Err(error) => tracing::error!(
                                message_id = %message.context.id,
                                ?error,
                                "Subscriber panicked"
                            ),
                        }
                    }
                    true
                })),
            )
            .await
    }

    async fn answer<Req: Message, Resp: Message>(&self, bytes: Bytes) -> Option<Bytes> {
        let request: Envelope<Req> = match Req::codec().decode(&bytes) {
            Ok(request) => request,
            Err(error) => {
                tracing::warn!(request_type = Req::message_type(), ?error, "Dropping undecodable request");
                return None;
            }
        };
        let responder = self.registry.first::<Responder<Req, Resp>>()?;

        let response: Mutex<Option<Envelope<Resp>>> = Mutex::new(None);
        let slot = &response;
        let incoming = &request;
        let accepted = self
            .pipeline
            .receive(
                Payload::new(&request),
                Some(terminal(move |_| async move {
                    match tokio::spawn((responder.0)(incoming.clone())).await {
                        Ok(message) => {
                            let context = MessageContext::caused_by(Resp::message_type(), &incoming.context);
                            *slot.lock() = Some(Envelope::new(message, context));
                            true
                        }
                        Err(error) => {
                            tracing::error!(request_id = %incoming.context.id, ?error, "Responder panicked");
                            false
                        }
                    }
                })),
            )
            .await;
        if !accepted {
            return None;
        }
        let response = response.into_inner()?;

        let encoded: Mutex<Option<Bytes>> = Mutex::new(None);
        let out = &encoded;
        let outgoing = &response;
        let result = self
            .pipeline
            .publish(
                Payload::new(&response),
                Some(terminal(move |_| async move {
                    match Resp::codec().encode(outgoing) {
                        Ok(bytes) => {
                            *out.lock() = Some(bytes);
                            PublishResult::success()
                        }
                        Err(error) => PublishResult::failure(error.into()),
                    }
                })),
            )
            .await;
        if let Some(error) = result.error_message() {
            tracing::warn!(request_id = %request.context.id, error, "Response not sent");
            return None;
        }
        encoded.into_inner()
    }
}

fn inbound_handler<D: Driver, T: Message>(client: Weak<ClientInner<D>>) -> InboundHandler {
    Arc::new(move |bytes: Bytes| -> BoxFuture<'static, ()> {
        let client = client.clone();
        Box::pin(async move {
            let Some(client) = client.upgrade() else {
                return;
            };
            match T::codec().decode::<T>(&bytes) {
                Ok(envelope) => {
                    client.dispatch(envelope).await;
                }
                Err(error) => {
                    tracing::warn!(message_type = T::message_type(), ?error, "Dropping undecodable message")
                }
            }
        })
    })
}

fn reply_handler<D: Driver, Req: Message, Resp: Message>(client: Weak<ClientInner<D>>) -> ReplyHandler {
    Arc::new(move |bytes: Bytes| -> BoxFuture<'static, Option<Bytes>> {
        let client = client.clone();
        Box::pin(async move {
            let client = client.upgrade()?;
            client.answer::<Req, Resp>(bytes).await
        })
    })
}
