use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering},
    },
    time::Duration,
};

use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::Mutex;

use crate::{
    config::SubscriptionOptions,
    transport::{Driver, InboundHandler, ReplyHandler, TransportError},
};

/// In-memory broker for testing or local pipelines.
///
/// This driver routes messages between subscribers and responders that live
/// in the same process and implements the [`Driver`] trait. It is useful for:
/// - Unit and integration testing
/// - Simulating message delivery without a real broker
/// - Debugging message flows
///
/// Clones share the same broker state, so two clients built from clones of
/// one driver talk to each other. Fault injection helpers
/// ([`break_connection`](Self::break_connection),
/// [`refuse_connects`](Self::refuse_connects),
/// [`set_connect_delay`](Self::set_connect_delay)) exercise the pool's
/// reconnection and timeout paths.
#[derive(Clone, Default)]
pub struct InMemoryDriver {
    shared: Arc<Shared>,
}

#[derive(Default)]
struct Shared {
    next_connection_id: AtomicU64,
    /// Health flags of open sessions.
    sessions: DashMap<u64, Arc<AtomicBool>>,
    subscriptions: DashMap<String, Vec<Binding<InboundHandler>>>,
    responders: DashMap<String, Vec<Binding<ReplyHandler>>>,
    sent: Mutex<Vec<SentMessage>>,
    opened: AtomicUsize,
    closed: AtomicUsize,
    refuse_connects: AtomicBool,
    connect_delay: Mutex<Duration>,
}

/// Handler registered by one session.
struct Binding<H> {
    connection: u64,
    handler: H,
}

/// Session handle returned by [`InMemoryDriver::connect`](Driver::connect).
#[derive(Debug, Clone)]
pub struct InMemoryConnection {
    id: u64,
    healthy: Arc<AtomicBool>,
}

impl InMemoryConnection {
    /// Broker-assigned session id.
    pub fn id(&self) -> u64 {
        self.id
    }
}

/// A message recorded by the in-memory broker.
#[derive(Debug, Clone)]
pub struct SentMessage {
    /// Session the message was sent on.
    pub connection: u64,
    /// Destination topic.
    pub topic: String,
    /// Encoded envelope.
    pub payload: Bytes,
}

impl InMemoryDriver {
    /// Return all messages and requests that have been sent so far.
    pub fn sent_messages(&self) -> Vec<SentMessage> {
        self.shared.sent.lock().clone()
    }

    /// Mark a session unhealthy, as if the broker dropped it.
    ///
    /// Returns `false` when no open session has this id.
    pub fn break_connection(&self, id: u64) -> bool {
        match self.shared.sessions.get(&id) {
            Some(flag) => {
                flag.store(false, Ordering::SeqCst);
                true
            }
            None => false,
        }
    }

    /// Mark every open session unhealthy.
    pub fn break_all(&self) {
        for flag in self.shared.sessions.iter() {
            flag.store(false, Ordering::SeqCst);
        }
    }

    /// Make subsequent `connect` calls fail.
    pub fn refuse_connects(&self, refuse: bool) {
        self.shared.refuse_connects.store(refuse, Ordering::SeqCst);
    }

    /// Delay every subsequent `connect` call.
    pub fn set_connect_delay(&self, delay: Duration) {
        *self.shared.connect_delay.lock() = delay;
    }

    /// Number of sessions opened and not yet closed.
    pub fn open_connections(&self) -> usize {
        self.shared.sessions.len()
    }

    /// Total number of sessions ever opened.
    pub fn connections_opened(&self) -> usize {
        self.shared.opened.load(Ordering::SeqCst)
    }

    /// Total number of sessions closed.
    pub fn connections_closed(&self) -> usize {
        self.shared.closed.load(Ordering::SeqCst)
    }

    /// Number of broker-level subscriptions on a topic.
    pub fn subscriber_count(&self, topic: &str) -> usize {
        self.shared
            .subscriptions
            .get(topic)
            .map_or(0, |bindings| bindings.len())
    }

    /// Number of responders serving a topic.
    pub fn responder_count(&self, topic: &str) -> usize {
        self.shared
            .responders
            .get(topic)
            .map_or(0, |bindings| bindings.len())
    }

    fn record(&self, connection: &InMemoryConnection, topic: &str, payload: &Bytes) {
        self.shared.sent.lock().push(SentMessage {
            connection: connection.id,
            topic: topic.to_owned(),
            payload: payload.clone(),
        });
    }
}

fn ensure_healthy(connection: &InMemoryConnection) -> Result<(), TransportError> {
    if connection.healthy.load(Ordering::SeqCst) {
        Ok(())
    } else {
        Err(TransportError::driver(Box::new(std::io::Error::new(
            std::io::ErrorKind::NotConnected,
            format!("in-memory session {} is closed", connection.id),
        ))))
    }
}

fn bind<H>(
    map: &DashMap<String, Vec<Binding<H>>>,
    connection: &InMemoryConnection,
    topic: &str,
    handler: H,
) {
    map.entry(topic.to_owned()).or_default().push(Binding {
        connection: connection.id,
        handler,
    });
}

fn unbind<H>(map: &DashMap<String, Vec<Binding<H>>>, connection: &InMemoryConnection, topic: &str) {
    if let Some(mut bindings) = map.get_mut(topic) {
        bindings.retain(|binding| binding.connection != connection.id);
    }
    map.remove_if(topic, |_, bindings| bindings.is_empty());
}

fn unbind_session<H>(map: &DashMap<String, Vec<Binding<H>>>, id: u64) {
    for mut bindings in map.iter_mut() {
        bindings.retain(|binding| binding.connection != id);
    }
    map.retain(|_, bindings| !bindings.is_empty());
}

#[async_trait::async_trait]
impl Driver for InMemoryDriver {
    type Connection = InMemoryConnection;

    async fn connect(&self) -> Result<InMemoryConnection, TransportError> {
        let delay = *self.shared.connect_delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        if self.shared.refuse_connects.load(Ordering::SeqCst) {
            return Err(TransportError::driver(Box::new(std::io::Error::new(
                std::io::ErrorKind::ConnectionRefused,
                "in-memory broker refused the connection",
            ))));
        }

        let id = self.shared.next_connection_id.fetch_add(1, Ordering::SeqCst) + 1;
        let healthy = Arc::new(AtomicBool::new(true));
        self.shared.sessions.insert(id, Arc::clone(&healthy));
        self.shared.opened.fetch_add(1, Ordering::SeqCst);
        tracing::trace!(session = id, "In-memory session opened");

        Ok(InMemoryConnection { id, healthy })
    }

    fn is_healthy(&self, connection: &InMemoryConnection) -> bool {
        connection.healthy.load(Ordering::SeqCst)
    }

    async fn close(&self, connection: &InMemoryConnection) {
        connection.healthy.store(false, Ordering::SeqCst);
        if self.shared.sessions.remove(&connection.id).is_some() {
            self.shared.closed.fetch_add(1, Ordering::SeqCst);
        }
        unbind_session(&self.shared.subscriptions, connection.id);
        unbind_session(&self.shared.responders, connection.id);
        tracing::trace!(session = connection.id, "In-memory session closed");
    }

    /// Deliver a message to every subscriber of the topic.
    ///
    /// Handlers run to completion before `send` returns.
    #[tracing::instrument(skip_all, fields(topic))]
    async fn send(
        &self,
        connection: &InMemoryConnection,
        topic: &str,
        payload: Bytes,
    ) -> Result<(), TransportError> {
        ensure_healthy(connection)?;
        self.record(connection, topic, &payload);

        let handlers: Vec<InboundHandler> = self
            .shared
            .subscriptions
            .get(topic)
            .map(|bindings| bindings.iter().map(|b| Arc::clone(&b.handler)).collect())
            .unwrap_or_default();

        tracing::debug!(subscribers = handlers.len(), "Message sent to in-memory broker");
        for handler in handlers {
            handler(payload.clone()).await;
        }
        Ok(())
    }

    async fn subscribe(
        &self,
        connection: &InMemoryConnection,
        topic: &str,
        _options: &SubscriptionOptions,
        handler: InboundHandler,
    ) -> Result<(), TransportError> {
        ensure_healthy(connection)?;
        bind(&self.shared.subscriptions, connection, topic, handler);
        Ok(())
    }

    async fn unsubscribe(
        &self,
        connection: &InMemoryConnection,
        topic: &str,
    ) -> Result<(), TransportError> {
        unbind(&self.shared.subscriptions, connection, topic);
        Ok(())
    }

    /// Route a request to the first responder serving the topic.
    ///
    /// Without a responder, or when the responder drops the request, the
    /// call waits out the full timeout like a real broker would.
    #[tracing::instrument(skip_all, fields(topic))]
    async fn request(
        &self,
        connection: &InMemoryConnection,
        topic: &str,
        payload: Bytes,
        timeout: Duration,
    ) -> Result<Bytes, TransportError> {
        ensure_healthy(connection)?;
        self.record(connection, topic, &payload);

        let responder = self
            .shared
            .responders
            .get(topic)
            .and_then(|bindings| bindings.first().map(|b| Arc::clone(&b.handler)));

        let exchange = async move {
            if let Some(responder) = responder {
                if let Some(response) = responder(payload).await {
                    return response;
                }
            }
            std::future::pending::<Bytes>().await
        };

        tokio::time::timeout(timeout, exchange)
            .await
            .map_err(|_| TransportError::timeout(timeout))
    }

    async fn serve(
        &self,
        connection: &InMemoryConnection,
        topic: &str,
        handler: ReplyHandler,
    ) -> Result<(), TransportError> {
        ensure_healthy(connection)?;
        bind(&self.shared.responders, connection, topic, handler);
        Ok(())
    }

    async fn stop_serving(
        &self,
        connection: &InMemoryConnection,
        topic: &str,
    ) -> Result<(), TransportError> {
        unbind(&self.shared.responders, connection, topic);
        Ok(())
    }
}
