//! Transport abstractions and the outbound send stack.
//!
//! The broker itself is an external collaborator reached through the
//! [`Driver`] trait. Outbound sends additionally go through a Tower-compatible
//! stack so callers can compose middleware (timeouts, rate limits, tracing)
//! onto the raw send path without touching the driver.
//!
//! ## Key components
//!
//! - [`Driver`]: Trait implemented by concrete broker backends
//! - [`Transport`]: Public-facing wrapper around the send `tower::Service`
//! - [`DriverService`]: Adapter from a [`Driver`] to a Tower service
//! - [`TransportError`]: Unified error type with tracing context

mod inmemory;

use std::{
    sync::Arc,
    task::{Context, Poll},
    time::Duration,
};

use bytes::Bytes;
use futures_core::future::BoxFuture;
use tower::{Layer, Service, ServiceExt, util::BoxCloneSyncService};
use tracing_error::SpanTrace;

use crate::{config::SubscriptionOptions, pool::Connection};

pub use inmemory::{InMemoryConnection, InMemoryDriver, SentMessage};

/// Callback invoked by a driver for every message arriving on a subscribed topic.
pub type InboundHandler = Arc<dyn Fn(Bytes) -> BoxFuture<'static, ()> + Send + Sync>;

/// Callback invoked by a driver for every request arriving on a served topic.
///
/// Returns the encoded response, or `None` when the request is dropped; the
/// requester then runs into its timeout.
pub type ReplyHandler = Arc<dyn Fn(Bytes) -> BoxFuture<'static, Option<Bytes>> + Send + Sync>;

/// Trait implemented by concrete broker backends.
///
/// A driver owns the wire protocol: it opens sessions, reports their health
/// and moves bytes. Connection lifecycle (pooling, pruning, reconnection) is
/// handled by the [`ConnectionPool`](crate::pool::ConnectionPool).
#[async_trait::async_trait]
pub trait Driver: Send + Sync + 'static {
    /// Handle to one broker session.
    type Connection: Send + Sync + 'static;

    /// Open a new broker session.
    async fn connect(&self) -> Result<Self::Connection, TransportError>;

    /// Whether the session can still be used.
    fn is_healthy(&self, connection: &Self::Connection) -> bool;

    /// Close a session. The pool calls this exactly once per connection.
    async fn close(&self, _connection: &Self::Connection) {}

    /// Send an encoded envelope to a topic.
    async fn send(
        &self,
        connection: &Self::Connection,
        topic: &str,
        payload: Bytes,
    ) -> Result<(), TransportError>;

    /// Create the broker-level subscription for a topic.
    async fn subscribe(
        &self,
        connection: &Self::Connection,
        topic: &str,
        options: &SubscriptionOptions,
        handler: InboundHandler,
    ) -> Result<(), TransportError>;

    /// Tear down the broker-level subscription for a topic.
    async fn unsubscribe(
        &self,
        connection: &Self::Connection,
        topic: &str,
    ) -> Result<(), TransportError>;

    /// Send a request and wait for the correlated response.
    ///
    /// Must fail with [`TransportErrorKind::Timeout`] when no response arrives
    /// within `timeout`.
    async fn request(
        &self,
        connection: &Self::Connection,
        topic: &str,
        payload: Bytes,
        timeout: Duration,
    ) -> Result<Bytes, TransportError>;

    /// Start answering requests arriving on a topic.
    async fn serve(
        &self,
        connection: &Self::Connection,
        topic: &str,
        handler: ReplyHandler,
    ) -> Result<(), TransportError>;

    /// Stop answering requests arriving on a topic.
    async fn stop_serving(
        &self,
        connection: &Self::Connection,
        topic: &str,
    ) -> Result<(), TransportError>;
}

/// An encoded envelope on its way to the broker.
pub struct Outbound<C> {
    /// Connection the envelope is sent on.
    pub connection: Arc<Connection<C>>,
    /// Destination topic.
    pub topic: &'static str,
    /// Encoded envelope.
    pub payload: Bytes,
}

impl<C> std::fmt::Debug for Outbound<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Outbound")
            .field("connection", &self.connection.id())
            .field("topic", &self.topic)
            .field("len", &self.payload.len())
            .finish()
    }
}

/// Type-erased send stack used by the client.
pub type OutboundService<C> = BoxCloneSyncService<Outbound<C>, (), tower::BoxError>;

/// Generic Tower-compatible transport wrapper.
///
/// `Transport` is the send path for published envelopes. It wraps an
/// underlying Tower `Service` and:
///
/// - Normalizes errors into [`TransportError`]
/// - Supports Tower middleware via layers
/// - Provides a convenience [`send`](Transport::send) API
///
/// Typically constructed from a concrete [`Driver`] implementation.
#[derive(Clone)]
pub struct Transport<S> {
    service: S,
}

impl<D: Driver> Transport<DriverService<D>> {
    /// Create a new transport from a concrete driver.
    ///
    /// The driver will be wrapped in a [`DriverService`] to make it
    /// Tower-compatible.
    pub fn new(driver: Arc<D>) -> Self {
        Self {
            service: DriverService::new(driver),
        }
    }
}

impl<S> Transport<S> {
    /// Apply a Tower layer to the transport.
    ///
    /// This enables composition with middleware such as retries, timeouts,
    /// buffering, or tracing.
    pub fn layer<L>(self, layer: L) -> Transport<L::Service>
    where
        L: Layer<S>,
    {
        Transport {
            service: layer.layer(self.service),
        }
    }

    /// Erase the service type so differently layered stacks share one type.
    pub fn boxed<C>(self) -> Transport<OutboundService<C>>
    where
        C: Send + Sync + 'static,
        S: Service<Outbound<C>, Response = ()> + Clone + Send + Sync + 'static,
        S::Future: Send + 'static,
        S::Error: Into<tower::BoxError>,
    {
        Transport {
            service: BoxCloneSyncService::new(ServiceExt::<Outbound<C>>::map_err(
                self.service,
                Into::<tower::BoxError>::into,
            )),
        }
    }

    /// Send an [`Outbound`] envelope through the stack.
    pub async fn send<C>(&self, outbound: Outbound<C>) -> Result<(), TransportError>
    where
        S: Service<Outbound<C>, Response = ()> + Clone,
        S::Error: Into<tower::BoxError>,
    {
        self.service
            .clone()
            .oneshot(outbound)
            .await
            .map_err(|e| TransportError::from_boxed(e.into()))
    }
}

/// Tower service adapter for a [`Driver`] backend.
///
/// This type bridges the [`Driver`] trait with Tower’s `Service` abstraction.
pub struct DriverService<D> {
    driver: Arc<D>,
}

impl<D> DriverService<D> {
    /// Create a new driver service from a backend.
    pub fn new(driver: Arc<D>) -> Self {
        Self { driver }
    }
}

impl<D> Clone for DriverService<D> {
    fn clone(&self) -> Self {
        Self {
            driver: Arc::clone(&self.driver),
        }
    }
}

/// `tower::Service` implementation delegating to [`Driver::send`].
impl<D: Driver> Service<Outbound<D::Connection>> for DriverService<D> {
    type Response = ();
    type Error = tower::BoxError;
    type Future = BoxFuture<'static, Result<(), Self::Error>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: Outbound<D::Connection>) -> Self::Future {
        let driver = Arc::clone(&self.driver);
        Box::pin(async move {
            driver
                .send(req.connection.handle(), req.topic, req.payload)
                .await?;
            Ok(())
        })
    }
}

/// Error returned by transport operations.
///
/// Each error captures:
/// - The underlying error kind
/// - A tracing span backtrace for improved diagnostics
#[derive(Debug)]
pub struct TransportError {
    context: SpanTrace,
    kind: TransportErrorKind,
}

/// Transport errors kind.
#[derive(Debug)]
pub enum TransportErrorKind {
    /// Errors originating from the driver backend.
    Driver(tower::BoxError),
    /// Errors related to serialization or deserialization.
    Serde(tower::BoxError),
    /// No response arrived within the deadline.
    Timeout(Duration),
}

impl TransportError {
    /// Create a driver-related transport error.
    pub fn driver(err: Box<dyn std::error::Error + Send + Sync>) -> Self {
        Self {
            context: SpanTrace::capture(),
            kind: TransportErrorKind::Driver(err),
        }
    }

    /// Create a serialization-related transport error.
    pub fn serde(err: Box<dyn std::error::Error + Send + Sync>) -> Self {
        Self {
            context: SpanTrace::capture(),
            kind: TransportErrorKind::Serde(err),
        }
    }

    /// Create a request timeout error.
    pub fn timeout(after: Duration) -> Self {
        Self {
            context: SpanTrace::capture(),
            kind: TransportErrorKind::Timeout(after),
        }
    }

    /// Recover a `TransportError` that travelled through a Tower stack.
    pub fn from_boxed(err: tower::BoxError) -> Self {
        match err.downcast::<TransportError>() {
            Ok(err) => *err,
            Err(err) => Self::driver(err),
        }
    }

    /// The error kind.
    pub fn kind(&self) -> &TransportErrorKind {
        &self.kind
    }

    /// Whether this is a [`TransportErrorKind::Timeout`].
    pub fn is_timeout(&self) -> bool {
        matches!(self.kind, TransportErrorKind::Timeout(_))
    }
}

impl std::fmt::Display for TransportErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransportErrorKind::Driver(err) => write!(f, "Driver error: {err}"),
            TransportErrorKind::Serde(err) => write!(f, "Serde error: {err}"),
            TransportErrorKind::Timeout(after) => write!(f, "Timed out after {after:?}"),
        }
    }
}

impl std::fmt::Display for TransportError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "{}", self.kind)?;
        self.context.fmt(f)
    }
}

impl std::error::Error for TransportError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match &self.kind {
            TransportErrorKind::Driver(err) => Some(err.as_ref()),
            TransportErrorKind::Serde(err) => Some(err.as_ref()),
            TransportErrorKind::Timeout(_) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    #[test]
    fn boxed_transport_errors_are_recovered() {
        let boxed: tower::BoxError = Box::new(TransportError::timeout(Duration::from_secs(1)));
        assert!(TransportError::from_boxed(boxed).is_timeout());

        let boxed: tower::BoxError = "plain failure".into();
        let err = TransportError::from_boxed(boxed);
        assert!(matches!(err.kind(), TransportErrorKind::Driver(_)));
    }

    #[tokio::test]
    async fn layers_wrap_the_driver_send() {
        let driver = Arc::new(InMemoryDriver::default());
        let handle = driver.connect().await.unwrap();
        let connection = Arc::new(Connection::new(1, handle));

        let seen = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&seen);
        let transport = Transport::new(Arc::clone(&driver))
            .layer(tower::layer::layer_fn(move |inner: DriverService<InMemoryDriver>| {
                let counter = Arc::clone(&counter);
                tower::service_fn(move |req: Outbound<InMemoryConnection>| {
                    counter.fetch_add(1, Ordering::SeqCst);
                    inner.clone().oneshot(req)
                })
            }))
            .boxed();

        transport
            .send(Outbound {
                connection,
                topic: "metrics",
                payload: Bytes::from_static(b"{}"),
            })
            .await
            .unwrap();

        assert_eq!(seen.load(Ordering::SeqCst), 1);
        assert_eq!(driver.sent_messages()[0].topic, "metrics");
    }
}
