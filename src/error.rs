//! Error returned by client, pool and registry operations.

use std::time::Duration;

use tracing_error::SpanTrace;

use crate::{registry::SubscriptionId, transport::TransportError};

/// Error returned by client, pool and registry operations.
///
/// Each error captures:
/// - The error kind
/// - A tracing span backtrace for improved diagnostics
#[derive(Debug)]
pub struct Error {
    context: SpanTrace,
    kind: ErrorKind,
}

/// Error kinds.
#[derive(Debug)]
pub enum ErrorKind {
    /// The connection creation lock was not acquired in time.
    ConnectionCreationTimeout(Duration),
    /// The broker reported a freshly created connection as unhealthy.
    ConnectionUnhealthy,
    /// A middleware vetoed the message before it reached the transport.
    MiddlewareRejected(String),
    /// No correlated response arrived before the deadline.
    RequestTimeout(Duration),
    /// A payload could not be decoded.
    Deserialization(tower::BoxError),
    /// The subscription exists but belongs to a different message type.
    SubscriptionTypeMismatch {
        id: SubscriptionId,
        expected: &'static str,
    },
    /// No subscription is registered under this id.
    SubscriptionNotFound(SubscriptionId),
    /// A response was vetoed by the receive pipeline.
    Processing,
    /// The pipeline ran out of middleware without a terminal handler.
    EndOfPipeline,
    /// Errors originating from the transport layer.
    Transport(TransportError),
    /// Invalid configuration.
    Configuration(String),
    /// The client or pool has been disposed.
    Disposed,
}

impl Error {
    fn new(kind: ErrorKind) -> Self {
        Self {
            context: SpanTrace::capture(),
            kind,
        }
    }

    pub(crate) fn connection_creation_timeout(waited: Duration) -> Self {
        Self::new(ErrorKind::ConnectionCreationTimeout(waited))
    }

    pub(crate) fn connection_unhealthy() -> Self {
        Self::new(ErrorKind::ConnectionUnhealthy)
    }

    /// Create an error for a message vetoed by a middleware.
    pub fn middleware_rejected(reason: impl Into<String>) -> Self {
        Self::new(ErrorKind::MiddlewareRejected(reason.into()))
    }

    pub(crate) fn request_timeout(timeout: Duration) -> Self {
        Self::new(ErrorKind::RequestTimeout(timeout))
    }

    pub(crate) fn deserialization(err: impl Into<tower::BoxError>) -> Self {
        Self::new(ErrorKind::Deserialization(err.into()))
    }

    pub(crate) fn subscription_type_mismatch(id: SubscriptionId, expected: &'static str) -> Self {
        Self::new(ErrorKind::SubscriptionTypeMismatch { id, expected })
    }

    pub(crate) fn subscription_not_found(id: SubscriptionId) -> Self {
        Self::new(ErrorKind::SubscriptionNotFound(id))
    }

    pub(crate) fn processing() -> Self {
        Self::new(ErrorKind::Processing)
    }

    pub(crate) fn end_of_pipeline() -> Self {
        Self::new(ErrorKind::EndOfPipeline)
    }

    pub(crate) fn configuration(reason: impl Into<String>) -> Self {
        Self::new(ErrorKind::Configuration(reason.into()))
    }

    pub(crate) fn disposed() -> Self {
        Self::new(ErrorKind::Disposed)
    }

    /// The error kind.
    pub fn kind(&self) -> &ErrorKind {
        &self.kind
    }

    /// Whether this is a [`ErrorKind::RequestTimeout`].
    pub fn is_request_timeout(&self) -> bool {
        matches!(self.kind, ErrorKind::RequestTimeout(_))
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ErrorKind::ConnectionCreationTimeout(waited) => {
                write!(f, "Timed out after {waited:?} waiting to create a connection")
            }
            ErrorKind::ConnectionUnhealthy => write!(f, "Connection is unhealthy"),
            ErrorKind::MiddlewareRejected(reason) => write!(f, "Rejected by middleware: {reason}"),
            ErrorKind::RequestTimeout(timeout) => {
                write!(f, "No response received within {timeout:?}")
            }
            ErrorKind::Deserialization(err) => write!(f, "Deserialization error: {err}"),
            ErrorKind::SubscriptionTypeMismatch { id, expected } => {
                write!(f, "Subscription {id} is not a subscription of {expected}")
            }
            ErrorKind::SubscriptionNotFound(id) => write!(f, "Subscription {id} not found"),
            ErrorKind::Processing => write!(f, "Processing error"),
            ErrorKind::EndOfPipeline => write!(f, "Reached end of pipeline"),
            ErrorKind::Transport(err) => write!(f, "Transport error: {}", err.kind()),
            ErrorKind::Configuration(reason) => write!(f, "Invalid configuration: {reason}"),
            ErrorKind::Disposed => write!(f, "Client has been disposed"),
        }
    }
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "{}", self.kind)?;
        self.context.fmt(f)
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match &self.kind {
            ErrorKind::Deserialization(err) => Some(err.as_ref()),
            ErrorKind::Transport(err) => Some(err),
            _ => None,
        }
    }
}

impl From<TransportError> for Error {
    fn from(err: TransportError) -> Self {
        Self::new(ErrorKind::Transport(err))
    }
}
