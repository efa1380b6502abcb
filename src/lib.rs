#![doc = include_str!("../README.md")]

pub mod client;
pub mod codec;
pub mod config;
mod context;
mod envelope;
mod error;
mod message;
pub mod middleware;
pub mod pool;
pub mod registry;
pub mod transport;

#[doc(inline)]
pub use client::{PublishResult, QueueClient, QueueClientBuilder, SubscribeResult, SubscriptionState};

#[doc(inline)]
pub use codec::Codec;

#[doc(inline)]
pub use config::{AckMode, ClientConfig, PoolConfig, SubscriptionOptions};

#[doc(inline)]
pub use context::MessageContext;

#[doc(inline)]
pub use envelope::Envelope;

#[doc(inline)]
pub use error::{Error, ErrorKind};

#[doc(inline)]
pub use message::Message;

#[doc(inline)]
pub use middleware::{Middleware, Pipeline};

#[doc(inline)]
pub use pool::{ConnectionPool, HealthStatus, PoolHealth};

#[doc(inline)]
pub use registry::SubscriptionId;

#[doc(inline)]
pub use transport::{Driver, Transport, TransportError, TransportErrorKind};
