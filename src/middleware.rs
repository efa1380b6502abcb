//! Ordered interceptor chain around publishing and receiving.
//!
//! A [`Middleware`] sees every outbound message in
//! [`publish`](Middleware::publish) and every inbound message in
//! [`receive`](Middleware::receive). Each hook gets a [`Next`] continuation:
//! code before `next.run(payload)` is the before-hook, code after it is the
//! after-hook, and returning without calling `next` vetoes the message.
//!
//! The [`Pipeline`] is a plain list walked by index. The last step is the
//! terminal supplied by the client (encode and send, or invoke subscribers);
//! without one, publishing fails with "reached end of pipeline" and
//! receiving yields `false`.
//!
//! ```rust
//! use courier::{PublishResult, middleware::{Middleware, Next, Payload, Publish}};
//!
//! struct DenyAnonymous;
//!
//! #[async_trait::async_trait]
//! impl Middleware for DenyAnonymous {
//!     async fn publish<'a>(&'a self, payload: Payload<'a>, next: Next<'a, Publish>) -> PublishResult {
//!         if payload.context().request_id.is_none() {
//!             return PublishResult::rejected("missing request id");
//!         }
//!         next.run(payload).await
//!     }
//! }
//! ```

mod logging;

use std::{any::Any, future::Future, sync::Arc};

use futures_core::future::BoxFuture;

use crate::{Envelope, Error, MessageContext, PublishResult, message::Message};

pub use logging::LoggingMiddleware;

/// Borrowed view of the message travelling through the chain.
#[derive(Clone, Copy)]
pub struct Payload<'a> {
    context: &'a MessageContext,
    message: &'a (dyn Any + Send + Sync),
}

impl<'a> Payload<'a> {
    pub fn new<M: Message>(envelope: &'a Envelope<M>) -> Self {
        Self {
            context: &envelope.context,
            message: &envelope.message,
        }
    }

    pub fn context(&self) -> &'a MessageContext {
        self.context
    }

    /// The payload, if it is an `M`.
    pub fn message<M: 'static>(&self) -> Option<&'a M> {
        self.message.downcast_ref()
    }

    pub fn message_type(&self) -> &'a str {
        &self.context.message_type
    }
}

impl std::fmt::Debug for Payload<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Payload")
            .field("context", self.context)
            .finish_non_exhaustive()
    }
}

/// Last step of a chain, supplied by the caller of the pipeline.
pub type Terminal<'a, R> = Box<dyn FnOnce(Payload<'a>) -> BoxFuture<'a, R> + Send + 'a>;

/// Wrap an async closure into a [`Terminal`].
pub fn terminal<'a, R, F, Fut>(f: F) -> Terminal<'a, R>
where
    F: FnOnce(Payload<'a>) -> Fut + Send + 'a,
    Fut: Future<Output = R> + Send + 'a,
{
    Box::new(move |payload| Box::pin(f(payload)))
}

mod sealed {
    pub trait Sealed {}
}

/// Direction a chain is walked in.
pub trait Stage: sealed::Sealed + Send + 'static {
    /// What the chain produces.
    type Output: Send;

    #[doc(hidden)]
    fn invoke<'a>(
        middleware: &'a dyn Middleware,
        payload: Payload<'a>,
        next: Next<'a, Self>,
    ) -> BoxFuture<'a, Self::Output>
    where
        Self: Sized;

    #[doc(hidden)]
    fn exhausted() -> Self::Output;
}

/// Outbound direction.
pub enum Publish {}

/// Inbound direction.
pub enum Receive {}

impl sealed::Sealed for Publish {}
impl sealed::Sealed for Receive {}

impl Stage for Publish {
    type Output = PublishResult;

    fn invoke<'a>(
        middleware: &'a dyn Middleware,
        payload: Payload<'a>,
        next: Next<'a, Self>,
    ) -> BoxFuture<'a, PublishResult> {
        middleware.publish(payload, next)
    }

    fn exhausted() -> PublishResult {
        PublishResult::failure(Error::end_of_pipeline())
    }
}

impl Stage for Receive {
    type Output = bool;

    fn invoke<'a>(
        middleware: &'a dyn Middleware,
        payload: Payload<'a>,
        next: Next<'a, Self>,
    ) -> BoxFuture<'a, bool> {
        middleware.receive(payload, next)
    }

    fn exhausted() -> bool {
        false
    }
}

/// Continuation handed to each middleware.
pub struct Next<'a, S: Stage> {
    remaining: &'a [Arc<dyn Middleware>],
    terminal: Option<Terminal<'a, S::Output>>,
}

impl<'a, S: Stage> Next<'a, S> {
    /// Run the rest of the chain.
    pub fn run(self, payload: Payload<'a>) -> BoxFuture<'a, S::Output> {
        match self.remaining.split_first() {
            Some((head, rest)) => {
                let next = Next {
                    remaining: rest,
                    terminal: self.terminal,
                };
                S::invoke(head.as_ref(), payload, next)
            }
            None => match self.terminal {
                Some(terminal) => terminal(payload),
                None => Box::pin(async { S::exhausted() }),
            },
        }
    }
}

/// Interceptor around publishing and receiving.
///
/// Both hooks default to passing the message on unchanged.
#[async_trait::async_trait]
pub trait Middleware: Send + Sync + 'static {
    async fn publish<'a>(&'a self, payload: Payload<'a>, next: Next<'a, Publish>) -> PublishResult {
        next.run(payload).await
    }

    async fn receive<'a>(&'a self, payload: Payload<'a>, next: Next<'a, Receive>) -> bool {
        next.run(payload).await
    }
}

/// Ordered list of middleware.
#[derive(Clone, Default)]
pub struct Pipeline {
    middleware: Vec<Arc<dyn Middleware>>,
}

impl Pipeline {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a middleware after the ones already registered.
    pub fn push(&mut self, middleware: impl Middleware) -> &mut Self {
        self.middleware.push(Arc::new(middleware));
        self
    }

    pub(crate) fn push_shared(&mut self, middleware: Arc<dyn Middleware>) {
        self.middleware.push(middleware);
    }

    pub fn len(&self) -> usize {
        self.middleware.len()
    }

    pub fn is_empty(&self) -> bool {
        self.middleware.is_empty()
    }

    /// Walk the publish chain.
    pub async fn publish<'a>(
        &'a self,
        payload: Payload<'a>,
        terminal: Option<Terminal<'a, PublishResult>>,
    ) -> PublishResult {
        Next::<Publish> {
            remaining: &self.middleware,
            terminal,
        }
        .run(payload)
        .await
    }

    /// Walk the receive chain.
    pub async fn receive<'a>(
        &'a self,
        payload: Payload<'a>,
        terminal: Option<Terminal<'a, bool>>,
    ) -> bool {
        Next::<Receive> {
            remaining: &self.middleware,
            terminal,
        }
        .run(payload)
        .await
    }
}

impl std::fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipeline")
            .field("len", &self.middleware.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use parking_lot::Mutex;

    use super::*;

    /// Records before/after events into a shared trace.
    struct Tracer {
        name: &'static str,
        trace: Arc<Mutex<Vec<String>>>,
        veto: bool,
    }

    impl Tracer {
        fn new(name: &'static str, trace: &Arc<Mutex<Vec<String>>>) -> Self {
            Self {
                name,
                trace: Arc::clone(trace),
                veto: false,
            }
        }

        fn vetoing(mut self) -> Self {
            self.veto = true;
            self
        }
    }

    #[async_trait::async_trait]
    impl Middleware for Tracer {
        async fn publish<'a>(&'a self, payload: Payload<'a>, next: Next<'a, Publish>) -> PublishResult {
            self.trace.lock().push(format!("{}:before", self.name));
            if self.veto {
                return PublishResult::rejected(self.name);
            }
            let result = next.run(payload).await;
            self.trace.lock().push(format!("{}:after", self.name));
            result
        }

        async fn receive<'a>(&'a self, payload: Payload<'a>, next: Next<'a, Receive>) -> bool {
            self.trace.lock().push(format!("{}:receive", self.name));
            !self.veto && next.run(payload).await
        }
    }

    fn envelope() -> Envelope<String> {
        Envelope::new("hello".to_owned(), MessageContext::new("string"))
    }

    #[tokio::test]
    async fn publish_runs_before_and_after_hooks_in_order() {
        let trace = Arc::new(Mutex::new(Vec::new()));
        let mut pipeline = Pipeline::new();
        pipeline
            .push(Tracer::new("a", &trace))
            .push(Tracer::new("b", &trace));

        let envelope = envelope();
        let sink = Arc::clone(&trace);
        let result = pipeline
            .publish(
                Payload::new(&envelope),
                Some(terminal(move |payload| async move {
                    assert_eq!(payload.message::<String>().map(String::as_str), Some("hello"));
                    sink.lock().push("terminal".to_owned());
                    PublishResult::success()
                })),
            )
            .await;

        assert!(result.is_success());
        assert_eq!(
            *trace.lock(),
            ["a:before", "b:before", "terminal", "b:after", "a:after"]
        );
    }

    #[tokio::test]
    async fn veto_stops_the_chain_but_outer_after_hooks_run() {
        let trace = Arc::new(Mutex::new(Vec::new()));
        let mut pipeline = Pipeline::new();
        pipeline
            .push(Tracer::new("a", &trace))
            .push(Tracer::new("b", &trace).vetoing())
            .push(Tracer::new("c", &trace));

        let envelope = envelope();
        let sink = Arc::clone(&trace);
        let result = pipeline
            .publish(
                Payload::new(&envelope),
                Some(terminal(move |_| async move {
                    sink.lock().push("terminal".to_owned());
                    PublishResult::success()
                })),
            )
            .await;

        assert!(!result.is_success());
        assert_eq!(result.error_message(), Some("Rejected by middleware: b"));
        assert_eq!(*trace.lock(), ["a:before", "b:before", "a:after"]);
    }

    #[tokio::test]
    async fn exhausted_chains_fall_back_to_defaults() {
        let pipeline = Pipeline::new();
        let envelope = envelope();

        let result = pipeline.publish(Payload::new(&envelope), None).await;
        assert_eq!(result.error_message(), Some("Reached end of pipeline"));

        assert!(!pipeline.receive(Payload::new(&envelope), None).await);
    }

    #[tokio::test]
    async fn receive_veto_skips_the_terminal() {
        let trace = Arc::new(Mutex::new(Vec::new()));
        let mut pipeline = Pipeline::new();
        pipeline.push(Tracer::new("a", &trace).vetoing());

        let envelope = envelope();
        let accepted = pipeline
            .receive(
                Payload::new(&envelope),
                Some(terminal(|_| async { true })),
            )
            .await;
        assert!(!accepted);
        assert_eq!(*trace.lock(), ["a:receive"]);
    }
}
