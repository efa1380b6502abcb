use std::time::Instant;

use crate::{
    PublishResult,
    middleware::{Middleware, Next, Payload, Publish, Receive},
};

/// Middleware that traces every message passing through the client.
///
/// Emits a `debug` event before and after each hook with the message type,
/// id and causal linkage, and a `warn` event when a publish fails or an
/// inbound message is rejected further down the chain.
#[derive(Debug, Clone, Copy, Default)]
pub struct LoggingMiddleware;

#[async_trait::async_trait]
impl Middleware for LoggingMiddleware {
    async fn publish<'a>(&'a self, payload: Payload<'a>, next: Next<'a, Publish>) -> PublishResult {
        let context = payload.context();
        tracing::debug!(
            message_type = %context.message_type,
            message_id = %context.id,
            parent_message_id = ?context.parent_message_id,
            "Publishing message"
        );

        let started = Instant::now();
        let result = next.run(payload).await;
        let elapsed_ms = started.elapsed().as_millis() as u64;

        match result.error_message() {
            None => tracing::debug!(message_id = %context.id, elapsed_ms, "Message published"),
            Some(error) => {
                tracing::warn!(message_id = %context.id, elapsed_ms, error, "Message not published")
            }
        }
        result
    }

    async fn receive<'a>(&'a self, payload: Payload<'a>, next: Next<'a, Receive>) -> bool {
        let context = payload.context();
        tracing::debug!(
            message_type = %context.message_type,
            message_id = %context.id,
            root_message_id = ?context.root_message_id,
            "Message received"
        );

        let accepted = next.run(payload).await;
        if !accepted {
            tracing::warn!(message_id = %context.id, "Message rejected by the receive chain");
        }
        accepted
    }
}
