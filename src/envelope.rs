use serde::{Deserialize, Serialize};

use crate::context::MessageContext;

/// Message container used by the client and its pipelines.
///
/// `Envelope` pairs a typed payload with the [`MessageContext`] describing
/// its identity and causal chain. Both travel together on the wire; the
/// envelope is owned by whichever call created it and never shared mutably.
///
/// ## Conversion
///
/// `Envelope` implements `From<(MessageContext, M)>` for ergonomic
/// construction when context and payload are already available as a tuple.
///
/// ## Example
///
/// ```rust
/// use courier::{Envelope, MessageContext};
///
/// let envelope = Envelope::new(42, MessageContext::new("answer"));
///
/// // or, equivalently
/// let envelope: Envelope<_> = (MessageContext::new("answer"), 42).into();
/// assert_eq!(envelope.message, 42);
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope<M> {
    /// Message metadata.
    pub context: MessageContext,
    /// Message payload.
    pub message: M,
}

impl<M> Envelope<M> {
    /// Pair a payload with its context.
    pub fn new(message: M, context: MessageContext) -> Self {
        Self { context, message }
    }

    /// Split the envelope into payload and context.
    pub fn into_parts(self) -> (M, MessageContext) {
        (self.message, self.context)
    }
}

impl<M> From<(MessageContext, M)> for Envelope<M> {
    fn from(value: (MessageContext, M)) -> Self {
        Envelope {
            context: value.0,
            message: value.1,
        }
    }
}
