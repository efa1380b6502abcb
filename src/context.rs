//! Identity and causality metadata carried by every message.

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{message::Message, registry::SubscriptionId};

/// Per-message metadata, created once per logical message.
///
/// A context either starts a causal chain (it is its own root) or is
/// [caused by](MessageContext::caused_by) a parent, in which case it carries
/// the parent's id and inherits the chain's root and request id. The root
/// id/date pair is what end-to-end latency is measured against.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageContext {
    /// Unique message id.
    pub id: Uuid,
    /// Creation timestamp.
    pub date: DateTime<Utc>,
    /// Logical type name of the payload.
    pub message_type: String,
    /// Id of the message that caused this one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_message_id: Option<Uuid>,
    /// Id of the first message in the causal chain.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub root_message_id: Option<Uuid>,
    /// Creation timestamp of the first message in the causal chain.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub root_message_date: Option<DateTime<Utc>>,
    /// Externally issued trace id.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    /// Subscription awaiting a reply to this message.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<SubscriptionId>,
}

impl MessageContext {
    /// Start a new causal chain: the context is its own root.
    pub fn new(message_type: impl Into<String>) -> Self {
        let id = Uuid::new_v4();
        let date = Utc::now();
        Self {
            id,
            date,
            message_type: message_type.into(),
            parent_message_id: None,
            root_message_id: Some(id),
            root_message_date: Some(date),
            request_id: None,
            reply_to: None,
        }
    }

    /// Create the context of a message caused by `parent`.
    ///
    /// The root is inherited from the parent; a parent without a root is
    /// treated as the root itself.
    pub fn caused_by(message_type: impl Into<String>, parent: &MessageContext) -> Self {
        let (root_id, root_date) = match (parent.root_message_id, parent.root_message_date) {
            (Some(id), Some(date)) => (id, date),
            _ => (parent.id, parent.date),
        };

        Self {
            id: Uuid::new_v4(),
            date: Utc::now(),
            message_type: message_type.into(),
            parent_message_id: Some(parent.id),
            root_message_id: Some(root_id),
            root_message_date: Some(root_date),
            request_id: parent.request_id.clone(),
            reply_to: None,
        }
    }

    /// Build the context for a new `M`, optionally linked to a parent.
    pub fn for_message<M: Message>(parent: Option<&MessageContext>) -> Self {
        match parent {
            Some(parent) => Self::caused_by(M::message_type(), parent),
            None => Self::new(M::message_type()),
        }
    }

    /// Attach an externally issued trace id.
    pub fn with_request_id(mut self, request_id: impl Into<String>) -> Self {
        self.request_id = Some(request_id.into());
        self
    }

    /// Mark the subscription awaiting a reply.
    pub fn with_reply_to(mut self, reply_to: SubscriptionId) -> Self {
        self.reply_to = Some(reply_to);
        self
    }

    /// Whether this message started its causal chain.
    pub fn is_root(&self) -> bool {
        self.parent_message_id.is_none()
    }

    /// Time elapsed since the root message was created.
    pub fn elapsed_since_root(&self) -> Option<TimeDelta> {
        self.root_message_date.map(|root| Utc::now() - root)
    }
}
