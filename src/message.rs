//! The trait implemented by every payload type sent through the client.

use serde::{Serialize, de::DeserializeOwned};

use crate::codec::Codec;

/// A payload that can be published, subscribed to, or used in request/reply.
///
/// The message type name is the static identifier the client keys
/// connectors and broker topics on. It defaults to the Rust type name, which
/// is stable for a given build but not across crate renames, so types shared
/// with other services should override it.
///
/// ```rust
/// use courier::{Codec, Message};
/// use serde::{Deserialize, Serialize};
///
/// #[derive(Clone, Serialize, Deserialize)]
/// struct OrderPlaced {
///     order_id: u64,
/// }
///
/// impl Message for OrderPlaced {
///     fn message_type() -> &'static str {
///         "orders.placed"
///     }
/// }
///
/// assert_eq!(OrderPlaced::topic(), "orders.placed");
/// assert_eq!(OrderPlaced::codec(), Codec::Json);
/// ```
pub trait Message: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {
    /// Logical type name of the payload.
    fn message_type() -> &'static str {
        std::any::type_name::<Self>()
    }

    /// Broker topic the payload travels on.
    fn topic() -> &'static str {
        Self::message_type()
    }

    /// Codec used to encode the envelope on the wire.
    ///
    /// Drivers only ever see the encoded bytes.
    fn codec() -> Codec {
        Codec::Json
    }
}

impl Message for String {
    fn message_type() -> &'static str {
        "string"
    }
}
