//! Envelope encoding.
//!
//! Each [`Message`](crate::Message) type picks its [`Codec`]; the client
//! encodes the whole [`Envelope`] (payload and context) before handing bytes
//! to the transport and decodes inbound bytes back into a typed envelope.

use bytes::Bytes;
use serde::{Serialize, de::DeserializeOwned};

use crate::{Envelope, transport::TransportError};

/// Wire encoding of an envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Codec {
    /// Plain-text JSON via `serde_json`.
    #[default]
    Json,
    /// Structured binary MessagePack via `rmp-serde`.
    #[cfg(feature = "msgpack")]
    MsgPack,
}

impl Codec {
    /// MIME type of the encoded bytes.
    pub fn content_type(self) -> &'static str {
        match self {
            Codec::Json => "application/json",
            #[cfg(feature = "msgpack")]
            Codec::MsgPack => "application/msgpack",
        }
    }

    /// Encode an envelope into bytes.
    pub fn encode<M: Serialize>(self, envelope: &Envelope<M>) -> Result<Bytes, TransportError> {
        let bytes = match self {
            Codec::Json => serde_json::to_vec(envelope).map_err(|e| TransportError::serde(Box::new(e)))?,
            #[cfg(feature = "msgpack")]
            Codec::MsgPack => {
                rmp_serde::to_vec_named(envelope).map_err(|e| TransportError::serde(Box::new(e)))?
            }
        };
        Ok(Bytes::from(bytes))
    }

    /// Decode bytes into an envelope.
    pub fn decode<M: DeserializeOwned>(self, bytes: &[u8]) -> Result<Envelope<M>, TransportError> {
        match self {
            Codec::Json => {
                serde_json::from_slice(bytes).map_err(|e| TransportError::serde(Box::new(e)))
            }
            #[cfg(feature = "msgpack")]
            Codec::MsgPack => {
                rmp_serde::from_slice(bytes).map_err(|e| TransportError::serde(Box::new(e)))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use serde::Deserialize;

    use super::*;
    use crate::{MessageContext, transport::TransportErrorKind};

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Reading {
        sensor: String,
        value: f64,
    }

    fn envelope() -> Envelope<Reading> {
        let parent = MessageContext::new("tick").with_request_id("req-7");
        Envelope::new(
            Reading {
                sensor: "t1".into(),
                value: 21.5,
            },
            MessageContext::caused_by("reading", &parent),
        )
    }

    #[test]
    fn json_keeps_context_linkage() {
        let original = envelope();
        let bytes = Codec::Json.encode(&original).unwrap();
        let json: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(json["message"]["sensor"], "t1");
        assert_eq!(json["context"]["request_id"], "req-7");

        let decoded: Envelope<Reading> = Codec::Json.decode(&bytes).unwrap();
        assert_eq!(decoded, original);
    }

    #[cfg(feature = "msgpack")]
    #[test]
    fn msgpack_decodes_what_it_encodes() {
        let original = envelope();
        let bytes = Codec::MsgPack.encode(&original).unwrap();
        let decoded: Envelope<Reading> = Codec::MsgPack.decode(&bytes).unwrap();
        assert_eq!(decoded, original);
    }

    #[test]
    fn garbage_is_a_serde_error() {
        let err = Codec::Json.decode::<Reading>(b"not json").unwrap_err();
        assert!(matches!(err.kind(), TransportErrorKind::Serde(_)));
    }
}
