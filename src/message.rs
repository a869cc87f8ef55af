// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Message Data Model
//!
//! Transport-independent representations of what travels over a session:
//! outgoing payloads with their classification, the properties attached to a
//! publish, and incoming deliveries handed to a message handler.

use crate::errors::AmqpError;
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;
use tracing::error;

/// Content type for structured payloads
pub const JSON_CONTENT_TYPE: &str = "application/json";
/// Content type for everything else
pub const TEXT_CONTENT_TYPE: &str = "text/plain";

/// An outgoing message body, classified by how it goes on the wire.
///
/// Mapping values are JSON; every other value is plain text. The
/// classification depends only on the value, so the same payload always gets
/// the same content type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Payload {
    Json(String),
    Text(String),
}

impl Payload {
    /// Serializes any value, classifying it by its JSON shape.
    pub fn json<T: Serialize>(value: &T) -> Result<Payload, AmqpError> {
        match serde_json::to_value(value) {
            Ok(v) => Ok(Payload::from(v)),
            Err(err) => {
                error!(error = err.to_string(), "failure to serialize payload");
                Err(AmqpError::ParsePayloadError)
            }
        }
    }

    pub fn content_type(&self) -> &'static str {
        match self {
            Payload::Json(_) => JSON_CONTENT_TYPE,
            Payload::Text(_) => TEXT_CONTENT_TYPE,
        }
    }

    pub fn body(&self) -> &[u8] {
        match self {
            Payload::Json(s) | Payload::Text(s) => s.as_bytes(),
        }
    }
}

impl From<Value> for Payload {
    fn from(value: Value) -> Self {
        match value {
            Value::Object(_) => Payload::Json(value.to_string()),
            Value::String(s) => Payload::from(s),
            other => Payload::Text(other.to_string()),
        }
    }
}

impl From<String> for Payload {
    /// A string that already holds a JSON object is sent verbatim as JSON.
    fn from(s: String) -> Self {
        match serde_json::from_str::<Value>(&s) {
            Ok(Value::Object(_)) => Payload::Json(s),
            _ => Payload::Text(s),
        }
    }
}

impl From<&str> for Payload {
    fn from(s: &str) -> Self {
        Payload::from(s.to_owned())
    }
}

/// Properties attached to a published message.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MessageProperties {
    pub content_type: String,
    pub app_id: String,
    pub message_id: String,
    pub headers: BTreeMap<String, String>,
}

/// Delivery metadata handed to a message handler.
///
/// Only string-valued headers are carried over from the broker message.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Metadata {
    pub exchange: String,
    pub routing_key: String,
    pub redelivered: bool,
    pub content_type: Option<String>,
    pub app_id: Option<String>,
    pub message_id: Option<String>,
    pub correlation_id: Option<String>,
    pub reply_to: Option<String>,
    pub headers: BTreeMap<String, String>,
}

/// A message received from the queue.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Delivery {
    pub delivery_tag: u64,
    pub metadata: Metadata,
    pub body: Vec<u8>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn mapping_is_json() {
        let payload = Payload::from(json!({"a": "b"}));
        assert_eq!(payload.content_type(), JSON_CONTENT_TYPE);
        assert_eq!(payload.body(), br#"{"a":"b"}"#);
    }

    #[test]
    fn string_holding_an_object_is_sent_verbatim_as_json() {
        let payload = Payload::from(r#"{"hej": "3"}"#);
        assert_eq!(payload, Payload::Json(r#"{"hej": "3"}"#.to_owned()));
    }

    #[test]
    fn everything_else_is_text() {
        assert_eq!(Payload::from("hej"), Payload::Text("hej".to_owned()));
        assert_eq!(Payload::from("[1, 2]").content_type(), TEXT_CONTENT_TYPE);
        assert_eq!(Payload::from(json!(42)), Payload::Text("42".to_owned()));
        assert_eq!(Payload::from(json!("plain")), Payload::Text("plain".to_owned()));
    }

    #[test]
    fn serializable_structs_are_classified_by_shape() {
        #[derive(Serialize)]
        struct Request {
            uuid: String,
        }

        let payload = Payload::json(&Request { uuid: "abc".to_owned() }).unwrap();
        assert_eq!(payload.content_type(), JSON_CONTENT_TYPE);

        let payload = Payload::json(&vec![1, 2, 3]).unwrap();
        assert_eq!(payload, Payload::Text("[1,2,3]".to_owned()));
    }
}
