//! Codec for classifying inbound frames and encoding outbound events.
//!
//! Inbound text frames fall into three shapes: the bare keep-alive token,
//! an opaque payload that is relayed untouched, or a JSON object event.

use bytes::Bytes;
use serde::Serialize;
use serde_json::{Map, Value};
use thiserror::Error;

use crate::events::{EventType, NotifyFields, KEEP_ALIVE_TOKEN};

/// Protocol errors that can occur during encoding.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// JSON encoding error.
    #[error("Encoding error: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Encode an outbound event as a JSON text payload.
///
/// # Errors
///
/// Returns an error if serialization fails.
pub fn encode<T: Serialize + ?Sized>(event: &T) -> Result<Bytes, ProtocolError> {
    Ok(Bytes::from(serde_json::to_vec(event)?))
}

/// A classified inbound frame.
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    /// The literal keep-alive token.
    KeepAlive,
    /// A frame that is not a JSON object; relayed as-is.
    Opaque(String),
    /// A JSON object frame.
    Event(InboundEvent),
}

/// A parsed JSON object frame.
#[derive(Debug, Clone, PartialEq)]
pub struct InboundEvent {
    body: Map<String, Value>,
}

impl InboundEvent {
    /// Wrap a parsed JSON object.
    #[must_use]
    pub fn new(body: Map<String, Value>) -> Self {
        Self { body }
    }

    /// The raw `eventType` tag, if it is a string.
    #[must_use]
    pub fn tag(&self) -> Option<&str> {
        self.body.get("eventType").and_then(Value::as_str)
    }

    /// The known event type, if the tag is recognised.
    #[must_use]
    pub fn kind(&self) -> Option<EventType> {
        self.tag().and_then(EventType::parse)
    }

    /// Read a field from the body.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.body.get(key)
    }

    /// The notify-class fields of this event.
    #[must_use]
    pub fn notify_fields(&self) -> NotifyFields {
        NotifyFields::from_body(&self.body)
    }

    /// Stamp the server timestamp and the sender identity.
    ///
    /// A `source` supplied by the client is always replaced, or dropped
    /// when the sender is unresolved.
    pub fn stamp(&mut self, st: u64, source: Option<&str>) {
        self.body.insert("st".to_string(), Value::from(st));
        match source {
            Some(source) => {
                self.body
                    .insert("source".to_string(), Value::String(source.to_string()));
            }
            None => {
                self.body.remove("source");
            }
        }
    }

    /// Encode the (possibly stamped) event for delivery.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn encode(&self) -> Result<Bytes, ProtocolError> {
        encode(&self.body)
    }
}

/// Classify a raw inbound text frame.
#[must_use]
pub fn classify(frame: &str) -> Inbound {
    if frame == KEEP_ALIVE_TOKEN {
        return Inbound::KeepAlive;
    }

    match serde_json::from_str::<Value>(frame) {
        Ok(Value::Object(body)) => Inbound::Event(InboundEvent::new(body)),
        _ => Inbound::Opaque(frame.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_classify_keep_alive() {
        assert_eq!(classify("ping"), Inbound::KeepAlive);
        // Quoted JSON string is not the bare token.
        assert_eq!(classify("\"ping\""), Inbound::Opaque("\"ping\"".into()));
    }

    #[test]
    fn test_classify_opaque() {
        assert_eq!(classify("hello there"), Inbound::Opaque("hello there".into()));
        assert_eq!(classify("{broken"), Inbound::Opaque("{broken".into()));
        assert_eq!(classify("[1,2]"), Inbound::Opaque("[1,2]".into()));
    }

    #[test]
    fn test_classify_event() {
        let Inbound::Event(event) = classify(r#"{"eventType":"requestList","limit":3}"#) else {
            panic!("expected event");
        };
        assert_eq!(event.kind(), Some(EventType::RequestList));
        assert_eq!(event.get("limit"), Some(&json!(3)));

        let Inbound::Event(event) = classify(r#"{"eventType":"chat"}"#) else {
            panic!("expected event");
        };
        assert_eq!(event.tag(), Some("chat"));
        assert_eq!(event.kind(), None);
    }

    #[test]
    fn test_stamp_and_encode() {
        let Inbound::Event(mut event) = classify(r#"{"eventType":"chat","text":"hi"}"#) else {
            panic!("expected event");
        };
        event.stamp(42, Some("alice"));

        let encoded = event.encode().unwrap();
        let value: Value = serde_json::from_slice(&encoded).unwrap();
        assert_eq!(
            value,
            json!({"eventType": "chat", "text": "hi", "st": 42, "source": "alice"})
        );
    }

    #[test]
    fn test_stamp_without_source() {
        let Inbound::Event(mut event) = classify(r#"{"eventType":"chat"}"#) else {
            panic!("expected event");
        };
        event.stamp(1, None);
        assert!(event.get("source").is_none());
        assert_eq!(event.get("st"), Some(&json!(1)));
    }

    #[test]
    fn test_stamp_drops_client_source() {
        let Inbound::Event(mut event) = classify(r#"{"eventType":"chat","source":"mallory"}"#)
        else {
            panic!("expected event");
        };
        event.stamp(1, None);
        assert!(event.get("source").is_none());

        let Inbound::Event(mut event) = classify(r#"{"eventType":"chat","source":"mallory"}"#)
        else {
            panic!("expected event");
        };
        event.stamp(1, Some("alice"));
        assert_eq!(event.get("source"), Some(&json!("alice")));
    }
}
