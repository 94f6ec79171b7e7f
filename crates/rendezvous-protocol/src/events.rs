//! Event types for the Rendezvous protocol.
//!
//! Field names are fixed for compatibility with deployed clients, hence the
//! camelCase renames on every outbound struct.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

/// The literal keep-alive frame. Sent bare, not as JSON.
pub const KEEP_ALIVE_TOKEN: &str = "ping";

/// Current server time in milliseconds since the Unix epoch.
#[must_use]
pub fn server_time() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

/// Known `eventType` tags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum EventType {
    Connect,
    Disconnect,
    RequestList,
    List,
    Ping,
    Pong,
    Match,
    ExtendChat,
    MatchCancel,
    MatchResponse,
}

impl EventType {
    /// The wire tag for this event type.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            EventType::Connect => "connect",
            EventType::Disconnect => "disconnect",
            EventType::RequestList => "requestList",
            EventType::List => "list",
            EventType::Ping => "ping",
            EventType::Pong => "pong",
            EventType::Match => "match",
            EventType::ExtendChat => "extendChat",
            EventType::MatchCancel => "matchCancel",
            EventType::MatchResponse => "matchResponse",
        }
    }

    /// Parse a wire tag. Unknown tags return `None`.
    #[must_use]
    pub fn parse(tag: &str) -> Option<Self> {
        Some(match tag {
            "connect" => EventType::Connect,
            "disconnect" => EventType::Disconnect,
            "requestList" => EventType::RequestList,
            "list" => EventType::List,
            "ping" => EventType::Ping,
            "pong" => EventType::Pong,
            "match" => EventType::Match,
            "extendChat" => EventType::ExtendChat,
            "matchCancel" => EventType::MatchCancel,
            "matchResponse" => EventType::MatchResponse,
            _ => return None,
        })
    }

    /// Whether this tag is delivered point-to-point to a `target` identity.
    #[must_use]
    pub fn is_notify(self) -> bool {
        matches!(
            self,
            EventType::Match
                | EventType::ExtendChat
                | EventType::MatchCancel
                | EventType::MatchResponse
        )
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A `connect` or `disconnect` presence event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PresenceEvent {
    pub event_type: EventType,
    /// Absent when a disconnecting handle could no longer be resolved.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_count: Option<usize>,
    pub st: u64,
}

impl PresenceEvent {
    /// Create a `connect` event.
    #[must_use]
    pub fn connect(source: impl Into<String>, user_count: usize, st: u64) -> Self {
        Self {
            event_type: EventType::Connect,
            source: Some(source.into()),
            user_count: Some(user_count),
            st,
        }
    }

    /// Create a `disconnect` event.
    #[must_use]
    pub fn disconnect(source: Option<String>, user_count: usize, st: u64) -> Self {
        Self {
            event_type: EventType::Disconnect,
            source,
            user_count: Some(user_count),
            st,
        }
    }
}

/// Reply to a keep-alive or `ping` event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Pong {
    pub event_type: EventType,
    pub st: u64,
    /// Correlation token echoed back from the client's `ping`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub t: Option<Value>,
}

impl Pong {
    #[must_use]
    pub fn new(st: u64, t: Option<Value>) -> Self {
        Self {
            event_type: EventType::Pong,
            st,
            t,
        }
    }
}

/// One entry in a `list` reply.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AidEntry {
    pub aid: String,
}

/// Reply to `requestList`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListReply {
    pub event_type: EventType,
    pub user_count: usize,
    pub aid_list: Vec<AidEntry>,
    pub st: u64,
}

impl ListReply {
    /// Build a list reply; `userCount` is the number of listed identities.
    #[must_use]
    pub fn new(identities: Vec<String>, st: u64) -> Self {
        let aid_list: Vec<AidEntry> = identities.into_iter().map(|aid| AidEntry { aid }).collect();
        Self {
            event_type: EventType::List,
            user_count: aid_list.len(),
            aid_list,
            st,
        }
    }
}

/// Fields read from a notify-class event body.
///
/// Extraction is lenient: a field with the wrong JSON type reads as absent
/// instead of failing the whole frame.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NotifyFields {
    pub target: Option<String>,
    /// Client timestamp of the originating match request.
    pub t: Option<u64>,
    /// Client timestamp of the response.
    pub rt: Option<u64>,
    pub is_accept: Option<bool>,
    pub reject_reason: Option<String>,
    pub channel_name: Option<String>,
}

impl NotifyFields {
    /// Read notify fields out of a parsed event body.
    #[must_use]
    pub fn from_body(body: &Map<String, Value>) -> Self {
        let string = |key: &str| body.get(key).and_then(Value::as_str).map(str::to_owned);
        let number = |key: &str| body.get(key).and_then(Value::as_u64);

        Self {
            target: string("target"),
            t: number("t"),
            rt: number("rt"),
            is_accept: body.get("isAccept").and_then(Value::as_bool),
            reject_reason: string("rejectReason"),
            channel_name: string("channelName"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_event_type_tags() {
        for kind in [
            EventType::Connect,
            EventType::RequestList,
            EventType::ExtendChat,
            EventType::MatchResponse,
        ] {
            assert_eq!(EventType::parse(kind.as_str()), Some(kind));
            assert_eq!(
                serde_json::to_value(kind).unwrap(),
                Value::String(kind.as_str().to_string())
            );
        }
        assert_eq!(EventType::parse("chat"), None);
    }

    #[test]
    fn test_notify_classification() {
        assert!(EventType::Match.is_notify());
        assert!(EventType::MatchCancel.is_notify());
        assert!(!EventType::Ping.is_notify());
        assert!(!EventType::RequestList.is_notify());
    }

    #[test]
    fn test_presence_event_shape() {
        let event = PresenceEvent::connect("alice", 2, 10);
        assert_eq!(
            serde_json::to_value(&event).unwrap(),
            json!({"eventType": "connect", "source": "alice", "userCount": 2, "st": 10})
        );

        let event = PresenceEvent::disconnect(None, 0, 11);
        assert_eq!(
            serde_json::to_value(&event).unwrap(),
            json!({"eventType": "disconnect", "userCount": 0, "st": 11})
        );
    }

    #[test]
    fn test_pong_echoes_token() {
        let pong = Pong::new(5, Some(json!("abc")));
        assert_eq!(
            serde_json::to_value(&pong).unwrap(),
            json!({"eventType": "pong", "st": 5, "t": "abc"})
        );
        let bare = serde_json::to_value(Pong::new(5, None)).unwrap();
        assert!(bare.get("t").is_none());
    }

    #[test]
    fn test_list_reply_shape() {
        let reply = ListReply::new(vec!["alice".into(), "bob".into()], 7);
        assert_eq!(
            serde_json::to_value(&reply).unwrap(),
            json!({
                "eventType": "list",
                "userCount": 2,
                "aidList": [{"aid": "alice"}, {"aid": "bob"}],
                "st": 7
            })
        );
    }

    #[test]
    fn test_notify_fields_lenient() {
        let body = json!({
            "eventType": "matchResponse",
            "target": "alice",
            "t": 1000,
            "rt": 1005,
            "isAccept": true,
            "channelName": 3
        });
        let fields = NotifyFields::from_body(body.as_object().unwrap());
        assert_eq!(fields.target.as_deref(), Some("alice"));
        assert_eq!(fields.t, Some(1000));
        assert_eq!(fields.rt, Some(1005));
        assert_eq!(fields.is_accept, Some(true));
        assert_eq!(fields.reject_reason, None);
        // Wrong type reads as absent.
        assert_eq!(fields.channel_name, None);
    }

    #[test]
    fn test_server_time_is_recent() {
        // 2020-01-01 in milliseconds.
        assert!(server_time() > 1_577_836_800_000);
    }
}
