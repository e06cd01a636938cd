//! JSON envelope protocol between sessions and the hub.
//!
//! Wire format (one JSON text frame per envelope):
//! ```text
//! { "type": "OP", "payload": { ...operation... }, "requestId": "…" }
//! ```
//!
//! | type               | direction       | payload                                   |
//! |--------------------|-----------------|-------------------------------------------|
//! | `HELLO`            | client → hub    | `{userId, name, docId, lastKnownVersion}` |
//! | `REQUEST_SNAPSHOT` | client → hub    | `{}`                                      |
//! | `OP`               | both            | operation                                 |
//! | `PRESENCE`         | both            | presence object or array of them          |
//! | `PRESENCE_REMOVE`  | both            | `{sessionId}`                             |
//! | `SNAPSHOT`         | hub → client    | `{id, version, content}`                  |
//! | `ACK`              | hub → client    | `{opId?, version?, sessionIds?}`          |
//! | `ERROR`            | hub → client    | `{message}`                               |
//! | `PING` / `PONG`    | both            | `{ts}` (unix millis)                      |
//!
//! `requestId` is optional on the way in and echoed on the reply.

use std::fmt;
use std::str::FromStr;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use uuid::Uuid;

use scribe_core::{Document, Operation};

use crate::presence::{now_millis, Presence, SessionId};

/// Envelope discriminant, as it appears in the `type` field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageType {
    Hello,
    Op,
    Presence,
    PresenceRemove,
    Snapshot,
    RequestSnapshot,
    Ack,
    Error,
    Ping,
    Pong,
}

impl MessageType {
    pub const ALL: [MessageType; 10] = [
        MessageType::Hello,
        MessageType::Op,
        MessageType::Presence,
        MessageType::PresenceRemove,
        MessageType::Snapshot,
        MessageType::RequestSnapshot,
        MessageType::Ack,
        MessageType::Error,
        MessageType::Ping,
        MessageType::Pong,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            MessageType::Hello => "HELLO",
            MessageType::Op => "OP",
            MessageType::Presence => "PRESENCE",
            MessageType::PresenceRemove => "PRESENCE_REMOVE",
            MessageType::Snapshot => "SNAPSHOT",
            MessageType::RequestSnapshot => "REQUEST_SNAPSHOT",
            MessageType::Ack => "ACK",
            MessageType::Error => "ERROR",
            MessageType::Ping => "PING",
            MessageType::Pong => "PONG",
        }
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MessageType {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        MessageType::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| ProtocolError::UnknownType(s.to_string()))
    }
}

/// Handshake sent by a client right after connecting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Hello {
    #[serde(default)]
    pub user_id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub doc_id: String,
    #[serde(default)]
    pub last_known_version: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PresenceRemove {
    pub session_id: SessionId,
}

/// Positive reply from the hub.
///
/// Carries `opId` and the new document version for an accepted operation,
/// or the affected `sessionIds` for presence changes.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Ack {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub op_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<u64>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub session_ids: Vec<SessionId>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub message: String,
}

/// `PING`/`PONG` body.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Heartbeat {
    #[serde(default)]
    pub ts: i64,
}

impl Heartbeat {
    pub fn now() -> Self {
        Self { ts: now_millis() }
    }
}

/// One decoded envelope body, tagged by its `type`.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Hello(Hello),
    Op(Operation),
    Presence(Vec<Presence>),
    PresenceRemove(PresenceRemove),
    Snapshot(Document),
    RequestSnapshot,
    Ack(Ack),
    Error(ErrorPayload),
    Ping(Heartbeat),
    Pong(Heartbeat),
}

impl Message {
    pub fn message_type(&self) -> MessageType {
        match self {
            Message::Hello(_) => MessageType::Hello,
            Message::Op(_) => MessageType::Op,
            Message::Presence(_) => MessageType::Presence,
            Message::PresenceRemove(_) => MessageType::PresenceRemove,
            Message::Snapshot(_) => MessageType::Snapshot,
            Message::RequestSnapshot => MessageType::RequestSnapshot,
            Message::Ack(_) => MessageType::Ack,
            Message::Error(_) => MessageType::Error,
            Message::Ping(_) => MessageType::Ping,
            Message::Pong(_) => MessageType::Pong,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Message::Error(ErrorPayload {
            message: message.into(),
        })
    }

    pub fn remove_presence(session_id: SessionId) -> Self {
        Message::PresenceRemove(PresenceRemove { session_id })
    }

    fn payload(&self) -> Result<Value, serde_json::Error> {
        match self {
            Message::Hello(hello) => serde_json::to_value(hello),
            Message::Op(op) => serde_json::to_value(op),
            Message::Presence(entries) => serde_json::to_value(entries),
            Message::PresenceRemove(remove) => serde_json::to_value(remove),
            Message::Snapshot(document) => serde_json::to_value(document),
            Message::RequestSnapshot => Ok(Value::Object(Default::default())),
            Message::Ack(ack) => serde_json::to_value(ack),
            Message::Error(error) => serde_json::to_value(error),
            Message::Ping(beat) | Message::Pong(beat) => serde_json::to_value(beat),
        }
    }

    fn from_payload(kind: MessageType, payload: Value) -> Result<Self, ProtocolError> {
        let message = match kind {
            MessageType::Hello => Message::Hello(parse(kind, payload)?),
            MessageType::Op => Message::Op(parse(kind, payload)?),
            MessageType::Presence => {
                let entries: OneOrMany<Presence> = parse(kind, payload)?;
                Message::Presence(entries.into_vec())
            }
            MessageType::PresenceRemove => Message::PresenceRemove(parse(kind, payload)?),
            MessageType::Snapshot => Message::Snapshot(parse(kind, payload)?),
            MessageType::RequestSnapshot => Message::RequestSnapshot,
            MessageType::Ack => Message::Ack(parse(kind, payload)?),
            MessageType::Error => Message::Error(parse(kind, payload)?),
            MessageType::Ping => Message::Ping(parse_or_default(kind, payload)?),
            MessageType::Pong => Message::Pong(parse_or_default(kind, payload)?),
        };
        Ok(message)
    }
}

fn parse<T: DeserializeOwned>(kind: MessageType, payload: Value) -> Result<T, ProtocolError> {
    serde_json::from_value(payload).map_err(|source| ProtocolError::InvalidPayload { kind, source })
}

/// Heartbeats tolerate a missing body.
fn parse_or_default(kind: MessageType, payload: Value) -> Result<Heartbeat, ProtocolError> {
    if payload.is_null() {
        return Ok(Heartbeat { ts: 0 });
    }
    parse(kind, payload)
}

#[derive(Deserialize)]
#[serde(untagged)]
enum OneOrMany<T> {
    Many(Vec<T>),
    One(T),
}

impl<T> OneOrMany<T> {
    fn into_vec(self) -> Vec<T> {
        match self {
            OneOrMany::Many(items) => items,
            OneOrMany::One(item) => vec![item],
        }
    }
}

#[derive(Serialize)]
struct WireOut<'a> {
    #[serde(rename = "type")]
    kind: &'static str,
    payload: Value,
    #[serde(rename = "requestId", skip_serializing_if = "Option::is_none")]
    request_id: Option<&'a str>,
}

#[derive(Deserialize)]
struct WireIn {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    payload: Value,
    #[serde(rename = "requestId", default)]
    request_id: Option<String>,
}

/// A message plus its optional correlation id.
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    pub message: Message,
    pub request_id: Option<String>,
}

impl Envelope {
    /// Envelope without a correlation id (broadcasts).
    pub fn new(message: Message) -> Self {
        Self {
            message,
            request_id: None,
        }
    }

    /// Envelope with a fresh correlation id (client requests).
    pub fn request(message: Message) -> Self {
        Self {
            message,
            request_id: Some(Uuid::new_v4().to_string()),
        }
    }

    /// Envelope answering a request with the given id.
    pub fn reply(message: Message, request_id: Option<String>) -> Self {
        Self {
            message,
            request_id,
        }
    }

    pub fn message_type(&self) -> MessageType {
        self.message.message_type()
    }

    /// Serialize to a JSON text frame.
    pub fn encode(&self) -> Result<String, ProtocolError> {
        let wire = WireOut {
            kind: self.message_type().as_str(),
            payload: self.message.payload().map_err(ProtocolError::Encode)?,
            request_id: self.request_id.as_deref(),
        };
        serde_json::to_string(&wire).map_err(ProtocolError::Encode)
    }

    /// Parse a JSON text frame.
    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        let wire: WireIn =
            serde_json::from_str(text).map_err(|e| ProtocolError::Malformed(e.to_string()))?;
        let kind: MessageType = wire.kind.parse()?;
        Ok(Self {
            message: Message::from_payload(kind, wire.payload)?,
            request_id: wire.request_id,
        })
    }
}

/// Envelope codec failures.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("malformed envelope: {0}")]
    Malformed(String),

    #[error("unknown message type {0:?}")]
    UnknownType(String),

    #[error("invalid {kind} payload: {source}")]
    InvalidPayload {
        kind: MessageType,
        source: serde_json::Error,
    },

    #[error("failed to encode envelope: {0}")]
    Encode(#[source] serde_json::Error),

    #[error("connection closed")]
    ConnectionClosed,
}

#[cfg(test)]
mod tests {
    use super::*;
    use scribe_core::OpKind;
    use serde_json::json;

    #[test]
    fn test_message_type_names() {
        for kind in MessageType::ALL {
            assert_eq!(kind.as_str().parse::<MessageType>().unwrap(), kind);
        }
        assert_eq!(MessageType::PresenceRemove.as_str(), "PRESENCE_REMOVE");
        assert_eq!(MessageType::RequestSnapshot.as_str(), "REQUEST_SNAPSHOT");
        assert!(matches!(
            "NOPE".parse::<MessageType>(),
            Err(ProtocolError::UnknownType(_))
        ));
    }

    #[test]
    fn test_op_envelope_shape() {
        let env = Envelope::reply(
            Message::Op(Operation::insert(5, ",")),
            Some("req-1".to_string()),
        );
        let value: Value = serde_json::from_str(&env.encode().unwrap()).unwrap();
        assert_eq!(value["type"], "OP");
        assert_eq!(value["requestId"], "req-1");
        assert_eq!(value["payload"]["kind"], "insert");
        assert_eq!(value["payload"]["index"], 5);
        assert_eq!(value["payload"]["text"], ",");
    }

    #[test]
    fn test_broadcast_omits_request_id() {
        let env = Envelope::new(Message::Pong(Heartbeat { ts: 9 }));
        let value: Value = serde_json::from_str(&env.encode().unwrap()).unwrap();
        assert!(value.get("requestId").is_none());
        assert_eq!(value["payload"]["ts"], 9);
    }

    #[test]
    fn test_request_gets_fresh_id() {
        let a = Envelope::request(Message::RequestSnapshot);
        let b = Envelope::request(Message::RequestSnapshot);
        assert!(a.request_id.is_some());
        assert_ne!(a.request_id, b.request_id);
    }

    #[test]
    fn test_decode_op() {
        let text = json!({
            "type": "OP",
            "payload": {"kind": "delete", "index": 0, "length": 6, "prevText": "Hello "},
            "requestId": "r"
        })
        .to_string();
        let env = Envelope::decode(&text).unwrap();
        assert_eq!(env.request_id.as_deref(), Some("r"));
        match env.message {
            Message::Op(op) => {
                assert_eq!(op.kind, OpKind::Delete);
                assert_eq!(op.length, Some(6));
            }
            other => panic!("expected OP, got {other:?}"),
        }
    }

    #[test]
    fn test_decode_presence_single_or_array() {
        let single = json!({
            "type": "PRESENCE",
            "payload": {"userId": "u", "sessionId": "s1", "name": "U", "cursor": 3, "lastSeen": 1}
        })
        .to_string();
        match Envelope::decode(&single).unwrap().message {
            Message::Presence(entries) => {
                assert_eq!(entries.len(), 1);
                assert_eq!(entries[0].cursor, 3);
            }
            other => panic!("expected PRESENCE, got {other:?}"),
        }

        let many = json!({
            "type": "PRESENCE",
            "payload": [
                {"userId": "u", "sessionId": "s1", "cursor": 1},
                {"userId": "v", "sessionId": "s2", "cursor": 2, "opStart": 0, "opEnd": 2}
            ]
        })
        .to_string();
        match Envelope::decode(&many).unwrap().message {
            Message::Presence(entries) => {
                assert_eq!(entries.len(), 2);
                assert_eq!(entries[1].op_end, Some(2));
            }
            other => panic!("expected PRESENCE, got {other:?}"),
        }
    }

    #[test]
    fn test_decode_snapshot_and_ack() {
        let env = Envelope::decode(
            r#"{"type":"SNAPSHOT","payload":{"id":"doc","version":4,"content":"hi"}}"#,
        )
        .unwrap();
        assert_eq!(
            env.message,
            Message::Snapshot(Document {
                id: "doc".into(),
                version: 4,
                content: "hi".into()
            })
        );

        let env =
            Envelope::decode(r#"{"type":"ACK","payload":{"opId":"o1","version":2}}"#).unwrap();
        match env.message {
            Message::Ack(ack) => {
                assert_eq!(ack.op_id.as_deref(), Some("o1"));
                assert_eq!(ack.version, Some(2));
                assert!(ack.session_ids.is_empty());
            }
            other => panic!("expected ACK, got {other:?}"),
        }
    }

    #[test]
    fn test_request_snapshot_and_ping_without_payload() {
        let env = Envelope::decode(r#"{"type":"REQUEST_SNAPSHOT"}"#).unwrap();
        assert_eq!(env.message, Message::RequestSnapshot);

        let env = Envelope::decode(r#"{"type":"PING"}"#).unwrap();
        assert_eq!(env.message, Message::Ping(Heartbeat { ts: 0 }));
    }

    #[test]
    fn test_decode_errors() {
        assert!(matches!(
            Envelope::decode("not json"),
            Err(ProtocolError::Malformed(_))
        ));
        assert!(matches!(
            Envelope::decode(r#"{"payload":{}}"#),
            Err(ProtocolError::Malformed(_))
        ));
        assert!(matches!(
            Envelope::decode(r#"{"type":"SHOUT","payload":{}}"#),
            Err(ProtocolError::UnknownType(t)) if t == "SHOUT"
        ));
        assert!(matches!(
            Envelope::decode(r#"{"type":"OP","payload":{"index":"three"}}"#),
            Err(ProtocolError::InvalidPayload { kind: MessageType::Op, .. })
        ));
    }

    #[test]
    fn test_hello_decodes_round_trip() {
        let hello = Hello {
            user_id: "alice".into(),
            name: "Alice".into(),
            doc_id: "doc".into(),
            last_known_version: 12,
        };
        let text = Envelope::request(Message::Hello(hello.clone())).encode().unwrap();
        assert!(text.contains("lastKnownVersion"));
        assert_eq!(Envelope::decode(&text).unwrap().message, Message::Hello(hello));
    }
}
