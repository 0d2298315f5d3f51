//! Wire messages for the remote event bus.
//!
//! Client to server frames are JSON objects `{event_name, data}`. Server to
//! client frames carry the same envelope; event payloads inside a `data`
//! object are channel-specific and stay opaque until the coordinator decodes
//! them with [`EventPayload::decode`].

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;

/// Field map carried in payloads. Values are opaque JSON.
pub type FieldMap = BTreeMap<String, serde_json::Value>;

/// A frame failed typed decoding.
///
/// Malformed frames are logged and dropped by the consumer; they must never
/// corrupt store state.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("malformed bus frame: {0}")]
pub struct DecodeError(pub String);

/// A client-to-server message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClientMessage {
    /// Message discriminator.
    pub event_name: String,
    /// Message body.
    pub data: serde_json::Value,
}

impl ClientMessage {
    /// Creates a message with an arbitrary body.
    pub fn new(event_name: impl Into<String>, data: serde_json::Value) -> Self {
        Self {
            event_name: event_name.into(),
            data,
        }
    }

    /// Builds the subscribe request naming the channel set and the last
    /// acknowledged cursor per channel. The server replays events after each
    /// cursor before delivering live ones.
    pub fn subscribe(channels: &[String], last: &BTreeMap<String, u64>) -> Self {
        Self::new(
            "subscribe",
            serde_json::json!({
                "channels": channels,
                "last": last,
            }),
        )
    }
}

/// A push event on a channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BusEvent {
    /// Channel the event was published on.
    pub channel: String,
    /// Per-channel delivery sequence.
    pub sequence: u64,
    /// Channel-specific payload, opaque at this layer.
    pub payload: serde_json::Value,
}

/// A decoded server-to-client frame.
#[derive(Debug, Clone, PartialEq)]
pub enum ServerMessage {
    /// A channel event.
    Event(BusEvent),
    /// Liveness heartbeat; resets the idle clock, otherwise ignored.
    Heartbeat,
    /// Subscription accepted for the named channels.
    SubscribeOk {
        /// Channels now active.
        channels: Vec<String>,
    },
    /// Subscription rejected.
    SubscribeRejected {
        /// Server-provided reason.
        reason: String,
    },
}

impl ServerMessage {
    /// Decodes a raw frame into a typed message.
    pub fn decode(frame: &serde_json::Value) -> Result<Self, DecodeError> {
        let event_name = frame
            .get("event_name")
            .and_then(|v| v.as_str())
            .ok_or_else(|| DecodeError("missing event_name".into()))?;
        let data = frame.get("data").cloned().unwrap_or(serde_json::Value::Null);

        match event_name {
            "event" => {
                let event: BusEvent = serde_json::from_value(data)
                    .map_err(|e| DecodeError(format!("bad event body: {e}")))?;
                Ok(ServerMessage::Event(event))
            }
            "heartbeat" => Ok(ServerMessage::Heartbeat),
            "sub_ok" => {
                let channels = data
                    .get("channels")
                    .and_then(|v| v.as_array())
                    .map(|a| {
                        a.iter()
                            .filter_map(|v| v.as_str().map(String::from))
                            .collect()
                    })
                    .unwrap_or_default();
                Ok(ServerMessage::SubscribeOk { channels })
            }
            "sub_rejected" => {
                let reason = data
                    .get("reason")
                    .and_then(|v| v.as_str())
                    .unwrap_or("unspecified")
                    .to_string();
                Ok(ServerMessage::SubscribeRejected { reason })
            }
            other => Err(DecodeError(format!("unknown event_name {other:?}"))),
        }
    }
}

/// A record as the server describes it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteRecord {
    /// Server-assigned id.
    pub id: i64,
    /// Server-authoritative timestamp, Unix millis.
    pub updated_at: u64,
    /// Field values.
    #[serde(default)]
    pub fields: FieldMap,
}

/// The change described by an event payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum RemoteChange {
    /// Create-or-update of a record.
    Upsert {
        /// The record after the change.
        record: RemoteRecord,
    },
    /// Server-side deletion.
    Delete {
        /// Id of the deleted record.
        id: i64,
    },
}

/// Typed form of a channel event payload.
///
/// This is the boundary where dynamic JSON from the bus becomes typed data;
/// anything that fails here is dropped upstream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventPayload {
    /// Entity model the change applies to.
    pub model: String,
    /// The change itself.
    #[serde(flatten)]
    pub change: RemoteChange,
}

impl EventPayload {
    /// Decodes an opaque event payload.
    pub fn decode(payload: &serde_json::Value) -> Result<Self, DecodeError> {
        serde_json::from_value(payload.clone())
            .map_err(|e| DecodeError(format!("bad event payload: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn subscribe_message_shape() {
        let mut last = BTreeMap::new();
        last.insert("contacts".to_string(), 17u64);

        let msg = ClientMessage::subscribe(&["contacts".to_string()], &last);
        assert_eq!(msg.event_name, "subscribe");
        assert_eq!(msg.data["channels"], json!(["contacts"]));
        assert_eq!(msg.data["last"]["contacts"], json!(17));
    }

    #[test]
    fn decode_event_frame() {
        let frame = json!({
            "event_name": "event",
            "data": {
                "channel": "contacts",
                "sequence": 18,
                "payload": {"model": "contact", "op": "delete", "id": 4}
            }
        });

        let msg = ServerMessage::decode(&frame).unwrap();
        let ServerMessage::Event(event) = msg else {
            panic!("expected event");
        };
        assert_eq!(event.channel, "contacts");
        assert_eq!(event.sequence, 18);
    }

    #[test]
    fn decode_heartbeat_and_sub_ok() {
        let hb = ServerMessage::decode(&json!({"event_name": "heartbeat"})).unwrap();
        assert_eq!(hb, ServerMessage::Heartbeat);

        let ok = ServerMessage::decode(&json!({
            "event_name": "sub_ok",
            "data": {"channels": ["contacts", "orders"]}
        }))
        .unwrap();
        assert_eq!(
            ok,
            ServerMessage::SubscribeOk {
                channels: vec!["contacts".into(), "orders".into()]
            }
        );
    }

    #[test]
    fn decode_rejects_unknown_frames() {
        assert!(ServerMessage::decode(&json!({"event_name": "mystery"})).is_err());
        assert!(ServerMessage::decode(&json!({"data": {}})).is_err());
    }

    #[test]
    fn payload_decode_upsert() {
        let payload = json!({
            "model": "contact",
            "op": "upsert",
            "record": {"id": 7, "updated_at": 1000, "fields": {"name": "Alice"}}
        });

        let decoded = EventPayload::decode(&payload).unwrap();
        assert_eq!(decoded.model, "contact");
        let RemoteChange::Upsert { record } = decoded.change else {
            panic!("expected upsert");
        };
        assert_eq!(record.id, 7);
        assert_eq!(record.fields.get("name"), Some(&json!("Alice")));
    }

    #[test]
    fn payload_decode_malformed_is_error() {
        assert!(EventPayload::decode(&json!({"op": "upsert"})).is_err());
        assert!(EventPayload::decode(&json!("not an object")).is_err());
    }
}
