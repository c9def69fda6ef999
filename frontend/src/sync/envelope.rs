//! Versioned wire envelope: `{"type": ..., "payload": {...}, "v": "v1", "source": ...}`.
//!
//! Decoding is deliberately two-step. The outer object is read loosely first
//! so a message from a newer build (different `v`, unknown `type`) is
//! rejected with a precise reason instead of a generic parse failure.

use serde::Serialize;
use serde_json::{Map, Value};
use shared::{MessageKind, SyncMessage, PROTOCOL_VERSION};

#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    pub message: SyncMessage,
    /// Sending context; absent on envelopes from builds that never set it.
    pub source: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EnvelopeRejection {
    #[error("not a JSON object: {0}")]
    NotJson(String),
    #[error("unsupported protocol version {0:?}")]
    UnsupportedVersion(Option<String>),
    #[error("unknown message type {0:?}")]
    UnknownType(Option<String>),
    #[error("malformed {kind} payload: {reason}")]
    Malformed { kind: MessageKind, reason: String },
}

#[derive(Serialize)]
struct OutgoingEnvelope<'a> {
    #[serde(rename = "type")]
    kind: &'static str,
    payload: Value,
    v: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    source: Option<&'a str>,
}

pub fn encode(message: &SyncMessage, source: Option<&str>) -> Result<String, serde_json::Error> {
    let payload = match message {
        SyncMessage::Init(payload) => serde_json::to_value(payload)?,
        SyncMessage::Control(payload) => serde_json::to_value(payload)?,
        SyncMessage::SyncRequest(payload) => serde_json::to_value(payload)?,
        SyncMessage::SyncResponse(snapshot) => serde_json::to_value(snapshot)?,
        SyncMessage::Ping(payload) | SyncMessage::Pong(payload) => serde_json::to_value(payload)?,
    };
    serde_json::to_string(&OutgoingEnvelope {
        kind: message.kind().as_str(),
        payload,
        v: PROTOCOL_VERSION,
        source,
    })
}

pub fn decode(raw: &str) -> Result<Envelope, EnvelopeRejection> {
    let value: Value =
        serde_json::from_str(raw).map_err(|error| EnvelopeRejection::NotJson(error.to_string()))?;
    let Value::Object(mut object) = value else {
        return Err(EnvelopeRejection::NotJson("top level is not an object".to_string()));
    };

    let version = object.get("v").and_then(Value::as_str);
    if version != Some(PROTOCOL_VERSION) {
        return Err(EnvelopeRejection::UnsupportedVersion(version.map(str::to_string)));
    }

    let type_name = object.get("type").and_then(Value::as_str);
    let Some(kind) = type_name.and_then(MessageKind::parse) else {
        return Err(EnvelopeRejection::UnknownType(type_name.map(str::to_string)));
    };

    let source = object
        .get("source")
        .and_then(Value::as_str)
        .filter(|source| !source.is_empty())
        .map(str::to_string);

    let payload = match object.remove("payload") {
        None | Some(Value::Null) => Value::Object(Map::new()),
        Some(payload) => payload,
    };

    let message = typed_message(kind, payload).map_err(|error| EnvelopeRejection::Malformed {
        kind,
        reason: error.to_string(),
    })?;

    Ok(Envelope { message, source })
}

fn typed_message(kind: MessageKind, payload: Value) -> Result<SyncMessage, serde_json::Error> {
    Ok(match kind {
        MessageKind::Init => SyncMessage::Init(serde_json::from_value(payload)?),
        MessageKind::Control => SyncMessage::Control(serde_json::from_value(payload)?),
        MessageKind::SyncRequest => SyncMessage::SyncRequest(serde_json::from_value(payload)?),
        MessageKind::SyncResponse => SyncMessage::SyncResponse(serde_json::from_value(payload)?),
        MessageKind::Ping => SyncMessage::Ping(serde_json::from_value(payload)?),
        MessageKind::Pong => SyncMessage::Pong(serde_json::from_value(payload)?),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared::{ControlAction, ControlPayload, HeartbeatPayload, SyncRequestPayload};

    #[test]
    fn encoded_envelope_has_wire_shape() {
        let message = SyncMessage::Control(ControlPayload {
            directory_id: Some("dir-1".to_string()),
            action: ControlAction::Add30,
        });
        let raw = encode(&message, Some("ctx-a")).unwrap();
        let value: Value = serde_json::from_str(&raw).unwrap();

        assert_eq!(value["type"], "CONTROL");
        assert_eq!(value["v"], "v1");
        assert_eq!(value["source"], "ctx-a");
        assert_eq!(value["payload"]["action"], "ADD30");
        assert_eq!(value["payload"]["directoryId"], "dir-1");

        let decoded = decode(&raw).unwrap();
        assert_eq!(decoded.message, message);
        assert_eq!(decoded.source.as_deref(), Some("ctx-a"));
    }

    #[test]
    fn version_is_checked_before_type() {
        assert_eq!(
            decode(r#"{"type":"PING","payload":{},"v":"v2"}"#),
            Err(EnvelopeRejection::UnsupportedVersion(Some("v2".to_string())))
        );
        assert_eq!(
            decode(r#"{"type":"BOGUS","payload":{}}"#),
            Err(EnvelopeRejection::UnsupportedVersion(None))
        );
        assert_eq!(
            decode(r#"{"type":"BOGUS","payload":{},"v":"v1"}"#),
            Err(EnvelopeRejection::UnknownType(Some("BOGUS".to_string())))
        );
        assert_eq!(
            decode(r#"{"payload":{},"v":"v1"}"#),
            Err(EnvelopeRejection::UnknownType(None))
        );
    }

    #[test]
    fn garbage_is_not_json() {
        assert!(matches!(decode("{"), Err(EnvelopeRejection::NotJson(_))));
        assert!(matches!(decode("[1,2]"), Err(EnvelopeRejection::NotJson(_))));
    }

    #[test]
    fn missing_payload_decodes_with_defaults() {
        let envelope = decode(r#"{"type":"SYNC_REQUEST","v":"v1"}"#).unwrap();
        assert_eq!(
            envelope.message,
            SyncMessage::SyncRequest(SyncRequestPayload::default())
        );
        assert_eq!(envelope.source, None);

        let envelope = decode(r#"{"type":"PING","payload":null,"v":"v1"}"#).unwrap();
        assert_eq!(envelope.message, SyncMessage::Ping(HeartbeatPayload::default()));
    }

    #[test]
    fn bad_payload_is_malformed() {
        let rejection = decode(r#"{"type":"CONTROL","payload":{"action":"JUMP"},"v":"v1"}"#);
        assert!(matches!(
            rejection,
            Err(EnvelopeRejection::Malformed {
                kind: MessageKind::Control,
                ..
            })
        ));

        let rejection = decode(r#"{"type":"SYNC_RESPONSE","payload":{},"v":"v1"}"#);
        assert!(matches!(
            rejection,
            Err(EnvelopeRejection::Malformed {
                kind: MessageKind::SyncResponse,
                ..
            })
        ));
    }
}
