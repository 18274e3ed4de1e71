//! Protocol envelopes.
//!
//! Every message that crosses the boundary is a JSON object carrying the
//! `"type": "@bridge"` marker, a kebab-case `action` discriminant and a
//! `sessionId`. [`Envelope`] is the closed set of those messages; [`classify`]
//! turns an arbitrary inbound value into one of them or rejects it.

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};

use crate::errors::ErrorBody;
use crate::ids::{RequestId, SessionId};

/// Value of the marker field on every protocol message.
pub const MARKER: &str = "@bridge";

/// Name of the marker field.
pub const MARKER_FIELD: &str = "type";

/// Discriminant of an [`Envelope`], usable as an event name.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum MessageKind {
    /// Guest → host: start a session.
    HandshakeRequest,
    /// Host → guest: session accepted.
    HandshakeResponse,
    /// Guest → host: session confirmed.
    HandshakeAck,
    /// Invoke a remote method.
    Call,
    /// Outcome of a call.
    Response,
    /// Fire-and-forget event.
    Event,
}

impl MessageKind {
    /// Every kind, in handshake-then-traffic order.
    pub const ALL: [Self; 6] = [
        Self::HandshakeRequest,
        Self::HandshakeResponse,
        Self::HandshakeAck,
        Self::Call,
        Self::Response,
        Self::Event,
    ];

    /// The wire `action` string.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::HandshakeRequest => "handshake-request",
            Self::HandshakeResponse => "handshake-response",
            Self::HandshakeAck => "handshake-ack",
            Self::Call => "call",
            Self::Response => "response",
            Self::Event => "event",
        }
    }
}

/// Payload of the three handshake messages.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Handshake {
    /// Session being negotiated.
    pub session_id: SessionId,
}

/// A remote method invocation.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallMessage {
    /// Session the call belongs to.
    pub session_id: SessionId,
    /// Correlates the eventual response.
    pub request_id: RequestId,
    /// Name of the method to invoke.
    pub method_name: String,
    /// Positional arguments.
    pub args: Vec<Value>,
}

/// Outcome of a [`CallMessage`].
///
/// `result` distinguishes "absent" (`None`) from "present and null"
/// (`Some(Value::Null)`); absent fields are omitted on the wire.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResponseMessage {
    /// Session the response belongs to.
    pub session_id: SessionId,
    /// Request being answered.
    pub request_id: RequestId,
    /// Returned value, if any.
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        deserialize_with = "present"
    )]
    pub result: Option<Value>,
    /// Failure, if the method threw.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorBody>,
}

impl ResponseMessage {
    /// Collapse into the caller-facing outcome. An error wins over a result;
    /// an absent result reads as `null`.
    pub fn into_outcome(self) -> Result<Value, ErrorBody> {
        match self.error {
            Some(error) => Err(error),
            None => Ok(self.result.unwrap_or(Value::Null)),
        }
    }
}

/// A broadcast event.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventMessage {
    /// Session the event belongs to.
    pub session_id: SessionId,
    /// Event name listeners subscribe to.
    pub event_name: String,
    /// Event payload.
    #[serde(default)]
    pub payload: Value,
}

/// Any protocol message.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "kebab-case")]
pub enum Envelope {
    /// See [`MessageKind::HandshakeRequest`].
    HandshakeRequest(Handshake),
    /// See [`MessageKind::HandshakeResponse`].
    HandshakeResponse(Handshake),
    /// See [`MessageKind::HandshakeAck`].
    HandshakeAck(Handshake),
    /// See [`MessageKind::Call`].
    Call(CallMessage),
    /// See [`MessageKind::Response`].
    Response(ResponseMessage),
    /// See [`MessageKind::Event`].
    Event(EventMessage),
}

impl Envelope {
    /// Build a handshake request.
    pub fn handshake_request(session_id: SessionId) -> Self {
        Self::HandshakeRequest(Handshake { session_id })
    }

    /// Build a handshake response.
    pub fn handshake_response(session_id: SessionId) -> Self {
        Self::HandshakeResponse(Handshake { session_id })
    }

    /// Build a handshake acknowledgement.
    pub fn handshake_ack(session_id: SessionId) -> Self {
        Self::HandshakeAck(Handshake { session_id })
    }

    /// Build a call.
    pub fn call(
        session_id: SessionId,
        request_id: RequestId,
        method_name: impl Into<String>,
        args: Vec<Value>,
    ) -> Self {
        Self::Call(CallMessage {
            session_id,
            request_id,
            method_name: method_name.into(),
            args,
        })
    }

    /// Build a response from a method outcome.
    pub fn response(
        session_id: SessionId,
        request_id: RequestId,
        outcome: Result<Value, ErrorBody>,
    ) -> Self {
        let (result, error) = match outcome {
            Ok(value) => (Some(value), None),
            Err(error) => (None, Some(error)),
        };
        Self::Response(ResponseMessage {
            session_id,
            request_id,
            result,
            error,
        })
    }

    /// Build an event.
    pub fn event(session_id: SessionId, event_name: impl Into<String>, payload: Value) -> Self {
        Self::Event(EventMessage {
            session_id,
            event_name: event_name.into(),
            payload,
        })
    }

    /// This envelope's discriminant.
    pub fn kind(&self) -> MessageKind {
        match self {
            Self::HandshakeRequest(_) => MessageKind::HandshakeRequest,
            Self::HandshakeResponse(_) => MessageKind::HandshakeResponse,
            Self::HandshakeAck(_) => MessageKind::HandshakeAck,
            Self::Call(_) => MessageKind::Call,
            Self::Response(_) => MessageKind::Response,
            Self::Event(_) => MessageKind::Event,
        }
    }

    /// Session this envelope is tagged with.
    pub fn session_id(&self) -> SessionId {
        match self {
            Self::HandshakeRequest(h) | Self::HandshakeResponse(h) | Self::HandshakeAck(h) => {
                h.session_id
            }
            Self::Call(c) => c.session_id,
            Self::Response(r) => r.session_id,
            Self::Event(e) => e.session_id,
        }
    }

    /// Encode for the wire, marker included.
    pub fn to_value(&self) -> serde_json::Result<Value> {
        let mut map = match serde_json::to_value(self)? {
            Value::Object(map) => map,
            other => {
                let mut map = Map::new();
                let _ = map.insert("value".into(), other);
                map
            }
        };
        let _ = map.insert(MARKER_FIELD.into(), Value::String(MARKER.into()));
        Ok(Value::Object(map))
    }
}

/// Whether `value` carries the protocol marker.
pub fn is_protocol_message(value: &Value) -> bool {
    value.get(MARKER_FIELD).and_then(Value::as_str) == Some(MARKER)
}

/// Classify an inbound value.
///
/// Returns `None` for anything that is not a well-formed protocol message:
/// non-objects, values without the marker, unknown actions and
/// wrongly-shaped fields. Never panics.
pub fn classify(value: &Value) -> Option<Envelope> {
    if !is_protocol_message(value) {
        return None;
    }
    Envelope::deserialize(value).ok()
}

fn present<'de, D>(deserializer: D) -> Result<Option<Value>, D::Error>
where
    D: Deserializer<'de>,
{
    Value::deserialize(deserializer).map(Some)
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use proptest::prelude::*;
    use serde_json::json;

    use super::*;

    fn sid(n: u64) -> SessionId {
        SessionId::new(n)
    }

    fn rid(n: u64) -> RequestId {
        RequestId::new(n)
    }

    #[test]
    fn handshake_request_wire_shape() {
        let wire = Envelope::handshake_request(sid(1)).to_value().unwrap();
        assert_eq!(
            wire,
            json!({"type": "@bridge", "action": "handshake-request", "sessionId": 1})
        );
    }

    #[test]
    fn call_wire_shape() {
        let wire = Envelope::call(sid(2), rid(0), "add", vec![json!(2), json!(3)])
            .to_value()
            .unwrap();
        assert_eq!(
            wire,
            json!({
                "type": "@bridge",
                "action": "call",
                "sessionId": 2,
                "requestId": 0,
                "methodName": "add",
                "args": [2, 3],
            })
        );
    }

    #[test]
    fn response_omits_absent_fields() {
        let ok = Envelope::response(sid(1), rid(4), Ok(json!(5)))
            .to_value()
            .unwrap();
        assert_eq!(ok["result"], json!(5));
        assert!(ok.get("error").is_none());

        let err = Envelope::response(sid(1), rid(4), Err(ErrorBody::message("boom")))
            .to_value()
            .unwrap();
        assert!(err.get("result").is_none());
        assert_eq!(err["error"], json!({"name": "Error", "message": "boom"}));
    }

    #[test]
    fn response_null_result_is_distinct_from_absent() {
        let with_null = json!({
            "type": "@bridge", "action": "response", "sessionId": 1, "requestId": 0, "result": null
        });
        let absent = json!({
            "type": "@bridge", "action": "response", "sessionId": 1, "requestId": 0
        });

        assert_matches!(
            classify(&with_null),
            Some(Envelope::Response(ResponseMessage { result: Some(Value::Null), .. }))
        );
        assert_matches!(
            classify(&absent),
            Some(Envelope::Response(ResponseMessage { result: None, error: None, .. }))
        );

        // A present null survives re-encoding.
        let reencoded = Envelope::response(sid(1), rid(0), Ok(Value::Null))
            .to_value()
            .unwrap();
        assert_eq!(reencoded.get("result"), Some(&Value::Null));
    }

    #[test]
    fn into_outcome_prefers_error() {
        let msg = ResponseMessage {
            session_id: sid(1),
            request_id: rid(0),
            result: Some(json!(1)),
            error: Some(ErrorBody::message("nope")),
        };
        assert_eq!(msg.into_outcome(), Err(ErrorBody::message("nope")));
    }

    #[test]
    fn into_outcome_absent_result_is_null() {
        let msg = ResponseMessage {
            session_id: sid(1),
            request_id: rid(0),
            result: None,
            error: None,
        };
        assert_eq!(msg.into_outcome(), Ok(Value::Null));
    }

    #[test]
    fn event_without_payload_defaults_to_null() {
        let raw = json!({"type": "@bridge", "action": "event", "sessionId": 3, "eventName": "ping"});
        let env = classify(&raw).unwrap();
        assert_eq!(env, Envelope::event(sid(3), "ping", Value::Null));
    }

    #[test]
    fn classify_roundtrips_every_kind() {
        let envelopes = [
            Envelope::handshake_request(sid(1)),
            Envelope::handshake_response(sid(1)),
            Envelope::handshake_ack(sid(1)),
            Envelope::call(sid(1), rid(9), "m", vec![json!({"a": [1, 2]})]),
            Envelope::response(sid(1), rid(9), Ok(json!("ok"))),
            Envelope::event(sid(1), "tick", json!([1, 2, 3])),
        ];
        for (env, kind) in envelopes.iter().zip(MessageKind::ALL) {
            let wire = env.to_value().unwrap();
            assert_eq!(wire["action"], json!(kind.as_str()));
            let back = classify(&wire).unwrap();
            assert_eq!(&back, env);
            assert_eq!(back.kind(), kind);
            assert_eq!(back.session_id(), sid(1));
        }
    }

    #[test]
    fn classify_rejects_foreign_traffic() {
        assert!(classify(&json!("hello")).is_none());
        assert!(classify(&json!(null)).is_none());
        assert!(classify(&json!([1, 2])).is_none());
        assert!(classify(&json!({"action": "call"})).is_none());
        assert!(classify(&json!({"type": "other", "action": "event", "sessionId": 1})).is_none());
    }

    #[test]
    fn classify_rejects_unknown_action() {
        let raw = json!({"type": "@bridge", "action": "teleport", "sessionId": 1});
        assert!(classify(&raw).is_none());
    }

    #[test]
    fn classify_rejects_wrong_shapes() {
        let bad_session = json!({"type": "@bridge", "action": "handshake-ack", "sessionId": "one"});
        assert!(classify(&bad_session).is_none());

        let missing_method = json!({
            "type": "@bridge", "action": "call", "sessionId": 1, "requestId": 0, "args": []
        });
        assert!(classify(&missing_method).is_none());

        let negative = json!({"type": "@bridge", "action": "handshake-request", "sessionId": -1});
        assert!(classify(&negative).is_none());
    }

    #[test]
    fn marker_predicate() {
        assert!(is_protocol_message(&json!({"type": "@bridge"})));
        assert!(!is_protocol_message(&json!({"type": 1})));
    }

    proptest! {
        #[test]
        fn classify_never_panics_on_arbitrary_text(text in ".{0,64}") {
            if let Ok(value) = serde_json::from_str::<Value>(&text) {
                let _ = classify(&value);
            }
        }

        #[test]
        fn classify_never_panics_on_marked_objects(
            action in "[a-z-]{0,20}",
            session in any::<i64>(),
            extra in any::<Option<String>>(),
        ) {
            let mut raw = json!({"type": MARKER, "action": action, "sessionId": session});
            if let Some(extra) = extra {
                raw["methodName"] = json!(extra);
            }
            let _ = classify(&raw);
        }

        #[test]
        fn event_payload_survives_wire(session in any::<u64>(), name in "[a-zA-Z]{1,12}", n in any::<i64>()) {
            let env = Envelope::event(SessionId::new(session), name, json!({"n": n}));
            let wire = env.to_value().unwrap();
            prop_assert_eq!(classify(&wire), Some(env));
        }
    }
}
