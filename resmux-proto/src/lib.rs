//! # resmux-proto
//!
//! Shared wire protocol types for the resmux client.
//!
//! The protocol is a resource-oriented RPC carried as JSON objects over a
//! framed text transport (typically WebSocket). Three message shapes exist:
//!
//! - **Request** (client → server): `{ id, method, params? }` where `method`
//!   is `<verb>.<rid>[.<name>]` and verb is one of `subscribe`,
//!   `unsubscribe`, `call`, `auth`.
//! - **Response** (server → client): `{ id, result }` or
//!   `{ id, error: { code, message, data? } }`.
//! - **Event** (server → client): `{ event: "<rid>.<name>", data? }`.
//!
//! Resources are named by a *rid*, a dot-separated string such as
//! `service.type.instance`. The first two dot-segments form the rid's *type
//! prefix*, used to select a model type on the client.
//!
//! Key deletion on the wire is expressed with the sentinel object
//! `{"action": "delete"}`; clients represent deleted keys as absent and
//! translate at this boundary.

use serde::{Deserialize, Serialize};
use serde_json::Value;

// ════════════════════════════════════════════════════════════════════
// Method verbs
// ════════════════════════════════════════════════════════════════════

pub const VERB_SUBSCRIBE: &str = "subscribe";
pub const VERB_UNSUBSCRIBE: &str = "unsubscribe";
pub const VERB_CALL: &str = "call";
pub const VERB_AUTH: &str = "auth";

/// Builds a `<verb>.<rid>` method string.
pub fn method(verb: &str, rid: &str) -> String {
    format!("{verb}.{rid}")
}

/// Builds a `<verb>.<rid>.<name>` method string.
pub fn method_with_name(verb: &str, rid: &str, name: &str) -> String {
    format!("{verb}.{rid}.{name}")
}

// ════════════════════════════════════════════════════════════════════
// Client → Server
// ════════════════════════════════════════════════════════════════════

/// Request message from the client.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Request {
    /// Unique request identifier, monotonically increasing per connection
    /// owner.
    pub id: u64,

    /// Method name, `<verb>.<rid>[.<name>]`.
    pub method: String,

    /// Method parameters (optional).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl Request {
    pub fn new(id: u64, method: impl Into<String>) -> Self {
        Self {
            id,
            method: method.into(),
            params: None,
        }
    }

    pub fn with_params(id: u64, method: impl Into<String>, params: Value) -> Self {
        Self {
            id,
            method: method.into(),
            params: Some(params),
        }
    }
}

// ════════════════════════════════════════════════════════════════════
// Server → Client
// ════════════════════════════════════════════════════════════════════

/// Response message from the server, correlated to a request by `id`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Response {
    /// Error response. Listed first so a frame carrying both `result` and
    /// `error` keys resolves to the error branch.
    Error {
        id: u64,
        error: ErrorObject,
    },
    /// Success response.
    Result {
        id: u64,
        result: Value,
    },
}

impl Response {
    pub fn id(&self) -> u64 {
        match self {
            Self::Error { id, .. } | Self::Result { id, .. } => *id,
        }
    }

    /// Extracts the result or the error object.
    pub fn into_result(self) -> Result<Value, ErrorObject> {
        match self {
            Self::Result { result, .. } => Ok(result),
            Self::Error { error, .. } => Err(error),
        }
    }
}

/// Error object carried in an error response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorObject {
    /// Machine-readable error code, e.g. `"system.notFound"`.
    pub code: String,

    /// Human-readable message.
    pub message: String,

    /// Additional error details (optional).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

/// Event frame pushed by the server for a subscribed resource.
///
/// `event` is `<rid>.<name>`; split with [`split_event`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventFrame {
    pub event: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

/// Any inbound frame: a response or an event.
///
/// Frames matching neither shape fail to parse and must be treated as
/// protocol errors by the caller.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum Inbound {
    Response(Response),
    Event(EventFrame),
}

/// Parses one inbound text frame.
pub fn parse_inbound(text: &str) -> Result<Inbound, serde_json::Error> {
    serde_json::from_str(text.trim())
}

/// Serializes an outbound request to a text frame.
pub fn serialize_request(request: &Request) -> Result<String, serde_json::Error> {
    serde_json::to_string(request)
}

// ════════════════════════════════════════════════════════════════════
// Resource ids
// ════════════════════════════════════════════════════════════════════

/// Returns the type prefix of a rid: its first two dot-segments.
///
/// Rids with fewer than two segments use the whole rid as prefix.
pub fn type_prefix(rid: &str) -> &str {
    let mut dots = rid.char_indices().filter(|&(_, c)| c == '.');
    dots.next();
    match dots.next() {
        Some((idx, _)) => &rid[..idx],
        None => rid,
    }
}

/// Splits an event path `<rid>.<name>` on its **last** dot.
///
/// Returns `None` when there is no dot or the name after it is empty; such
/// paths are malformed.
pub fn split_event(event: &str) -> Option<(&str, &str)> {
    let idx = event.rfind('.')?;
    let (rid, name) = (&event[..idx], &event[idx + 1..]);
    if rid.is_empty() || name.is_empty() {
        return None;
    }
    Some((rid, name))
}

// ════════════════════════════════════════════════════════════════════
// Delete sentinel
// ════════════════════════════════════════════════════════════════════

/// The `action` value marking a key deletion on the wire.
pub const DELETE_ACTION: &str = "delete";

/// Builds the wire representation of a key deletion: `{"action": "delete"}`.
pub fn delete_sentinel() -> Value {
    serde_json::json!({ "action": DELETE_ACTION })
}

/// Returns `true` if `value` is the delete sentinel.
pub fn is_delete_sentinel(value: &Value) -> bool {
    match value.as_object() {
        Some(map) => {
            map.len() == 1 && map.get("action").and_then(Value::as_str) == Some(DELETE_ACTION)
        }
        None => false,
    }
}

// ════════════════════════════════════════════════════════════════════
// Tests
// ════════════════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_serialization() {
        let req = Request::new(1, "subscribe.user.42");
        let json = serialize_request(&req).unwrap();
        assert!(json.contains("\"id\":1"));
        assert!(json.contains("\"method\":\"subscribe.user.42\""));
        assert!(!json.contains("params"));

        let req = Request::with_params(2, "call.user.42.set", serde_json::json!({"name": "A"}));
        let json = serialize_request(&req).unwrap();
        assert!(json.contains("\"params\":{\"name\":\"A\"}"));
    }

    #[test]
    fn response_result_parse() {
        let frame = r#"{"id":3,"result":{"data":{"name":"A"}}}"#;
        match parse_inbound(frame).unwrap() {
            Inbound::Response(resp) => {
                assert_eq!(resp.id(), 3);
                let result = resp.into_result().unwrap();
                assert_eq!(result["data"]["name"], "A");
            }
            _ => panic!("expected response"),
        }
    }

    #[test]
    fn response_error_parse() {
        let frame = r#"{"id":4,"error":{"code":"system.notFound","message":"Not found"}}"#;
        match parse_inbound(frame).unwrap() {
            Inbound::Response(resp) => {
                let err = resp.into_result().unwrap_err();
                assert_eq!(err.code, "system.notFound");
                assert_eq!(err.message, "Not found");
                assert!(err.data.is_none());
            }
            _ => panic!("expected response"),
        }
    }

    #[test]
    fn event_parse() {
        let frame = r#"{"event":"user.42.change","data":{"name":"B"}}"#;
        match parse_inbound(frame).unwrap() {
            Inbound::Event(ev) => {
                assert_eq!(ev.event, "user.42.change");
                assert_eq!(ev.data.unwrap()["name"], "B");
            }
            _ => panic!("expected event"),
        }
    }

    #[test]
    fn malformed_frames_fail() {
        assert!(parse_inbound("{}").is_err());
        assert!(parse_inbound(r#"{"id":1}"#).is_err());
        assert!(parse_inbound("not json").is_err());
    }

    #[test]
    fn type_prefix_segments() {
        assert_eq!(type_prefix("service.type.instance"), "service.type");
        assert_eq!(type_prefix("service.type"), "service.type");
        assert_eq!(type_prefix("service"), "service");
        assert_eq!(type_prefix(""), "");
    }

    #[test]
    fn split_event_on_last_dot() {
        assert_eq!(split_event("user.42.change"), Some(("user.42", "change")));
        assert_eq!(split_event("rooms.add"), Some(("rooms", "add")));
        assert_eq!(split_event("rooms."), None);
        assert_eq!(split_event(".change"), None);
        assert_eq!(split_event("change"), None);
    }

    #[test]
    fn delete_sentinel_roundtrip() {
        assert!(is_delete_sentinel(&delete_sentinel()));
        assert!(!is_delete_sentinel(&serde_json::json!({"action": "remove"})));
        assert!(!is_delete_sentinel(
            &serde_json::json!({"action": "delete", "extra": 1})
        ));
        assert!(!is_delete_sentinel(&serde_json::json!("delete")));
        assert!(!is_delete_sentinel(&Value::Null));
    }

    #[test]
    fn method_builders() {
        assert_eq!(method(VERB_SUBSCRIBE, "user.42"), "subscribe.user.42");
        assert_eq!(
            method_with_name(VERB_CALL, "user.42", "set"),
            "call.user.42.set"
        );
        assert_eq!(
            method_with_name(VERB_AUTH, "auth.vault", "login"),
            "auth.auth.vault.login"
        );
    }
}
