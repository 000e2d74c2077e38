//! Wire message types.
//!
//! Outbound requests carry a `seq` that doubles as the correlation id; the
//! server echoes it back as `request_seq` on the matching response. Events are
//! server-initiated and carry no `request_seq`.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

use crate::error::BridgeError;

/// Ordered request arguments.
pub type Arguments = serde_json::Map<String, serde_json::Value>;

static NEXT_CORRELATION_ID: AtomicU64 = AtomicU64::new(1);

/// Next id from the process-wide monotonic counter.
pub fn next_correlation_id() -> u64 {
    NEXT_CORRELATION_ID.fetch_add(1, Ordering::Relaxed)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    pub command: String,
    #[serde(default)]
    pub arguments: Arguments,
    #[serde(rename = "seq")]
    pub correlation_id: u64,
    #[serde(rename = "type")]
    kind: RequestType,
}

impl Request {
    /// Build a request with a fresh correlation id.
    pub fn new(command: impl Into<String>, arguments: Arguments) -> Self {
        Self::with_id(next_correlation_id(), command, arguments)
    }

    /// Build a request with a caller-supplied correlation id.
    pub fn with_id(correlation_id: u64, command: impl Into<String>, arguments: Arguments) -> Self {
        Self {
            command: command.into(),
            arguments,
            correlation_id,
            kind: RequestType::Request,
        }
    }
}

/// The `"type": "request"` tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
enum RequestType {
    Request,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Response {
    pub command: String,
    #[serde(rename = "request_seq")]
    pub correlation_id: u64,
    #[serde(rename = "seq", default)]
    pub sequence: u64,
    pub success: bool,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub body: Option<serde_json::Value>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Event {
    #[serde(rename = "event")]
    pub name: String,
    #[serde(rename = "seq", default)]
    pub sequence: u64,
    #[serde(default)]
    pub body: Option<serde_json::Value>,
}

impl Event {
    pub fn new(name: impl Into<String>, sequence: u64, body: Option<serde_json::Value>) -> Self {
        Self {
            name: name.into(),
            sequence,
            body,
        }
    }
}

/// A decoded inbound payload.
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    Response(Response),
    Event(Event),
}

/// Serialize a request to its JSON body (no framing).
pub fn encode_request(request: &Request) -> Result<Vec<u8>, BridgeError> {
    serde_json::to_vec(request)
        .map_err(|e| BridgeError::transport(format!("failed to encode request: {e}")))
}

/// Parse a request body. Used by test servers and diagnostics.
pub fn decode_request(body: &[u8]) -> Result<Request, BridgeError> {
    serde_json::from_slice(body).map_err(|e| BridgeError::protocol(format!("invalid request: {e}")))
}

/// Parse a frame body and classify it by field shape.
///
/// `request_seq` + `success` is a response; `event` without `request_seq` is
/// an event; anything else is malformed.
pub fn decode_inbound(body: &[u8]) -> Result<Inbound, BridgeError> {
    let value: serde_json::Value = serde_json::from_slice(body)
        .map_err(|e| BridgeError::protocol(format!("invalid JSON: {e}")))?;

    let Some(object) = value.as_object() else {
        return Err(BridgeError::protocol("payload is not a JSON object"));
    };

    let has_correlation = object.contains_key("request_seq");
    if has_correlation && object.contains_key("success") {
        return serde_json::from_value(value)
            .map(Inbound::Response)
            .map_err(|e| BridgeError::protocol(format!("invalid response: {e}")));
    }
    if !has_correlation && object.contains_key("event") {
        return serde_json::from_value(value)
            .map(Inbound::Event)
            .map_err(|e| BridgeError::protocol(format!("invalid event: {e}")));
    }

    Err(BridgeError::protocol("payload is neither a response nor an event"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn args(value: serde_json::Value) -> Arguments {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn request_serializes() {
        let req = Request::with_id(
            7,
            "autocomplete",
            args(json!({"FileName": "Program.cs", "Line": 10, "Column": 5})),
        );
        insta::assert_json_snapshot!(req, @r#"
        {
          "command": "autocomplete",
          "arguments": {
            "FileName": "Program.cs",
            "Line": 10,
            "Column": 5
          },
          "seq": 7,
          "type": "request"
        }
        "#);
    }

    #[test]
    fn correlation_ids_are_monotonic() {
        let a = Request::new("a", Arguments::new());
        let b = Request::new("b", Arguments::new());
        assert!(b.correlation_id > a.correlation_id);
    }

    #[test]
    fn request_roundtrip() {
        let req = Request::new("codecheck", args(json!({"FileName": "Ünïcødé.cs"})));
        let body = encode_request(&req).unwrap();
        let decoded = decode_request(&body).unwrap();
        assert_eq!(decoded, req);
    }

    #[test]
    fn classifies_response() {
        let body = br#"{"command":"autocomplete","request_seq":3,"seq":9,"type":"response","success":true,"message":null,"body":{"Items":[]}}"#;
        match decode_inbound(body).unwrap() {
            Inbound::Response(resp) => {
                assert_eq!(resp.command, "autocomplete");
                assert_eq!(resp.correlation_id, 3);
                assert_eq!(resp.sequence, 9);
                assert!(resp.success);
                assert_eq!(resp.message, None);
                assert_eq!(resp.body, Some(json!({"Items": []})));
            }
            other => panic!("expected response, got {other:?}"),
        }
    }

    #[test]
    fn classifies_failed_response() {
        let body = br#"{"command":"format","request_seq":4,"seq":1,"type":"response","success":false,"message":"no such file"}"#;
        let Inbound::Response(resp) = decode_inbound(body).unwrap() else {
            panic!("expected response");
        };
        assert!(!resp.success);
        assert_eq!(resp.message.as_deref(), Some("no such file"));
        assert_eq!(resp.body, None);
    }

    #[test]
    fn classifies_event() {
        let body = br#"{"event":"ProjectAdded","seq":12,"type":"event","body":{"Name":"App"}}"#;
        let Inbound::Event(event) = decode_inbound(body).unwrap() else {
            panic!("expected event");
        };
        assert_eq!(event.name, "ProjectAdded");
        assert_eq!(event.sequence, 12);
        assert_eq!(event.body, Some(json!({"Name": "App"})));
    }

    #[test]
    fn event_with_request_seq_is_not_an_event() {
        let body = br#"{"event":"x","request_seq":1,"seq":1}"#;
        assert!(matches!(
            decode_inbound(body),
            Err(BridgeError::Protocol(_))
        ));
    }

    #[test]
    fn rejects_unclassifiable_payloads() {
        for body in [
            &br#"{"seq":1,"type":"response"}"#[..],
            &br#"[1,2,3]"#[..],
            &b"not json"[..],
            &br#"{"request_seq":"one","success":true,"command":"x"}"#[..],
        ] {
            assert!(matches!(
                decode_inbound(body),
                Err(BridgeError::Protocol(_))
            ));
        }
    }
}
