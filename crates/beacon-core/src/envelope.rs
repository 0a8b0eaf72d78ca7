//! The JSON wire unit exchanged in both directions over the socket.
//!
//! Every frame is one [`Envelope`] tagged by `type`. Optional fields are
//! omitted from the encoded form when absent, so the same struct serves
//! `authenticate`, `execute`, `event`, `result` and the rest.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::errors::ProtocolError;
use crate::ids::RequestId;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnvelopeType {
    Authenticate,
    Subscribe,
    Unsubscribe,
    Execute,
    Event,
    Result,
    Error,
    Auth,
    Ping,
    Pong,
}

impl EnvelopeType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Authenticate => "authenticate",
            Self::Subscribe => "subscribe",
            Self::Unsubscribe => "unsubscribe",
            Self::Execute => "execute",
            Self::Event => "event",
            Self::Result => "result",
            Self::Error => "error",
            Self::Auth => "auth",
            Self::Ping => "ping",
            Self::Pong => "pong",
        }
    }
}

impl std::fmt::Display for EnvelopeType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    #[serde(rename = "type")]
    pub kind: EnvelopeType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub topic: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Map<String, Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<RequestId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth: Option<String>,
}

impl Envelope {
    fn bare(kind: EnvelopeType) -> Self {
        Self {
            kind,
            topic: None,
            tool: None,
            params: None,
            data: None,
            error: None,
            request_id: None,
            auth: None,
        }
    }

    pub fn authenticate(secret: impl Into<String>) -> Self {
        Self {
            auth: Some(secret.into()),
            ..Self::bare(EnvelopeType::Authenticate)
        }
    }

    pub fn subscribe(topic: impl Into<String>) -> Self {
        Self {
            topic: Some(topic.into()),
            ..Self::bare(EnvelopeType::Subscribe)
        }
    }

    pub fn unsubscribe(topic: impl Into<String>) -> Self {
        Self {
            topic: Some(topic.into()),
            ..Self::bare(EnvelopeType::Unsubscribe)
        }
    }

    pub fn execute(tool: impl Into<String>, params: Map<String, Value>, request_id: RequestId) -> Self {
        Self {
            tool: Some(tool.into()),
            params: Some(params),
            request_id: Some(request_id),
            ..Self::bare(EnvelopeType::Execute)
        }
    }

    pub fn event(topic: impl Into<String>, data: Value) -> Self {
        Self {
            topic: Some(topic.into()),
            data: Some(data),
            ..Self::bare(EnvelopeType::Event)
        }
    }

    pub fn result(request_id: RequestId, outcome: &ToolOutcome) -> Self {
        Self {
            request_id: Some(request_id),
            data: Some(outcome.to_value()),
            ..Self::bare(EnvelopeType::Result)
        }
    }

    pub fn error(request_id: Option<RequestId>, message: impl Into<String>) -> Self {
        Self {
            request_id,
            error: Some(message.into()),
            ..Self::bare(EnvelopeType::Error)
        }
    }

    pub fn auth_ok() -> Self {
        Self {
            data: Some(serde_json::json!({ "authenticated": true })),
            ..Self::bare(EnvelopeType::Auth)
        }
    }

    pub fn ping() -> Self {
        Self::bare(EnvelopeType::Ping)
    }

    pub fn pong() -> Self {
        Self::bare(EnvelopeType::Pong)
    }

    /// Parse one text frame.
    pub fn decode(raw: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(raw).map_err(|e| ProtocolError::Malformed(e.to_string()))
    }

    pub fn encode(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(|e| ProtocolError::Encode(e.to_string()))
    }

    pub fn require_topic(&self) -> Result<&str, ProtocolError> {
        self.topic.as_deref().ok_or(ProtocolError::MissingField {
            kind: self.kind.as_str(),
            field: "topic",
        })
    }

    pub fn require_tool(&self) -> Result<&str, ProtocolError> {
        self.tool.as_deref().ok_or(ProtocolError::MissingField {
            kind: self.kind.as_str(),
            field: "tool",
        })
    }

    /// True for an `auth` envelope whose payload reports success.
    pub fn is_auth_success(&self) -> bool {
        self.kind == EnvelopeType::Auth
            && self
                .data
                .as_ref()
                .and_then(|d| d.get("authenticated"))
                .and_then(Value::as_bool)
                .unwrap_or(false)
    }

    /// `result`/`error` envelopes that carry a request id belong to the correlator.
    pub fn is_correlated_response(&self) -> bool {
        matches!(self.kind, EnvelopeType::Result | EnvelopeType::Error) && self.request_id.is_some()
    }
}

/// Payload of a `result` envelope: `{success, result}` or `{success:false, error}`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ToolOutcome {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ToolOutcome {
    pub fn success(result: Value) -> Self {
        Self {
            success: true,
            result: Some(result),
            error: None,
        }
    }

    pub fn failure(message: impl Into<String>) -> Self {
        Self {
            success: false,
            result: None,
            error: Some(message.into()),
        }
    }

    /// Encode with `result` always present on success, `null` included.
    pub fn to_value(&self) -> Value {
        if self.success {
            serde_json::json!({
                "success": true,
                "result": self.result.clone().unwrap_or(Value::Null),
            })
        } else {
            serde_json::json!({
                "success": false,
                "error": self.error.clone().unwrap_or_default(),
            })
        }
    }

    pub fn from_value(value: &Value) -> Result<Self, ProtocolError> {
        serde_json::from_value(value.clone()).map_err(|e| ProtocolError::Malformed(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn authenticate_carries_secret() {
        let json: Value = serde_json::from_str(&Envelope::authenticate("s3cret").encode().unwrap()).unwrap();
        assert_eq!(json, json!({"type": "authenticate", "auth": "s3cret"}));
    }

    #[test]
    fn execute_uses_camel_case_request_id() {
        let env = Envelope::execute("getActiveSession", Map::new(), RequestId::from_raw("r1"));
        let json: Value = serde_json::from_str(&env.encode().unwrap()).unwrap();
        assert_eq!(
            json,
            json!({"type": "execute", "tool": "getActiveSession", "params": {}, "requestId": "r1"})
        );
    }

    #[test]
    fn success_result_keeps_null_result() {
        let env = Envelope::result(RequestId::from_raw("r1"), &ToolOutcome::success(Value::Null));
        let json: Value = serde_json::from_str(&env.encode().unwrap()).unwrap();
        assert_eq!(
            json,
            json!({"type": "result", "requestId": "r1", "data": {"success": true, "result": null}})
        );
    }

    #[test]
    fn failure_result_has_error() {
        let outcome = ToolOutcome::failure("Unknown tool: bogus");
        assert_eq!(
            outcome.to_value(),
            json!({"success": false, "error": "Unknown tool: bogus"})
        );
    }

    #[test]
    fn decode_rejects_unknown_type() {
        let err = Envelope::decode(r#"{"type":"teleport"}"#).unwrap_err();
        assert_eq!(err.error_kind(), "malformed");
    }

    #[test]
    fn decode_rejects_garbage() {
        assert!(Envelope::decode("not json").is_err());
    }

    #[test]
    fn decode_event_from_server() {
        let env = Envelope::decode(r#"{"type":"event","topic":"session.status","data":{"id":"s"}}"#).unwrap();
        assert_eq!(env.kind, EnvelopeType::Event);
        assert_eq!(env.require_topic().unwrap(), "session.status");
        assert!(env.require_tool().is_err());
    }

    #[test]
    fn auth_success_detection() {
        assert!(Envelope::auth_ok().is_auth_success());
        let denied = Envelope::decode(r#"{"type":"auth","data":{"authenticated":false}}"#).unwrap();
        assert!(!denied.is_auth_success());
    }

    #[test]
    fn correlated_response_needs_request_id() {
        assert!(Envelope::error(Some(RequestId::from_raw("r")), "x").is_correlated_response());
        assert!(!Envelope::error(None, "x").is_correlated_response());
        assert!(!Envelope::event("t", json!(1)).is_correlated_response());
    }

    #[test]
    fn outcome_from_value() {
        let outcome = ToolOutcome::from_value(&json!({"success": true, "result": {"a": 1}})).unwrap();
        assert!(outcome.success);
        assert_eq!(outcome.result, Some(json!({"a": 1})));
    }
}
