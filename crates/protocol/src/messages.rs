use serde::{Deserialize, Serialize};
use serde_json::Value;

// ---------------------------------------------------------------------------
// Invocation payloads
// ---------------------------------------------------------------------------

/// Calls a named remote method with positional arguments.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InvokeRequest {
    pub method: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<Value>,
}

/// Carries the typed result of a completed invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InvokeResult {
    pub value: Value,
}

// ---------------------------------------------------------------------------
// Push events
// ---------------------------------------------------------------------------

/// A named push notification with positional arguments, broadcast to the
/// members of a group. Argument count is bounded by
/// [`MAX_EVENT_ARGS`](crate::constants::MAX_EVENT_ARGS).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventNotification {
    pub event: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<Value>,
}

impl EventNotification {
    /// Convenience constructor for the common single-name events.
    pub fn with_name(event: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            event: event.into(),
            args: vec![Value::String(name.into())],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invoke_request_roundtrip() {
        let req = InvokeRequest {
            method: "register".into(),
            args: vec![serde_json::json!("sensor-01"), serde_json::json!(2)],
        };
        let json = serde_json::to_string(&req).unwrap();
        let parsed: InvokeRequest = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, req);
    }

    #[test]
    fn invoke_request_args_default_to_empty() {
        let parsed: InvokeRequest = serde_json::from_str(r#"{"method":"deregister"}"#).unwrap();
        assert_eq!(parsed.method, "deregister");
        assert!(parsed.args.is_empty());
    }

    #[test]
    fn invoke_request_omits_empty_args() {
        let req = InvokeRequest {
            method: "noop".into(),
            args: vec![],
        };
        let json = serde_json::to_string(&req).unwrap();
        assert!(!json.contains("args"));
    }

    #[test]
    fn event_with_name() {
        let ev = EventNotification::with_name("clientConnected", "sensor-01");
        assert_eq!(ev.event, "clientConnected");
        assert_eq!(ev.args, vec![serde_json::json!("sensor-01")]);
    }

    #[test]
    fn event_wire_casing() {
        let ev = EventNotification::with_name("clientDisconnected", "a");
        let json = serde_json::to_string(&ev).unwrap();
        assert!(json.contains("\"event\":\"clientDisconnected\""));
    }
}
