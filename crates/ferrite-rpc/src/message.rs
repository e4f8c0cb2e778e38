//! Request/response message model shared by both sides of a connection.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::CodedError;

/// Reserved call id marking a heartbeat frame on both streams.
pub const HEARTBEAT_ID: u64 = 0;

/// One request travelling client -> server.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Request {
    /// Call id used for response matching; `0` means heartbeat.
    pub id: u64,
    /// Target service name.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub service: String,
    /// Target method name.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub method: String,
    /// Caller-supplied metadata, passed through to the handler.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub labels: HashMap<String, String>,
    /// Positional arguments.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<Value>,
}

impl Request {
    /// Builds a heartbeat request (id 0, no payload).
    pub fn heartbeat() -> Self {
        Request::default()
    }

    /// Whether this request is a heartbeat marker.
    pub fn is_heartbeat(&self) -> bool {
        self.id == HEARTBEAT_ID
    }

    /// The `service.method` identity of this request.
    pub fn action_name(&self) -> String {
        format!("{}.{}", self.service, self.method)
    }
}

/// Decoded head of a request, before its arguments are consumed.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RequestHead {
    /// Call id; `0` means heartbeat.
    pub id: u64,
    /// Target service name.
    #[serde(default)]
    pub service: String,
    /// Target method name.
    #[serde(default)]
    pub method: String,
    /// Caller-supplied metadata.
    #[serde(default)]
    pub labels: HashMap<String, String>,
}

/// One response travelling server -> client.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Response {
    /// Call id this response answers; `0` means heartbeat.
    pub id: u64,
    /// Result value; absent for errors and heartbeats.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    /// Coded error, if the call failed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<CodedError>,
}

impl Response {
    /// Builds a heartbeat response (id 0, no payload).
    pub fn heartbeat() -> Self {
        Response::default()
    }

    /// Builds a successful response carrying `result`.
    pub fn ok(id: u64, result: Value) -> Self {
        Response {
            id,
            result: Some(result),
            error: None,
        }
    }

    /// Builds an error response from a coded error.
    pub fn fail(id: u64, error: CodedError) -> Self {
        Response {
            id,
            result: None,
            error: Some(error),
        }
    }

    /// Whether this response is a heartbeat marker.
    pub fn is_heartbeat(&self) -> bool {
        self.id == HEARTBEAT_ID
    }
}

/// Decoded head of a response, before its result is consumed.
#[derive(Debug, Clone, Default)]
pub struct ResponseHead {
    /// Call id this response answers; `0` means heartbeat.
    pub id: u64,
    /// Coded error, if the call failed.
    pub error: Option<CodedError>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_heartbeat_request() {
        let hb = Request::heartbeat();
        assert!(hb.is_heartbeat());
        assert_eq!(hb.id, HEARTBEAT_ID);
    }

    #[test]
    fn test_request_serde_roundtrip() {
        let mut req = Request::default();
        req.id = 7;
        req.service = "Echo".into();
        req.method = "Upper".into();
        req.args = vec![Value::String("hi".into())];
        let text = serde_json::to_string(&req).unwrap();
        let back: Request = serde_json::from_str(&text).unwrap();
        assert_eq!(back.id, 7);
        assert_eq!(back.service, "Echo");
        assert_eq!(back.method, "Upper");
        assert_eq!(back.args.len(), 1);
    }

    #[test]
    fn test_heartbeat_wire_form_is_minimal() {
        let text = serde_json::to_string(&Request::heartbeat()).unwrap();
        assert_eq!(text, r#"{"id":0}"#);
    }

    #[test]
    fn test_response_without_result_decodes() {
        let resp: Response = serde_json::from_str(r#"{"id":3}"#).unwrap();
        assert_eq!(resp.id, 3);
        assert!(resp.result.is_none());
        assert!(resp.error.is_none());
    }

    #[test]
    fn test_action_name() {
        let mut req = Request::default();
        req.service = "Echo".into();
        req.method = "Upper".into();
        assert_eq!(req.action_name(), "Echo.Upper");
    }
}
