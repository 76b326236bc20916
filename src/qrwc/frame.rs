//! QRWC frame types.
//!
//! JSON-RPC 2.0 over a single WebSocket. Requests carry a monotonically
//! increasing integer id; responses are correlated by id. Frames with a
//! method but no id are unsolicited server pushes (auto-poll results,
//! status broadcasts).

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A request frame.
#[derive(Debug, Clone, Serialize)]
pub struct RequestFrame {
    /// Always `"2.0"`.
    pub jsonrpc: &'static str,

    /// Method name, e.g. `Component.GetComponents`.
    pub method: String,

    /// Method parameters.
    #[serde(skip_serializing_if = "Value::is_null")]
    pub params: Value,

    /// Correlation id.
    pub id: u64,
}

impl RequestFrame {
    /// Build a request frame.
    pub fn new(id: u64, method: impl Into<String>, params: Value) -> Self {
        Self {
            jsonrpc: "2.0",
            method: method.into(),
            params,
            id,
        }
    }
}

/// Error envelope inside a response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FrameError {
    /// Numeric error code from the core.
    pub code: i64,

    /// Error description.
    pub message: String,
}

/// An inbound frame before classification.
#[derive(Debug, Clone, Deserialize)]
pub struct RawFrame {
    /// Present on responses.
    #[serde(default)]
    pub id: Option<u64>,

    /// Present on unsolicited pushes (and requests, which we never receive).
    #[serde(default)]
    pub method: Option<String>,

    /// Success payload.
    #[serde(default)]
    pub result: Option<Value>,

    /// Failure payload.
    #[serde(default)]
    pub error: Option<FrameError>,

    /// Push parameters.
    #[serde(default)]
    pub params: Option<Value>,
}

/// A classified inbound frame.
#[derive(Debug, Clone)]
pub enum InboundFrame {
    /// Response to a request we sent.
    Response {
        /// The request id this answers.
        id: u64,
        /// `Ok(result)` or the core's error envelope.
        result: std::result::Result<Value, FrameError>,
    },

    /// Server push with no correlation id.
    Unsolicited {
        /// Push method, e.g. `ChangeGroup.Poll`.
        method: String,
        /// Push payload.
        params: Value,
    },
}

impl RawFrame {
    /// Classify the frame, or `None` when it is neither a response nor
    /// a recognizable push.
    pub fn classify(self) -> Option<InboundFrame> {
        if let Some(id) = self.id {
            let result = match (self.result, self.error) {
                (_, Some(error)) => Err(error),
                (Some(result), None) => Ok(result),
                // A response with neither field; treat as empty success.
                (None, None) => Ok(Value::Null),
            };
            return Some(InboundFrame::Response { id, result });
        }
        if let Some(method) = self.method {
            return Some(InboundFrame::Unsolicited {
                method,
                params: self.params.unwrap_or(Value::Null),
            });
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_serialization() {
        let frame = RequestFrame::new(7, "Control.Get", serde_json::json!({"Names": ["a"]}));
        let json = serde_json::to_value(&frame).unwrap();
        assert_eq!(json["jsonrpc"], "2.0");
        assert_eq!(json["id"], 7);
        assert_eq!(json["method"], "Control.Get");
        assert_eq!(json["params"]["Names"][0], "a");
    }

    #[test]
    fn test_null_params_omitted() {
        let frame = RequestFrame::new(1, "Status.Get", Value::Null);
        let text = serde_json::to_string(&frame).unwrap();
        assert!(!text.contains("params"));
    }

    #[test]
    fn test_classify_response() {
        let raw: RawFrame =
            serde_json::from_str(r#"{"jsonrpc":"2.0","id":3,"result":{"ok":true}}"#).unwrap();
        match raw.classify().unwrap() {
            InboundFrame::Response { id, result } => {
                assert_eq!(id, 3);
                assert_eq!(result.unwrap()["ok"], true);
            }
            other => panic!("unexpected frame: {other:?}"),
        }
    }

    #[test]
    fn test_classify_error_response() {
        let raw: RawFrame = serde_json::from_str(
            r#"{"jsonrpc":"2.0","id":4,"error":{"code":-32601,"message":"Unknown method"}}"#,
        )
        .unwrap();
        match raw.classify().unwrap() {
            InboundFrame::Response { id, result } => {
                assert_eq!(id, 4);
                let err = result.unwrap_err();
                assert_eq!(err.code, -32601);
            }
            other => panic!("unexpected frame: {other:?}"),
        }
    }

    #[test]
    fn test_classify_unsolicited() {
        let raw: RawFrame = serde_json::from_str(
            r#"{"jsonrpc":"2.0","method":"ChangeGroup.Poll","params":{"Id":"g1","Changes":[]}}"#,
        )
        .unwrap();
        match raw.classify().unwrap() {
            InboundFrame::Unsolicited { method, params } => {
                assert_eq!(method, "ChangeGroup.Poll");
                assert_eq!(params["Id"], "g1");
            }
            other => panic!("unexpected frame: {other:?}"),
        }
    }

    #[test]
    fn test_unclassifiable_frame() {
        let raw: RawFrame = serde_json::from_str(r#"{"jsonrpc":"2.0"}"#).unwrap();
        assert!(raw.classify().is_none());
    }
}
