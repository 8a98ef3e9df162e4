//! OCPP-J wire framing: the untyped 3- or 5-element JSON array carried in
//! every WebSocket text frame.
//!
//! ```text
//! [2, "<id>", "<action>", {..params..}]          CALL
//! [3, "<id>", {..result..}]                       CALLRESULT
//! [4, "<id>", "<errorCode>", "<description>", {}] CALLERROR
//! ```
//!
//! Like this codebase's existing JSON-RPC framing, every frame is decoded
//! into a `serde_json::Value` first and only then matched against the
//! expected tuple shape — the wire boundary never trusts a concrete struct
//! until the envelope itself has been validated.

use serde_json::Value;

use crate::errors::{OcppErrorCode, RpcError};

pub const MESSAGE_TYPE_CALL: i64 = 2;
pub const MESSAGE_TYPE_CALLRESULT: i64 = 3;
pub const MESSAGE_TYPE_CALLERROR: i64 = 4;

pub type MessageId = String;

/// A decoded OCPP-J frame.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Call {
        id: MessageId,
        action: String,
        payload: Value,
    },
    CallResult {
        id: MessageId,
        payload: Value,
    },
    CallError {
        id: MessageId,
        error_code: String,
        error_description: String,
        error_details: Value,
    },
}

impl Message {
    pub fn id(&self) -> &str {
        match self {
            Message::Call { id, .. } => id,
            Message::CallResult { id, .. } => id,
            Message::CallError { id, .. } => id,
        }
    }

    pub fn call(id: impl Into<String>, action: impl Into<String>, payload: Value) -> Self {
        Message::Call {
            id: id.into(),
            action: action.into(),
            payload,
        }
    }

    pub fn call_result(id: impl Into<String>, payload: Value) -> Self {
        Message::CallResult {
            id: id.into(),
            payload,
        }
    }

    pub fn call_error(id: impl Into<String>, code: OcppErrorCode, description: impl Into<String>) -> Self {
        Self::call_error_with_details(id, code, description, Value::Null)
    }

    pub fn call_error_with_details(
        id: impl Into<String>,
        code: OcppErrorCode,
        description: impl Into<String>,
        details: Value,
    ) -> Self {
        Message::CallError {
            id: id.into(),
            error_code: code.as_wire_str().to_string(),
            error_description: description.into(),
            error_details: details,
        }
    }

    /// Serialize to the wire-format JSON array string.
    pub fn to_wire_string(&self) -> String {
        let value = match self {
            Message::Call { id, action, payload } => {
                Value::Array(vec![
                    Value::from(MESSAGE_TYPE_CALL),
                    Value::String(id.clone()),
                    Value::String(action.clone()),
                    payload.clone(),
                ])
            }
            Message::CallResult { id, payload } => Value::Array(vec![
                Value::from(MESSAGE_TYPE_CALLRESULT),
                Value::String(id.clone()),
                payload.clone(),
            ]),
            Message::CallError {
                id,
                error_code,
                error_description,
                error_details,
            } => Value::Array(vec![
                Value::from(MESSAGE_TYPE_CALLERROR),
                Value::String(id.clone()),
                Value::String(error_code.clone()),
                Value::String(error_description.clone()),
                error_details.clone(),
            ]),
        };
        value.to_string()
    }

    /// Parse a raw text frame into a `Message`.
    ///
    /// Returns `RpcError::UnexpectedResponse` (never panics) on any
    /// malformed envelope: not JSON, not an array, wrong element count,
    /// or an unrecognized message-type discriminant.
    pub fn parse(text: &str) -> Result<Message, RpcError> {
        let value: Value =
            serde_json::from_str(text).map_err(|e| RpcError::UnexpectedResponse(e.to_string()))?;
        Self::from_value(value)
    }

    /// Best-effort extraction of a CALL id from a frame that failed to
    /// parse as a well-formed `Message`, so the bad-message path can still
    /// send a targeted `CALLERROR` back rather than leaving the peer's
    /// pending call to time out. Only recognizes the `[2, "<id>"` prefix
    /// shape; anything else (not an array, not a CALL, malformed id) yields
    /// `None` and the frame is simply dropped with a bad-message count.
    pub fn recognizable_call_id(text: &str) -> Option<String> {
        let value: Value = serde_json::from_str(text).ok()?;
        let arr = value.as_array()?;
        if arr.first()?.as_i64()? != MESSAGE_TYPE_CALL {
            return None;
        }
        arr.get(1)?.as_str().map(str::to_string)
    }

    pub fn from_value(value: Value) -> Result<Message, RpcError> {
        let arr = value
            .as_array()
            .ok_or_else(|| RpcError::UnexpectedResponse("frame is not a JSON array".into()))?;

        let msg_type = arr
            .first()
            .and_then(Value::as_i64)
            .ok_or_else(|| RpcError::UnexpectedResponse("missing message type id".into()))?;

        match msg_type {
            MESSAGE_TYPE_CALL => {
                if arr.len() != 4 {
                    return Err(RpcError::UnexpectedResponse(format!(
                        "CALL frame must have 4 elements, got {}",
                        arr.len()
                    )));
                }
                let id = arr[1]
                    .as_str()
                    .ok_or_else(|| RpcError::UnexpectedResponse("CALL id must be a string".into()))?
                    .to_string();
                let action = arr[2]
                    .as_str()
                    .ok_or_else(|| RpcError::UnexpectedResponse("CALL action must be a string".into()))?
                    .to_string();
                Ok(Message::Call {
                    id,
                    action,
                    payload: arr[3].clone(),
                })
            }
            MESSAGE_TYPE_CALLRESULT => {
                if arr.len() != 3 {
                    return Err(RpcError::UnexpectedResponse(format!(
                        "CALLRESULT frame must have 3 elements, got {}",
                        arr.len()
                    )));
                }
                let id = arr[1]
                    .as_str()
                    .ok_or_else(|| RpcError::UnexpectedResponse("CALLRESULT id must be a string".into()))?
                    .to_string();
                Ok(Message::CallResult {
                    id,
                    payload: arr[2].clone(),
                })
            }
            MESSAGE_TYPE_CALLERROR => {
                if arr.len() != 5 {
                    return Err(RpcError::UnexpectedResponse(format!(
                        "CALLERROR frame must have 5 elements, got {}",
                        arr.len()
                    )));
                }
                let id = arr[1]
                    .as_str()
                    .ok_or_else(|| RpcError::UnexpectedResponse("CALLERROR id must be a string".into()))?
                    .to_string();
                let error_code = arr[2]
                    .as_str()
                    .ok_or_else(|| RpcError::UnexpectedResponse("CALLERROR errorCode must be a string".into()))?
                    .to_string();
                let error_description = arr[3].as_str().unwrap_or_default().to_string();
                Ok(Message::CallError {
                    id,
                    error_code,
                    error_description,
                    error_details: arr[4].clone(),
                })
            }
            other => Err(RpcError::UnexpectedResponse(format!(
                "unknown message type id {other}"
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn round_trips_call() {
        let msg = Message::call("1", "Heartbeat", json!({}));
        let wire = msg.to_wire_string();
        let parsed = Message::parse(&wire).unwrap();
        assert_eq!(msg, parsed);
    }

    #[test]
    fn round_trips_call_result() {
        let msg = Message::call_result("42", json!({"status": "Accepted"}));
        let parsed = Message::parse(&msg.to_wire_string()).unwrap();
        assert_eq!(msg, parsed);
    }

    #[test]
    fn round_trips_call_error() {
        let msg = Message::call_error("7", OcppErrorCode::NotImplemented, "nope");
        let parsed = Message::parse(&msg.to_wire_string()).unwrap();
        assert_eq!(msg, parsed);
    }

    #[test]
    fn rejects_wrong_arity() {
        let err = Message::parse(r#"[2,"1","Heartbeat"]"#).unwrap_err();
        assert!(matches!(err, RpcError::UnexpectedResponse(_)));
    }

    #[test]
    fn rejects_non_array() {
        let err = Message::parse(r#"{"not":"an array"}"#).unwrap_err();
        assert!(matches!(err, RpcError::UnexpectedResponse(_)));
    }

    #[test]
    fn rejects_unknown_type() {
        let err = Message::parse(r#"[9,"1"]"#).unwrap_err();
        assert!(matches!(err, RpcError::UnexpectedResponse(_)));
    }

    #[test]
    fn id_accessor_covers_all_variants() {
        assert_eq!(Message::call("a", "X", json!(null)).id(), "a");
        assert_eq!(Message::call_result("b", json!(null)).id(), "b");
        assert_eq!(
            Message::call_error("c", OcppErrorCode::GenericError, "x").id(),
            "c"
        );
    }
}
