// src/protocol/frame.rs
//! Backend frames
//!
//! Inbound frames are single JSON lines. Only the header fields are read
//! by the communication unit; the full line is passed on untouched.

use crate::runtime::link::{MessageId, VuserId, PUSH_MESSAGE_ID};
use crate::script::ScriptError;
use crate::utils::errors::{EngineError, ErrorCode, Result};
use serde::Serialize;
use serde_json::{json, Value};

/// Originator tag of every message a vuser sends
pub const ORIGINATOR_VUSER: u8 = 3;

/// Routing fields of an inbound frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameHeader {
    pub message_id: MessageId,

    /// Present on push frames
    pub socket_id: Option<String>,
}

impl FrameHeader {
    /// Read the header of one inbound line
    ///
    /// Only the leading JSON value is inspected; trailing bytes are left
    /// for whoever consumes the full line.
    pub fn parse(line: &str) -> Result<Self> {
        let value: Value = match serde_json::Deserializer::from_str(line)
            .into_iter::<Value>()
            .next()
        {
            Some(value) => value?,
            None => return Err(EngineError::ProtocolError("empty frame".into())),
        };

        let message_id = value
            .get("messageId")
            .and_then(Value::as_i64)
            .ok_or_else(|| EngineError::ProtocolError("frame without numeric messageId".into()))?;

        // Socket ids arrive as strings; tolerate numbers.
        let socket_id = match value.get("socketId") {
            Some(Value::String(id)) => Some(id.clone()),
            Some(Value::Number(id)) => Some(id.to_string()),
            _ => None,
        };

        Ok(Self {
            message_id,
            socket_id,
        })
    }

    pub fn is_push(&self) -> bool {
        self.message_id == PUSH_MESSAGE_ID
    }
}

/// Outbound message to the backend
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope<'a> {
    pub id: VuserId,
    pub message_id: MessageId,
    pub originator: u8,
    pub message_type: &'a str,
    pub content: &'a Value,
}

impl<'a> Envelope<'a> {
    pub fn new(
        vuser_id: VuserId,
        message_id: MessageId,
        message_type: &'a str,
        content: &'a Value,
    ) -> Self {
        Self {
            id: vuser_id,
            message_id,
            originator: ORIGINATOR_VUSER,
            message_type,
            content,
        }
    }

    /// Serialize as one newline-terminated wire line
    pub fn to_line(&self) -> Result<String> {
        let mut line = serde_json::to_string(self)?;
        line.push('\n');
        Ok(line)
    }
}

/// Reply standing in for a backend reply that could not be delivered
pub fn protocol_error_reply(message_id: MessageId, message: &str) -> String {
    json!({
        "messageId": message_id,
        "messageType": "Error.Protocol",
        "content": {
            "content": message,
            "errorCode": ErrorCode::Parsing.value(),
        },
    })
    .to_string()
}

/// Turn a parsed reply envelope into its content or a script error
///
/// `FatalError.*` replies abort the vuser, `Error.*` replies become load
/// errors carrying the reply's error code.
pub fn classify_reply(reply: Value) -> std::result::Result<Value, ScriptError> {
    let message_type = reply
        .get("messageType")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();
    let content = match reply {
        Value::Object(mut fields) => fields.remove("content").unwrap_or(Value::Null),
        _ => Value::Null,
    };

    if message_type.starts_with("FatalError.") {
        return Err(ScriptError::abort(value_text(&content)));
    }

    if let Some(error_type) = message_type.strip_prefix("Error.") {
        let inner = content.get("content").filter(|inner| !inner.is_null());
        let message = value_text(inner.unwrap_or(&content));
        let code = content.get("errorCode").and_then(Value::as_i64).unwrap_or(0);
        return Err(ScriptError::Load {
            error_type: error_type.to_string(),
            message,
            code,
        });
    }

    Ok(content)
}

fn value_text(value: &Value) -> String {
    match value {
        Value::String(text) => text.clone(),
        other => other.to_string(),
    }
}
