// 工具桥协议：服务端与编辑器客户端之间的消息结构。
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

pub const MSG_READY: &str = "ready";
pub const MSG_TOOL_EXECUTE: &str = "tool_execute";
pub const MSG_TOOL_RESULT: &str = "tool_result";
pub const MSG_TOOL_CANCEL: &str = "tool_cancel";
pub const MSG_JOIN: &str = "join";
pub const MSG_LEAVE: &str = "leave";
pub const MSG_PING: &str = "ping";
pub const MSG_PONG: &str = "pong";
pub const MSG_ERROR: &str = "error";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ToolExecuteMessage {
    pub request_id: String,
    pub tool_name: String,
    #[serde(default)]
    pub input: Value,
    pub timeout_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ToolResultMessage {
    pub request_id: String,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ToolCancelMessage {
    pub request_id: String,
    pub project_id: String,
    pub conversation_id: String,
    pub chat_run_id: String,
    pub reason: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomPayload {
    #[serde(alias = "project_id")]
    pub project_id: String,
}

/// Envelope used in both directions: `{"type": ..., "payload": ...}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
}

impl Envelope {
    pub fn new(kind: &str, payload: Option<Value>) -> Self {
        Self {
            kind: kind.to_string(),
            payload,
        }
    }

    pub fn execute(message: &ToolExecuteMessage) -> Self {
        Self::new(MSG_TOOL_EXECUTE, serde_json::to_value(message).ok())
    }

    pub fn cancel(message: &ToolCancelMessage) -> Self {
        Self::new(MSG_TOOL_CANCEL, serde_json::to_value(message).ok())
    }

    pub fn error(code: &str, message: impl Into<String>) -> Self {
        Self::new(
            MSG_ERROR,
            Some(json!({ "code": code, "message": message.into() })),
        )
    }

    pub fn to_text(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| {
            json!({ "type": MSG_ERROR, "payload": { "code": "INTERNAL_ERROR" } }).to_string()
        })
    }
}
