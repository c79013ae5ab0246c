use serde_json::{json, Value};

pub const DEFAULT_CANCEL_REASON: &str = "user cancelled";

/// Terminal failure delivered to whoever awaits a remote tool call.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BridgeError {
    #[error("unknown request: {request_id}")]
    UnknownRequest { request_id: String },
    #[error("tool {tool_name} timed out after {timeout_ms}ms")]
    Timeout { tool_name: String, timeout_ms: u64 },
    #[error("tool call cancelled: {reason}")]
    Cancelled { reason: String },
    #[error("channel failure: {message}")]
    ChannelFailure { message: String },
    #[error("tool failed: {message}")]
    ToolFailed { message: String },
    #[error("duplicate request id: {request_id}")]
    DuplicateRequestId { request_id: String },
    #[error("invalid request: {message}")]
    InvalidRequest { message: String },
}

impl BridgeError {
    pub fn timeout(tool_name: impl Into<String>, timeout_ms: u64) -> Self {
        Self::Timeout {
            tool_name: tool_name.into(),
            timeout_ms,
        }
    }

    pub fn cancelled(reason: Option<&str>) -> Self {
        Self::Cancelled {
            reason: cancel_reason(reason),
        }
    }

    pub fn invalid(message: impl Into<String>) -> Self {
        Self::InvalidRequest {
            message: message.into(),
        }
    }

    pub fn channel(message: impl Into<String>) -> Self {
        Self::ChannelFailure {
            message: message.into(),
        }
    }

    /// Builds the failure for a `success: false` result frame. Clients send
    /// either a bare string or an object carrying `message`.
    pub fn from_client_error(error: Option<&Value>) -> Self {
        let message = match error {
            Some(Value::String(text)) if !text.trim().is_empty() => text.trim().to_string(),
            Some(Value::Object(map)) => map
                .get("message")
                .and_then(Value::as_str)
                .map(str::to_string)
                .unwrap_or_else(|| Value::Object(map.clone()).to_string()),
            Some(Value::Null) | None => "client reported failure".to_string(),
            Some(other) => other.to_string(),
        };
        Self::ToolFailed { message }
    }

    pub fn code(&self) -> &'static str {
        match self {
            Self::UnknownRequest { .. } => "UNKNOWN_REQUEST",
            Self::Timeout { .. } => "TOOL_TIMEOUT",
            Self::Cancelled { .. } => "TOOL_CANCELLED",
            Self::ChannelFailure { .. } => "CHANNEL_FAILURE",
            Self::ToolFailed { .. } => "TOOL_FAILED",
            Self::DuplicateRequestId { .. } => "DUPLICATE_REQUEST_ID",
            Self::InvalidRequest { .. } => "INVALID_REQUEST",
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled { .. })
    }

    pub fn to_value(&self) -> Value {
        let mut payload = json!({
            "code": self.code(),
            "message": self.to_string(),
        });
        match self {
            Self::Timeout {
                tool_name,
                timeout_ms,
            } => {
                payload["toolName"] = json!(tool_name);
                payload["timeoutMs"] = json!(timeout_ms);
            }
            Self::Cancelled { reason } => {
                payload["reason"] = json!(reason);
            }
            _ => {}
        }
        payload
    }
}

pub type BridgeResult<T> = Result<T, BridgeError>;

pub fn cancel_reason(reason: Option<&str>) -> String {
    reason
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .unwrap_or(DEFAULT_CANCEL_REASON)
        .to_string()
}
