use crate::bridge::error::BridgeError;
use axum::http::header::{HeaderName, HeaderValue};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::{json, Value};
use std::time::{SystemTime, UNIX_EPOCH};
use uuid::Uuid;

pub(crate) const TRACE_HEADER: &str = "x-trace-id";
pub(crate) const ERROR_CODE_HEADER: &str = "x-error-code";

#[derive(Debug, Clone)]
pub(crate) struct ErrorMeta {
    pub code: String,
    pub message: String,
    pub status: u16,
    pub hint: String,
    pub trace_id: String,
    pub timestamp: f64,
}

impl ErrorMeta {
    pub(crate) fn to_value(&self) -> Value {
        json!({
            "code": self.code,
            "message": self.message,
            "status": self.status,
            "hint": self.hint,
            "trace_id": self.trace_id,
            "timestamp": self.timestamp,
        })
    }
}

pub(crate) fn build_error_meta(
    status: StatusCode,
    code: &str,
    message: impl Into<String>,
    hint: Option<&str>,
) -> ErrorMeta {
    let message = message.into();
    let code = code.trim().to_string();
    let hint = hint
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .unwrap_or_else(|| default_hint(status))
        .to_string();
    ErrorMeta {
        code,
        message,
        status: status.as_u16(),
        hint,
        trace_id: format!("err_{}", Uuid::new_v4().simple()),
        timestamp: now_unix_seconds(),
    }
}

pub(crate) fn status_for_error_code(code: &str) -> StatusCode {
    let normalized = code.trim().to_ascii_uppercase();
    match normalized.as_str() {
        "INVALID_REQUEST" => StatusCode::BAD_REQUEST,
        "UNKNOWN_REQUEST" => StatusCode::NOT_FOUND,
        "TOOL_CANCELLED" | "DUPLICATE_REQUEST_ID" => StatusCode::CONFLICT,
        "CHANNEL_FAILURE" => StatusCode::SERVICE_UNAVAILABLE,
        "TOOL_FAILED" => StatusCode::BAD_GATEWAY,
        "TOOL_TIMEOUT" => StatusCode::GATEWAY_TIMEOUT,
        _ => StatusCode::BAD_REQUEST,
    }
}

pub(crate) fn hint_for_error_code(code: &str) -> Option<&'static str> {
    let normalized = code.trim().to_ascii_uppercase();
    match normalized.as_str() {
        "INVALID_JSON" => Some("Send valid JSON payload encoded in UTF-8."),
        "INVALID_REQUEST" | "INVALID_PAYLOAD" | "PAYLOAD_REQUIRED" => {
            Some("Check required fields and payload schema before retrying.")
        }
        "UNSUPPORTED_TYPE" => Some("Verify message type against the bridge protocol."),
        "TOOL_TIMEOUT" => Some("The editor did not answer in time; check that the project is open."),
        "TOOL_CANCELLED" => Some("The chat run was cancelled; start a new run to retry."),
        "CHANNEL_FAILURE" => Some("Open the project in an editor so it can join the bridge room."),
        "TOOL_FAILED" => Some("The editor reported an error while executing the tool."),
        _ => None,
    }
}

/// Maps a bridge failure onto the unified error payload, keeping the
/// structured fields under `detail`.
pub(crate) fn bridge_error_response(err: &BridgeError) -> Response {
    let code = err.code();
    error_response_with_detail(
        status_for_error_code(code),
        code,
        err.to_string(),
        hint_for_error_code(code),
        Some(err.to_value()),
    )
}

pub fn error_response_with_detail(
    status: StatusCode,
    code: &str,
    message: impl Into<String>,
    hint: Option<&str>,
    detail: Option<Value>,
) -> Response {
    let meta = build_error_meta(status, code, message, hint);
    let detail = build_detail_payload(&meta.message, detail);
    let payload = json!({
        "ok": false,
        "error": meta.to_value(),
        "detail": detail,
    });

    let mut response = (status, Json(payload)).into_response();
    if let Ok(value) = HeaderValue::from_str(&meta.trace_id) {
        response
            .headers_mut()
            .insert(HeaderName::from_static(TRACE_HEADER), value);
    }
    if let Ok(value) = HeaderValue::from_str(&meta.code) {
        response
            .headers_mut()
            .insert(HeaderName::from_static(ERROR_CODE_HEADER), value);
    }
    response
}

fn build_detail_payload(message: &str, detail: Option<Value>) -> Value {
    match detail {
        Some(Value::Object(mut map)) => {
            map.entry("message".to_string())
                .or_insert_with(|| Value::String(message.to_string()));
            Value::Object(map)
        }
        Some(value) => json!({
            "message": message,
            "detail": value,
        }),
        None => json!({
            "message": message,
        }),
    }
}

fn default_hint(status: StatusCode) -> &'static str {
    match status {
        StatusCode::BAD_REQUEST => "Verify request parameters and payload format.",
        StatusCode::CONFLICT => "Verify the request id and chat run state before retrying.",
        _ if status.is_server_error() => "Retry later or contact support with trace_id.",
        _ => "Inspect request and try again.",
    }
}

fn now_unix_seconds() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|duration| duration.as_secs_f64())
        .unwrap_or(0.0)
}
