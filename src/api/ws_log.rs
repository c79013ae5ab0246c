use axum::http::header::{HOST, ORIGIN, USER_AGENT};
use axum::http::HeaderMap;
use tracing::{info, warn};

#[derive(Clone, Debug, Default)]
pub(crate) struct WsConnMeta {
    pub user_agent: Option<String>,
    pub origin: Option<String>,
    pub host: Option<String>,
    pub forwarded_for: Option<String>,
    pub real_ip: Option<String>,
}

impl WsConnMeta {
    pub(crate) fn from_headers(headers: &HeaderMap) -> Self {
        let pick = |name: &str| {
            headers
                .get(name)
                .and_then(|value| value.to_str().ok())
                .map(|value| value.to_string())
        };
        Self {
            user_agent: pick(USER_AGENT.as_str()),
            origin: pick(ORIGIN.as_str()),
            host: pick(HOST.as_str()),
            forwarded_for: pick("x-forwarded-for"),
            real_ip: pick("x-real-ip"),
        }
    }
}

pub(crate) fn log_ws_open(
    endpoint: &str,
    connection_id: &str,
    project_id: Option<&str>,
    meta: &WsConnMeta,
) {
    info!(
        target: "canvas_bridge.ws",
        ws_event = "open",
        endpoint,
        connection_id,
        project_id = ?project_id,
        user_agent = ?meta.user_agent,
        origin = ?meta.origin,
        host = ?meta.host,
        forwarded_for = ?meta.forwarded_for,
        real_ip = ?meta.real_ip,
        "ws connection opened",
    );
}

pub(crate) fn log_ws_room(
    endpoint: &str,
    connection_id: &str,
    action: &str,
    project_id: &str,
    members: usize,
) {
    info!(
        target: "canvas_bridge.ws",
        ws_event = "room",
        endpoint,
        connection_id,
        action,
        project_id,
        members,
        "ws room membership changed",
    );
}

pub(crate) fn log_ws_message(
    endpoint: &str,
    connection_id: &str,
    message_type: &str,
    request_id: Option<&str>,
) {
    info!(
        target: "canvas_bridge.ws",
        ws_event = "message",
        endpoint,
        connection_id,
        message_type,
        request_id = ?request_id,
        "ws message received",
    );
}

pub(crate) fn log_ws_parse_error(endpoint: &str, connection_id: &str, error: &str) {
    warn!(
        target: "canvas_bridge.ws",
        ws_event = "parse_error",
        endpoint,
        connection_id,
        error,
        "ws message parse error",
    );
}

pub(crate) fn log_ws_close(
    endpoint: &str,
    connection_id: &str,
    code: Option<u16>,
    reason: Option<&str>,
    emptied_rooms: usize,
    duration_ms: Option<u128>,
) {
    info!(
        target: "canvas_bridge.ws",
        ws_event = "close",
        endpoint,
        connection_id,
        code = ?code,
        reason = ?reason,
        emptied_rooms,
        duration_ms = ?duration_ms,
        "ws connection closed",
    );
}
