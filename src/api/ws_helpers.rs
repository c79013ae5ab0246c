use crate::bridge::protocol::{Envelope, MSG_ERROR, MSG_PONG, MSG_READY};
use axum::extract::ws::Message;
use chrono::Utc;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::sync::mpsc;

#[derive(Debug, Deserialize)]
pub(crate) struct BridgeWsQuery {
    #[serde(default, alias = "project_id", rename = "projectId")]
    pub project_id: Option<String>,
}

#[derive(Debug)]
pub(crate) enum WsPayloadError {
    Missing,
    Invalid(String),
}

impl WsPayloadError {
    pub(crate) fn code(&self) -> &'static str {
        match self {
            Self::Missing => "PAYLOAD_REQUIRED",
            Self::Invalid(_) => "INVALID_PAYLOAD",
        }
    }

    pub(crate) fn message(&self) -> String {
        match self {
            Self::Missing => "payload required".to_string(),
            Self::Invalid(message) => message.clone(),
        }
    }
}

pub(crate) fn parse_payload<T: for<'de> Deserialize<'de>>(
    payload: Option<Value>,
) -> Result<T, WsPayloadError> {
    let Some(payload) = payload else {
        return Err(WsPayloadError::Missing);
    };
    serde_json::from_value(payload)
        .map_err(|err| WsPayloadError::Invalid(format!("invalid payload: {err}")))
}

pub(crate) async fn send_ws_ready(
    tx: &mpsc::Sender<Message>,
    connection_id: &str,
    project_id: Option<&str>,
    now_ts: f64,
) -> Result<(), ()> {
    let payload = json!({
        "connectionId": connection_id,
        "projectId": project_id,
        "serverTime": now_ts,
    });
    send_ws_message(tx, MSG_READY, Some(payload)).await
}

pub(crate) async fn send_ws_pong(tx: &mpsc::Sender<Message>) -> Result<(), ()> {
    send_ws_message(
        tx,
        MSG_PONG,
        Some(json!({ "ts": Utc::now().timestamp_millis() })),
    )
    .await
}

pub(crate) async fn send_ws_error(
    tx: &mpsc::Sender<Message>,
    code: &str,
    message: String,
) -> Result<(), ()> {
    let payload = json!({
        "code": code,
        "message": message,
    });
    send_ws_message(tx, MSG_ERROR, Some(payload)).await
}

pub(crate) async fn send_ws_message(
    tx: &mpsc::Sender<Message>,
    kind: &str,
    payload: Option<Value>,
) -> Result<(), ()> {
    let text = Envelope::new(kind, payload).to_text();
    tx.send(Message::Text(text.into())).await.map_err(|_| ())
}
