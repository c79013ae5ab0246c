// 对话运行控制：取消整个 chat run，连带撤回已下发但未完成的工具调用。
use crate::state::AppState;
use axum::body::Bytes;
use axum::extract::State;
use axum::{routing::post, Json, Router};
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::warn;

pub fn router() -> Router<Arc<AppState>> {
    Router::new().route("/api/chat/cancel", post(cancel_chat_run))
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CancelChatRunRequest {
    #[serde(default, alias = "chat_run_id")]
    chat_run_id: Option<String>,
    #[serde(default)]
    reason: Option<String>,
}

/// Always acknowledges: unknown, blank or malformed requests are no-ops.
async fn cancel_chat_run(State(state): State<Arc<AppState>>, body: Bytes) -> Json<Value> {
    let payload = if body.is_empty() {
        CancelChatRunRequest::default()
    } else {
        serde_json::from_slice::<CancelChatRunRequest>(&body).unwrap_or_else(|err| {
            warn!("chat cancel payload ignored: {err}");
            CancelChatRunRequest::default()
        })
    };
    if let Some(chat_run_id) = payload.chat_run_id.as_deref() {
        state
            .bridge
            .cancel_run(chat_run_id, payload.reason.as_deref())
            .await;
    }
    Json(json!({}))
}
