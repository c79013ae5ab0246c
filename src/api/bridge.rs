use crate::api::errors::bridge_error_response;
use crate::bridge::{now_ts, ToolInvocation};
use crate::state::AppState;
use axum::extract::State;
use axum::response::Response;
use axum::{
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/api/health", get(health))
        .route("/api/bridge/status", get(bridge_status))
        .route("/api/bridge/invoke", post(bridge_invoke))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct InvokeRequest {
    #[serde(alias = "project_id")]
    project_id: String,
    #[serde(alias = "tool_name")]
    tool_name: String,
    #[serde(default)]
    input: Value,
    #[serde(default, alias = "chat_run_id")]
    chat_run_id: Option<String>,
    #[serde(default, alias = "conversation_id")]
    conversation_id: Option<String>,
    #[serde(default)]
    description: Option<String>,
}

async fn health() -> Json<Value> {
    Json(json!({ "ok": true, "status": "ok", "serverTime": now_ts() }))
}

async fn bridge_status(State(state): State<Arc<AppState>>) -> Json<Value> {
    let snapshot = state.bridge.snapshot();
    Json(json!({
        "data": {
            "pendingCount": snapshot.pending.len(),
            "pending": snapshot.pending,
            "rooms": snapshot.rooms,
            "activeRuns": snapshot.active_runs,
            "cancelledRuns": snapshot.cancelled_runs,
            "defaultTimeoutMs": state.bridge.policy().default_ms(),
        }
    }))
}

/// Dispatches one tool call on behalf of an out-of-process reasoning loop
/// and blocks until it settles.
async fn bridge_invoke(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<InvokeRequest>,
) -> Result<Json<Value>, Response> {
    let mut invocation = ToolInvocation::new(&payload.project_id, &payload.tool_name, payload.input);
    invocation.context.chat_run_id = payload.chat_run_id;
    invocation.context.conversation_id = payload.conversation_id;
    invocation.description = payload.description;
    match state.bridge.dispatch(invocation).await {
        Ok(result) => Ok(Json(json!({ "ok": true, "result": result }))),
        Err(err) => Err(bridge_error_response(&err)),
    }
}
