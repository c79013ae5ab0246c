// API 路由汇总入口，按领域拆分以保持结构清晰。
pub mod bridge;
pub mod bridge_ws;
pub mod chat;
pub mod errors;
mod ws_helpers;
mod ws_log;

use crate::state::AppState;
use axum::Router;
use std::sync::Arc;

pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .merge(bridge::router())
        .merge(bridge_ws::router())
        .merge(chat::router())
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use axum::body::{to_bytes, Body};
    use axum::http::{Request, StatusCode};
    use serde_json::{json, Value};
    use tower::ServiceExt;

    fn test_router() -> (Arc<AppState>, Router) {
        let state = Arc::new(AppState::from_config(Config::default()));
        (state.clone(), build_router(state))
    }

    async fn read_json(response: axum::response::Response) -> Value {
        let body = to_bytes(response.into_body(), usize::MAX)
            .await
            .expect("read response body");
        serde_json::from_slice(&body).expect("parse response json")
    }

    fn post_json(uri: &str, body: Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .expect("request")
    }

    #[tokio::test]
    async fn health_reports_ok() {
        let (_state, router) = test_router();
        let response = router
            .oneshot(
                Request::builder()
                    .uri("/api/health")
                    .body(Body::empty())
                    .expect("request"),
            )
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(read_json(response).await["ok"], json!(true));
    }

    #[tokio::test]
    async fn cancel_marks_run_and_returns_empty_body() {
        let (state, router) = test_router();
        let response = router
            .oneshot(post_json(
                "/api/chat/cancel",
                json!({ "chatRunId": " run-42 " }),
            ))
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(read_json(response).await, json!({}));
        assert!(state.bridge.runs().is_cancelled("run-42"));
    }

    #[tokio::test]
    async fn invoke_requires_project_and_tool() {
        let (_state, router) = test_router();
        let response = router
            .oneshot(post_json(
                "/api/bridge/invoke",
                json!({ "projectId": " ", "toolName": "get_diagram" }),
            ))
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let payload = read_json(response).await;
        assert_eq!(payload["error"]["code"], json!("INVALID_REQUEST"));
    }

    #[tokio::test]
    async fn status_lists_registry_sizes() {
        let (state, router) = test_router();
        state.bridge.runs().cancel("run-1");
        let response = router
            .oneshot(
                Request::builder()
                    .uri("/api/bridge/status")
                    .body(Body::empty())
                    .expect("request"),
            )
            .await
            .expect("response");
        let payload = read_json(response).await;
        assert_eq!(payload["data"]["pendingCount"], json!(0));
        assert_eq!(payload["data"]["cancelledRuns"], json!(1));
        assert_eq!(payload["data"]["defaultTimeoutMs"], json!(30_000));
    }
}
