// 工具调用桥：服务端推理循环把只能在客户端执行的操作下发到项目房间，并等待结果。
pub mod cancel;
pub mod error;
pub mod notify;
pub mod pending;
pub mod protocol;
pub mod rooms;
pub mod runs;
pub mod timeouts;

#[cfg(test)]
pub(crate) mod testing;

use crate::config::BridgeConfig;
use chrono::Utc;
use error::{BridgeError, BridgeResult};
use pending::{CallContext, CallOutcome, PendingCall, PendingCallSummary, RequestRegistry};
use protocol::{Envelope, ToolExecuteMessage, ToolResultMessage};
use rooms::{GroupSender, RoomHub, RoomSummary};
use runs::ChatRunRegistry;
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use timeouts::TimeoutPolicy;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

pub use cancel::CancelOutcome;

/// A tool call the reasoning loop wants a client to execute.
#[derive(Debug, Clone)]
pub struct ToolInvocation {
    pub tool_name: String,
    pub input: Value,
    pub description: Option<String>,
    pub context: CallContext,
    /// Overrides the policy deadline when set.
    pub timeout: Option<Duration>,
}

impl ToolInvocation {
    pub fn new(project_id: &str, tool_name: &str, input: Value) -> Self {
        Self {
            tool_name: tool_name.to_string(),
            input,
            description: None,
            context: CallContext {
                project_id: Some(project_id.to_string()),
                ..CallContext::default()
            },
            timeout: None,
        }
    }

    pub fn with_run(mut self, conversation_id: &str, chat_run_id: &str) -> Self {
        self.context.conversation_id = Some(conversation_id.to_string());
        self.context.chat_run_id = Some(chat_run_id.to_string());
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BridgeSnapshot {
    pub pending: Vec<PendingCallSummary>,
    pub rooms: Vec<RoomSummary>,
    pub active_runs: usize,
    pub cancelled_runs: usize,
}

/// Process-wide owner of the request registry, the run registry and the
/// project rooms. Built once at startup and shared through `AppState`.
pub struct ToolBridge {
    requests: RequestRegistry,
    runs: ChatRunRegistry,
    policy: TimeoutPolicy,
    rooms: Arc<RoomHub>,
    transport: Arc<dyn GroupSender>,
}

impl ToolBridge {
    pub fn new(config: &BridgeConfig) -> Self {
        let rooms = Arc::new(RoomHub::new());
        let transport: Arc<dyn GroupSender> = rooms.clone();
        Self::with_parts(config, rooms, transport)
    }

    pub fn with_parts(
        config: &BridgeConfig,
        rooms: Arc<RoomHub>,
        transport: Arc<dyn GroupSender>,
    ) -> Self {
        Self {
            requests: RequestRegistry::new(),
            runs: ChatRunRegistry::with_capacity(config.cancelled_run_capacity),
            policy: TimeoutPolicy::with_overrides(
                config.default_timeout_ms,
                &config.tool_timeouts_ms,
            ),
            rooms,
            transport,
        }
    }

    pub fn requests(&self) -> &RequestRegistry {
        &self.requests
    }

    pub fn runs(&self) -> &ChatRunRegistry {
        &self.runs
    }

    pub fn rooms(&self) -> &Arc<RoomHub> {
        &self.rooms
    }

    pub fn policy(&self) -> &TimeoutPolicy {
        &self.policy
    }

    pub(crate) fn transport(&self) -> &dyn GroupSender {
        self.transport.as_ref()
    }

    /// Sends a tool call to the project's clients and waits for the first of
    /// result, deadline, cancellation or channel failure.
    pub async fn dispatch(&self, invocation: ToolInvocation) -> CallOutcome {
        let tool_name = invocation.tool_name.trim().to_string();
        if tool_name.is_empty() {
            return Err(BridgeError::invalid("tool name required"));
        }
        let context = normalize_context(invocation.context);
        let Some(project_id) = context.project_id.clone() else {
            return Err(BridgeError::invalid("project id required"));
        };
        if let Some(chat_run_id) = context.chat_run_id.as_deref() {
            if self.runs.is_cancelled(chat_run_id) {
                return Err(BridgeError::cancelled(Some("run already cancelled")));
            }
        }

        let timeout_ms = invocation
            .timeout
            .map(|value| value.as_millis().max(1) as u64)
            .unwrap_or_else(|| self.policy.timeout_ms(&tool_name));
        let request_id = format!("toolreq_{}", Uuid::new_v4().simple());
        let chat_run_id = context.chat_run_id.clone();
        let (call, mut rx) = PendingCall::new(request_id.clone(), tool_name.clone(), context);
        self.requests.register(call)?;
        let guard = PendingGuard {
            requests: &self.requests,
            request_id: &request_id,
        };

        // A cancel may have swept the registry between the check above and
        // the insert; the sweep would have missed this call.
        let cancelled_meanwhile = chat_run_id
            .as_deref()
            .is_some_and(|chat_run_id| self.runs.is_cancelled(chat_run_id));
        if cancelled_meanwhile {
            self.requests.settle_err(
                &request_id,
                BridgeError::cancelled(Some("run already cancelled")),
            );
        } else {
            let message = ToolExecuteMessage {
                request_id: request_id.clone(),
                tool_name: tool_name.clone(),
                input: invocation.input,
                timeout_ms,
                description: invocation.description,
            };
            match self
                .transport
                .send_to_group(&project_id, &Envelope::execute(&message))
                .await
            {
                Ok(delivered) => {
                    debug!(
                        target: "canvas_bridge.bridge",
                        request_id = %request_id,
                        tool_name = %tool_name,
                        project_id = %project_id,
                        chat_run_id = ?chat_run_id,
                        timeout_ms,
                        delivered,
                        "tool call dispatched"
                    );
                }
                Err(err) => {
                    warn!(
                        target: "canvas_bridge.bridge",
                        request_id = %request_id,
                        tool_name = %tool_name,
                        project_id = %project_id,
                        error = %err,
                        "tool call dispatch failed"
                    );
                    self.requests
                        .settle_err(&request_id, BridgeError::channel(err.to_string()));
                }
            }
        }

        let outcome =
            match tokio::time::timeout(Duration::from_millis(timeout_ms), &mut rx).await {
                Ok(Ok(outcome)) => outcome,
                Ok(Err(_)) => Err(BridgeError::channel("pending call dropped")),
                Err(_) => {
                    if self
                        .requests
                        .settle_err(&request_id, BridgeError::timeout(&tool_name, timeout_ms))
                    {
                        info!(
                            target: "canvas_bridge.bridge",
                            request_id = %request_id,
                            tool_name = %tool_name,
                            timeout_ms,
                            "tool call timed out"
                        );
                    }
                    // Whoever settled first put the outcome in the channel.
                    rx.await
                        .unwrap_or_else(|_| Err(BridgeError::channel("pending call dropped")))
                }
            };
        drop(guard);
        outcome
    }

    /// Routes an inbound result frame. Unknown or already-settled ids are
    /// discarded, as are results from a connection outside the call's
    /// project room when `source` is given.
    pub fn handle_result(&self, message: ToolResultMessage, source: Option<&str>) -> bool {
        let request_id = message.request_id.trim();
        if let Some(connection_id) = source {
            if let Some(Some(project_id)) = self.requests.project_of(request_id) {
                if !self.rooms.is_member(&project_id, connection_id) {
                    warn!(
                        target: "canvas_bridge.bridge",
                        request_id,
                        project_id = %project_id,
                        connection_id,
                        "tool result from outside the project room rejected"
                    );
                    return false;
                }
            }
        }
        let settled = if message.success {
            self.requests
                .settle_ok(request_id, message.result.unwrap_or(Value::Null))
        } else {
            self.requests.settle_err(
                request_id,
                BridgeError::from_client_error(message.error.as_ref()),
            )
        };
        if !settled {
            debug!(
                target: "canvas_bridge.bridge",
                request_id,
                success = message.success,
                "late or unknown tool result discarded"
            );
        }
        settled
    }

    /// Fails every call routed to a project whose last client just left.
    pub fn fail_project(&self, project_id: &str) -> usize {
        let swept = self.requests.sweep_by_project(project_id);
        let count = swept.len();
        for call in swept {
            call.reject(BridgeError::channel(format!(
                "all clients for project {} disconnected",
                project_id.trim()
            )));
        }
        if count > 0 {
            warn!(
                target: "canvas_bridge.bridge",
                project_id,
                failed = count,
                "pending tool calls failed after project room emptied"
            );
        }
        count
    }

    /// Starts bookkeeping for a chat run and hands the caller its abort
    /// token. Dropping the scope clears the bookkeeping again.
    pub fn begin_run(self: &Arc<Self>, conversation_id: &str, chat_run_id: &str) -> RunScope {
        let token = CancellationToken::new();
        // A cancel may land before the run starts; the token must still fire.
        if self.runs.is_cancelled(chat_run_id) {
            token.cancel();
        }
        self.runs.set_active(conversation_id, chat_run_id);
        self.runs.register_abort(chat_run_id, token.clone());
        RunScope {
            bridge: self.clone(),
            conversation_id: conversation_id.trim().to_string(),
            chat_run_id: chat_run_id.trim().to_string(),
            token,
        }
    }

    pub fn snapshot(&self) -> BridgeSnapshot {
        BridgeSnapshot {
            pending: self.requests.snapshot(),
            rooms: self.rooms.snapshot(),
            active_runs: self.runs.active_len(),
            cancelled_runs: self.runs.cancelled_len(),
        }
    }
}

/// Removes the registry entry if the dispatching future is dropped before
/// the call settles.
struct PendingGuard<'a> {
    requests: &'a RequestRegistry,
    request_id: &'a str,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.requests.settle_err(
            self.request_id,
            BridgeError::channel("caller stopped waiting"),
        );
    }
}

/// Handle held by the reasoning loop for the duration of one chat run.
pub struct RunScope {
    bridge: Arc<ToolBridge>,
    conversation_id: String,
    chat_run_id: String,
    token: CancellationToken,
}

impl RunScope {
    pub fn chat_run_id(&self) -> &str {
        &self.chat_run_id
    }

    pub fn conversation_id(&self) -> &str {
        &self.conversation_id
    }

    pub fn abort_token(&self) -> CancellationToken {
        self.token.clone()
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled() || self.bridge.runs.is_cancelled(&self.chat_run_id)
    }

    pub async fn call_tool(
        &self,
        project_id: &str,
        tool_name: &str,
        input: Value,
        description: Option<String>,
    ) -> BridgeResult<Value> {
        let mut invocation = ToolInvocation::new(project_id, tool_name, input)
            .with_run(&self.conversation_id, &self.chat_run_id);
        invocation.description = description;
        self.bridge.dispatch(invocation).await
    }

    pub fn finish(self) {}
}

impl Drop for RunScope {
    fn drop(&mut self) {
        self.bridge
            .runs
            .clear_active(&self.conversation_id, Some(&self.chat_run_id));
        self.bridge.runs.take_abort(&self.chat_run_id);
    }
}

fn normalize_context(context: CallContext) -> CallContext {
    CallContext {
        chat_run_id: normalize_id(context.chat_run_id),
        project_id: normalize_id(context.project_id),
        conversation_id: normalize_id(context.conversation_id),
    }
}

pub(crate) fn normalize_id(value: Option<String>) -> Option<String> {
    value
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

pub fn now_ts() -> f64 {
    Utc::now().timestamp_millis() as f64 / 1000.0
}

#[cfg(test)]
mod tests {
    use super::testing::{bridge_with_recorder, wait_for_pending};
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn result_resolves_dispatched_call() {
        let (bridge, recorder) = bridge_with_recorder();
        let task = {
            let bridge = bridge.clone();
            tokio::spawn(async move {
                bridge
                    .dispatch(
                        ToolInvocation::new("proj-1", "get_diagram", json!({ "page": 1 }))
                            .with_description("read page 1"),
                    )
                    .await
            })
        };
        let request_id = wait_for_pending(&bridge, 1).await.remove(0);

        let sent = recorder.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, "proj-1");
        let payload = sent[0].1.payload.clone().expect("payload");
        assert_eq!(payload["requestId"], json!(request_id));
        assert_eq!(payload["toolName"], json!("get_diagram"));
        assert_eq!(payload["timeoutMs"], json!(10_000));
        assert_eq!(payload["description"], json!("read page 1"));

        assert!(bridge.handle_result(
            ToolResultMessage {
                request_id: request_id.clone(),
                success: true,
                result: Some(json!({ "xml": "<mxfile/>" })),
                error: None,
            },
            None
        ));
        let outcome = task.await.expect("join");
        assert_eq!(outcome, Ok(json!({ "xml": "<mxfile/>" })));
        assert!(bridge.requests().is_empty());
    }

    #[tokio::test]
    async fn client_failure_is_surfaced() {
        let (bridge, _recorder) = bridge_with_recorder();
        let task = {
            let bridge = bridge.clone();
            tokio::spawn(async move {
                bridge
                    .dispatch(ToolInvocation::new("proj-1", "render_preview", json!({})))
                    .await
            })
        };
        let request_id = wait_for_pending(&bridge, 1).await.remove(0);
        bridge.handle_result(
            ToolResultMessage {
                request_id,
                success: false,
                result: None,
                error: Some(json!("canvas not mounted")),
            },
            None
        );
        let err = task.await.expect("join").expect_err("tool failed");
        assert_eq!(
            err,
            BridgeError::ToolFailed {
                message: "canvas not mounted".to_string()
            }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn deadline_settles_with_timeout_and_late_result_is_noop() {
        let (bridge, _recorder) = bridge_with_recorder();
        let task = {
            let bridge = bridge.clone();
            tokio::spawn(async move {
                bridge
                    .dispatch(
                        ToolInvocation::new("proj-1", "get_diagram", json!({}))
                            .with_timeout(Duration::from_millis(50)),
                    )
                    .await
            })
        };
        let request_id = wait_for_pending(&bridge, 1).await.remove(0);
        let started = tokio::time::Instant::now();
        let err = task.await.expect("join").expect_err("timed out");
        assert_eq!(err, BridgeError::timeout("get_diagram", 50));
        assert!(started.elapsed() >= Duration::from_millis(40));
        assert!(started.elapsed() < Duration::from_millis(200));

        assert!(!bridge.handle_result(
            ToolResultMessage {
                request_id,
                success: true,
                result: Some(json!("late")),
                error: None,
            },
            None
        ));
    }

    #[tokio::test]
    async fn send_failure_surfaces_channel_error() {
        let (bridge, recorder) = bridge_with_recorder();
        recorder.fail_sends(true);
        let err = bridge
            .dispatch(ToolInvocation::new("proj-1", "export_diagram", json!({})))
            .await
            .expect_err("no client");
        assert_eq!(err.code(), "CHANNEL_FAILURE");
        assert!(bridge.requests().is_empty());
    }

    #[tokio::test]
    async fn missing_project_or_tool_is_rejected_up_front() {
        let (bridge, recorder) = bridge_with_recorder();
        let err = bridge
            .dispatch(ToolInvocation::new("  ", "get_diagram", json!({})))
            .await
            .expect_err("project required");
        assert_eq!(err, BridgeError::invalid("project id required"));
        let err = bridge
            .dispatch(ToolInvocation::new("proj-1", " ", json!({})))
            .await
            .expect_err("tool required");
        assert_eq!(err.code(), "INVALID_REQUEST");
        assert!(recorder.sent().is_empty());
    }

    #[tokio::test]
    async fn dispatch_under_cancelled_run_never_reaches_clients() {
        let (bridge, recorder) = bridge_with_recorder();
        bridge.runs().cancel("run-3");
        let err = bridge
            .dispatch(
                ToolInvocation::new("proj-1", "apply_diagram_edits", json!({}))
                    .with_run("conv-1", "run-3"),
            )
            .await
            .expect_err("cancelled");
        assert!(err.is_cancelled());
        assert!(recorder.sent().is_empty());
    }

    #[tokio::test]
    async fn dropped_caller_leaves_no_pending_entry() {
        let (bridge, _recorder) = bridge_with_recorder();
        let task = {
            let bridge = bridge.clone();
            tokio::spawn(async move {
                bridge
                    .dispatch(ToolInvocation::new("proj-1", "export_all_pages", json!({})))
                    .await
            })
        };
        wait_for_pending(&bridge, 1).await;
        task.abort();
        let _ = task.await;
        assert!(bridge.requests().is_empty());
    }

    #[tokio::test]
    async fn run_scope_tracks_and_clears_bookkeeping() {
        let (bridge, _recorder) = bridge_with_recorder();
        let scope = bridge.begin_run("conv-1", "run-1");
        assert_eq!(bridge.runs().get_active("conv-1").as_deref(), Some("run-1"));
        assert!(bridge.runs().has_abort("run-1"));
        assert!(!scope.is_cancelled());

        let newer = bridge.begin_run("conv-1", "run-2");
        scope.finish();
        assert_eq!(bridge.runs().get_active("conv-1").as_deref(), Some("run-2"));
        assert!(!bridge.runs().has_abort("run-1"));
        drop(newer);
        assert_eq!(bridge.runs().get_active("conv-1"), None);
    }

    #[tokio::test]
    async fn emptied_project_fails_its_calls() {
        let (bridge, _recorder) = bridge_with_recorder();
        let task = {
            let bridge = bridge.clone();
            tokio::spawn(async move {
                bridge
                    .dispatch(ToolInvocation::new("proj-9", "render_preview", json!({})))
                    .await
            })
        };
        wait_for_pending(&bridge, 1).await;
        assert_eq!(bridge.fail_project("proj-9"), 1);
        let err = task.await.expect("join").expect_err("channel failure");
        assert_eq!(err.code(), "CHANNEL_FAILURE");
    }

    #[tokio::test]
    async fn run_cancelled_before_start_gets_fired_token() {
        let (bridge, _recorder) = bridge_with_recorder();
        bridge.cancel_run("run-1", None).await;

        let scope = bridge.begin_run("conv-1", "run-1");
        assert!(scope.abort_token().is_cancelled());
        assert!(scope.is_cancelled());
        let err = scope
            .call_tool("proj-1", "get_diagram", json!({}), None)
            .await
            .expect_err("cancelled run");
        assert!(err.is_cancelled());
    }

    #[tokio::test]
    async fn result_from_outside_project_room_is_ignored() {
        let bridge = Arc::new(ToolBridge::new(&BridgeConfig::default()));
        let (tx, mut rx) = tokio::sync::mpsc::channel(4);
        bridge.rooms().join("proj-1", "conn-a", tx);
        let (stranger_tx, _stranger_rx) = tokio::sync::mpsc::channel(4);
        bridge.rooms().join("proj-2", "conn-x", stranger_tx);

        let task = {
            let bridge = bridge.clone();
            tokio::spawn(async move {
                bridge
                    .dispatch(ToolInvocation::new("proj-1", "list_pages", json!({})))
                    .await
            })
        };
        let request_id = wait_for_pending(&bridge, 1).await.remove(0);
        assert!(rx.recv().await.is_some());

        let result = |value: &str| ToolResultMessage {
            request_id: request_id.clone(),
            success: true,
            result: Some(json!(value)),
            error: None,
        };
        assert!(!bridge.handle_result(result("forged"), Some("conn-x")));
        assert!(bridge.requests().contains(&request_id));
        assert!(bridge.handle_result(result("pages"), Some("conn-a")));
        assert_eq!(task.await.expect("join"), Ok(json!("pages")));
    }
}
