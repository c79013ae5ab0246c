use super::error::{BridgeError, BridgeResult};
use super::now_ts;
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use tokio::sync::oneshot;
use tracing::error;

pub type CallOutcome = BridgeResult<Value>;

/// Routing and run context attached to a dispatched call.
#[derive(Debug, Clone, Default)]
pub struct CallContext {
    pub chat_run_id: Option<String>,
    pub project_id: Option<String>,
    pub conversation_id: Option<String>,
}

pub struct PendingCall {
    pub request_id: String,
    pub tool_name: String,
    pub context: CallContext,
    pub created_at: f64,
    settle: oneshot::Sender<CallOutcome>,
}

impl PendingCall {
    pub fn new(
        request_id: impl Into<String>,
        tool_name: impl Into<String>,
        context: CallContext,
    ) -> (Self, oneshot::Receiver<CallOutcome>) {
        let (tx, rx) = oneshot::channel();
        let call = Self {
            request_id: request_id.into(),
            tool_name: tool_name.into(),
            context,
            created_at: now_ts(),
            settle: tx,
        };
        (call, rx)
    }

    /// Consumes the call, so a handle can only ever fire once. Returns false
    /// when the waiter already went away.
    pub fn resolve(self, value: Value) -> bool {
        self.settle.send(Ok(value)).is_ok()
    }

    pub fn reject(self, err: BridgeError) -> bool {
        self.settle.send(Err(err)).is_ok()
    }

    fn summary(&self, now: f64) -> PendingCallSummary {
        PendingCallSummary {
            request_id: self.request_id.clone(),
            tool_name: self.tool_name.clone(),
            chat_run_id: self.context.chat_run_id.clone(),
            project_id: self.context.project_id.clone(),
            conversation_id: self.context.conversation_id.clone(),
            age_ms: ((now - self.created_at).max(0.0) * 1000.0).round() as u64,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingCallSummary {
    pub request_id: String,
    pub tool_name: String,
    pub chat_run_id: Option<String>,
    pub project_id: Option<String>,
    pub conversation_id: Option<String>,
    pub age_ms: u64,
}

#[derive(Default)]
pub struct RequestRegistry {
    entries: Mutex<HashMap<String, PendingCall>>,
}

impl RequestRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, call: PendingCall) -> BridgeResult<()> {
        let mut entries = self.entries.lock();
        if entries.contains_key(&call.request_id) {
            error!(
                target: "canvas_bridge.bridge",
                request_id = %call.request_id,
                tool_name = %call.tool_name,
                "duplicate request id rejected"
            );
            return Err(BridgeError::DuplicateRequestId {
                request_id: call.request_id,
            });
        }
        entries.insert(call.request_id.clone(), call);
        Ok(())
    }

    pub fn settle_ok(&self, request_id: &str, value: Value) -> bool {
        match self.take(request_id) {
            Some(call) => {
                call.resolve(value);
                true
            }
            None => false,
        }
    }

    pub fn settle_err(&self, request_id: &str, err: BridgeError) -> bool {
        match self.take(request_id) {
            Some(call) => {
                call.reject(err);
                true
            }
            None => false,
        }
    }

    pub fn sweep_by_run(&self, chat_run_id: &str) -> Vec<PendingCall> {
        let chat_run_id = chat_run_id.trim();
        if chat_run_id.is_empty() {
            return Vec::new();
        }
        self.sweep(|call| call.context.chat_run_id.as_deref() == Some(chat_run_id))
    }

    pub fn sweep_by_project(&self, project_id: &str) -> Vec<PendingCall> {
        let project_id = project_id.trim();
        if project_id.is_empty() {
            return Vec::new();
        }
        self.sweep(|call| call.context.project_id.as_deref() == Some(project_id))
    }

    /// Project the call was routed to; `None` when the id is not pending.
    pub fn project_of(&self, request_id: &str) -> Option<Option<String>> {
        self.entries
            .lock()
            .get(request_id.trim())
            .map(|call| call.context.project_id.clone())
    }

    pub fn contains(&self, request_id: &str) -> bool {
        self.entries.lock().contains_key(request_id.trim())
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn snapshot(&self) -> Vec<PendingCallSummary> {
        let now = now_ts();
        let entries = self.entries.lock();
        let mut items = entries
            .values()
            .map(|call| call.summary(now))
            .collect::<Vec<_>>();
        items.sort_by(|left, right| right.age_ms.cmp(&left.age_ms));
        items
    }

    fn take(&self, request_id: &str) -> Option<PendingCall> {
        let request_id = request_id.trim();
        if request_id.is_empty() {
            return None;
        }
        self.entries.lock().remove(request_id)
    }

    fn sweep<F>(&self, predicate: F) -> Vec<PendingCall>
    where
        F: Fn(&PendingCall) -> bool,
    {
        let mut entries = self.entries.lock();
        let request_ids = entries
            .iter()
            .filter_map(|(request_id, call)| {
                if predicate(call) {
                    Some(request_id.clone())
                } else {
                    None
                }
            })
            .collect::<Vec<_>>();
        request_ids
            .into_iter()
            .filter_map(|request_id| entries.remove(&request_id))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Arc;
    use tokio::sync::Barrier;

    fn run_context(chat_run_id: &str) -> CallContext {
        CallContext {
            chat_run_id: Some(chat_run_id.to_string()),
            project_id: Some("proj-1".to_string()),
            conversation_id: Some("conv-1".to_string()),
        }
    }

    #[tokio::test]
    async fn first_settlement_wins() {
        let registry = RequestRegistry::new();
        let (call, rx) = PendingCall::new("r1", "get_diagram", CallContext::default());
        registry.register(call).expect("register");

        assert!(registry.settle_ok("r1", json!({ "pages": 2 })));
        assert!(!registry.settle_err("r1", BridgeError::timeout("get_diagram", 10)));
        assert!(!registry.settle_ok("r1", json!(null)));
        assert!(!registry.contains("r1"));

        let outcome = rx.await.expect("outcome delivered");
        assert_eq!(outcome, Ok(json!({ "pages": 2 })));
    }

    #[tokio::test]
    async fn reject_first_then_late_result_is_noop() {
        let registry = RequestRegistry::new();
        let (call, rx) = PendingCall::new("r2", "export_diagram", CallContext::default());
        registry.register(call).expect("register");

        assert!(registry.settle_err("r2", BridgeError::cancelled(None)));
        assert!(!registry.settle_ok("r2", json!("late")));
        assert_eq!(rx.await.expect("outcome"), Err(BridgeError::cancelled(None)));
    }

    #[test]
    fn duplicate_registration_fails_without_overwrite() {
        let registry = RequestRegistry::new();
        let (first, _first_rx) = PendingCall::new("dup", "get_diagram", CallContext::default());
        let (second, _second_rx) = PendingCall::new("dup", "save_diagram", CallContext::default());
        registry.register(first).expect("first register");
        let err = registry.register(second).expect_err("duplicate must fail");
        assert_eq!(err.code(), "DUPLICATE_REQUEST_ID");
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.snapshot()[0].tool_name, "get_diagram");
    }

    #[test]
    fn unknown_ids_are_silent_noops() {
        let registry = RequestRegistry::new();
        assert!(!registry.settle_ok("missing", json!(1)));
        assert!(!registry.settle_err("", BridgeError::cancelled(None)));
        assert!(registry.sweep_by_run("  ").is_empty());
    }

    #[test]
    fn sweep_by_run_takes_only_matching_calls() {
        let registry = RequestRegistry::new();
        let mut receivers = Vec::new();
        for idx in 0..3 {
            let (call, rx) =
                PendingCall::new(format!("a{idx}"), "apply_diagram_edits", run_context("run-a"));
            registry.register(call).expect("register");
            receivers.push(rx);
        }
        for idx in 0..2 {
            let (call, rx) =
                PendingCall::new(format!("b{idx}"), "apply_diagram_edits", run_context("run-b"));
            registry.register(call).expect("register");
            receivers.push(rx);
        }
        let (legacy, _legacy_rx) =
            PendingCall::new("legacy", "get_diagram", CallContext::default());
        registry.register(legacy).expect("register");

        let swept = registry.sweep_by_run(" run-a ");
        assert_eq!(swept.len(), 3);
        assert!(swept
            .iter()
            .all(|call| call.context.chat_run_id.as_deref() == Some("run-a")));
        assert_eq!(registry.len(), 3);
        assert!(registry.contains("b0"));
        assert!(registry.contains("legacy"));
        assert!(registry.sweep_by_run("run-a").is_empty());
    }

    #[test]
    fn sweep_by_project_matches_routing_context() {
        let registry = RequestRegistry::new();
        let (call, _rx) = PendingCall::new("p1", "render_preview", run_context("run-a"));
        registry.register(call).expect("register");
        assert!(registry.sweep_by_project("other").is_empty());
        assert_eq!(registry.sweep_by_project("proj-1").len(), 1);
        assert!(registry.is_empty());
    }

    #[test]
    fn settling_after_waiter_dropped_still_removes_entry() {
        let registry = RequestRegistry::new();
        let (call, rx) = PendingCall::new("gone", "get_diagram", CallContext::default());
        registry.register(call).expect("register");
        drop(rx);
        assert!(registry.settle_ok("gone", json!(true)));
        assert!(registry.is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn racing_settlers_deliver_exactly_one_outcome() {
        for round in 0..200 {
            let registry = Arc::new(RequestRegistry::new());
            let request_id = format!("race-{round}");
            let (call, rx) = PendingCall::new(
                request_id.clone(),
                "apply_diagram_edits",
                run_context("run-race"),
            );
            registry.register(call).expect("register");

            let barrier = Arc::new(Barrier::new(3));
            let mut handles = Vec::new();
            for settler in 0..3 {
                let registry = registry.clone();
                let barrier = barrier.clone();
                let request_id = request_id.clone();
                handles.push(tokio::spawn(async move {
                    barrier.wait().await;
                    match settler {
                        0 => registry.settle_ok(&request_id, json!("done")),
                        1 => registry.settle_err(
                            &request_id,
                            BridgeError::timeout("apply_diagram_edits", 50),
                        ),
                        _ => {
                            let swept = registry.sweep_by_run("run-race");
                            let won = !swept.is_empty();
                            for call in swept {
                                call.reject(BridgeError::cancelled(None));
                            }
                            won
                        }
                    }
                }));
            }
            let mut wins = 0;
            for handle in handles {
                if handle.await.expect("join") {
                    wins += 1;
                }
            }
            assert_eq!(wins, 1, "round {round}");
            let outcome = rx.await.expect("one outcome delivered");
            match outcome {
                Ok(value) => assert_eq!(value, json!("done")),
                Err(err) => assert!(matches!(
                    err,
                    BridgeError::Timeout { .. } | BridgeError::Cancelled { .. }
                )),
            }
            assert!(registry.is_empty());
            assert!(!registry.settle_ok(&request_id, json!("late")));
        }
    }
}
