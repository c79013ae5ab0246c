use super::error::{cancel_reason, BridgeError};
use super::notify::fire_and_forget;
use super::protocol::{Envelope, ToolCancelMessage};
use super::ToolBridge;
use serde::Serialize;
use tracing::info;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CancelOutcome {
    pub chat_run_id: String,
    pub newly_cancelled: bool,
    pub aborted: bool,
    pub rejected: usize,
    pub notified: usize,
}

impl ToolBridge {
    /// Cancels a chat run. Every step is best-effort and the call always
    /// succeeds: an unknown run is a valid no-op.
    pub async fn cancel_run(&self, chat_run_id: &str, reason: Option<&str>) -> CancelOutcome {
        let chat_run_id = chat_run_id.trim();
        let mut outcome = CancelOutcome {
            chat_run_id: chat_run_id.to_string(),
            ..CancelOutcome::default()
        };
        if chat_run_id.is_empty() {
            return outcome;
        }
        let reason = cancel_reason(reason);

        outcome.newly_cancelled = self.runs().cancel(chat_run_id);

        // The mapping goes away whether or not a handle was there.
        if let Some(token) = self.runs().take_abort(chat_run_id) {
            token.cancel();
            outcome.aborted = true;
        }

        // Repeat cancels still sweep: calls may have been registered since.
        let swept = self.requests().sweep_by_run(chat_run_id);
        let mut notices = Vec::new();
        for call in swept {
            let routing = call
                .context
                .project_id
                .clone()
                .zip(call.context.conversation_id.clone());
            if let Some((project_id, conversation_id)) = routing {
                notices.push(ToolCancelMessage {
                    request_id: call.request_id.clone(),
                    project_id,
                    conversation_id,
                    chat_run_id: chat_run_id.to_string(),
                    reason: reason.clone(),
                });
            }
            call.reject(BridgeError::Cancelled {
                reason: reason.clone(),
            });
            outcome.rejected += 1;
        }

        for notice in notices {
            if fire_and_forget(
                self.transport(),
                &notice.project_id,
                &Envelope::cancel(&notice),
                "tool_cancel",
            )
            .await
            {
                outcome.notified += 1;
            }
        }

        info!(
            target: "canvas_bridge.bridge",
            chat_run_id,
            reason = %reason,
            newly_cancelled = outcome.newly_cancelled,
            aborted = outcome.aborted,
            rejected = outcome.rejected,
            notified = outcome.notified,
            "chat run cancelled"
        );
        outcome
    }
}
