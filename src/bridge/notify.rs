use super::protocol::Envelope;
use super::rooms::GroupSender;
use tracing::{debug, warn};

/// Best-effort delivery for notifications that must never hold up the
/// caller: failures are logged and reported as `false`, never propagated.
pub async fn fire_and_forget(
    transport: &dyn GroupSender,
    group_id: &str,
    envelope: &Envelope,
    label: &str,
) -> bool {
    match transport.send_to_group(group_id, envelope).await {
        Ok(delivered) => {
            debug!(
                target: "canvas_bridge.bridge",
                group_id,
                kind = %envelope.kind,
                label,
                delivered,
                "notification delivered"
            );
            true
        }
        Err(err) => {
            warn!(
                target: "canvas_bridge.bridge",
                group_id,
                kind = %envelope.kind,
                label,
                error = %err,
                "notification dropped"
            );
            false
        }
    }
}
