use super::protocol::Envelope;
use super::rooms::{GroupSender, RoomHub};
use super::ToolBridge;
use crate::config::BridgeConfig;
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// In-memory transport that records every group send.
#[derive(Default)]
pub(crate) struct RecordingTransport {
    sent: Mutex<Vec<(String, Envelope)>>,
    fail: AtomicBool,
}

impl RecordingTransport {
    pub(crate) fn sent(&self) -> Vec<(String, Envelope)> {
        self.sent.lock().clone()
    }

    pub(crate) fn sent_kind(&self, kind: &str) -> Vec<(String, Envelope)> {
        self.sent()
            .into_iter()
            .filter(|(_, envelope)| envelope.kind == kind)
            .collect()
    }

    pub(crate) fn fail_sends(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl GroupSender for RecordingTransport {
    async fn send_to_group(&self, group_id: &str, envelope: &Envelope) -> Result<usize> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(anyhow!("transport offline"));
        }
        self.sent
            .lock()
            .push((group_id.to_string(), envelope.clone()));
        Ok(1)
    }
}

pub(crate) fn bridge_with_recorder() -> (Arc<ToolBridge>, Arc<RecordingTransport>) {
    bridge_with_config(&BridgeConfig::default())
}

pub(crate) fn bridge_with_config(
    config: &BridgeConfig,
) -> (Arc<ToolBridge>, Arc<RecordingTransport>) {
    let recorder = Arc::new(RecordingTransport::default());
    let transport: Arc<dyn GroupSender> = recorder.clone();
    let bridge = Arc::new(ToolBridge::with_parts(
        config,
        Arc::new(RoomHub::new()),
        transport,
    ));
    (bridge, recorder)
}

/// Yields until at least `count` calls are pending and returns their ids,
/// oldest first.
pub(crate) async fn wait_for_pending(bridge: &ToolBridge, count: usize) -> Vec<String> {
    for _ in 0..10_000 {
        let pending = bridge.requests().snapshot();
        if pending.len() >= count {
            return pending.into_iter().map(|item| item.request_id).collect();
        }
        tokio::task::yield_now().await;
    }
    panic!("expected {count} pending calls");
}
