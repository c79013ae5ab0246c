use super::protocol::Envelope;
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use axum::extract::ws::Message;
use dashmap::DashMap;
use serde::Serialize;
use std::collections::HashMap;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::warn;

const SLOW_MEMBER_THRESHOLD: u32 = 3;

/// Outbound half of the duplex transport: fire-and-forget delivery to every
/// client in a project group.
#[async_trait]
pub trait GroupSender: Send + Sync {
    /// Returns how many members accepted the message; errors when nobody did.
    async fn send_to_group(&self, group_id: &str, envelope: &Envelope) -> Result<usize>;
}

struct RoomMember {
    sender: mpsc::Sender<Message>,
    slow_hits: u32,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomSummary {
    pub project_id: String,
    pub members: usize,
}

#[derive(Default)]
pub struct RoomHub {
    rooms: DashMap<String, HashMap<String, RoomMember>>,
    // 连接级驱逐信号：慢连接被踢出时通知其读循环关闭。
    evictions: DashMap<String, CancellationToken>,
}

impl RoomHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the token that fires when the hub evicts this connection.
    pub fn register_connection(&self, connection_id: &str) -> CancellationToken {
        self.evictions
            .entry(connection_id.to_string())
            .or_default()
            .clone()
    }

    /// Drops the connection from every room and forgets its eviction token.
    pub fn forget_connection(&self, connection_id: &str) -> Vec<String> {
        self.evictions.remove(connection_id);
        self.leave_all(connection_id)
    }

    pub fn is_member(&self, project_id: &str, connection_id: &str) -> bool {
        self.rooms
            .get(project_id.trim())
            .is_some_and(|room| room.contains_key(connection_id.trim()))
    }

    pub fn join(
        &self,
        project_id: &str,
        connection_id: &str,
        sender: mpsc::Sender<Message>,
    ) -> usize {
        let project_id = project_id.trim();
        if project_id.is_empty() || connection_id.trim().is_empty() {
            return 0;
        }
        let mut room = self.rooms.entry(project_id.to_string()).or_default();
        room.insert(
            connection_id.to_string(),
            RoomMember {
                sender,
                slow_hits: 0,
            },
        );
        room.len()
    }

    /// Returns the remaining member count, or `None` when the connection was
    /// not in the room.
    pub fn leave(&self, project_id: &str, connection_id: &str) -> Option<usize> {
        let project_id = project_id.trim();
        let remaining = {
            let mut room = self.rooms.get_mut(project_id)?;
            room.remove(connection_id)?;
            room.len()
        };
        if remaining == 0 {
            self.rooms.remove_if(project_id, |_, members| members.is_empty());
        }
        Some(remaining)
    }

    /// Drops a connection from every room it joined and reports which rooms
    /// became empty.
    pub fn leave_all(&self, connection_id: &str) -> Vec<String> {
        let joined = self
            .rooms
            .iter()
            .filter(|room| room.value().contains_key(connection_id))
            .map(|room| room.key().clone())
            .collect::<Vec<_>>();
        joined
            .into_iter()
            .filter(|project_id| self.leave(project_id, connection_id) == Some(0))
            .collect()
    }

    pub fn room_size(&self, project_id: &str) -> usize {
        self.rooms
            .get(project_id.trim())
            .map(|room| room.len())
            .unwrap_or(0)
    }

    pub fn snapshot(&self) -> Vec<RoomSummary> {
        let mut items = self
            .rooms
            .iter()
            .map(|room| RoomSummary {
                project_id: room.key().clone(),
                members: room.value().len(),
            })
            .collect::<Vec<_>>();
        items.sort_by(|left, right| left.project_id.cmp(&right.project_id));
        items
    }

    fn deliver(&self, project_id: &str, text: &str) -> (usize, Vec<String>) {
        let Some(mut room) = self.rooms.get_mut(project_id) else {
            return (0, Vec::new());
        };
        let mut delivered = 0;
        let mut dropped = Vec::new();
        for (connection_id, member) in room.iter_mut() {
            match member.sender.try_send(Message::Text(text.to_string().into())) {
                Ok(()) => {
                    member.slow_hits = 0;
                    delivered += 1;
                }
                Err(mpsc::error::TrySendError::Full(_)) => {
                    member.slow_hits += 1;
                    if member.slow_hits >= SLOW_MEMBER_THRESHOLD {
                        dropped.push(connection_id.clone());
                    }
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    dropped.push(connection_id.clone());
                }
            }
        }
        (delivered, dropped)
    }
}

#[async_trait]
impl GroupSender for RoomHub {
    async fn send_to_group(&self, group_id: &str, envelope: &Envelope) -> Result<usize> {
        let project_id = group_id.trim();
        if project_id.is_empty() {
            return Err(anyhow!("project id required"));
        }
        let (delivered, dropped) = self.deliver(project_id, &envelope.to_text());
        for connection_id in dropped {
            warn!(
                target: "canvas_bridge.bridge",
                project_id,
                connection_id = %connection_id,
                "dropping unresponsive room member"
            );
            self.leave(project_id, &connection_id);
            if let Some(token) = self.evictions.get(&connection_id) {
                token.cancel();
            }
        }
        if delivered == 0 {
            return Err(anyhow!("no connected client for project {project_id}"));
        }
        Ok(delivered)
    }
}
