use parking_lot::Mutex;
use std::collections::{HashMap, HashSet, VecDeque};
use tokio_util::sync::CancellationToken;

pub const DEFAULT_CANCELLED_RUN_CAPACITY: usize = 500;

#[derive(Debug, Default)]
struct CancelledRuns {
    order: VecDeque<String>,
    members: HashSet<String>,
}

#[derive(Debug, Default)]
struct RunState {
    active: HashMap<String, String>,
    cancelled: CancelledRuns,
    aborts: HashMap<String, CancellationToken>,
}

/// Tracks the active run per conversation, a bounded set of cancelled run
/// ids, and the abort handle lookup for in-flight runs.
///
/// Every id is trimmed; blank ids never reach the maps.
pub struct ChatRunRegistry {
    capacity: usize,
    state: Mutex<RunState>,
}

impl ChatRunRegistry {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CANCELLED_RUN_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            state: Mutex::new(RunState::default()),
        }
    }

    pub fn set_active(&self, conversation_id: &str, chat_run_id: &str) {
        let (Some(conversation_id), Some(chat_run_id)) =
            (clean(conversation_id), clean(chat_run_id))
        else {
            return;
        };
        self.state
            .lock()
            .active
            .insert(conversation_id.to_string(), chat_run_id.to_string());
    }

    /// With a run id, clears only while that run is still the recorded one so
    /// a late clear cannot erase a newer run.
    pub fn clear_active(&self, conversation_id: &str, chat_run_id: Option<&str>) {
        let Some(conversation_id) = clean(conversation_id) else {
            return;
        };
        let mut state = self.state.lock();
        match chat_run_id {
            Some(raw) => {
                let Some(chat_run_id) = clean(raw) else {
                    return;
                };
                let matches = state
                    .active
                    .get(conversation_id)
                    .is_some_and(|current| current == chat_run_id);
                if matches {
                    state.active.remove(conversation_id);
                }
            }
            None => {
                state.active.remove(conversation_id);
            }
        }
    }

    pub fn get_active(&self, conversation_id: &str) -> Option<String> {
        let conversation_id = clean(conversation_id)?;
        self.state.lock().active.get(conversation_id).cloned()
    }

    /// Returns true when the id was newly added.
    pub fn cancel(&self, chat_run_id: &str) -> bool {
        let Some(chat_run_id) = clean(chat_run_id) else {
            return false;
        };
        let mut state = self.state.lock();
        let cancelled = &mut state.cancelled;
        if !cancelled.members.insert(chat_run_id.to_string()) {
            return false;
        }
        cancelled.order.push_back(chat_run_id.to_string());
        while cancelled.order.len() > self.capacity {
            if let Some(oldest) = cancelled.order.pop_front() {
                cancelled.members.remove(&oldest);
            }
        }
        true
    }

    pub fn is_cancelled(&self, chat_run_id: &str) -> bool {
        let Some(chat_run_id) = clean(chat_run_id) else {
            return false;
        };
        self.state.lock().cancelled.members.contains(chat_run_id)
    }

    pub fn cancelled_len(&self) -> usize {
        self.state.lock().cancelled.order.len()
    }

    pub fn active_len(&self) -> usize {
        self.state.lock().active.len()
    }

    pub fn register_abort(&self, chat_run_id: &str, token: CancellationToken) {
        let Some(chat_run_id) = clean(chat_run_id) else {
            return;
        };
        self.state
            .lock()
            .aborts
            .insert(chat_run_id.to_string(), token);
    }

    pub fn take_abort(&self, chat_run_id: &str) -> Option<CancellationToken> {
        let chat_run_id = clean(chat_run_id)?;
        self.state.lock().aborts.remove(chat_run_id)
    }

    pub fn has_abort(&self, chat_run_id: &str) -> bool {
        clean(chat_run_id)
            .map(|chat_run_id| self.state.lock().aborts.contains_key(chat_run_id))
            .unwrap_or(false)
    }
}

impl Default for ChatRunRegistry {
    fn default() -> Self {
        Self::new()
    }
}

fn clean(value: &str) -> Option<&str> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed)
    }
}
