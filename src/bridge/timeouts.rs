use std::collections::HashMap;
use std::time::Duration;

pub const DEFAULT_TOOL_TIMEOUT_MS: u64 = 30_000;

/// Built-in deadlines. Server-local reads/writes are short; anything that
/// renders or exports artifacts on the client gets a longer budget.
const BUILTIN_TIMEOUTS_MS: &[(&str, u64)] = &[
    ("get_diagram", 10_000),
    ("list_pages", 10_000),
    ("save_diagram", 15_000),
    ("apply_diagram_edits", 30_000),
    ("render_preview", 60_000),
    ("export_diagram", 120_000),
    ("export_all_pages", 300_000),
];

#[derive(Debug, Clone)]
pub struct TimeoutPolicy {
    default_ms: u64,
    table: HashMap<String, u64>,
}

impl TimeoutPolicy {
    pub fn builtin() -> Self {
        let table = BUILTIN_TIMEOUTS_MS
            .iter()
            .map(|(name, ms)| (name.to_string(), *ms))
            .collect();
        Self {
            default_ms: DEFAULT_TOOL_TIMEOUT_MS,
            table,
        }
    }

    /// Layers configured values over the built-in table. Zero and blank
    /// names are ignored.
    pub fn with_overrides(default_ms: Option<u64>, overrides: &HashMap<String, u64>) -> Self {
        let mut policy = Self::builtin();
        if let Some(default_ms) = default_ms.filter(|value| *value > 0) {
            policy.default_ms = default_ms;
        }
        for (name, ms) in overrides {
            let name = name.trim();
            if name.is_empty() || *ms == 0 {
                continue;
            }
            policy.table.insert(name.to_string(), *ms);
        }
        policy
    }

    pub fn timeout_ms(&self, tool_name: &str) -> u64 {
        self.table
            .get(tool_name.trim())
            .copied()
            .unwrap_or(self.default_ms)
    }

    pub fn timeout_for(&self, tool_name: &str) -> Duration {
        Duration::from_millis(self.timeout_ms(tool_name))
    }

    pub fn default_ms(&self) -> u64 {
        self.default_ms
    }
}

impl Default for TimeoutPolicy {
    fn default() -> Self {
        Self::builtin()
    }
}
