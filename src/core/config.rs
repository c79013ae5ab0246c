// 配置读取与覆盖合并：基础 YAML + 可选覆盖文件 + 环境变量占位符。
use crate::bridge::runs::DEFAULT_CANCELLED_RUN_CAPACITY;
use serde::de::{self, Deserializer, Visitor};
use serde::{Deserialize, Serialize};
use serde_yaml::Value;
use std::collections::HashMap;
use std::env;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::warn;

pub const CONFIG_PATH_ENV: &str = "CANVAS_BRIDGE_CONFIG_PATH";
pub const CONFIG_OVERRIDE_PATH_ENV: &str = "CANVAS_BRIDGE_CONFIG_OVERRIDE_PATH";
const DEFAULT_CONFIG_PATH: &str = "config/canvas-bridge.yaml";
const DEFAULT_OVERRIDE_PATH: &str = "data/config/canvas-bridge.override.yaml";

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub cors: CorsConfig,
    #[serde(default)]
    pub bridge: BridgeConfig,
    #[serde(default)]
    pub observability: ObservabilityConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port", deserialize_with = "deserialize_u16_from_any")]
    pub port: u16,
    /// Fall back to a free port when `port` is taken.
    #[serde(default)]
    pub auto_port: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            auto_port: false,
        }
    }
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8790
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct CorsConfig {
    pub allow_origins: Option<Vec<String>>,
    pub allow_methods: Option<Vec<String>>,
    pub allow_headers: Option<Vec<String>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BridgeConfig {
    #[serde(default)]
    pub default_timeout_ms: Option<u64>,
    #[serde(default)]
    pub tool_timeouts_ms: HashMap<String, u64>,
    #[serde(default = "default_cancelled_run_capacity")]
    pub cancelled_run_capacity: usize,
    #[serde(default = "default_max_message_bytes")]
    pub max_message_bytes: usize,
    #[serde(default = "default_outbound_queue_size")]
    pub outbound_queue_size: usize,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            default_timeout_ms: None,
            tool_timeouts_ms: HashMap::new(),
            cancelled_run_capacity: default_cancelled_run_capacity(),
            max_message_bytes: default_max_message_bytes(),
            outbound_queue_size: default_outbound_queue_size(),
        }
    }
}

fn default_cancelled_run_capacity() -> usize {
    DEFAULT_CANCELLED_RUN_CAPACITY
}

fn default_max_message_bytes() -> usize {
    4 * 1024 * 1024
}

fn default_outbound_queue_size() -> usize {
    64
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ObservabilityConfig {
    #[serde(default)]
    pub log_level: String,
    /// `text` (default) or `json`.
    #[serde(default)]
    pub log_format: String,
}

fn deserialize_u16_from_any<'de, D>(deserializer: D) -> Result<u16, D::Error>
where
    D: Deserializer<'de>,
{
    struct U16Visitor;

    impl<'de> Visitor<'de> for U16Visitor {
        type Value = u16;

        fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
            formatter.write_str("u16 or numeric string")
        }

        fn visit_u64<E>(self, value: u64) -> Result<Self::Value, E>
        where
            E: de::Error,
        {
            u16::try_from(value).map_err(|_| E::custom("u16 out of range"))
        }

        fn visit_i64<E>(self, value: i64) -> Result<Self::Value, E>
        where
            E: de::Error,
        {
            if value < 0 {
                return Err(E::custom("u16 must be non-negative"));
            }
            self.visit_u64(value as u64)
        }

        fn visit_str<E>(self, value: &str) -> Result<Self::Value, E>
        where
            E: de::Error,
        {
            let trimmed = value.trim();
            if trimmed.is_empty() {
                return Err(E::custom("u16 string is empty"));
            }
            trimmed
                .parse::<u16>()
                .map_err(|_| E::custom("invalid u16 string"))
        }
    }

    deserializer.deserialize_any(U16Visitor)
}

pub fn config_path_default() -> PathBuf {
    PathBuf::from(env::var(CONFIG_PATH_ENV).unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string()))
}

pub fn override_path_default() -> PathBuf {
    PathBuf::from(
        env::var(CONFIG_OVERRIDE_PATH_ENV).unwrap_or_else(|_| DEFAULT_OVERRIDE_PATH.to_string()),
    )
}

pub fn load_config_from(base_path: &Path, override_path: Option<&Path>) -> Config {
    let mut merged = read_yaml(base_path);
    if let Some(override_path) = override_path.filter(|path| path.exists()) {
        // 只对非空字段做递归覆盖，避免误清空已有配置。
        merge_yaml(&mut merged, read_yaml(override_path));
    }
    expand_yaml_env(&mut merged);
    if merged.is_null() {
        return Config::default();
    }
    serde_yaml::from_value::<Config>(merged).unwrap_or_else(|err| {
        warn!("config parse failed, using defaults: {err}");
        Config::default()
    })
}

fn read_yaml(path: &Path) -> Value {
    // 配置文件允许不存在，避免首次启动失败。
    let content = match fs::read_to_string(path) {
        Ok(text) => text,
        Err(err) => {
            warn!("config read failed: {}, {err}", path.display());
            return Value::Null;
        }
    };
    serde_yaml::from_str(&content).unwrap_or_else(|err| {
        warn!("config yaml invalid: {}, {err}", path.display());
        Value::Null
    })
}

fn merge_yaml(base: &mut Value, override_value: Value) {
    match (base, override_value) {
        (Value::Mapping(base_map), Value::Mapping(override_map)) => {
            for (key, value) in override_map {
                match base_map.get_mut(&key) {
                    Some(existing) => merge_yaml(existing, value),
                    None => {
                        base_map.insert(key, value);
                    }
                }
            }
        }
        (base_slot, override_value) => {
            if !override_value.is_null() {
                *base_slot = override_value;
            }
        }
    }
}

fn expand_yaml_env(value: &mut Value) {
    match value {
        Value::String(text) => {
            *text = expand_env_placeholders(text);
        }
        Value::Sequence(items) => {
            for item in items {
                expand_yaml_env(item);
            }
        }
        Value::Mapping(map) => {
            for (_, value) in map.iter_mut() {
                expand_yaml_env(value);
            }
        }
        _ => {}
    }
}

/// Expands `${NAME}` and `${NAME:-default}`; unset names without a default
/// expand to nothing.
fn expand_env_placeholders(input: &str) -> String {
    let mut output = String::with_capacity(input.len());
    let mut rest = input;
    while let Some(start) = rest.find("${") {
        output.push_str(&rest[..start]);
        rest = &rest[start + 2..];
        let Some(end) = rest.find('}') else {
            output.push_str("${");
            output.push_str(rest);
            return output;
        };
        let inner = &rest[..end];
        rest = &rest[end + 1..];
        let (name, default_value) = match inner.split_once(":-") {
            Some((name, default_value)) => (name.trim(), Some(default_value)),
            None => (inner.trim(), None),
        };
        if name.is_empty() {
            output.push_str("${");
            output.push_str(inner);
            output.push('}');
            continue;
        }
        let resolved = env::var(name).ok().filter(|value| !value.is_empty());
        match (resolved, default_value) {
            (Some(value), _) => output.push_str(&value),
            (None, Some(default_value)) => output.push_str(default_value),
            (None, None) => {}
        }
    }
    output.push_str(rest);
    output
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_expand_env_placeholders() {
        std::env::remove_var("CANVAS_BRIDGE_TEST_PLACEHOLDER");
        assert_eq!(
            expand_env_placeholders("${CANVAS_BRIDGE_TEST_PLACEHOLDER:-default}"),
            "default"
        );
        std::env::set_var("CANVAS_BRIDGE_TEST_PLACEHOLDER", "value");
        assert_eq!(
            expand_env_placeholders("prefix-${CANVAS_BRIDGE_TEST_PLACEHOLDER}-suffix"),
            "prefix-value-suffix"
        );
        std::env::remove_var("CANVAS_BRIDGE_TEST_PLACEHOLDER");
        assert_eq!(expand_env_placeholders("${CANVAS_BRIDGE_TEST_PLACEHOLDER}"), "");
        assert_eq!(expand_env_placeholders("${unterminated"), "${unterminated");
    }

    #[test]
    fn missing_file_yields_defaults() {
        let dir = tempfile::tempdir().expect("tempdir");
        let config = load_config_from(&dir.path().join("absent.yaml"), None);
        assert_eq!(config.server.port, 8790);
        assert_eq!(
            config.bridge.cancelled_run_capacity,
            DEFAULT_CANCELLED_RUN_CAPACITY
        );
    }

    #[test]
    fn override_file_merges_over_base() {
        let dir = tempfile::tempdir().expect("tempdir");
        let base_path = dir.path().join("base.yaml");
        let override_path = dir.path().join("override.yaml");
        let mut base = fs::File::create(&base_path).expect("create base");
        writeln!(
            base,
            "server:\n  host: 0.0.0.0\n  port: \"9100\"\nbridge:\n  tool_timeouts_ms:\n    export_diagram: 90000\n  cancelled_run_capacity: 8"
        )
        .expect("write base");
        fs::write(&override_path, "bridge:\n  cancelled_run_capacity: 3\n").expect("write override");

        let config = load_config_from(&base_path, Some(&override_path));
        assert_eq!(config.server.host, "0.0.0.0");
        assert_eq!(config.server.port, 9100);
        assert_eq!(config.bridge.cancelled_run_capacity, 3);
        assert_eq!(
            config.bridge.tool_timeouts_ms.get("export_diagram"),
            Some(&90_000)
        );
        assert_eq!(config.bridge.outbound_queue_size, 64);
    }
}
