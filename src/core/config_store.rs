// 配置存储：启动时加载一次，供各请求共享读取。
use super::config::{load_config_from, Config};
use std::path::Path;
use std::sync::Arc;
use tokio::sync::RwLock;

#[derive(Clone)]
pub struct ConfigStore {
    inner: Arc<RwLock<Config>>,
}

impl ConfigStore {
    pub fn new(config: Config) -> Self {
        Self {
            inner: Arc::new(RwLock::new(config)),
        }
    }

    pub fn load(base_path: &Path, override_path: Option<&Path>) -> Self {
        Self::new(load_config_from(base_path, override_path))
    }

    pub async fn get(&self) -> Config {
        self.inner.read().await.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn load_reads_base_and_override_files() {
        let dir = tempfile::tempdir().expect("tempdir");
        let base = dir.path().join("bridge.yaml");
        let override_path = dir.path().join("bridge.override.yaml");
        std::fs::write(&base, "server:\n  port: 9001\n").expect("write base");
        std::fs::write(&override_path, "bridge:\n  outbound_queue_size: 8\n")
            .expect("write override");

        let store = ConfigStore::load(&base, Some(&override_path));
        let shared = store.clone();
        let config = shared.get().await;
        assert_eq!(config.server.port, 9001);
        assert_eq!(config.bridge.outbound_queue_size, 8);
    }
}
