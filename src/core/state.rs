// 全局应用状态：集中初始化工具桥并注入到路由。

use super::config::Config;
use super::config_store::ConfigStore;
use crate::bridge::ToolBridge;
use std::sync::Arc;

pub struct AppState {
    pub config_store: ConfigStore,
    pub bridge: Arc<ToolBridge>,
}

impl AppState {
    pub fn new(config_store: ConfigStore, config: &Config) -> Self {
        Self {
            config_store,
            bridge: Arc::new(ToolBridge::new(&config.bridge)),
        }
    }

    pub fn from_config(config: Config) -> Self {
        let store = ConfigStore::new(config.clone());
        Self::new(store, &config)
    }
}
