pub mod config;
pub mod config_store;
pub mod port;
pub mod shutdown;
pub mod state;
