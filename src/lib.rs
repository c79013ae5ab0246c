// 库入口：供服务端二进制与集成测试复用。
pub mod api;
pub mod bridge;
mod core;

pub use api::build_router;
pub use bridge::{CancelOutcome, RunScope, ToolBridge, ToolInvocation};
pub use self::core::{config, config_store, port, shutdown, state};
