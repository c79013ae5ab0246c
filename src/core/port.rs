// 监听端口选择：首选端口被占用时可回退到系统分配的空闲端口。
use anyhow::{Context, Result};
use std::net::TcpListener;
use tracing::warn;

/// Returns `preferred` when it can be bound on `host`. Otherwise, when
/// `allow_fallback` is set, asks the OS for a free port. `preferred == 0`
/// always asks the OS.
pub fn pick_port(host: &str, preferred: u16, allow_fallback: bool) -> Result<u16> {
    if preferred == 0 {
        return os_assigned_port(host);
    }
    match TcpListener::bind((host, preferred)) {
        Ok(listener) => {
            drop(listener);
            Ok(preferred)
        }
        Err(err) if allow_fallback => {
            warn!("port {preferred} unavailable on {host}: {err}, picking a free port");
            os_assigned_port(host)
        }
        Err(err) => Err(err).with_context(|| format!("bind {host}:{preferred} failed")),
    }
}

fn os_assigned_port(host: &str) -> Result<u16> {
    let listener =
        TcpListener::bind((host, 0)).with_context(|| format!("bind {host}:0 failed"))?;
    let port = listener
        .local_addr()
        .with_context(|| format!("read local addr on {host} failed"))?
        .port();
    Ok(port)
}
