// 工具桥服务入口：加载配置、挂载路由并监听端口。
use anyhow::Context;
use canvas_bridge::build_router;
use canvas_bridge::config::{config_path_default, override_path_default, Config};
use canvas_bridge::config_store::ConfigStore;
use canvas_bridge::port::pick_port;
use canvas_bridge::shutdown::shutdown_signal;
use canvas_bridge::state::AppState;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tower_http::cors::{AllowHeaders, AllowMethods, AllowOrigin, Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

#[derive(Debug, Parser)]
#[command(
    author,
    version,
    bin_name = "canvas-bridge-server",
    about = "Run the diagram assistant tool-call bridge"
)]
struct ServerArgs {
    /// Config file. Defaults to $CANVAS_BRIDGE_CONFIG_PATH or config/canvas-bridge.yaml.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Bind host, overrides config and CANVAS_BRIDGE_HOST.
    #[arg(long)]
    host: Option<String>,

    /// Bind port (0 = random free port).
    #[arg(long)]
    port: Option<u16>,

    /// Fall back to a free port when the requested one is taken.
    #[arg(long, default_value_t = false)]
    auto_port: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = ServerArgs::parse();
    let config_path = args.config.clone().unwrap_or_else(config_path_default);
    let override_path = override_path_default();
    let config_store = ConfigStore::load(&config_path, Some(&override_path));
    let config = config_store.get().await;
    init_tracing(&config);
    let state = Arc::new(AppState::new(config_store, &config));

    let cors = build_cors(&config);
    let app = build_router(state.clone())
        .layer(cors)
        .layer(TraceLayer::new_for_http());

    let (host, port) = bind_address(&config, &args);
    let port = pick_port(&host, port, args.auto_port || config.server.auto_port)?;
    let addr = format!("{host}:{port}");
    let listener = tokio::net::TcpListener::bind(addr.as_str())
        .await
        .with_context(|| format!("bind {addr} failed"))?;
    info!("canvas bridge listening on http://{addr}");

    let server = axum::serve(listener, app).with_graceful_shutdown(shutdown_signal());
    if let Err(err) = server.await {
        warn!("bridge server exited with error: {err}");
    }

    Ok(())
}

fn init_tracing(config: &Config) {
    let default_level = config.observability.log_level.trim();
    let default_level = if default_level.is_empty() {
        "info".to_string()
    } else {
        default_level.to_lowercase()
    };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if config
        .observability
        .log_format
        .trim()
        .eq_ignore_ascii_case("json")
    {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn bind_address(config: &Config, args: &ServerArgs) -> (String, u16) {
    // 优先级：命令行 > 环境变量 > 配置文件。
    let host = args
        .host
        .clone()
        .or_else(|| std::env::var("CANVAS_BRIDGE_HOST").ok())
        .unwrap_or_else(|| config.server.host.clone());
    let port = args.port.unwrap_or_else(|| {
        std::env::var("CANVAS_BRIDGE_PORT")
            .ok()
            .and_then(|value| value.parse::<u16>().ok())
            .unwrap_or(config.server.port)
    });
    (host, port)
}

fn build_cors(config: &Config) -> CorsLayer {
    let mut cors = CorsLayer::new();

    match config.cors.allow_origins.as_deref() {
        Some(origins) if origins.iter().any(|value| value == "*") => {
            cors = cors.allow_origin(Any);
        }
        Some(origins) => {
            let values = origins
                .iter()
                .filter_map(|value| value.parse().ok())
                .collect::<Vec<_>>();
            if !values.is_empty() {
                cors = cors.allow_origin(AllowOrigin::list(values));
            }
        }
        None => {
            cors = cors.allow_origin(Any);
        }
    }

    match config.cors.allow_methods.as_deref() {
        Some(methods) if methods.iter().any(|value| value == "*") => {
            cors = cors.allow_methods(Any);
        }
        Some(methods) => {
            let values = methods
                .iter()
                .filter_map(|value| value.parse().ok())
                .collect::<Vec<_>>();
            if !values.is_empty() {
                cors = cors.allow_methods(AllowMethods::list(values));
            }
        }
        None => {
            cors = cors.allow_methods(Any);
        }
    }

    match config.cors.allow_headers.as_deref() {
        Some(headers) if headers.iter().any(|value| value == "*") => {
            cors = cors.allow_headers(Any);
        }
        Some(headers) => {
            let values = headers
                .iter()
                .filter_map(|value| value.parse().ok())
                .collect::<Vec<_>>();
            if !values.is_empty() {
                cors = cors.allow_headers(AllowHeaders::list(values));
            }
        }
        None => {
            cors = cors.allow_headers(Any);
        }
    }

    cors
}
