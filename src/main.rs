//! reg-agent 服务入口
//!
//! 加载配置、初始化日志、装配编排器，启动 HTTP 与 WebSocket 监听，
//! 收到 Ctrl+C / SIGTERM 后停止监听并等待执行中的任务结束。
//!
//! ```bash
//! cargo run                                   # 默认 config/default.toml
//! REG_AGENT__FDA__OFFLINE=true cargo run      # 离线模式
//! ```

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use reg_agent::config::load_config;
use reg_agent::core::{
    serve_until_shutdown, OrchestratorBuilder, ShutdownReason, ShutdownSignal, Storage,
};
use reg_agent::gateway::{http, ws};
use tokio::net::TcpListener;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    reg_agent::observability::init();

    let config_path = std::env::args().nth(1).map(PathBuf::from);
    let config = load_config(config_path).context("Failed to load configuration")?;

    let storage = Storage::open(&config)
        .await
        .context("Failed to open storage")?;
    let orchestrator = OrchestratorBuilder::new(config.clone())
        .with_storage(storage)
        .build()
        .context("Failed to build capability registry")?;
    orchestrator.start();

    let http_listener = TcpListener::bind(&config.server.http_bind)
        .await
        .with_context(|| format!("Failed to bind {}", config.server.http_bind))?;
    let ws_listener = TcpListener::bind(&config.server.ws_bind)
        .await
        .with_context(|| format!("Failed to bind {}", config.server.ws_bind))?;

    let signal = Arc::new(ShutdownSignal::new());
    let token = signal.token();

    let app = http::router(orchestrator.clone(), config.server.max_http_concurrency);
    let http_token = token.clone();
    let http_signal = signal.clone();
    let http_bind = config.server.http_bind.clone();
    let http_server = async move {
        tracing::info!(addr = %http_bind, "http listening");
        let result = axum::serve(http_listener, app)
            .with_graceful_shutdown(async move { http_token.cancelled().await })
            .await;
        if let Err(e) = result {
            tracing::error!(error = %e, "http server failed");
            http_signal.trigger(ShutdownReason::ServerFailed(e.to_string()));
        }
    };

    let ws_server = ws::serve(ws_listener, orchestrator.hub().clone(), token);
    let servers = async move {
        let (_, ws_result) = tokio::join!(http_server, ws_server);
        if let Err(e) = ws_result {
            tracing::error!(error = %e, "websocket server failed");
        }
    };

    serve_until_shutdown(
        signal,
        servers,
        &orchestrator,
        Duration::from_secs(config.server.shutdown_grace_secs),
    )
    .await;

    Ok(())
}
