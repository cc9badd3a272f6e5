//! relay-rs：多渠道 LLM API 网关
//!
//! 接受 OpenAI / Anthropic 两种方言的聊天请求，按权重在已配置的
//! 上游渠道间调度转发，跨方言自动转换请求/响应/流式格式，
//! 并为每次调度落一条用量记录。

mod channel;
mod common;
mod convert;
mod dedup;
mod dispatch;
mod http_client;
mod model;
mod proxy;
mod usage;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use channel::ChannelStore;
use dedup::PendingRequests;
use dispatch::RetryPolicy;
use model::config::Config;
use proxy::AppState;
use usage::UsageRecorder;

/// 命令行参数
#[derive(Parser, Debug)]
#[command(name = "relay-rs", about = "多渠道 LLM API 网关")]
struct Args {
    /// 配置文件路径
    #[arg(short, long, default_value_t = Config::default_config_path().to_string())]
    config: String,

    /// 监听地址（覆盖配置文件）
    #[arg(long)]
    host: Option<String>,

    /// 监听端口（覆盖配置文件）
    #[arg(long)]
    port: Option<u16>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let mut config = Config::load(&args.config)
        .with_context(|| format!("加载配置失败: {}", args.config))?;
    if let Some(host) = args.host {
        config.host = host;
    }
    if let Some(port) = args.port {
        config.port = port;
    }

    let store = ChannelStore::open(&config.db_path)
        .with_context(|| format!("打开数据库失败: {}", config.db_path))?;
    let recorder = Arc::new(
        UsageRecorder::new(&config.db_path).context("初始化用量记录服务失败")?,
    );
    let client = http_client::build_client(config.proxy_url.as_deref(), config.connect_timeout_secs)
        .context("构建上游 HTTP 客户端失败")?;

    let state = AppState {
        store,
        recorder: recorder.clone(),
        client,
        policy: RetryPolicy {
            rounds: config.retry_rounds.max(1),
            delay: Duration::from_millis(config.retry_delay_ms),
        },
        model_filter_fallback: config.model_filter_fallback,
        max_body_bytes: config.max_body_bytes,
        pending: Arc::new(PendingRequests::new(Duration::from_secs(
            config.dedup_ttl_secs,
        ))),
    };

    let mut app = proxy::create_proxy_router(state).layer(proxy::middleware::cors_layer());

    // 配置了 Admin Key 才开放用量查询 API
    if let Some(admin_api_key) = &config.admin_api_key {
        app = app.nest(
            "/api/admin",
            usage::create_usage_router(admin_api_key.clone(), recorder),
        );
        tracing::info!("用量查询 API 已启用: /api/admin/usage");
    }

    let addr = format!("{}:{}", config.host, config.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("监听失败: {}", addr))?;
    tracing::info!("relay-rs 已启动: http://{}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("服务运行失败")?;

    tracing::info!("服务已退出");
    Ok(())
}

/// 等待 Ctrl+C / SIGTERM
async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::warn!("注册 SIGTERM 处理失败: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    tracing::info!("收到退出信号，正在优雅关闭");
}
