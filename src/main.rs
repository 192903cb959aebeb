mod config;
mod engine;
mod error;
mod reconciler;
mod registry;
mod source;
mod state;
mod store;
mod supervisor;
mod web;

use anyhow::Context;
use clap::Parser;
use config::AppConfig;
use registry::{ConfiguredRegistry, RegistryClient};
use store::SegmentStore;
use supervisor::Supervisor;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

/// CCTV Relay - camera stream supervisor and HLS delivery server
/// 解析命令行参数，加载配置文件，启动对账循环与 HTTP 服务
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// 配置文件路径
    #[arg(short, long, default_value = "cctv-relay.yaml")]
    config: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // 初始化日志系统，RUST_LOG 可覆盖默认级别
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "cctv_relay=info,tower_http=info".into()),
        )
        .init();

    let args = Args::parse();

    let config = AppConfig::load(&args.config)
        .with_context(|| format!("failed to load config {}", args.config))?;

    // 切片根目录无法创建时拒绝启动
    let store = SegmentStore::init(&config.server.hls_root)
        .await
        .with_context(|| format!("failed to prepare HLS root {}", config.server.hls_root))?;
    info!("CCTV Relay initialized. HLS Root: {:?}", store.root());

    // 端口无法绑定时拒绝启动，此时尚未启动任何子进程
    let listener = tokio::net::TcpListener::bind(&config.server.listen)
        .await
        .with_context(|| format!("failed to bind {}", config.server.listen))?;

    let supervisor = Supervisor::new(
        store.clone(),
        config.transcoder.clone(),
        config.retry.clone(),
    );
    let shutdown = CancellationToken::new();

    // 启动后台对账循环
    let reconciler = tokio::spawn(reconciler::run_reconciler(
        RegistryClient::new(ConfiguredRegistry::from_config(&config.registry)),
        supervisor.clone(),
        config.reconciler.clone(),
        shutdown.clone(),
    ));

    info!("Listening on {}", config.server.listen);
    let served = axum::serve(listener, web::router(store))
        .with_graceful_shutdown(shutdown_signal(shutdown.clone()))
        .await;

    // HTTP 服务已关闭：停止对账并回收所有子进程
    shutdown.cancel();
    if let Err(e) = reconciler.await {
        error!("Reconciler task failed: {}", e);
    }
    supervisor.shutdown().await;
    info!("CCTV Relay shutdown complete");

    served.context("HTTP server failed")
}

/// 等待 SIGINT / SIGTERM，或内部取消
async fn shutdown_signal(token: CancellationToken) {
    let ctrl_c = async {
        match signal::ctrl_c().await {
            Ok(()) => info!("Received SIGINT, starting graceful shutdown..."),
            Err(e) => {
                error!("Failed to listen for SIGINT: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
                info!("Received SIGTERM, starting graceful shutdown...");
            }
            Err(e) => {
                error!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
        _ = token.cancelled() => {},
    }
}
