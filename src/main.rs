mod config;
mod engine;
mod error;
mod registry;
mod state;
mod store;
mod supervisor;
mod web;

use axum::{routing::get, Router};
use clap::Parser;
use config::AppConfig;
use engine::Engine;
use registry::Registry;
use state::AppState;
use std::net::SocketAddr;
use store::SourceStore;
use tracing::{error, info};

/// Cam Relay - 按需拉起转码进程, 把视频源中继给任意数量的 WebSocket 观看端
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// 配置文件路径
    #[arg(short, long, default_value = "cam-relay.yaml")]
    config: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // 初始化日志系统
    tracing_subscriber::fmt::init();

    let args = Args::parse();
    let config = AppConfig::load(&args.config)?;
    info!("cam-relay initialized, ffmpeg: {}", config.server.ffmpeg_binary);

    // 打开持久层并全量加载源定义; 这里失败直接退出
    let store = SourceStore::open(&config.server.data_file).await?;
    let records = store.all().await;
    info!(
        "loaded {} sources from {}",
        records.len(),
        config.server.data_file
    );

    let state = AppState::new(config.clone(), store, records);

    // 常驻源开机即启动; 失败交给复活扫描重试
    {
        let mut sources = state.sources.lock().unwrap();
        for src in sources.values_mut() {
            if src.lazy {
                continue;
            }
            let key = src.key.clone();
            if let Err(e) = Engine::start(&state, src) {
                error!("autostart failed for [{}]: {}", key, e);
                Engine::record_failure(&state, &key);
            }
        }
    }

    // 后台复活扫描
    tokio::spawn(supervisor::start_supervisor(
        state.clone(),
        config.server.supervisor_interval_ms,
    ));

    // 注册 HTTP 路由
    let app = Router::new()
        .route("/relay", get(web::relay::relay_handler)) // WebSocket 中继
        .route(
            "/streamer/add",
            get(web::admin::add_source).post(web::admin::add_source_form),
        )
        .route("/streamer/list", get(web::admin::list_sources))
        .route(
            "/streamer/delete",
            get(web::admin::delete_source).post(web::admin::delete_source_form),
        )
        .route("/sys/status", get(web::admin::sys_status)) // 系统状态
        .with_state(state.clone());

    // 启动HTTP服务, 观看端身份取自连接的远端地址
    info!("listening on {}", config.server.listen);
    let listener = tokio::net::TcpListener::bind(&config.server.listen).await?;
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;

    // 停机收尾: 终止所有转码进程
    Registry::stop_all(&state).await;
    info!("cam-relay stopped");
    Ok(())
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    info!("shutdown signal received");
}
