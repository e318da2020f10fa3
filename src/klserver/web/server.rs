// 状态查询服务实现
use std::net::SocketAddr;
use std::sync::Arc;

use axum::{routing::get, Router};
use tokio::sync::watch;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

use crate::klcommon::{AppError, Database, Result};
use crate::kldata::status::StatusTracker;
use crate::kldata::streamer::wait_for_shutdown;

use super::handlers;

/// 路由共享状态，只读
#[derive(Clone)]
pub struct AppState {
    pub db: Arc<Database>,
    pub status: StatusTracker,
    pub symbol: Arc<str>,
}

impl AppState {
    pub fn new(db: Arc<Database>, symbol: &str) -> Self {
        Self {
            status: StatusTracker::new(db.clone()),
            db,
            symbol: Arc::from(symbol),
        }
    }
}

/// 构建路由
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(handlers::health_handler))
        .route("/api/status", get(handlers::status_handler))
        .route("/api/candles", get(handlers::candles_handler))
        .route("/api/liquidations", get(handlers::liquidations_handler))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// 启动状态查询服务，收到关闭信号后优雅退出
pub async fn start_web_server(state: AppState, bind_addr: &str, mut shutdown: watch::Receiver<bool>) -> Result<()> {
    let addr: SocketAddr = bind_addr
        .parse()
        .map_err(|e| AppError::WebServerError(format!("无效的监听地址 {}: {}", bind_addr, e)))?;

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .map_err(|e| AppError::WebServerError(format!("绑定地址失败: {}", e)))?;

    info!(target: "状态服务", log_type = "module", "状态查询服务启动在 http://{}", addr);

    let app = router(state);
    match axum::serve(listener, app)
        .with_graceful_shutdown(async move { wait_for_shutdown(&mut shutdown).await })
        .await
    {
        Ok(_) => info!(target: "状态服务", "状态查询服务已关闭"),
        Err(e) => {
            error!(target: "状态服务", "状态查询服务错误: {}", e);
            return Err(AppError::WebServerError(format!("状态查询服务错误: {}", e)));
        }
    }

    Ok(())
}
