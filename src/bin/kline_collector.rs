//! K线与强平数据采集器
//!
//! 启动顺序：配置 → 日志 → 数据库（失败即退出）→ 状态查询服务 → 回填与两条实时流 → 等待 Ctrl+C。

use anyhow::{Context, Result};
use clap::Parser;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{error, info};

use kline_collector::klcommon::config::constants::DEFAULT_CONFIG_PATH;
use kline_collector::klcommon::{init_logging, CollectorConfig, Database};
use kline_collector::kldata::Supervisor;
use kline_collector::klserver::{start_web_server, AppState};

#[derive(Parser, Debug, Clone)]
#[command(author, version, about = "Binance futures kline and liquidation collector.", long_about = None)]
struct Args {
    /// Path to the TOML config file (falls back to CONFIG_PATH, then the built-in default path).
    #[arg(short, long)]
    config: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let config_path = args
        .config
        .or_else(|| std::env::var("CONFIG_PATH").ok())
        .unwrap_or_else(|| DEFAULT_CONFIG_PATH.to_string());

    let config = CollectorConfig::load_or_default(&config_path)
        .with_context(|| format!("加载配置失败: {}", config_path))?;

    // guard 必须活到进程结束
    let _log_guard = init_logging(&config.logging).context("初始化日志失败")?;

    info!(
        target: "应用生命周期",
        log_type = "low_freq",
        config_path = %config_path,
        symbol = %config.symbol,
        interval = %config.interval,
        "K线采集器启动"
    );

    // 存储不可用是唯一允许中止启动的错误
    let db = match Database::with_config(&config.database) {
        Ok(db) => Arc::new(db),
        Err(e) => {
            error!(
                target: "应用生命周期",
                {
                    error.summary = e.get_error_type_summary(),
                    error.details = %e,
                },
                "数据库初始化失败，无法启动"
            );
            return Err(e.into());
        }
    };

    let (web_shutdown_tx, web_shutdown_rx) = watch::channel(false);
    let web_handle = if config.web.enabled {
        let state = AppState::new(db.clone(), &config.symbol);
        let bind_addr = config.web.bind_addr.clone();
        Some(tokio::spawn(async move {
            if let Err(e) = start_web_server(state, &bind_addr, web_shutdown_rx).await {
                error!(target: "应用生命周期", { error.details = %e }, "状态查询服务退出");
            }
        }))
    } else {
        None
    };

    let collector = Supervisor::new(config, db).start().await;

    info!(target: "应用生命周期", "所有服务已启动，等待关闭信号 (Ctrl+C)...");
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(target: "应用生命周期", "监听关闭信号失败: {}", e);
    }
    info!(target: "应用生命周期", log_type = "low_freq", reason = "received_ctrl_c", "接收到关闭信号，开始优雅关闭");

    collector.shutdown().await;

    web_shutdown_tx.send_replace(true);
    if let Some(handle) = web_handle {
        if let Err(e) = handle.await {
            error!(target: "应用生命周期", task = "web_server", panic = ?e, "状态查询服务在退出时发生 panic");
        }
    }

    info!(target: "应用生命周期", log_type = "low_freq", "采集器已退出");
    Ok(())
}
