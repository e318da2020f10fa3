//! 统一日志系统初始化模块
//!
//! 控制台输出人类可读格式，文件输出按天滚动的 JSON 行，
//! 两者共用同一个 `EnvFilter`。`RUST_LOG` 优先于配置文件中的级别。

use crate::klcommon::config::LoggingConfig;
use crate::klcommon::{AppError, Result};
use std::path::Path;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer, Registry};

/// 日志文件名前缀
const LOG_FILE_PREFIX: &str = "kline_collector.log";

/// 构建业务日志过滤器字符串，压低第三方库的噪音
fn business_filter(log_level: &str) -> String {
    format!(
        "{},hyper=warn,reqwest=warn,rusqlite=warn,tungstenite=warn,tokio_tungstenite=warn,tower_http=info",
        log_level
    )
}

/// 初始化日志系统
///
/// 返回的 guard 必须由 main 持有到进程退出，否则缓冲中的文件日志会丢失。
pub fn init_logging(config: &LoggingConfig) -> Result<WorkerGuard> {
    let log_dir = Path::new(&config.log_dir);
    std::fs::create_dir_all(log_dir)
        .map_err(|e| AppError::ConfigError(format!("无法创建日志目录 {}: {}", log_dir.display(), e)))?;

    let filter_str = std::env::var("RUST_LOG").unwrap_or_else(|_| business_filter(&config.log_level));

    let file_appender = tracing_appender::rolling::daily(log_dir, LOG_FILE_PREFIX);
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let file_layer = tracing_subscriber::fmt::layer()
        .json()
        .with_writer(non_blocking)
        .with_ansi(false)
        .with_target(true)
        .with_current_span(true)
        .with_filter(EnvFilter::new(&filter_str));

    let console_layer = config.enable_console_output.then(|| {
        tracing_subscriber::fmt::layer()
            .with_target(true)
            .with_thread_ids(false)
            .with_file(false)
            .with_line_number(false)
            .with_filter(EnvFilter::new(&filter_str))
    });

    Registry::default()
        .with(file_layer)
        .with(console_layer)
        .try_init()
        .map_err(|e| AppError::ConfigError(format!("日志系统初始化失败: {}", e)))?;

    eprintln!("日志系统初始化完成，级别: {}，目录: {}", filter_str, log_dir.display());
    Ok(guard)
}
