// 导出共享模块
pub mod api;
pub mod config;
pub mod db;
pub mod error;
pub mod logging_setup;
pub mod models;
pub mod proxy;

// 重新导出常用类型，方便使用
pub use api::{current_timestamp_ms, interval_to_milliseconds, BinanceApi};
pub use config::CollectorConfig;
pub use db::{run_blocking, Database, SideStats, TableSummary};
pub use error::{AppError, Result};
pub use logging_setup::init_logging;
pub use models::{Candle, CollectorStatus, Liquidation, LiquidationSide, StreamKind};
pub use proxy::ProxyConfig;
