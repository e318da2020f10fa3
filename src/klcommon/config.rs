//! 采集器配置模块

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;
use tracing::warn;

use crate::klcommon::proxy::ProxyConfig;
use crate::klcommon::{AppError, Result};

/// 系统配置常量
pub mod constants {
    /// 默认配置文件路径
    pub const DEFAULT_CONFIG_PATH: &str = "config/CollectorConfig.toml";

    /// 默认交易对
    pub const DEFAULT_SYMBOL: &str = "BTCUSDT";

    /// 默认K线周期
    pub const DEFAULT_INTERVAL: &str = "1m";

    /// 交易所单次请求允许的最大K线数量
    pub const MAX_KLINES_PER_REQUEST: u32 = 1500;

    /// 交易所支持的K线周期
    pub const SUPPORTED_INTERVALS: &[&str] = &[
        "1m", "3m", "5m", "15m", "30m", "1h", "2h", "4h", "6h", "8h", "12h", "1d", "3d", "1w",
    ];
}

use constants::*;

/// 重连退避策略类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackoffKind {
    /// 固定间隔
    Fixed,
    /// 带上限的指数退避
    Exponential,
}

/// 采集器配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CollectorConfig {
    /// 交易对
    pub symbol: String,

    /// K线周期
    pub interval: String,

    /// 启动时回填的K线数量
    pub backfill_limit: u32,

    /// 状态汇报间隔（秒）
    pub status_report_interval_secs: u64,

    /// 数据库配置
    pub database: DatabaseConfig,

    /// REST接口配置
    pub api: ApiConfig,

    /// WebSocket配置
    pub websocket: WebSocketConfig,

    /// 代理配置
    pub proxy: ProxyConfig,

    /// 状态查询服务配置
    pub web: WebConfig,

    /// 日志配置
    pub logging: LoggingConfig,
}

/// 数据库配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    /// 数据库文件路径
    pub database_path: String,

    /// 连接池大小
    pub pool_size: u32,

    /// 忙等待超时（毫秒）
    pub busy_timeout_ms: u64,
}

/// REST接口配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    /// API端点
    pub base_url: String,

    /// 请求超时（秒）
    pub request_timeout_secs: u64,
}

/// WebSocket配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WebSocketConfig {
    /// 单流端点，形如 `wss://fstream.binance.com/ws`
    pub base_url: String,

    /// 连接超时（秒）
    pub connect_timeout_secs: u64,

    /// Ping 间隔（秒）
    pub ping_interval_secs: u64,

    /// 等待 Pong 的超时（秒）
    pub ping_timeout_secs: u64,

    /// 退避策略
    pub backoff: BackoffKind,

    /// 重连间隔（秒），指数退避时为初始间隔
    pub reconnect_interval_secs: u64,

    /// 指数退避的间隔上限（秒）
    pub max_reconnect_interval_secs: u64,
}

/// 状态查询服务配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WebConfig {
    pub enabled: bool,
    pub bind_addr: String,
}

/// 日志配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// 日志级别 (trace, debug, info, warn, error)
    pub log_level: String,

    /// 日志文件目录
    pub log_dir: String,

    /// 是否启用控制台输出
    pub enable_console_output: bool,
}

impl Default for CollectorConfig {
    fn default() -> Self {
        Self {
            symbol: DEFAULT_SYMBOL.to_string(),
            interval: DEFAULT_INTERVAL.to_string(),
            backfill_limit: MAX_KLINES_PER_REQUEST,
            status_report_interval_secs: 60,
            database: DatabaseConfig::default(),
            api: ApiConfig::default(),
            websocket: WebSocketConfig::default(),
            proxy: ProxyConfig::default(),
            web: WebConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            database_path: "data/btc_data.db".to_string(),
            pool_size: 4,
            busy_timeout_ms: 5000,
        }
    }
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            base_url: "https://fapi.binance.com".to_string(),
            request_timeout_secs: 10,
        }
    }
}

impl Default for WebSocketConfig {
    fn default() -> Self {
        Self {
            base_url: "wss://fstream.binance.com/ws".to_string(),
            connect_timeout_secs: 10,
            ping_interval_secs: 20,
            ping_timeout_secs: 10,
            backoff: BackoffKind::Fixed,
            reconnect_interval_secs: 5,
            max_reconnect_interval_secs: 60,
        }
    }
}

impl Default for WebConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            bind_addr: "0.0.0.0:10000".to_string(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_dir: "logs".to_string(),
            enable_console_output: true,
        }
    }
}

impl WebSocketConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn ping_interval(&self) -> Duration {
        Duration::from_secs(self.ping_interval_secs)
    }

    pub fn ping_timeout(&self) -> Duration {
        Duration::from_secs(self.ping_timeout_secs)
    }
}

impl CollectorConfig {
    /// 从文件加载配置
    pub fn from_file(path: &str) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;

        let config: Self = toml::from_str(&content)
            .map_err(|e| AppError::ConfigError(format!("解析配置文件失败: {}", e)))?;

        config.validate()?;
        Ok(config)
    }

    /// 加载配置，文件不存在时回退到默认值
    pub fn load_or_default(path: &str) -> Result<Self> {
        if Path::new(path).exists() {
            Self::from_file(path)
        } else {
            warn!(target: "应用生命周期", path, "配置文件不存在，使用默认配置");
            let config = Self::default();
            config.validate()?;
            Ok(config)
        }
    }

    /// 验证配置的有效性
    pub fn validate(&self) -> Result<()> {
        if self.symbol.trim().is_empty() {
            return Err(AppError::ConfigError("交易对不能为空".to_string()));
        }

        if !SUPPORTED_INTERVALS.contains(&self.interval.as_str()) {
            return Err(AppError::ConfigError(format!("无效的K线周期: {}", self.interval)));
        }

        if self.backfill_limit == 0 {
            return Err(AppError::ConfigError("回填数量必须大于0".to_string()));
        }

        if self.status_report_interval_secs == 0 {
            return Err(AppError::ConfigError("状态汇报间隔必须大于0".to_string()));
        }

        if self.database.pool_size == 0 {
            return Err(AppError::ConfigError("数据库连接池大小必须大于0".to_string()));
        }

        if self.api.request_timeout_secs == 0 {
            return Err(AppError::ConfigError("REST请求超时必须大于0".to_string()));
        }

        let ws = &self.websocket;
        if ws.connect_timeout_secs == 0 || ws.ping_interval_secs == 0 || ws.ping_timeout_secs == 0 {
            return Err(AppError::ConfigError("WebSocket超时和心跳间隔必须大于0".to_string()));
        }

        if ws.ping_timeout_secs >= ws.ping_interval_secs {
            return Err(AppError::ConfigError("Pong超时必须小于Ping间隔".to_string()));
        }

        if ws.reconnect_interval_secs == 0 {
            return Err(AppError::ConfigError("重连间隔必须大于0".to_string()));
        }

        if ws.backoff == BackoffKind::Exponential && ws.max_reconnect_interval_secs < ws.reconnect_interval_secs {
            return Err(AppError::ConfigError("最大重连间隔不能小于初始重连间隔".to_string()));
        }

        if self.proxy.enabled && self.proxy.port == 0 {
            return Err(AppError::ConfigError("代理端口必须大于0".to_string()));
        }

        if self.web.enabled {
            self.web.bind_addr.parse::<SocketAddr>()
                .map_err(|e| AppError::ConfigError(format!("无效的监听地址 {}: {}", self.web.bind_addr, e)))?;
        }

        Ok(())
    }

    /// 实际请求的回填数量，截断到交易所上限
    pub fn effective_backfill_limit(&self) -> u32 {
        self.backfill_limit.min(MAX_KLINES_PER_REQUEST)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = CollectorConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.symbol, "BTCUSDT");
        assert_eq!(config.websocket.ping_interval_secs, 20);
        assert_eq!(config.websocket.ping_timeout_secs, 10);
        assert_eq!(config.websocket.reconnect_interval_secs, 5);
    }

    #[test]
    fn test_partial_toml_falls_back_to_defaults() {
        let config: CollectorConfig = toml::from_str(r#"
            symbol = "ETHUSDT"

            [websocket]
            backoff = "exponential"
            max_reconnect_interval_secs = 120
        "#).unwrap();

        assert_eq!(config.symbol, "ETHUSDT");
        assert_eq!(config.interval, "1m");
        assert_eq!(config.websocket.backoff, BackoffKind::Exponential);
        assert_eq!(config.websocket.max_reconnect_interval_secs, 120);
        assert_eq!(config.websocket.reconnect_interval_secs, 5);
        assert_eq!(config.database.pool_size, 4);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_invalid_configs_are_rejected() {
        let mut config = CollectorConfig::default();
        config.interval = "7m".to_string();
        assert!(config.validate().is_err());

        let mut config = CollectorConfig::default();
        config.websocket.ping_timeout_secs = 20;
        assert!(config.validate().is_err());

        let mut config = CollectorConfig::default();
        config.web.bind_addr = "not-an-addr".to_string();
        assert!(config.validate().is_err());

        let mut config = CollectorConfig::default();
        config.symbol = "  ".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_backfill_limit_is_clamped() {
        let mut config = CollectorConfig::default();
        config.backfill_limit = 5000;
        assert_eq!(config.effective_backfill_limit(), 1500);
        config.backfill_limit = 100;
        assert_eq!(config.effective_backfill_limit(), 100);
    }
}
