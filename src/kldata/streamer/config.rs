use crate::klcommon::config::WebSocketConfig;
use crate::klcommon::ProxyConfig;
use std::time::Duration;

/// 币安U本位合约单流端点
pub const BINANCE_WS_URL: &str = "wss://fstream.binance.com/ws";

/// K线流名称，如 `btcusdt@kline_1m`
pub fn candle_stream_name(symbol: &str, interval: &str) -> String {
    format!("{}@kline_{}", symbol.to_lowercase(), interval)
}

/// 强平流名称，如 `btcusdt@forceOrder`
pub fn liquidation_stream_name(symbol: &str) -> String {
    format!("{}@forceOrder", symbol.to_lowercase())
}

/// 单个订阅的连接配置
#[derive(Debug, Clone)]
pub struct StreamConfig {
    /// 端点，`/ws` 结尾为单流，`/stream` 结尾为组合流
    pub base_url: String,
    pub stream_name: String,
    pub connect_timeout: Duration,
    pub ping_interval: Duration,
    pub ping_timeout: Duration,
    pub proxy: ProxyConfig,
}

impl StreamConfig {
    pub fn new(base_url: impl Into<String>, stream_name: impl Into<String>) -> Self {
        let defaults = WebSocketConfig::default();
        Self {
            base_url: base_url.into(),
            stream_name: stream_name.into(),
            connect_timeout: defaults.connect_timeout(),
            ping_interval: defaults.ping_interval(),
            ping_timeout: defaults.ping_timeout(),
            proxy: ProxyConfig::default(),
        }
    }

    pub fn from_config(ws: &WebSocketConfig, proxy: &ProxyConfig, stream_name: impl Into<String>) -> Self {
        Self {
            base_url: ws.base_url.clone(),
            stream_name: stream_name.into(),
            connect_timeout: ws.connect_timeout(),
            ping_interval: ws.ping_interval(),
            ping_timeout: ws.ping_timeout(),
            proxy: proxy.clone(),
        }
    }

    /// 完整的订阅URL
    pub fn url(&self) -> String {
        let base = self.base_url.trim_end_matches('/');
        if base.ends_with("/stream") {
            format!("{}?streams={}", base, self.stream_name)
        } else {
            format!("{}/{}", base, self.stream_name)
        }
    }
}
