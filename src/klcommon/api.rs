use crate::klcommon::config::ApiConfig;
use crate::klcommon::models::Candle;
use crate::klcommon::proxy::ProxyConfig;
use crate::klcommon::{AppError, Result};
use reqwest::Client;
use serde_json::Value;
use std::time::Duration;
use tracing::{debug, error, info, instrument, warn};

/// 将时间间隔转换为毫秒数
/// 例如: "1m" -> 60000, "1h" -> 3600000
pub fn interval_to_milliseconds(interval: &str) -> i64 {
    let last_char = interval.chars().last().unwrap_or('m');
    let value: i64 = interval
        .get(..interval.len().saturating_sub(1))
        .and_then(|v| v.parse().ok())
        .unwrap_or(1);

    match last_char {
        'm' => value * 60 * 1000,               // 分钟
        'h' => value * 60 * 60 * 1000,          // 小时
        'd' => value * 24 * 60 * 60 * 1000,     // 天
        'w' => value * 7 * 24 * 60 * 60 * 1000, // 周
        _ => value * 60 * 1000,                 // 默认为分钟
    }
}

/// 当前时间（毫秒）
pub fn current_timestamp_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// 日志中响应体预览的最大字符数
const BODY_PREVIEW_CHARS: usize = 500;

/// 按字符截断响应体，不会切在多字节字符中间
pub fn body_preview(text: &str) -> String {
    text.chars().take(BODY_PREVIEW_CHARS).collect()
}

/// 币安U本位合约REST客户端，只用于拉取历史K线
#[derive(Clone, Debug)]
pub struct BinanceApi {
    api_url: String,
    request_timeout: Duration,
    proxy: ProxyConfig,
}

impl BinanceApi {
    /// 按配置创建API客户端实例
    pub fn new(config: &ApiConfig, proxy: &ProxyConfig) -> Self {
        info!(target: "api", log_type = "module", "🌐 初始化币安API客户端，端点: {}", config.base_url);
        Self {
            api_url: config.base_url.trim_end_matches('/').to_string(),
            request_timeout: Duration::from_secs(config.request_timeout_secs),
            proxy: proxy.clone(),
        }
    }

    /// 创建新的API客户端实例（带自定义URL，不走代理）
    #[instrument(fields(api_url = %api_url))]
    pub fn new_with_url(api_url: String) -> Self {
        debug!(decision = "custom_api_client_init", endpoint = %api_url, "使用自定义端点初始化API客户端");
        Self {
            api_url: api_url.trim_end_matches('/').to_string(),
            request_timeout: Duration::from_secs(ApiConfig::default().request_timeout_secs),
            proxy: ProxyConfig::default(),
        }
    }

    pub fn api_url(&self) -> &str {
        &self.api_url
    }

    /// 创建HTTP客户端实例
    fn create_client(&self) -> Result<Client> {
        let client_builder = Client::builder()
            .timeout(self.request_timeout)
            .connect_timeout(Duration::from_secs(10));

        if !self.proxy.enabled {
            return client_builder
                .build()
                .map_err(|e| AppError::ApiError(format!("创建HTTP客户端失败: {}", e)));
        }

        let proxy_url = self.proxy.url();
        let client = match reqwest::Proxy::all(&proxy_url) {
            Ok(proxy) => client_builder
                .proxy(proxy)
                .build()
                .map_err(|e| AppError::ApiError(format!("创建带代理的HTTP客户端失败: {}", e)))?,
            Err(e) => {
                warn!(target: "api", log_type = "module", "设置代理失败，将尝试直接连接: {} - {}", proxy_url, e);
                client_builder
                    .build()
                    .map_err(|e| AppError::ApiError(format!("创建HTTP客户端失败: {}", e)))?
            }
        };

        Ok(client)
    }

    /// 拉取最近 `limit` 根K线（`GET /fapi/v1/klines`）
    ///
    /// 指定 `start_time` 时从该时间开始向后取。交易所返回的最后一根通常尚未收盘，
    /// 这里只保留收盘时间早于当前时间的K线。无法解析的行被跳过。
    #[instrument(skip(self), err)]
    pub async fn fetch_klines(
        &self,
        symbol: &str,
        interval: &str,
        limit: u32,
        start_time: Option<i64>,
    ) -> Result<Vec<Candle>> {
        let mut url = format!(
            "{}/fapi/v1/klines?symbol={}&interval={}&limit={}",
            self.api_url, symbol, interval, limit
        );
        if let Some(start) = start_time {
            url.push_str(&format!("&startTime={}", start));
        }

        let client = self.create_client()?;

        let response = match client.get(&url).send().await {
            Ok(resp) => {
                debug!(decision = "http_request_success", symbol, interval, status = %resp.status(), "HTTP请求成功");
                resp
            }
            Err(e) => {
                let http_error = AppError::from(e);
                error!(
                    target: "api",
                    log_type = "module",
                    url = %url,
                    error.summary = http_error.get_error_type_summary(),
                    error.details = %http_error,
                    "{}/{}: K线请求失败", symbol, interval
                );
                return Err(http_error);
            }
        };

        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await?;
            let api_error = AppError::ApiError(format!("下载 {} 的K线失败: {} - {}", symbol, status, body_preview(&text)));
            error!(
                target: "api",
                log_type = "module",
                status = %status,
                error.summary = api_error.get_error_type_summary(),
                error.details = %api_error,
                "API响应状态错误"
            );
            return Err(api_error);
        }

        let response_text = response.text().await?;

        let raw_klines: Vec<Vec<Value>> = match serde_json::from_str(&response_text) {
            Ok(data) => data,
            Err(e) => {
                let json_error = AppError::JsonError(e);
                error!(
                    target: "api",
                    log_type = "module",
                    response_preview = %body_preview(&response_text),
                    error.summary = json_error.get_error_type_summary(),
                    error.details = %json_error,
                    "{}/{}: K线JSON解析失败", symbol, interval
                );
                return Err(json_error);
            }
        };

        let now = current_timestamp_ms();
        let interval_ms = interval_to_milliseconds(interval);
        let total = raw_klines.len();

        let candles: Vec<Candle> = raw_klines
            .iter()
            .filter_map(|raw| {
                let candle = Candle::from_raw_kline(raw, symbol);
                if candle.is_none() {
                    warn!(target: "api", raw = ?raw, "跳过无法解析的K线行");
                }
                candle
            })
            .filter(|c| c.timestamp + interval_ms <= now)
            .collect();

        debug!(target: "api", symbol, interval, total, closed = candles.len(), "K线下载完成");
        Ok(candles)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_interval_to_milliseconds() {
        assert_eq!(interval_to_milliseconds("1m"), 60_000);
        assert_eq!(interval_to_milliseconds("15m"), 900_000);
        assert_eq!(interval_to_milliseconds("4h"), 14_400_000);
        assert_eq!(interval_to_milliseconds("1d"), 86_400_000);
        assert_eq!(interval_to_milliseconds("1w"), 604_800_000);
    }

    #[test]
    fn test_body_preview_respects_char_boundaries() {
        let body = format!("{}{}", "a".repeat(499), "é".repeat(10));
        let preview = body_preview(&body);
        assert_eq!(preview.chars().count(), 500);
        assert!(preview.ends_with('é'));
        assert_eq!(body_preview("短"), "短");
    }

    #[test]
    fn test_new_trims_trailing_slash() {
        let api = BinanceApi::new_with_url("http://127.0.0.1:9000/".to_string());
        assert_eq!(api.api_url(), "http://127.0.0.1:9000");
    }
}
