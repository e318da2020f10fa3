use crate::klcommon::error::{AppError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// 一根已收盘的K线（蜡烛图），以开盘时间为自然主键
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candle {
    /// K线开盘时间（毫秒）
    pub timestamp: i64,
    pub symbol: String,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

impl Candle {
    /// 从REST接口返回的原始K线数组创建
    ///
    /// 格式: `[open_time, open, high, low, close, volume, close_time, ...]`，
    /// 价格字段为字符串。多余的字段被忽略。
    pub fn from_raw_kline(raw: &[serde_json::Value], symbol: &str) -> Option<Self> {
        if raw.len() < 6 {
            return None;
        }

        Some(Self {
            timestamp: raw[0].as_i64()?,
            symbol: symbol.to_string(),
            open: value_to_f64(&raw[1])?,
            high: value_to_f64(&raw[2])?,
            low: value_to_f64(&raw[3])?,
            close: value_to_f64(&raw[4])?,
            volume: value_to_f64(&raw[5])?,
        })
    }

    /// 校验价格关系: 所有字段非负且 `low <= open,close <= high`
    pub fn validate(&self) -> Result<()> {
        let fields = [self.open, self.high, self.low, self.close, self.volume];
        if fields.iter().any(|v| !v.is_finite() || *v < 0.0) {
            return Err(AppError::DataError(format!(
                "K线 {} 含有负值或非法数值: {:?}", self.timestamp, fields
            )));
        }
        if self.low > self.high
            || self.open < self.low || self.open > self.high
            || self.close < self.low || self.close > self.high
        {
            return Err(AppError::DataError(format!(
                "K线 {} 价格区间不一致: O={} H={} L={} C={}",
                self.timestamp, self.open, self.high, self.low, self.close
            )));
        }
        if self.symbol.is_empty() {
            return Err(AppError::DataError(format!("K线 {} 缺少交易对", self.timestamp)));
        }
        Ok(())
    }
}

/// 强平方向
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum LiquidationSide {
    Buy,
    Sell,
}

impl LiquidationSide {
    pub fn as_str(&self) -> &'static str {
        match self {
            LiquidationSide::Buy => "BUY",
            LiquidationSide::Sell => "SELL",
        }
    }
}

impl fmt::Display for LiquidationSide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LiquidationSide {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "BUY" => Ok(LiquidationSide::Buy),
            "SELL" => Ok(LiquidationSide::Sell),
            other => Err(AppError::ParseError(format!("未知的强平方向: {}", other))),
        }
    }
}

/// 一次强平成交事件
///
/// 唯一键为 (symbol, timestamp, side, amount)，重复事件被静默丢弃
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Liquidation {
    pub symbol: String,
    pub side: LiquidationSide,
    pub price: f64,
    pub quantity: f64,
    /// price × quantity，本地计算，不信任上游
    pub amount: f64,
    /// 成交时间（毫秒）
    pub timestamp: i64,
}

impl Liquidation {
    pub fn new(symbol: impl Into<String>, side: LiquidationSide, price: f64, quantity: f64, timestamp: i64) -> Self {
        Self {
            symbol: symbol.into(),
            side,
            price,
            quantity,
            amount: price * quantity,
            timestamp,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.symbol.is_empty() {
            return Err(AppError::DataError("强平事件缺少交易对".to_string()));
        }
        if !(self.price.is_finite() && self.price > 0.0) || !(self.quantity.is_finite() && self.quantity > 0.0) {
            return Err(AppError::DataError(format!(
                "强平事件价格或数量非正: price={} quantity={}", self.price, self.quantity
            )));
        }
        Ok(())
    }
}

/// 数据流类型，两个订阅各对应一种
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamKind {
    Candle,
    Liquidation,
}

impl StreamKind {
    pub fn name(&self) -> &'static str {
        match self {
            StreamKind::Candle => "K线流",
            StreamKind::Liquidation => "强平流",
        }
    }
}

impl fmt::Display for StreamKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// 采集器状态（单行记录）
///
/// 所有字段仅供外部健康检查参考，采集引擎本身不依赖它做任何正确性判断
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CollectorStatus {
    pub last_candle_timestamp: Option<i64>,
    pub last_liquidation_timestamp: Option<i64>,
    pub total_candles_collected: i64,
    pub total_liquidations_collected: i64,
    /// 仅反映K线流的连接状态
    pub is_running: bool,
    /// 强平流的连接状态，独立于 `is_running`
    pub is_liquidation_running: bool,
    /// 最近一次变更时间（毫秒）
    pub last_update: i64,
}

/// K线流事件 (`<symbol>@kline_<interval>`)
#[derive(Debug, Clone, Deserialize)]
pub struct KlineEvent {
    #[serde(rename = "e")]
    pub event_type: String,
    #[serde(rename = "s")]
    pub symbol: String,
    #[serde(rename = "k")]
    pub kline: KlinePayload,
}

/// K线流事件中的 `k` 字段
#[derive(Debug, Clone, Deserialize)]
pub struct KlinePayload {
    #[serde(rename = "t")]
    pub start_time: i64,
    #[serde(rename = "s")]
    pub symbol: String,
    #[serde(rename = "i")]
    pub interval: String,
    #[serde(rename = "o")]
    pub open: String,
    #[serde(rename = "c")]
    pub close: String,
    #[serde(rename = "h")]
    pub high: String,
    #[serde(rename = "l")]
    pub low: String,
    #[serde(rename = "v")]
    pub volume: String,
    /// 这根K线是否已收盘
    #[serde(rename = "x")]
    pub is_closed: bool,
}

impl KlinePayload {
    pub fn to_candle(&self) -> Result<Candle> {
        Ok(Candle {
            timestamp: self.start_time,
            symbol: self.symbol.clone(),
            open: parse_price_field("o", &self.open)?,
            high: parse_price_field("h", &self.high)?,
            low: parse_price_field("l", &self.low)?,
            close: parse_price_field("c", &self.close)?,
            volume: parse_price_field("v", &self.volume)?,
        })
    }
}

/// 强平流事件 (`<symbol>@forceOrder`)
#[derive(Debug, Clone, Deserialize)]
pub struct ForceOrderEvent {
    #[serde(rename = "e")]
    pub event_type: String,
    #[serde(rename = "o")]
    pub order: ForceOrderPayload,
}

/// 强平流事件中的 `o` 字段 (简化)
#[derive(Debug, Clone, Deserialize)]
pub struct ForceOrderPayload {
    #[serde(rename = "s")]
    pub symbol: String,
    #[serde(rename = "S")]
    pub side: String,
    #[serde(rename = "q")]
    pub quantity: String,
    #[serde(rename = "p")]
    pub price: String,
    #[serde(rename = "T")]
    pub trade_time: i64,
}

impl ForceOrderPayload {
    pub fn to_liquidation(&self) -> Result<Liquidation> {
        let side = self.side.parse::<LiquidationSide>()?;
        let price = parse_price_field("p", &self.price)?;
        let quantity = parse_price_field("q", &self.quantity)?;
        Ok(Liquidation::new(self.symbol.clone(), side, price, quantity, self.trade_time))
    }
}

fn parse_price_field(field: &str, raw: &str) -> Result<f64> {
    raw.parse::<f64>()
        .map_err(|e| AppError::ParseError(format!("字段 {} 无法解析为数值: {:?} ({})", field, raw, e)))
}

fn value_to_f64(value: &serde_json::Value) -> Option<f64> {
    match value {
        serde_json::Value::String(s) => s.parse().ok(),
        serde_json::Value::Number(n) => n.as_f64(),
        _ => None,
    }
}
