use crate::klcommon::{
    current_timestamp_ms, interval_to_milliseconds, run_blocking, AppError, Database, Result, StreamKind,
};
use crate::klcommon::models::{Candle, ForceOrderEvent, KlineEvent, Liquidation};
use crate::kldata::backfill::HistoricalBackfiller;
use serde_json::Value;
use std::future::Future;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// 单条消息的处理结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageOutcome {
    /// 写入了存储
    Stored,
    /// 唯一键已存在，静默丢弃
    Duplicate,
    /// 合法但不需要持久化（未收盘、其他交易对、订阅回执等）
    Ignored,
}

/// 消息处理接口，每个数据流一个实现
pub trait StreamHandler: Send + Sync + 'static {
    fn kind(&self) -> StreamKind;

    /// 进入 CONNECTED 时调用，在处理任何消息之前完成
    fn on_connected(&self) -> impl Future<Output = ()> + Send;

    /// 任何原因断开后调用
    fn on_disconnected(&self) -> impl Future<Output = ()> + Send;

    /// 处理一条文本消息；存储操作在阻塞线程池中完成
    fn handle_text(&self, text: &str) -> impl Future<Output = Result<MessageOutcome>> + Send;
}

/// 解开组合流的 `{"stream": ..., "data": ...}` 外壳
pub fn unwrap_envelope(text: &str) -> Result<Value> {
    let mut value: Value = serde_json::from_str(text)
        .map_err(|e| AppError::ParseError(format!("消息不是有效的JSON: {}", e)))?;

    if value.get("stream").is_some() {
        if let Some(data) = value.get_mut("data") {
            return Ok(data.take());
        }
    }
    Ok(value)
}

/// 返回事件类型；订阅回执等无 `e` 字段的控制消息返回 None
fn event_type(value: &Value) -> Option<&str> {
    value.get("e").and_then(Value::as_str)
}

fn is_control_message(value: &Value) -> bool {
    value.get("result").is_some() && value.get("id").is_some()
}

//=============================================================================
// K线流
//=============================================================================

/// K线流处理器：只持久化已收盘、且交易对与周期匹配的K线
pub struct CandleHandler {
    db: Arc<Database>,
    symbol: String,
    interval: String,
    interval_ms: i64,
    backfill: Option<Arc<HistoricalBackfiller>>,
    backfill_limit: u32,
}

impl CandleHandler {
    pub fn new(db: Arc<Database>, symbol: &str, interval: &str) -> Self {
        Self {
            db,
            symbol: symbol.to_uppercase(),
            interval: interval.to_string(),
            interval_ms: interval_to_milliseconds(interval),
            backfill: None,
            backfill_limit: 0,
        }
    }

    /// 启用重连后的缺口补齐
    pub fn with_gap_backfill(mut self, backfill: Arc<HistoricalBackfiller>, limit: u32) -> Self {
        self.backfill = Some(backfill);
        self.backfill_limit = limit;
        self
    }

    /// 库中最新K线落后超过一个周期时补齐
    async fn backfill_gap(&self, backfill: &HistoricalBackfiller) {
        let db = self.db.clone();
        let last = match run_blocking(move || db.latest_candle_timestamp()).await {
            Ok(Some(ts)) => ts,
            // 空库由启动回填负责
            Ok(None) => return,
            Err(e) => {
                warn!(target: "K线流", { error.details = %e }, "读取最新K线时间失败，跳过缺口补齐");
                return;
            }
        };

        let now = current_timestamp_ms();
        if last + 2 * self.interval_ms > now {
            debug!(target: "K线流", last, now, "无缺口");
            return;
        }

        match backfill
            .fill_gap(&self.symbol, &self.interval, last, self.interval_ms, self.backfill_limit)
            .await
        {
            Ok(written) => info!(target: "K线流", log_type = "module", written, "缺口补齐完成"),
            // fill_gap 已记录详细错误
            Err(_) => warn!(target: "K线流", "缺口补齐失败，继续处理实时数据"),
        }
    }
}

impl CandleHandler {
    /// 解析并过滤，返回需要落库的已收盘K线
    fn closed_candle(&self, text: &str) -> Result<Option<Candle>> {
        let value = unwrap_envelope(text)?;

        match event_type(&value) {
            Some("kline") => {}
            Some(other) => {
                debug!(target: "K线流", event_type = other, "忽略非K线事件");
                return Ok(None);
            }
            None if is_control_message(&value) => return Ok(None),
            None => return Err(AppError::ParseError("K线消息缺少事件类型".to_string())),
        }

        let event: KlineEvent = serde_json::from_value(value)
            .map_err(|e| AppError::ParseError(format!("K线事件格式错误: {}", e)))?;
        let kline = &event.kline;

        if !event.symbol.eq_ignore_ascii_case(&self.symbol) || kline.interval != self.interval {
            debug!(target: "K线流", symbol = %event.symbol, interval = %kline.interval, "忽略非跟踪的交易对或周期");
            return Ok(None);
        }

        // 未收盘的K线一律不落库
        if !kline.is_closed {
            return Ok(None);
        }

        let mut candle = kline.to_candle()?;
        candle.symbol = self.symbol.clone();
        candle.validate()?;
        Ok(Some(candle))
    }

    async fn set_running(&self, running: bool) {
        let db = self.db.clone();
        if let Err(e) = run_blocking(move || db.set_running(running)).await {
            error!(target: "K线流", { error.summary = e.get_error_type_summary(), error.details = %e }, "更新运行状态失败");
        }
    }
}

impl StreamHandler for CandleHandler {
    fn kind(&self) -> StreamKind {
        StreamKind::Candle
    }

    fn on_connected(&self) -> impl Future<Output = ()> + Send {
        async move {
            self.set_running(true).await;
            if let Some(backfill) = &self.backfill {
                self.backfill_gap(backfill).await;
            }
        }
    }

    fn on_disconnected(&self) -> impl Future<Output = ()> + Send {
        self.set_running(false)
    }

    fn handle_text(&self, text: &str) -> impl Future<Output = Result<MessageOutcome>> + Send {
        let parsed = self.closed_candle(text);
        let db = self.db.clone();

        async move {
            let Some(candle) = parsed? else {
                return Ok(MessageOutcome::Ignored);
            };
            let (timestamp, close) = (candle.timestamp, candle.close);

            run_blocking(move || db.upsert_candle(&candle)).await?;
            info!(target: "K线流", timestamp, close, "已收盘K线已写入");
            Ok(MessageOutcome::Stored)
        }
    }
}

//=============================================================================
// 强平流
//=============================================================================

/// 强平流处理器：按唯一键去重插入
pub struct LiquidationHandler {
    db: Arc<Database>,
    symbol: String,
}

impl LiquidationHandler {
    pub fn new(db: Arc<Database>, symbol: &str) -> Self {
        Self { db, symbol: symbol.to_uppercase() }
    }
}

impl LiquidationHandler {
    /// 解析并过滤，返回本交易对的强平记录
    fn tracked_liquidation(&self, text: &str) -> Result<Option<Liquidation>> {
        let value = unwrap_envelope(text)?;

        match event_type(&value) {
            Some("forceOrder") => {}
            Some(other) => {
                debug!(target: "强平流", event_type = other, "忽略非强平事件");
                return Ok(None);
            }
            None if is_control_message(&value) => return Ok(None),
            None => return Err(AppError::ParseError("强平消息缺少事件类型".to_string())),
        }

        let event: ForceOrderEvent = serde_json::from_value(value)
            .map_err(|e| AppError::ParseError(format!("强平事件格式错误: {}", e)))?;

        if !event.order.symbol.eq_ignore_ascii_case(&self.symbol) {
            debug!(target: "强平流", symbol = %event.order.symbol, "过滤其他交易对的强平事件");
            return Ok(None);
        }

        let liquidation = event.order.to_liquidation()?;
        liquidation.validate()?;
        Ok(Some(liquidation))
    }

    async fn set_running(&self, running: bool) {
        let db = self.db.clone();
        if let Err(e) = run_blocking(move || db.set_stream_running(StreamKind::Liquidation, running)).await {
            error!(target: "强平流", { error.details = %e }, "更新运行状态失败");
        }
    }
}

impl StreamHandler for LiquidationHandler {
    fn kind(&self) -> StreamKind {
        StreamKind::Liquidation
    }

    fn on_connected(&self) -> impl Future<Output = ()> + Send {
        self.set_running(true)
    }

    fn on_disconnected(&self) -> impl Future<Output = ()> + Send {
        self.set_running(false)
    }

    fn handle_text(&self, text: &str) -> impl Future<Output = Result<MessageOutcome>> + Send {
        let parsed = self.tracked_liquidation(text);
        let db = self.db.clone();

        async move {
            let Some(liquidation) = parsed? else {
                return Ok(MessageOutcome::Ignored);
            };

            let record = liquidation.clone();
            if run_blocking(move || db.insert_liquidation_if_absent(&record)).await? {
                info!(
                    target: "强平流",
                    side = %liquidation.side,
                    price = liquidation.price,
                    quantity = liquidation.quantity,
                    amount = liquidation.amount,
                    "强平记录已写入"
                );
                Ok(MessageOutcome::Stored)
            } else {
                debug!(target: "强平流", timestamp = liquidation.timestamp, "重复的强平事件已丢弃");
                Ok(MessageOutcome::Duplicate)
            }
        }
    }
}
