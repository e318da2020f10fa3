use crate::klcommon::{current_timestamp_ms, CollectorStatus, Database, Result};
use serde::Serialize;
use std::sync::Arc;

/// 超过该时长没有新K线视为数据陈旧（毫秒）
pub const CANDLE_STALE_AFTER_MS: i64 = 120_000;

/// 超过该时长没有强平事件视为"近期无强平"（毫秒），只是提示，不代表故障
pub const LIQUIDATION_QUIET_AFTER_MS: i64 = 300_000;

/// 状态行加上新鲜度判断
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatusView {
    #[serde(flatten)]
    pub status: CollectorStatus,
    pub candle_age_ms: Option<i64>,
    pub liquidation_age_ms: Option<i64>,
    pub candles_fresh: bool,
    pub liquidations_recent: bool,
}

/// 状态追踪器：状态行的只读视图，本身不持有任何状态
#[derive(Debug, Clone)]
pub struct StatusTracker {
    db: Arc<Database>,
}

impl StatusTracker {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    pub fn current(&self) -> Result<CollectorStatus> {
        self.db.read_status()
    }

    pub fn view(&self) -> Result<StatusView> {
        Ok(Self::assess(self.current()?, current_timestamp_ms()))
    }

    /// 按给定的当前时间计算新鲜度
    pub fn assess(status: CollectorStatus, now_ms: i64) -> StatusView {
        let candle_age_ms = status.last_candle_timestamp.map(|ts| now_ms - ts);
        let liquidation_age_ms = status.last_liquidation_timestamp.map(|ts| now_ms - ts);

        StatusView {
            candles_fresh: candle_age_ms.is_some_and(|age| age <= CANDLE_STALE_AFTER_MS),
            liquidations_recent: liquidation_age_ms.is_some_and(|age| age <= LIQUIDATION_QUIET_AFTER_MS),
            candle_age_ms,
            liquidation_age_ms,
            status,
        }
    }
}
