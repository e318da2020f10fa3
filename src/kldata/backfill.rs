use crate::klcommon::{run_blocking, AppError, BinanceApi, Candle, Database, Result};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info, instrument, warn};

const BACKFILL_TARGET: &str = "历史回填";

/// 历史K线回填器
///
/// 一次请求拉取最近的已收盘K线，按收到的顺序逐根 upsert。
/// 以时间戳为键覆盖写入，重复或重叠的回填是安全的。
pub struct HistoricalBackfiller {
    db: Arc<Database>,
    api: BinanceApi,
}

impl HistoricalBackfiller {
    /// 创建新的回填器实例
    pub fn new(db: Arc<Database>, api: BinanceApi) -> Self {
        Self { db, api }
    }

    /// 拉取最近 `limit` 根K线写入存储，返回成功写入的数量
    ///
    /// 网络或解析失败时返回 `BackfillError`；单根K线写入失败只记录日志，不中断回填。
    #[instrument(skip(self), err)]
    pub async fn load_historical(&self, symbol: &str, interval: &str, limit: u32) -> Result<usize> {
        info!(target: BACKFILL_TARGET, log_type = "module", symbol, interval, limit, "开始回填历史K线");
        self.fetch_and_store(symbol, interval, limit, None).await
    }

    /// 从 `last_timestamp` 之后的一根开始补齐缺口
    #[instrument(skip(self), err)]
    pub async fn fill_gap(&self, symbol: &str, interval: &str, last_timestamp: i64, interval_ms: i64, limit: u32) -> Result<usize> {
        let start = last_timestamp + interval_ms;
        info!(target: BACKFILL_TARGET, log_type = "module", symbol, interval, start, "检测到K线缺口，开始补齐");
        self.fetch_and_store(symbol, interval, limit, Some(start)).await
    }

    async fn fetch_and_store(&self, symbol: &str, interval: &str, limit: u32, start_time: Option<i64>) -> Result<usize> {
        let started = Instant::now();

        let candles = self
            .api
            .fetch_klines(symbol, interval, limit, start_time)
            .await
            .map_err(|e| {
                let backfill_error = AppError::BackfillError(format!("{}/{} 拉取历史K线失败: {}", symbol, interval, e));
                error!(
                    target: BACKFILL_TARGET,
                    log_type = "module",
                    error.summary = backfill_error.get_error_type_summary(),
                    error.details = %backfill_error,
                    "回填请求失败，继续启动实时流"
                );
                backfill_error
            })?;

        let received = candles.len();
        let db = self.db.clone();
        let written = run_blocking(move || Ok(Self::store_candles(&db, &candles))).await?;

        info!(
            target: BACKFILL_TARGET,
            log_type = "module",
            symbol,
            interval,
            received,
            written,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "✅ 历史K线回填完成"
        );
        Ok(written)
    }

    /// 按收到的顺序写入，跳过校验失败的K线；在阻塞线程中调用
    fn store_candles(db: &Database, candles: &[Candle]) -> usize {
        let mut written = 0;
        for candle in candles {
            if let Err(e) = candle.validate() {
                warn!(target: BACKFILL_TARGET, { error.details = %e }, "跳过无效的历史K线");
                continue;
            }
            match db.upsert_candle(candle) {
                Ok(()) => written += 1,
                Err(e) => {
                    error!(
                        target: BACKFILL_TARGET,
                        timestamp = candle.timestamp,
                        error.summary = e.get_error_type_summary(),
                        error.details = %e,
                        "写入历史K线失败"
                    );
                }
            }
        }
        debug!(target: BACKFILL_TARGET, total = candles.len(), written, "历史K线写入结束");
        written
    }
}
