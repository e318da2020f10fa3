use crate::klcommon::api::current_timestamp_ms;
use crate::klcommon::config::DatabaseConfig;
use crate::klcommon::error::{AppError, Result};
use crate::klcommon::models::{Candle, CollectorStatus, Liquidation, LiquidationSide, StreamKind};
use chrono::NaiveDateTime;
use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::types::{Type, Value};
use rusqlite::{params, OpenFlags, OptionalExtension, Row};
use serde::Serialize;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tokio::task;
use tracing::{debug, info, instrument};

// 数据库连接池类型
pub type DbPool = Pool<SqliteConnectionManager>;

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS klines (
        timestamp INTEGER PRIMARY KEY,
        symbol TEXT NOT NULL,
        open REAL NOT NULL,
        high REAL NOT NULL,
        low REAL NOT NULL,
        close REAL NOT NULL,
        volume REAL NOT NULL,
        created_at TIMESTAMP DEFAULT CURRENT_TIMESTAMP
    );

    CREATE TABLE IF NOT EXISTS liquidations (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        symbol TEXT NOT NULL,
        side TEXT NOT NULL,
        price REAL NOT NULL,
        quantity REAL NOT NULL,
        amount REAL NOT NULL,
        timestamp INTEGER NOT NULL,
        created_at TIMESTAMP DEFAULT CURRENT_TIMESTAMP,
        UNIQUE(symbol, timestamp, side, amount)
    );

    CREATE INDEX IF NOT EXISTS idx_liquidations_timestamp ON liquidations (timestamp);

    CREATE TABLE IF NOT EXISTS collector_state (
        id INTEGER PRIMARY KEY CHECK (id = 1),
        last_kline_timestamp INTEGER,
        last_liquidation_timestamp INTEGER,
        total_klines_collected INTEGER DEFAULT 0,
        total_liquidations_collected INTEGER DEFAULT 0,
        is_running INTEGER DEFAULT 0,
        is_liquidation_running INTEGER DEFAULT 0,
        last_update TIMESTAMP DEFAULT CURRENT_TIMESTAMP
    );
";

/// 在阻塞线程池中执行存储操作
///
/// rusqlite 是阻塞 I/O，加上 `busy_timeout` 可能阻塞数秒，不能占用异步工作线程。
/// 进入阻塞线程前捕获当前 span，在新线程中用 `in_scope` 恢复。
pub async fn run_blocking<T, F>(op: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    let parent_span = tracing::Span::current();

    match task::spawn_blocking(move || parent_span.in_scope(op)).await {
        Ok(result) => result,
        Err(join_error) => Err(AppError::DatabaseError(format!("数据库任务 panic: {:?}", join_error))),
    }
}

/// 表的概要统计
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct TableSummary {
    pub count: i64,
    pub earliest_timestamp: Option<i64>,
    pub latest_timestamp: Option<i64>,
}

/// 按方向汇总的强平统计
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SideStats {
    pub side: String,
    pub count: i64,
    pub total_amount: f64,
}

/// 数据库管理器
///
/// 持久化状态的唯一所有者。写操作通过内部互斥锁串行化，
/// 每次写入（记录 + 状态行）在同一个事务内完成，读操作可与写并发。
#[derive(Debug)]
pub struct Database {
    pool: DbPool,
    write_lock: Mutex<()>,
}

impl Database {
    /// 使用默认参数打开（或创建）数据库
    pub fn new<P: AsRef<Path>>(db_path: P) -> Result<Self> {
        let config = DatabaseConfig {
            database_path: db_path.as_ref().display().to_string(),
            ..DatabaseConfig::default()
        };
        Self::with_config(&config)
    }

    /// 按配置打开（或创建）数据库并初始化表结构
    #[instrument(skip_all, fields(db_path = %config.database_path), err)]
    pub fn with_config(config: &DatabaseConfig) -> Result<Self> {
        let db_path = Path::new(&config.database_path);

        // 确保父目录存在
        if let Some(parent) = db_path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent)?;
            }
        }

        info!(target: "db", log_type = "module", "Using SQLite database at {}", db_path.display());

        let busy_timeout = Duration::from_millis(config.busy_timeout_ms);
        let manager = SqliteConnectionManager::file(db_path).with_init(move |conn| {
            conn.busy_timeout(busy_timeout)?;
            conn.execute_batch("
                PRAGMA journal_mode = WAL;
                PRAGMA synchronous = NORMAL;
                PRAGMA temp_store = MEMORY;
            ")
        });

        let pool = Pool::builder()
            .max_size(config.pool_size)
            .build(manager)
            .map_err(|e| AppError::DatabaseError(format!("Failed to create connection pool: {}", e)))?;

        let db = Self {
            pool,
            write_lock: Mutex::new(()),
        };

        db.init_db()?;
        info!(target: "db", log_type = "module", "✅ SQLite数据库初始化成功");
        Ok(db)
    }

    /// 以只读方式打开已有数据库，供诊断工具使用
    pub fn open_read_only<P: AsRef<Path>>(db_path: P) -> Result<Self> {
        let db_path = db_path.as_ref();
        if !db_path.exists() {
            return Err(AppError::DatabaseError(format!("数据库文件不存在: {}", db_path.display())));
        }

        let manager = SqliteConnectionManager::file(db_path)
            .with_flags(OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX);
        let pool = Pool::builder()
            .max_size(1)
            .build(manager)
            .map_err(|e| AppError::DatabaseError(format!("Failed to open database read-only: {}", e)))?;

        Ok(Self {
            pool,
            write_lock: Mutex::new(()),
        })
    }

    fn init_db(&self) -> Result<()> {
        let _guard = self.write_guard();
        let conn = self.get_connection()?;
        conn.execute_batch(SCHEMA)?;

        // 旧版数据库没有独立的强平流状态列
        let has_liq_flag: bool = conn
            .prepare("SELECT 1 FROM pragma_table_info('collector_state') WHERE name = 'is_liquidation_running'")?
            .exists([])?;
        if !has_liq_flag {
            info!(target: "db", log_type = "module", "为 collector_state 添加 is_liquidation_running 列");
            conn.execute("ALTER TABLE collector_state ADD COLUMN is_liquidation_running INTEGER DEFAULT 0", [])?;
        }

        conn.execute(
            "INSERT OR IGNORE INTO collector_state (id, is_running, last_update) VALUES (1, 0, ?1)",
            params![current_timestamp_ms()],
        )?;
        Ok(())
    }

    /// 获取数据库连接
    pub fn get_connection(&self) -> Result<r2d2::PooledConnection<SqliteConnectionManager>> {
        Ok(self.pool.get()?)
    }

    // 互斥锁只保护 ()，中毒后继续使用是安全的
    fn write_guard(&self) -> MutexGuard<'_, ()> {
        self.write_lock.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    //=========================================================================
    // 写操作
    //=========================================================================

    /// 写入或覆盖以 `timestamp` 为键的K线
    ///
    /// 成功后无条件累加 `total_klines_collected`，覆盖已有时间戳也会计数。
    pub fn upsert_candle(&self, candle: &Candle) -> Result<()> {
        let _guard = self.write_guard();
        let mut conn = self.get_connection()?;
        let tx = conn.transaction()?;

        tx.execute(
            "INSERT INTO klines (timestamp, symbol, open, high, low, close, volume)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
             ON CONFLICT(timestamp) DO UPDATE SET
                symbol = excluded.symbol,
                open = excluded.open,
                high = excluded.high,
                low = excluded.low,
                close = excluded.close,
                volume = excluded.volume",
            params![
                candle.timestamp,
                candle.symbol,
                candle.open,
                candle.high,
                candle.low,
                candle.close,
                candle.volume,
            ],
        )?;

        tx.execute(
            "UPDATE collector_state
             SET last_kline_timestamp = ?1,
                 total_klines_collected = total_klines_collected + 1,
                 last_update = ?2
             WHERE id = 1",
            params![candle.timestamp, current_timestamp_ms()],
        )?;

        tx.commit()?;
        debug!(target: "db", timestamp = candle.timestamp, close = candle.close, "K线已写入");
        Ok(())
    }

    /// 按唯一键 (symbol, timestamp, side, amount) 插入强平记录
    ///
    /// 返回是否真正新增了一行；只有新增才推进强平计数器。
    pub fn insert_liquidation_if_absent(&self, liquidation: &Liquidation) -> Result<bool> {
        let _guard = self.write_guard();
        let mut conn = self.get_connection()?;
        let tx = conn.transaction()?;

        let inserted = tx.execute(
            "INSERT OR IGNORE INTO liquidations (symbol, side, price, quantity, amount, timestamp)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                liquidation.symbol,
                liquidation.side.as_str(),
                liquidation.price,
                liquidation.quantity,
                liquidation.amount,
                liquidation.timestamp,
            ],
        )? > 0;

        if inserted {
            tx.execute(
                "UPDATE collector_state
                 SET last_liquidation_timestamp = ?1,
                     total_liquidations_collected = total_liquidations_collected + 1,
                     last_update = ?2
                 WHERE id = 1",
                params![liquidation.timestamp, current_timestamp_ms()],
            )?;
        }

        tx.commit()?;
        debug!(target: "db", timestamp = liquidation.timestamp, inserted, "强平记录已处理");
        Ok(inserted)
    }

    /// 更新 `is_running`（K线流连接状态）
    pub fn set_running(&self, running: bool) -> Result<()> {
        self.set_stream_running(StreamKind::Candle, running)
    }

    /// 更新指定数据流的运行标志
    pub fn set_stream_running(&self, kind: StreamKind, running: bool) -> Result<()> {
        let column = match kind {
            StreamKind::Candle => "is_running",
            StreamKind::Liquidation => "is_liquidation_running",
        };

        let _guard = self.write_guard();
        let conn = self.get_connection()?;
        conn.execute(
            &format!("UPDATE collector_state SET {} = ?1, last_update = ?2 WHERE id = 1", column),
            params![running, current_timestamp_ms()],
        )?;
        Ok(())
    }

    //=========================================================================
    // 读操作
    //=========================================================================

    /// 读取状态行
    pub fn read_status(&self) -> Result<CollectorStatus> {
        let conn = self.get_connection()?;
        let status = conn
            .query_row(
                "SELECT last_kline_timestamp, last_liquidation_timestamp,
                        total_klines_collected, total_liquidations_collected,
                        is_running, is_liquidation_running, last_update
                 FROM collector_state WHERE id = 1",
                [],
                |row| {
                    Ok(CollectorStatus {
                        last_candle_timestamp: row.get(0)?,
                        last_liquidation_timestamp: row.get(1)?,
                        total_candles_collected: row.get::<_, Option<i64>>(2)?.unwrap_or(0),
                        total_liquidations_collected: row.get::<_, Option<i64>>(3)?.unwrap_or(0),
                        is_running: row.get::<_, Option<bool>>(4)?.unwrap_or(false),
                        is_liquidation_running: row.get::<_, Option<bool>>(5)?.unwrap_or(false),
                        last_update: last_update_to_ms(row.get::<_, Value>(6)?),
                    })
                },
            )
            .optional()?;

        status.ok_or_else(|| AppError::DatabaseError("collector_state 状态行缺失".to_string()))
    }

    /// 最近 `limit` 根K线，按时间升序
    pub fn read_recent_candles(&self, limit: usize) -> Result<Vec<Candle>> {
        let conn = self.get_connection()?;
        let mut stmt = conn.prepare(
            "SELECT timestamp, symbol, open, high, low, close, volume
             FROM klines ORDER BY timestamp DESC LIMIT ?1",
        )?;
        let mut candles = stmt
            .query_map(params![limit as i64], candle_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        candles.reverse();
        Ok(candles)
    }

    /// 开盘时间不早于 `since` 的K线，按时间升序
    pub fn read_candles_since(&self, since: i64) -> Result<Vec<Candle>> {
        let conn = self.get_connection()?;
        let mut stmt = conn.prepare(
            "SELECT timestamp, symbol, open, high, low, close, volume
             FROM klines WHERE timestamp >= ?1 ORDER BY timestamp ASC",
        )?;
        let candles = stmt
            .query_map(params![since], candle_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(candles)
    }

    /// 按开盘时间读取单根K线
    pub fn read_candle(&self, timestamp: i64) -> Result<Option<Candle>> {
        let conn = self.get_connection()?;
        let candle = conn
            .query_row(
                "SELECT timestamp, symbol, open, high, low, close, volume
                 FROM klines WHERE timestamp = ?1",
                params![timestamp],
                candle_from_row,
            )
            .optional()?;
        Ok(candle)
    }

    /// 时间不早于 `since` 的强平记录，按时间升序
    pub fn read_liquidations_since(&self, since: i64) -> Result<Vec<Liquidation>> {
        let conn = self.get_connection()?;
        let mut stmt = conn.prepare(
            "SELECT symbol, side, price, quantity, amount, timestamp
             FROM liquidations WHERE timestamp >= ?1 ORDER BY timestamp ASC, id ASC",
        )?;
        let liquidations = stmt
            .query_map(params![since], liquidation_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(liquidations)
    }

    /// 最近 `limit` 条强平记录，按时间降序
    pub fn read_latest_liquidations(&self, limit: usize) -> Result<Vec<Liquidation>> {
        let conn = self.get_connection()?;
        let mut stmt = conn.prepare(
            "SELECT symbol, side, price, quantity, amount, timestamp
             FROM liquidations ORDER BY timestamp DESC, id DESC LIMIT ?1",
        )?;
        let liquidations = stmt
            .query_map(params![limit as i64], liquidation_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(liquidations)
    }

    /// 库中最新一根K线的开盘时间
    pub fn latest_candle_timestamp(&self) -> Result<Option<i64>> {
        let conn = self.get_connection()?;
        let ts = conn.query_row("SELECT MAX(timestamp) FROM klines", [], |row| row.get(0))?;
        Ok(ts)
    }

    pub fn candle_summary(&self) -> Result<TableSummary> {
        self.table_summary("klines")
    }

    pub fn liquidation_summary(&self) -> Result<TableSummary> {
        self.table_summary("liquidations")
    }

    fn table_summary(&self, table: &str) -> Result<TableSummary> {
        let conn = self.get_connection()?;
        let summary = conn.query_row(
            &format!("SELECT COUNT(*), MIN(timestamp), MAX(timestamp) FROM {}", table),
            [],
            |row| {
                Ok(TableSummary {
                    count: row.get(0)?,
                    earliest_timestamp: row.get(1)?,
                    latest_timestamp: row.get(2)?,
                })
            },
        )?;
        Ok(summary)
    }

    /// 按方向汇总强平数量与金额
    pub fn liquidation_side_stats(&self) -> Result<Vec<SideStats>> {
        let conn = self.get_connection()?;
        let mut stmt = conn.prepare(
            "SELECT side, COUNT(*), SUM(amount) FROM liquidations GROUP BY side ORDER BY side",
        )?;
        let stats = stmt
            .query_map([], |row| {
                Ok(SideStats {
                    side: row.get(0)?,
                    count: row.get(1)?,
                    total_amount: row.get::<_, Option<f64>>(2)?.unwrap_or(0.0),
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(stats)
    }

    /// 库中所有表名
    pub fn table_names(&self) -> Result<Vec<String>> {
        let conn = self.get_connection()?;
        let mut stmt = conn.prepare(
            "SELECT name FROM sqlite_master WHERE type = 'table' AND name NOT LIKE 'sqlite_%' ORDER BY name",
        )?;
        let names = stmt
            .query_map([], |row| row.get(0))?
            .collect::<rusqlite::Result<Vec<String>>>()?;
        Ok(names)
    }
}

fn candle_from_row(row: &Row<'_>) -> rusqlite::Result<Candle> {
    Ok(Candle {
        timestamp: row.get(0)?,
        symbol: row.get(1)?,
        open: row.get(2)?,
        high: row.get(3)?,
        low: row.get(4)?,
        close: row.get(5)?,
        volume: row.get(6)?,
    })
}

fn liquidation_from_row(row: &Row<'_>) -> rusqlite::Result<Liquidation> {
    let side_text: String = row.get(1)?;
    let side = side_text
        .parse::<LiquidationSide>()
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(1, Type::Text, Box::new(e)))?;

    Ok(Liquidation {
        symbol: row.get(0)?,
        side,
        price: row.get(2)?,
        quantity: row.get(3)?,
        amount: row.get(4)?,
        timestamp: row.get(5)?,
    })
}

/// `last_update` 在旧库中是 `CURRENT_TIMESTAMP` 文本，新库中是毫秒整数
fn last_update_to_ms(value: Value) -> i64 {
    match value {
        Value::Integer(ms) => ms,
        Value::Text(text) => NaiveDateTime::parse_from_str(&text, "%Y-%m-%d %H:%M:%S")
            .map(|dt| dt.and_utc().timestamp_millis())
            .unwrap_or(0),
        _ => 0,
    }
}
