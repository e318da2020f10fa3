//! 只读数据库诊断工具，从不写入

use anyhow::{Context, Result};
use chrono::{TimeZone, Utc};
use clap::Parser;

use kline_collector::klcommon::config::constants::DEFAULT_CONFIG_PATH;
use kline_collector::klcommon::{current_timestamp_ms, CollectorConfig, Database};
use kline_collector::kldata::status::{StatusTracker, CANDLE_STALE_AFTER_MS, LIQUIDATION_QUIET_AFTER_MS};

#[derive(Parser, Debug, Clone)]
#[command(author, version, about = "Read-only report over the collector database.", long_about = None)]
struct Args {
    /// Path to the SQLite database file (defaults to the path in the config file).
    #[arg(short, long)]
    db_path: Option<String>,

    /// Path to the TOML config file.
    #[arg(short, long, default_value = DEFAULT_CONFIG_PATH)]
    config: String,
}

fn fmt_ts(ts: Option<i64>) -> String {
    match ts.and_then(|ms| Utc.timestamp_millis_opt(ms).single()) {
        Some(dt) => dt.format("%Y-%m-%d %H:%M:%S UTC").to_string(),
        None => "-".to_string(),
    }
}

fn main() -> Result<()> {
    let args = Args::parse();

    let db_path = match args.db_path {
        Some(path) => path,
        None => CollectorConfig::load_or_default(&args.config)
            .with_context(|| format!("加载配置失败: {}", args.config))?
            .database
            .database_path,
    };

    println!("🔍 检查数据库: {}", db_path);
    let db = Database::open_read_only(&db_path).with_context(|| format!("打开数据库失败: {}", db_path))?;

    println!("\n📋 数据表: {}", db.table_names()?.join(", "));

    // K线
    let candles = db.candle_summary()?;
    println!("\n📊 K线: {} 根", candles.count);
    println!("  最早: {}", fmt_ts(candles.earliest_timestamp));
    println!("  最新: {}", fmt_ts(candles.latest_timestamp));
    println!("  最近5根:");
    for c in db.read_recent_candles(5)?.iter().rev() {
        println!(
            "    {} O={} H={} L={} C={} V={}",
            fmt_ts(Some(c.timestamp)), c.open, c.high, c.low, c.close, c.volume
        );
    }

    // 强平
    let liquidations = db.liquidation_summary()?;
    println!("\n💥 强平记录: {} 条", liquidations.count);
    println!("  最早: {}", fmt_ts(liquidations.earliest_timestamp));
    println!("  最新: {}", fmt_ts(liquidations.latest_timestamp));
    println!("  最近10条:");
    for l in db.read_latest_liquidations(10)? {
        println!(
            "    {} {} {:>4} 价格={} 数量={} 金额={:.2}",
            fmt_ts(Some(l.timestamp)), l.symbol, l.side, l.price, l.quantity, l.amount
        );
    }
    for stats in db.liquidation_side_stats()? {
        println!("  {}: {} 条, 总金额 {:.2}", stats.side, stats.count, stats.total_amount);
    }

    // 状态
    let view = StatusTracker::assess(db.read_status()?, current_timestamp_ms());
    let status = &view.status;
    println!("\n🩺 采集器状态:");
    println!("  K线流运行中: {}", status.is_running);
    println!("  强平流运行中: {}", status.is_liquidation_running);
    println!("  累计K线写入: {}", status.total_candles_collected);
    println!("  累计强平写入: {}", status.total_liquidations_collected);
    println!("  最近更新: {}", fmt_ts(Some(status.last_update)));

    if !view.candles_fresh {
        println!(
            "  ⚠️  超过 {} 秒没有新K线 (最新: {})",
            CANDLE_STALE_AFTER_MS / 1000,
            fmt_ts(status.last_candle_timestamp)
        );
    }
    if !view.liquidations_recent {
        println!("  ⚠️  最近 {} 分钟没有强平记录", LIQUIDATION_QUIET_AFTER_MS / 60_000);
    }

    Ok(())
}
