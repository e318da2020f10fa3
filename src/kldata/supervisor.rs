//! 采集监督模块
//!
//! 启动时先同步完成一次历史回填，然后把K线流和强平流作为两个独立的 tokio 任务运行。
//! 定时汇报只读取状态；任一订阅任务异常退出（panic）时在下一次汇报时重启它，另一条流不受影响。

use crate::klcommon::config::WebSocketConfig;
use crate::klcommon::{run_blocking, BinanceApi, CollectorConfig, Database, StreamKind};
use crate::kldata::backfill::HistoricalBackfiller;
use crate::kldata::status::StatusTracker;
use crate::kldata::streamer::{
    backoff_from_config, candle_stream_name, liquidation_stream_name, wait_for_shutdown, CandleHandler,
    ConnectionState, LiquidationHandler, StreamConfig, StreamHandler, StreamStats, StreamStatsSnapshot,
    StreamSubscriber,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{error, info, warn, Instrument};

const SUPERVISOR_TARGET: &str = "应用生命周期";

/// 一个订阅及其可重启所需的全部材料
struct StreamUnit<H: StreamHandler> {
    config: StreamConfig,
    ws_config: WebSocketConfig,
    handler: Arc<H>,
    state_tx: Arc<watch::Sender<ConnectionState>>,
    stats: Arc<StreamStats>,
    task: Option<JoinHandle<()>>,
}

impl<H: StreamHandler> StreamUnit<H> {
    fn new(config: StreamConfig, ws_config: WebSocketConfig, handler: H) -> Self {
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            config,
            ws_config,
            handler: Arc::new(handler),
            state_tx: Arc::new(state_tx),
            stats: Arc::new(StreamStats::default()),
            task: None,
        }
    }

    fn kind(&self) -> StreamKind {
        self.handler.kind()
    }

    fn spawn(&mut self, shutdown: watch::Receiver<bool>) {
        let subscriber = StreamSubscriber::with_shared(
            self.config.clone(),
            self.handler.clone(),
            backoff_from_config(&self.ws_config),
            self.state_tx.clone(),
            self.stats.clone(),
        );
        self.task = Some(tokio::spawn(subscriber.run(shutdown)));
    }

    /// 订阅循环只会因关闭信号退出，提前结束意味着 panic
    async fn respawn_if_finished(&mut self, shutdown: &watch::Receiver<bool>) {
        let finished = self.task.as_ref().map_or(true, |task| task.is_finished());
        if !finished || *shutdown.borrow() {
            return;
        }

        if let Some(task) = self.task.take() {
            match task.await {
                Err(e) if e.is_panic() => {
                    error!(target: SUPERVISOR_TARGET, log_type = "low_freq", stream = self.kind().name(), "订阅任务 panic，正在重启");
                }
                _ => warn!(target: SUPERVISOR_TARGET, stream = self.kind().name(), "订阅任务意外结束，正在重启"),
            }
        }
        // panic 时可能没来得及清除运行标志
        self.handler.on_disconnected().await;
        self.state_tx.send_replace(ConnectionState::Disconnected);
        self.spawn(shutdown.clone());
    }

    async fn join(&mut self) {
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                error!(target: SUPERVISOR_TARGET, stream = self.kind().name(), panic = ?e, "订阅任务在退出时发生 panic");
            }
        }
    }
}

/// 采集器的生命周期句柄，取代全局的"是否已在运行"标志
pub struct CollectorHandle {
    shutdown_tx: watch::Sender<bool>,
    task: JoinHandle<()>,
    candle_state: watch::Receiver<ConnectionState>,
    liquidation_state: watch::Receiver<ConnectionState>,
    candle_stats: Arc<StreamStats>,
    liquidation_stats: Arc<StreamStats>,
    status: StatusTracker,
}

impl CollectorHandle {
    /// 尚未关闭且监督任务仍在运行
    pub fn is_active(&self) -> bool {
        !*self.shutdown_tx.borrow() && !self.task.is_finished()
    }

    pub fn candle_state(&self) -> watch::Receiver<ConnectionState> {
        self.candle_state.clone()
    }

    pub fn liquidation_state(&self) -> watch::Receiver<ConnectionState> {
        self.liquidation_state.clone()
    }

    pub fn candle_stats(&self) -> StreamStatsSnapshot {
        self.candle_stats.snapshot()
    }

    pub fn liquidation_stats(&self) -> StreamStatsSnapshot {
        self.liquidation_stats.snapshot()
    }

    pub fn status(&self) -> &StatusTracker {
        &self.status
    }

    /// 广播关闭信号并等待两条流退出、运行标志清除
    pub async fn shutdown(self) {
        self.shutdown_tx.send_replace(true);
        if let Err(e) = self.task.await {
            error!(target: SUPERVISOR_TARGET, panic = ?e, "监督任务在退出时发生 panic");
        }
        info!(target: SUPERVISOR_TARGET, log_type = "low_freq", "采集器已停止");
    }
}

/// 采集监督器
pub struct Supervisor {
    config: CollectorConfig,
    db: Arc<Database>,
}

impl Supervisor {
    pub fn new(config: CollectorConfig, db: Arc<Database>) -> Self {
        Self { config, db }
    }

    /// 完成启动回填后启动两条订阅，立即返回句柄
    pub async fn start(self) -> CollectorHandle {
        let config = self.config;
        let db = self.db;
        let limit = config.effective_backfill_limit();

        let api = BinanceApi::new(&config.api, &config.proxy);
        let backfiller = Arc::new(HistoricalBackfiller::new(db.clone(), api));

        // 回填失败不影响实时流
        match backfiller.load_historical(&config.symbol, &config.interval, limit).await {
            Ok(written) => info!(target: SUPERVISOR_TARGET, log_type = "low_freq", written, "启动回填完成"),
            Err(e) => warn!(
                target: SUPERVISOR_TARGET,
                { error.summary = e.get_error_type_summary() },
                "启动回填失败，仅依赖实时流"
            ),
        }

        let candle = StreamUnit::new(
            StreamConfig::from_config(
                &config.websocket,
                &config.proxy,
                candle_stream_name(&config.symbol, &config.interval),
            ),
            config.websocket.clone(),
            CandleHandler::new(db.clone(), &config.symbol, &config.interval)
                .with_gap_backfill(backfiller, limit),
        );
        let liquidation = StreamUnit::new(
            StreamConfig::from_config(&config.websocket, &config.proxy, liquidation_stream_name(&config.symbol)),
            config.websocket.clone(),
            LiquidationHandler::new(db.clone(), &config.symbol),
        );

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let status = StatusTracker::new(db.clone());

        let handle_parts = (
            candle.state_tx.subscribe(),
            liquidation.state_tx.subscribe(),
            candle.stats.clone(),
            liquidation.stats.clone(),
        );

        let report_period = Duration::from_secs(config.status_report_interval_secs);
        let task = tokio::spawn(
            supervise(candle, liquidation, db, status.clone(), report_period, shutdown_rx)
                .instrument(tracing::info_span!("supervisor", symbol = %config.symbol)),
        );

        info!(target: SUPERVISOR_TARGET, log_type = "low_freq", symbol = %config.symbol, interval = %config.interval, "采集器已启动");

        CollectorHandle {
            shutdown_tx,
            task,
            candle_state: handle_parts.0,
            liquidation_state: handle_parts.1,
            candle_stats: handle_parts.2,
            liquidation_stats: handle_parts.3,
            status,
        }
    }
}

async fn supervise<C: StreamHandler, L: StreamHandler>(
    mut candle: StreamUnit<C>,
    mut liquidation: StreamUnit<L>,
    db: Arc<Database>,
    status: StatusTracker,
    report_period: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    candle.spawn(shutdown.clone());
    liquidation.spawn(shutdown.clone());

    let mut ticker = interval_at(Instant::now() + report_period, report_period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                report(&status, &candle, &liquidation).await;
                candle.respawn_if_finished(&shutdown).await;
                liquidation.respawn_if_finished(&shutdown).await;
            }
            _ = wait_for_shutdown(&mut shutdown) => {
                info!(target: SUPERVISOR_TARGET, log_type = "low_freq", "接收到关闭信号，等待订阅退出");
                break;
            }
        }
    }

    candle.join().await;
    liquidation.join().await;

    for kind in [StreamKind::Candle, StreamKind::Liquidation] {
        let db = db.clone();
        if let Err(e) = run_blocking(move || db.set_stream_running(kind, false)).await {
            error!(target: SUPERVISOR_TARGET, stream = kind.name(), error.details = %e, "关闭时清除运行标志失败");
        }
    }
}

/// 定时汇报，只读
async fn report<C: StreamHandler, L: StreamHandler>(
    status: &StatusTracker,
    candle: &StreamUnit<C>,
    liquidation: &StreamUnit<L>,
) {
    let candle_stats = candle.stats.snapshot();
    let liquidation_stats = liquidation.stats.snapshot();

    let tracker = status.clone();
    match run_blocking(move || tracker.view()).await {
        Ok(view) => info!(
            target: SUPERVISOR_TARGET,
            log_type = "low_freq",
            candle_state = ?*candle.state_tx.borrow(),
            liquidation_state = ?*liquidation.state_tx.borrow(),
            total_candles = view.status.total_candles_collected,
            total_liquidations = view.status.total_liquidations_collected,
            last_candle = ?view.status.last_candle_timestamp,
            candles_fresh = view.candles_fresh,
            candle_reconnects = candle_stats.reconnects,
            candle_dropped = candle_stats.dropped,
            liquidation_duplicates = liquidation_stats.duplicates,
            liquidation_dropped = liquidation_stats.dropped,
            "采集状态汇报"
        ),
        Err(e) => warn!(target: SUPERVISOR_TARGET, { error.details = %e }, "读取状态失败"),
    }
}
