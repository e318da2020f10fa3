// 导出WebSocket相关模块
mod backoff;
mod config;
mod connection;
mod message;

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::time::sleep;
use tracing::{error, info, warn, Instrument};

// 重新导出
pub use backoff::{backoff_from_config, BackoffPolicy, CappedExponentialBackoff, FixedBackoff};
pub use config::{candle_stream_name, liquidation_stream_name, StreamConfig, BINANCE_WS_URL};
pub use connection::{wait_for_shutdown, ConnectionManager, DisconnectReason, WsStream};
pub use message::{unwrap_envelope, CandleHandler, LiquidationHandler, MessageOutcome, StreamHandler};

/// 订阅的连接状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// 单个订阅的运行统计，跨重连累计
#[derive(Debug, Default)]
pub struct StreamStats {
    pub messages: AtomicU64,
    pub stored: AtomicU64,
    pub duplicates: AtomicU64,
    pub ignored: AtomicU64,
    pub dropped: AtomicU64,
    pub persistence_failures: AtomicU64,
    pub reconnects: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StreamStatsSnapshot {
    pub messages: u64,
    pub stored: u64,
    pub duplicates: u64,
    pub ignored: u64,
    pub dropped: u64,
    pub persistence_failures: u64,
    pub reconnects: u64,
}

impl StreamStats {
    pub fn snapshot(&self) -> StreamStatsSnapshot {
        StreamStatsSnapshot {
            messages: self.messages.load(Ordering::Relaxed),
            stored: self.stored.load(Ordering::Relaxed),
            duplicates: self.duplicates.load(Ordering::Relaxed),
            ignored: self.ignored.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            persistence_failures: self.persistence_failures.load(Ordering::Relaxed),
            reconnects: self.reconnects.load(Ordering::Relaxed),
        }
    }
}

/// 单流订阅器
///
/// `DISCONNECTED → CONNECTING → CONNECTED → DISCONNECTED → ...`，
/// 除关闭信号外永不退出，重连间隔由 [`BackoffPolicy`] 决定。
pub struct StreamSubscriber<H: StreamHandler> {
    handler: Arc<H>,
    connection: ConnectionManager,
    backoff: Box<dyn BackoffPolicy>,
    state_tx: Arc<watch::Sender<ConnectionState>>,
    stats: Arc<StreamStats>,
}

impl<H: StreamHandler> StreamSubscriber<H> {
    pub fn new(config: StreamConfig, handler: H, backoff: Box<dyn BackoffPolicy>) -> Self {
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
        Self::with_shared(
            config,
            Arc::new(handler),
            backoff,
            Arc::new(state_tx),
            Arc::new(StreamStats::default()),
        )
    }

    /// 使用外部持有的状态通道与统计创建，重启后观察者无需重新订阅
    pub fn with_shared(
        config: StreamConfig,
        handler: Arc<H>,
        backoff: Box<dyn BackoffPolicy>,
        state_tx: Arc<watch::Sender<ConnectionState>>,
        stats: Arc<StreamStats>,
    ) -> Self {
        Self {
            handler,
            connection: ConnectionManager::new(config),
            backoff,
            state_tx,
            stats,
        }
    }

    pub fn state(&self) -> watch::Receiver<ConnectionState> {
        self.state_tx.subscribe()
    }

    pub fn stats(&self) -> Arc<StreamStats> {
        self.stats.clone()
    }

    fn set_state(&self, state: ConnectionState) {
        self.state_tx.send_replace(state);
    }

    /// 运行重连循环，直到收到关闭信号
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        let kind = self.handler.kind();
        let target = kind.name();
        let stream_name = self.connection.config().stream_name.clone();

        async {
            info!(target: "WebSocket连接", log_type = "module", stream = target, "启动订阅");

            'reconnect_loop: loop {
                if *shutdown.borrow() {
                    break 'reconnect_loop;
                }

                self.set_state(ConnectionState::Connecting);

                let connected = tokio::select! {
                    result = self.connection.connect() => result,
                    _ = wait_for_shutdown(&mut shutdown) => break 'reconnect_loop,
                };

                match connected {
                    Ok(mut ws) => {
                        // 先更新存储中的运行标志（含缺口补齐），再对外发布状态
                        tokio::select! {
                            _ = self.handler.on_connected() => {}
                            _ = wait_for_shutdown(&mut shutdown) => break 'reconnect_loop,
                        }
                        self.set_state(ConnectionState::Connected);
                        self.backoff.reset();

                        let reason = self
                            .connection
                            .run_session(&mut ws, self.handler.as_ref(), &self.stats, &mut shutdown)
                            .await;

                        self.handler.on_disconnected().await;
                        self.set_state(ConnectionState::Disconnected);

                        match reason {
                            DisconnectReason::Shutdown => break 'reconnect_loop,
                            DisconnectReason::Closed => info!(target: "WebSocket连接", stream = target, "连接已关闭，准备重连"),
                            DisconnectReason::HeartbeatTimeout => warn!(target: "WebSocket连接", stream = target, "心跳超时断开，准备重连"),
                            DisconnectReason::Error(e) => warn!(target: "WebSocket连接", stream = target, "连接错误断开: {}，准备重连", e),
                        }
                    }
                    Err(e) => {
                        self.set_state(ConnectionState::Disconnected);
                        error!(
                            target: "WebSocket连接",
                            stream = target,
                            error.summary = e.get_error_type_summary(),
                            error.details = %e,
                            "连接失败，准备重试"
                        );
                    }
                }

                self.stats.reconnects.fetch_add(1, Ordering::Relaxed);
                let delay = self.backoff.next_delay();
                info!(target: "WebSocket连接", stream = target, delay_ms = delay.as_millis() as u64, "等待后重连");

                tokio::select! {
                    _ = sleep(delay) => {}
                    _ = wait_for_shutdown(&mut shutdown) => break 'reconnect_loop,
                }
            }

            self.handler.on_disconnected().await;
            self.set_state(ConnectionState::Disconnected);
            info!(target: "WebSocket连接", log_type = "module", stream = target, "订阅已停止");
        }
        .instrument(tracing::info_span!("stream_subscriber", stream = %stream_name))
        .await
    }
}
