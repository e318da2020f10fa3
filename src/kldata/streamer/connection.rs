use crate::klcommon::{AppError, Result};
use crate::kldata::streamer::config::StreamConfig;
use crate::kldata::streamer::message::{MessageOutcome, StreamHandler};
use crate::kldata::streamer::StreamStats;

use futures_util::{SinkExt, StreamExt};
use std::sync::atomic::Ordering;
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio::time::{interval_at, sleep_until, timeout, Instant, MissedTickBehavior};
use tokio_socks::tcp::Socks5Stream;
use tokio_tungstenite::{
    client_async_tls_with_config, tungstenite::protocol::Message, MaybeTlsStream, WebSocketStream,
};
use tracing::{debug, error, info, warn};
use url::Url;

pub type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// 一次会话结束的原因
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DisconnectReason {
    /// 对端关闭或流结束
    Closed,
    /// 读写错误
    Error(String),
    /// 超过 ping 超时未收到任何帧
    HeartbeatTimeout,
    /// 进程关闭
    Shutdown,
}

/// 等待关闭信号；发送端被丢弃同样视为关闭
pub async fn wait_for_shutdown(shutdown: &mut watch::Receiver<bool>) {
    while !*shutdown.borrow_and_update() {
        if shutdown.changed().await.is_err() {
            return;
        }
    }
}

/// 连接管理器
#[derive(Debug, Clone)]
pub struct ConnectionManager {
    config: StreamConfig,
}

impl ConnectionManager {
    pub fn new(config: StreamConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &StreamConfig {
        &self.config
    }

    /// 建立连接，整体受 `connect_timeout` 约束
    pub async fn connect(&self) -> Result<WsStream> {
        let url = Url::parse(&self.config.url())?;
        info!(target: "WebSocket连接", log_type = "module", url = %url, "连接到WebSocket");

        match timeout(self.config.connect_timeout, self.connect_once(&url)).await {
            Ok(result) => result,
            Err(_) => Err(AppError::WebSocketError(format!(
                "连接超时 ({}秒): {}",
                self.config.connect_timeout.as_secs(),
                url
            ))),
        }
    }

    async fn connect_once(&self, url: &Url) -> Result<WsStream> {
        let host = url
            .host_str()
            .ok_or_else(|| AppError::WebSocketError(format!("URL缺少主机: {}", url)))?;
        let port = url.port_or_known_default().unwrap_or(443);

        let socket = if self.config.proxy.enabled {
            let proxy = &self.config.proxy;
            info!(target: "WebSocket连接", "通过代理 {}:{} 连接", proxy.host, proxy.port);
            Socks5Stream::connect((proxy.host.as_str(), proxy.port), (host, port))
                .await
                .map_err(|e| AppError::WebSocketError(format!("代理连接失败: {}", e)))?
                .into_inner()
        } else {
            TcpStream::connect((host, port)).await?
        };

        let (ws_stream, _response) = client_async_tls_with_config(url.as_str(), socket, None, None)
            .await
            .map_err(|e| AppError::WebSocketError(format!("WebSocket握手失败: {}", e)))?;

        info!(target: "WebSocket连接", log_type = "module", stream = %self.config.stream_name, "WebSocket连接已建立");
        Ok(ws_stream)
    }

    /// 接收循环，直到断开或收到关闭信号
    ///
    /// 每 `ping_interval` 发送一次 Ping；发出后 `ping_timeout` 内未收到任何帧即判定心跳超时。
    pub async fn run_session<H: StreamHandler>(
        &self,
        ws: &mut WsStream,
        handler: &H,
        stats: &StreamStats,
        shutdown: &mut watch::Receiver<bool>,
    ) -> DisconnectReason {
        let target = handler.kind().name();
        let ping_interval = self.config.ping_interval;
        let mut ping_timer = interval_at(Instant::now() + ping_interval, ping_interval);
        ping_timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut pong_deadline: Option<Instant> = None;

        loop {
            let deadline = pong_deadline;
            let heartbeat_expired = async move {
                match deadline {
                    Some(at) => sleep_until(at).await,
                    None => std::future::pending::<()>().await,
                }
            };

            tokio::select! {
                _ = wait_for_shutdown(shutdown) => {
                    if let Err(e) = ws.close(None).await {
                        debug!(target: "WebSocket连接", stream = target, "关闭连接时出错: {}", e);
                    }
                    return DisconnectReason::Shutdown;
                }
                _ = ping_timer.tick() => {
                    if pong_deadline.is_none() {
                        pong_deadline = Some(Instant::now() + self.config.ping_timeout);
                    }
                    if let Err(e) = ws.send(Message::Ping(Vec::new())).await {
                        error!(target: "WebSocket连接", stream = target, "发送Ping失败: {}", e);
                        return DisconnectReason::Error(e.to_string());
                    }
                }
                _ = heartbeat_expired => {
                    warn!(target: "WebSocket连接", stream = target, "心跳超时，准备重连");
                    return DisconnectReason::HeartbeatTimeout;
                }
                msg = ws.next() => {
                    // 任何入站帧都证明连接存活
                    pong_deadline = None;
                    match msg {
                        Some(Ok(Message::Text(text))) => {
                            stats.messages.fetch_add(1, Ordering::Relaxed);
                            Self::dispatch(handler, stats, &text).await;
                        }
                        Some(Ok(Message::Ping(data))) => {
                            debug!(target: "WebSocket连接", stream = target, "收到Ping，发送Pong");
                            if let Err(e) = ws.send(Message::Pong(data)).await {
                                error!(target: "WebSocket连接", stream = target, "发送Pong失败: {}", e);
                                return DisconnectReason::Error(e.to_string());
                            }
                        }
                        Some(Ok(Message::Close(frame))) => {
                            info!(target: "WebSocket连接", stream = target, "服务器关闭连接: {:?}", frame);
                            return DisconnectReason::Closed;
                        }
                        Some(Ok(_)) => {}
                        Some(Err(e)) => {
                            error!(target: "WebSocket连接", stream = target, "WebSocket读取错误: {}", e);
                            return DisconnectReason::Error(e.to_string());
                        }
                        None => {
                            info!(target: "WebSocket连接", stream = target, "WebSocket流已结束");
                            return DisconnectReason::Closed;
                        }
                    }
                }
            }
        }
    }

    /// 交给处理器并记录结果；单条消息失败不影响接收循环
    async fn dispatch<H: StreamHandler>(handler: &H, stats: &StreamStats, text: &str) {
        let target = handler.kind().name();
        match handler.handle_text(text).await {
            Ok(MessageOutcome::Stored) => {
                stats.stored.fetch_add(1, Ordering::Relaxed);
            }
            Ok(MessageOutcome::Duplicate) => {
                stats.duplicates.fetch_add(1, Ordering::Relaxed);
            }
            Ok(MessageOutcome::Ignored) => {
                stats.ignored.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) if e.is_persistence() => {
                stats.persistence_failures.fetch_add(1, Ordering::Relaxed);
                error!(
                    target: "WebSocket连接",
                    stream = target,
                    error.summary = e.get_error_type_summary(),
                    error.details = %e,
                    "写入存储失败，继续接收"
                );
            }
            Err(e) => {
                stats.dropped.fetch_add(1, Ordering::Relaxed);
                warn!(
                    target: "WebSocket连接",
                    stream = target,
                    error.summary = e.get_error_type_summary(),
                    error.details = %e,
                    "丢弃无法处理的消息"
                );
            }
        }
    }
}
