#[cfg(test)]
mod tests {
    use axum::{routing::get, Json, Router};
    use futures_util::{SinkExt, StreamExt};
    use kline_collector::klcommon::{CollectorConfig, Database};
    use kline_collector::kldata::{ConnectionState, Supervisor};
    use serde_json::json;
    use std::fs;
    use std::net::SocketAddr;
    use std::path::PathBuf;
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::net::TcpListener;
    use tokio::sync::{oneshot, watch};
    use tokio::time::{sleep, timeout};
    use tokio_tungstenite::accept_hdr_async;
    use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
    use tokio_tungstenite::tungstenite::Message;

    const T: i64 = 1_700_000_000_000;

    fn setup_test_db(name: &str) -> Arc<Database> {
        let db_path = PathBuf::from(format!("./target/{}.db", name));
        for suffix in ["", "-wal", "-shm"] {
            let path = PathBuf::from(format!("{}{}", db_path.display(), suffix));
            if path.exists() {
                fs::remove_file(&path).unwrap();
            }
        }
        Arc::new(Database::new(&db_path).unwrap())
    }

    async fn start_rest_mock() -> SocketAddr {
        let router = Router::new().route(
            "/fapi/v1/klines",
            get(|| async {
                let row = |t: i64, close: &str| {
                    json!([t, "100.0", "110.0", "90.0", close, "12.5", t + 59_999, "0", 1, "0", "0", "0"])
                };
                Json(json!([row(T, "100.0"), row(T + 60_000, "101.0"), row(T + 120_000, "99.0")]))
            }),
        );
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        addr
    }

    /// 按请求路径区分两条流：K线流等待放行后推送修正K线，强平流推送两条相同事件
    async fn start_ws_mock(candle_gate: oneshot::Receiver<()>) -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let candle_gate = Arc::new(tokio::sync::Mutex::new(Some(candle_gate)));

        tokio::spawn(async move {
            loop {
                let (tcp, _) = listener.accept().await.unwrap();
                let candle_gate = candle_gate.clone();
                tokio::spawn(async move {
                    let (path_tx, path_rx) = std::sync::mpsc::channel();
                    let callback = move |req: &Request, resp: Response| {
                        let _ = path_tx.send(req.uri().path().to_string());
                        Ok::<_, ErrorResponse>(resp)
                    };
                    let mut ws = accept_hdr_async(tcp, callback).await.unwrap();
                    let path = path_rx.recv().unwrap_or_default();

                    if path.ends_with("@kline_1m") {
                        if let Some(gate) = candle_gate.lock().await.take() {
                            let _ = gate.await;
                        }
                        let msg = json!({
                            "stream": "btcusdt@kline_1m",
                            "data": {
                                "e": "kline", "E": T + 120_001, "s": "BTCUSDT",
                                "k": { "t": T + 60_000, "T": T + 119_999, "s": "BTCUSDT", "i": "1m",
                                       "o": "100.0", "c": "105.0", "h": "110.0", "l": "90.0", "v": "13.0", "x": true }
                            }
                        });
                        ws.send(Message::Text(msg.to_string())).await.unwrap();
                    } else {
                        let msg = json!({
                            "e": "forceOrder", "E": 5001,
                            "o": { "s": "BTCUSDT", "S": "SELL", "q": "2.0", "p": "600.0", "T": 5000 }
                        });
                        ws.send(Message::Text(msg.to_string())).await.unwrap();
                        ws.send(Message::Text(msg.to_string())).await.unwrap();
                    }
                    while let Some(Ok(_)) = ws.next().await {}
                });
            }
        });
        addr
    }

    async fn eventually(what: &str, mut check: impl FnMut() -> bool) {
        let result = timeout(Duration::from_secs(10), async {
            while !check() {
                sleep(Duration::from_millis(20)).await;
            }
        })
        .await;
        assert!(result.is_ok(), "等待超时: {}", what);
    }

    async fn wait_connected(rx: &mut watch::Receiver<ConnectionState>) {
        let result = timeout(Duration::from_secs(10), rx.wait_for(|s| *s == ConnectionState::Connected)).await;
        assert!(matches!(result, Ok(Ok(_))), "订阅未能连接");
    }

    #[tokio::test]
    async fn test_full_collector_lifecycle() {
        let db = setup_test_db("test_supervisor_lifecycle");
        let rest_addr = start_rest_mock().await;
        let (gate_tx, gate_rx) = oneshot::channel();
        let ws_addr = start_ws_mock(gate_rx).await;

        let mut config = CollectorConfig::default();
        config.api.base_url = format!("http://{}", rest_addr);
        // 组合流端点
        config.websocket.base_url = format!("ws://{}/stream", ws_addr);
        config.websocket.connect_timeout_secs = 2;
        config.websocket.reconnect_interval_secs = 1;
        config.web.enabled = false;
        config.status_report_interval_secs = 1;

        let handle = Supervisor::new(config, db.clone()).start().await;
        assert!(handle.is_active());

        // 启动回填已同步完成
        let closes: Vec<f64> = db.read_candles_since(T).unwrap().iter().map(|c| c.close).collect();
        assert_eq!(closes, vec![100.0, 101.0, 99.0]);

        let mut candle_state = handle.candle_state();
        let mut liquidation_state = handle.liquidation_state();
        wait_connected(&mut candle_state).await;
        wait_connected(&mut liquidation_state).await;

        // 缺口补齐已在 CONNECTED 之前完成，此后只剩一次流事件
        let before = db.read_status().unwrap().total_candles_collected;
        gate_tx.send(()).unwrap();
        eventually("修正K线写入", || db.read_candle(T + 60_000).unwrap().map(|c| c.close) == Some(105.0)).await;
        assert_eq!(db.read_status().unwrap().total_candles_collected, before + 1);

        eventually("强平去重", || handle.liquidation_stats().duplicates == 1).await;
        let status = db.read_status().unwrap();
        assert_eq!(status.total_liquidations_collected, 1);
        assert_eq!(db.liquidation_summary().unwrap().count, 1);
        assert!(status.is_running);
        assert!(status.is_liquidation_running);
        // 事件时间戳很旧，不算近期强平
        assert!(!handle.status().view().unwrap().liquidations_recent);

        timeout(Duration::from_secs(5), handle.shutdown()).await.expect("关闭应及时完成");

        let status = db.read_status().unwrap();
        assert!(!status.is_running, "关闭后 K线流标志应清除");
        assert!(!status.is_liquidation_running, "关闭后强平流标志应清除");
    }

    #[tokio::test]
    async fn test_collector_starts_when_backfill_fails() {
        let db = setup_test_db("test_supervisor_backfill_fails");

        // REST 与 WS 都无人监听
        let dead = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let dead_addr = dead.local_addr().unwrap();
        drop(dead);

        let mut config = CollectorConfig::default();
        config.api.base_url = format!("http://{}", dead_addr);
        config.websocket.base_url = format!("ws://{}/ws", dead_addr);
        config.websocket.reconnect_interval_secs = 1;
        config.web.enabled = false;

        let handle = Supervisor::new(config, db.clone()).start().await;
        assert!(handle.is_active(), "回填失败不影响启动");
        assert_eq!(db.candle_summary().unwrap().count, 0);

        eventually("两条流都在重试", || {
            handle.candle_stats().reconnects >= 1 && handle.liquidation_stats().reconnects >= 1
        })
        .await;

        timeout(Duration::from_secs(5), handle.shutdown()).await.expect("关闭应及时完成");
        assert!(!db.read_status().unwrap().is_running);
    }
}
