#[cfg(test)]
mod tests {
    use axum::{routing::get, Router};
    use futures_util::{SinkExt, StreamExt};
    use kline_collector::klcommon::{BinanceApi, Database};
    use kline_collector::kldata::HistoricalBackfiller;
    use kline_collector::kldata::streamer::{
        CandleHandler, ConnectionState, FixedBackoff, LiquidationHandler, StreamConfig, StreamHandler, StreamSubscriber,
    };
    use std::fs;
    use std::path::PathBuf;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::net::TcpListener;
    use tokio::sync::{oneshot, watch};
    use tokio::time::{sleep, timeout};
    use tokio_tungstenite::{accept_async, tungstenite::Message};

    // 创建测试数据库
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

    fn kline_msg(t: i64, close: &str, high: &str, closed: bool) -> String {
        serde_json::json!({
            "e": "kline", "E": t + 1, "s": "BTCUSDT",
            "k": {
                "t": t, "T": t + 59_999, "s": "BTCUSDT", "i": "1m",
                "o": "100.0", "c": close, "h": high, "l": "90.0", "v": "10.0", "x": closed
            }
        })
        .to_string()
    }

    fn force_order_msg(symbol: &str) -> String {
        serde_json::json!({
            "e": "forceOrder", "E": 5001,
            "o": { "s": symbol, "S": "SELL", "q": "2.0", "p": "600.0", "T": 5000 }
        })
        .to_string()
    }

    fn test_stream_config(addr: std::net::SocketAddr, stream: &str) -> StreamConfig {
        let mut config = StreamConfig::new(format!("ws://{}/ws", addr), stream);
        config.connect_timeout = Duration::from_secs(2);
        config
    }

    /// 轮询直到条件成立，超时则失败
    async fn eventually(what: &str, mut check: impl FnMut() -> bool) {
        let result = timeout(Duration::from_secs(10), async {
            while !check() {
                sleep(Duration::from_millis(20)).await;
            }
        })
        .await;
        assert!(result.is_ok(), "等待超时: {}", what);
    }

    async fn wait_state(rx: &mut watch::Receiver<ConnectionState>, what: &str, pred: impl Fn(ConnectionState) -> bool) {
        let result = timeout(Duration::from_secs(10), rx.wait_for(|s| pred(*s))).await;
        assert!(matches!(result, Ok(Ok(_))), "等待连接状态超时: {}", what);
    }

    #[tokio::test]
    async fn test_reconnect_after_server_close() {
        let db = setup_test_db("test_streamer_reconnect");
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (gate_tx, gate_rx) = oneshot::channel::<()>();

        // 第一次连接发一根K线后关闭；放行后第二次连接发另一根并保持
        tokio::spawn(async move {
            let (tcp, _) = listener.accept().await.unwrap();
            let mut ws = accept_async(tcp).await.unwrap();
            ws.send(Message::Text(kline_msg(60_000, "100.0", "110.0", true))).await.unwrap();
            ws.close(None).await.unwrap();
            drop(ws);

            gate_rx.await.unwrap();
            let (tcp, _) = listener.accept().await.unwrap();
            let mut ws = accept_async(tcp).await.unwrap();
            ws.send(Message::Text(kline_msg(120_000, "101.0", "110.0", true))).await.unwrap();
            while let Some(Ok(_)) = ws.next().await {}
        });

        let subscriber = StreamSubscriber::new(
            test_stream_config(addr, "btcusdt@kline_1m"),
            CandleHandler::new(db.clone(), "BTCUSDT", "1m"),
            Box::new(FixedBackoff::new(Duration::from_millis(200))),
        );
        let mut state = subscriber.state();
        let stats = subscriber.stats();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(subscriber.run(shutdown_rx));

        // 首个连接很快被关闭，这里只观察写入结果
        eventually("第一根K线写入", || db.read_candle(60_000).unwrap().is_some()).await;

        // 服务器关闭后订阅器离开 CONNECTED，运行标志清除
        wait_state(&mut state, "断开", |s| s != ConnectionState::Connected).await;
        assert!(!db.read_status().unwrap().is_running, "断开期间 is_running 应为 false");

        gate_tx.send(()).unwrap();
        wait_state(&mut state, "重新连接", |s| s == ConnectionState::Connected).await;
        assert!(db.read_status().unwrap().is_running, "重连后 is_running 应为 true");
        eventually("第二根K线写入", || db.read_candle(120_000).unwrap().is_some()).await;
        assert!(stats.snapshot().reconnects >= 1);

        shutdown_tx.send(true).unwrap();
        timeout(Duration::from_secs(5), task).await.expect("订阅器应及时退出").unwrap();
        assert_eq!(*state.borrow(), ConnectionState::Disconnected);
        assert!(!db.read_status().unwrap().is_running);
    }

    #[tokio::test]
    async fn test_open_candle_and_garbage_are_not_persisted() {
        let db = setup_test_db("test_streamer_open_candle");
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            let (tcp, _) = listener.accept().await.unwrap();
            let mut ws = accept_async(tcp).await.unwrap();
            // 未收盘K线的 high 比最终值高，不能落库
            ws.send(Message::Text(kline_msg(60_000, "105.0", "999.0", false))).await.unwrap();
            ws.send(Message::Text("{not json".to_string())).await.unwrap();
            ws.send(Message::Text(kline_msg(60_000, "105.0", "110.0", true))).await.unwrap();
            while let Some(Ok(_)) = ws.next().await {}
        });

        let subscriber = StreamSubscriber::new(
            test_stream_config(addr, "btcusdt@kline_1m"),
            CandleHandler::new(db.clone(), "BTCUSDT", "1m"),
            Box::new(FixedBackoff::new(Duration::from_millis(200))),
        );
        let stats = subscriber.stats();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(subscriber.run(shutdown_rx));

        eventually("已收盘K线写入", || db.read_candle(60_000).unwrap().is_some()).await;
        let stored = db.read_candle(60_000).unwrap().unwrap();
        assert_eq!(stored.high, 110.0, "只应保存已收盘K线");
        assert_eq!(db.read_status().unwrap().total_candles_collected, 1);

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.messages, 3);
        assert_eq!(snapshot.dropped, 1, "格式错误的消息被丢弃而不是中断循环");
        assert_eq!(snapshot.ignored, 1);
        assert_eq!(snapshot.stored, 1);

        shutdown_tx.send(true).unwrap();
        timeout(Duration::from_secs(5), task).await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_duplicate_liquidations_over_stream() {
        let db = setup_test_db("test_streamer_liquidation");
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            let (tcp, _) = listener.accept().await.unwrap();
            let mut ws = accept_async(tcp).await.unwrap();
            ws.send(Message::Text(force_order_msg("BTCUSDT"))).await.unwrap();
            ws.send(Message::Text(force_order_msg("BTCUSDT"))).await.unwrap();
            ws.send(Message::Text(force_order_msg("ETHUSDT"))).await.unwrap();
            while let Some(Ok(_)) = ws.next().await {}
        });

        let subscriber = StreamSubscriber::new(
            test_stream_config(addr, "btcusdt@forceOrder"),
            LiquidationHandler::new(db.clone(), "BTCUSDT"),
            Box::new(FixedBackoff::new(Duration::from_millis(200))),
        );
        let stats = subscriber.stats();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(subscriber.run(shutdown_rx));

        eventually("最后一条（其他交易对）处理完", || stats.snapshot().ignored == 1).await;

        let rows = db.read_liquidations_since(0).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].timestamp, 5000);
        assert_eq!(rows[0].amount, 1200.0);

        let status = db.read_status().unwrap();
        assert_eq!(status.total_liquidations_collected, 1, "重复事件只计数一次");
        assert!(status.is_liquidation_running);
        assert!(!status.is_running, "强平流不影响 is_running");
        assert_eq!(stats.snapshot().duplicates, 1);

        shutdown_tx.send(true).unwrap();
        timeout(Duration::from_secs(5), task).await.unwrap().unwrap();
        assert!(!db.read_status().unwrap().is_liquidation_running);
    }

    #[tokio::test]
    async fn test_heartbeat_timeout_triggers_reconnect() {
        let db = setup_test_db("test_streamer_heartbeat");
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        // 接受连接后从不读取，因此永远不会回 Pong
        tokio::spawn(async move {
            let mut held = Vec::new();
            loop {
                let (tcp, _) = listener.accept().await.unwrap();
                held.push(accept_async(tcp).await.unwrap());
            }
        });

        let mut config = test_stream_config(addr, "btcusdt@kline_1m");
        config.ping_interval = Duration::from_millis(200);
        config.ping_timeout = Duration::from_millis(100);

        let subscriber = StreamSubscriber::new(
            config,
            CandleHandler::new(db.clone(), "BTCUSDT", "1m"),
            Box::new(FixedBackoff::new(Duration::from_millis(50))),
        );
        let stats = subscriber.stats();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(subscriber.run(shutdown_rx));

        eventually("心跳超时后重连", || stats.snapshot().reconnects >= 2).await;

        shutdown_tx.send(true).unwrap();
        timeout(Duration::from_secs(5), task).await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_shutdown_during_gap_backfill() {
        let db = setup_test_db("test_streamer_shutdown_gap");
        // 很久以前的K线，连接后必然触发缺口补齐
        let handler = CandleHandler::new(db.clone(), "BTCUSDT", "1m");
        handler.handle_text(&kline_msg(60_000, "100.0", "110.0", true)).await.unwrap();

        // REST 端点收到请求后迟迟不响应
        let requested = Arc::new(AtomicBool::new(false));
        let seen = requested.clone();
        let router = Router::new().route(
            "/fapi/v1/klines",
            get(move || {
                let seen = seen.clone();
                async move {
                    seen.store(true, Ordering::SeqCst);
                    sleep(Duration::from_secs(30)).await;
                    "[]"
                }
            }),
        );
        let rest = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let rest_addr = rest.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(rest, router).await.unwrap();
        });
        let backfiller = Arc::new(HistoricalBackfiller::new(
            db.clone(),
            BinanceApi::new_with_url(format!("http://{}", rest_addr)),
        ));

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (tcp, _) = listener.accept().await.unwrap();
            let mut ws = accept_async(tcp).await.unwrap();
            while let Some(Ok(_)) = ws.next().await {}
        });

        let subscriber = StreamSubscriber::new(
            test_stream_config(addr, "btcusdt@kline_1m"),
            handler.with_gap_backfill(backfiller, 1500),
            Box::new(FixedBackoff::new(Duration::from_millis(200))),
        );
        let state = subscriber.state();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(subscriber.run(shutdown_rx));

        eventually("缺口补齐请求已发出", || requested.load(Ordering::SeqCst)).await;
        assert_ne!(*state.borrow(), ConnectionState::Connected, "补齐完成前不应发布 CONNECTED");

        shutdown_tx.send(true).unwrap();
        timeout(Duration::from_secs(2), task)
            .await
            .expect("缺口补齐进行中也应立即响应关闭信号")
            .unwrap();
        assert!(!db.read_status().unwrap().is_running);
    }

    #[tokio::test]
    async fn test_shutdown_during_backoff() {
        let db = setup_test_db("test_streamer_shutdown");
        // 没有服务器监听，连接必然失败并进入退避
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let subscriber = StreamSubscriber::new(
            test_stream_config(addr, "btcusdt@kline_1m"),
            CandleHandler::new(db.clone(), "BTCUSDT", "1m"),
            Box::new(FixedBackoff::new(Duration::from_secs(60))),
        );
        let stats = subscriber.stats();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(subscriber.run(shutdown_rx));

        eventually("首次连接失败", || stats.snapshot().reconnects >= 1).await;

        shutdown_tx.send(true).unwrap();
        timeout(Duration::from_secs(2), task)
            .await
            .expect("退避等待中也应立即响应关闭信号")
            .unwrap();
    }
}
