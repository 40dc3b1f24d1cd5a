// ===============================
// src/feed.rs
// ===============================
//
// Market Data adapters:
// - StreamClient::run : Binance combined trade stream (Sandbox & Mainnet),
//                       ws base URL dari config
// - run_mock          : random-walk trade generator, lewat jalur ingest yang sama
//
// Setiap trade: TickStore.update -> fan-out ke subscriber tick (aggregator, dll).
// Stop & reconnect selalu bisa diinterupsi (watch stop + Notify resubscribe).
//
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use ahash::AHashMap as HashMap;
use chrono::{TimeZone, Utc};
use futures_util::{FutureExt, StreamExt}; // .now_or_never(), .next()
use parking_lot::RwLock;
use rand::Rng;
use thiserror::Error;
use tokio::sync::{watch, Notify};
use tokio::time::sleep;
use tokio_tungstenite::connect_async;
use tracing::{debug, error, info, warn};
use url::Url;

use crate::binance::{CombinedFrame, TradePayload};
use crate::bus::Fanout;
use crate::domain::Tick;
use crate::metrics::{FEED_PARSE_ERRORS, TICKS_BY_SYMBOL, WS_CONNECTED, WS_RECONNECTS};
use crate::tick_store::TickStore;

#[derive(Debug, Error, PartialEq)]
pub enum FeedError {
    #[error("bad ws url {0}")]
    InvalidUrl(String),
    #[error("frame parse: {0}")]
    Parse(String),
    #[error("invalid trade: {0}")]
    InvalidTrade(String),
}

/// Combined-stream URL for `symbols`: trailing `/ws` becomes `/stream`.
pub fn stream_url(ws_base: &str, symbols: &BTreeSet<String>) -> Result<Url, FeedError> {
    let base = ws_base.trim_end_matches('/');
    let base = match base.strip_suffix("/ws") {
        Some(root) => format!("{root}/stream"),
        None if base.ends_with("/stream") => base.to_string(),
        None => format!("{base}/stream"),
    };
    let streams = symbols
        .iter()
        .map(|s| format!("{}@trade", s.to_ascii_lowercase()))
        .collect::<Vec<_>>()
        .join("/");
    let raw = format!("{base}?streams={streams}");
    Url::parse(&raw).map_err(|e| FeedError::InvalidUrl(format!("{raw}: {e}")))
}

/// Decode one text frame (combined envelope or bare trade payload) into a Tick.
pub fn parse_frame(txt: &str) -> Result<Tick, FeedError> {
    let (symbol, p): (String, TradePayload) = match serde_json::from_str::<CombinedFrame>(txt) {
        Ok(f) => {
            let sym = f.stream.split('@').next().unwrap_or_default().to_ascii_uppercase();
            (sym, f.data)
        }
        Err(_) => {
            let p: TradePayload = serde_json::from_str(txt).map_err(|e| FeedError::Parse(e.to_string()))?;
            let sym = p.symbol.clone().unwrap_or_default().to_ascii_uppercase();
            (sym, p)
        }
    };

    if symbol.is_empty() {
        return Err(FeedError::InvalidTrade("missing symbol".into()));
    }
    if let Some(ev) = p.event.as_deref() {
        if ev != "trade" {
            return Err(FeedError::InvalidTrade(format!("unexpected event {ev}")));
        }
    }
    let price: f64 = p.price.parse().map_err(|_| FeedError::InvalidTrade(format!("price {:?}", p.price)))?;
    if !(price.is_finite() && price > 0.0) {
        return Err(FeedError::InvalidTrade(format!("price {price}")));
    }
    let quantity: f64 =
        p.quantity.parse().map_err(|_| FeedError::InvalidTrade(format!("qty {:?}", p.quantity)))?;
    if !(quantity.is_finite() && quantity >= 0.0) {
        return Err(FeedError::InvalidTrade(format!("qty {quantity}")));
    }
    let timestamp = Utc
        .timestamp_millis_opt(p.trade_time)
        .single()
        .ok_or_else(|| FeedError::InvalidTrade(format!("trade time {}", p.trade_time)))?;

    Ok(Tick { symbol, price, quantity, timestamp, trade_id: p.trade_id })
}

enum Disconnect {
    Stopped,
    Resubscribe,
    Dropped,
}

pub struct StreamClient {
    ws_base: String,
    reconnect_delay: Duration,
    symbols: RwLock<BTreeSet<String>>,
    store: Arc<TickStore>,
    ticks: Fanout<Tick>,
    stop_tx: watch::Sender<bool>,
    resubscribe: Notify,
    running: AtomicBool,
    connected: AtomicBool,
}

impl StreamClient {
    pub fn new(
        ws_base: &str,
        symbols: &[String],
        store: Arc<TickStore>,
        reconnect_delay: Duration,
    ) -> Result<Self, FeedError> {
        Url::parse(ws_base).map_err(|e| FeedError::InvalidUrl(format!("{ws_base}: {e}")))?;
        let (stop_tx, _) = watch::channel(false);
        Ok(Self {
            ws_base: ws_base.to_string(),
            reconnect_delay,
            symbols: RwLock::new(symbols.iter().map(|s| s.to_ascii_uppercase()).collect()),
            store,
            ticks: Fanout::new("ticks"),
            stop_tx,
            resubscribe: Notify::new(),
            running: AtomicBool::new(false),
            connected: AtomicBool::new(false),
        })
    }

    /// Tick consumers (candle aggregator, ...).
    pub fn ticks(&self) -> &Fanout<Tick> { &self.ticks }

    pub fn subscribed_symbols(&self) -> Vec<String> { self.symbols.read().iter().cloned().collect() }

    pub fn is_running(&self) -> bool { self.running.load(Ordering::SeqCst) }

    pub fn is_connected(&self) -> bool { self.connected.load(Ordering::SeqCst) }

    /// Add symbols; returns the newly added ones. A live socket is recycled.
    ///
    /// The wakeup is stored even while `run` is connecting or backing off,
    /// so the next socket always carries the current set.
    pub fn subscribe(&self, symbols: &[String]) -> Vec<String> {
        let added: Vec<String> = {
            let mut set = self.symbols.write();
            symbols.iter().map(|s| s.to_ascii_uppercase()).filter(|s| set.insert(s.clone())).collect()
        };
        if !added.is_empty() {
            info!(?added, "subscribed");
            self.resubscribe.notify_one();
        }
        added
    }

    /// Remove symbols; returns the ones actually removed.
    pub fn unsubscribe(&self, symbols: &[String]) -> Vec<String> {
        let removed: Vec<String> = {
            let mut set = self.symbols.write();
            symbols.iter().map(|s| s.to_ascii_uppercase()).filter(|s| set.remove(s)).collect()
        };
        if !removed.is_empty() {
            info!(?removed, "unsubscribed");
            self.resubscribe.notify_one();
        }
        removed
    }

    /// `None` while there is nothing to subscribe to.
    pub fn build_stream_url(&self) -> Result<Option<Url>, FeedError> {
        let set = self.symbols.read();
        if set.is_empty() {
            return Ok(None);
        }
        stream_url(&self.ws_base, &set).map(Some)
    }

    /// Common path for every trade: store first, then fan-out.
    pub fn ingest(&self, tick: Tick) {
        TICKS_BY_SYMBOL.with_label_values(&[&tick.symbol]).inc();
        self.store.update(&tick);
        self.ticks.publish(&tick);
    }

    fn handle_text(&self, txt: &str) {
        match parse_frame(txt) {
            Ok(tick) => self.ingest(tick),
            Err(e) => {
                FEED_PARSE_ERRORS.inc();
                warn!(error = %e, "dropping frame");
            }
        }
    }

    /// Idempotent; wakes every wait point in `run`.
    pub fn stop(&self) {
        self.stop_tx.send_replace(true);
    }

    fn stop_rx(&self) -> watch::Receiver<bool> { self.stop_tx.subscribe() }

    /// Connect / read / reconnect until `stop()`.
    pub async fn run(self: Arc<Self>) {
        self.running.store(true, Ordering::SeqCst);
        let mut stop = self.stop_rx();

        loop {
            if *stop.borrow() {
                break;
            }

            // URL dibangun dari set terkini, jadi wakeup yang tertunda sudah basi.
            // Perubahan setelah titik ini menyimpan permit baru dan me-recycle socket.
            let _ = self.resubscribe.notified().now_or_never();

            let url = match self.build_stream_url() {
                Ok(Some(u)) => u,
                Ok(None) => {
                    info!("no symbols subscribed, idling");
                    tokio::select! {
                        _ = self.resubscribe.notified() => {}
                        _ = stop.changed() => {}
                    }
                    continue;
                }
                Err(e) => {
                    error!(error = %e, "cannot build stream url");
                    break;
                }
            };

            WS_RECONNECTS.inc();
            info!(%url, "connecting binance trade stream");
            let conn = tokio::select! {
                r = connect_async(url.as_str()) => r,
                _ = stop.changed() => break,
            };

            let outcome = match conn {
                Ok((mut ws, _resp)) => {
                    self.connected.store(true, Ordering::SeqCst);
                    WS_CONNECTED.set(1);
                    info!(symbols = ?self.subscribed_symbols(), "connected");

                    let outcome = loop {
                        tokio::select! {
                            frame = ws.next() => match frame {
                                Some(Ok(m)) if m.is_text() => match m.into_text() {
                                    Ok(txt) => self.handle_text(&txt),
                                    Err(e) => warn!(?e, "failed to read text frame"),
                                },
                                Some(Ok(_)) => {} // ping/pong/binary
                                Some(Err(e)) => {
                                    error!(?e, "ws read error");
                                    break Disconnect::Dropped;
                                }
                                None => break Disconnect::Dropped,
                            },
                            _ = self.resubscribe.notified() => break Disconnect::Resubscribe,
                            _ = stop.changed() => break Disconnect::Stopped,
                        }
                    };

                    if !matches!(outcome, Disconnect::Dropped) {
                        let _ = ws.close(None).await;
                    }
                    self.connected.store(false, Ordering::SeqCst);
                    WS_CONNECTED.set(0);
                    outcome
                }
                Err(e) => {
                    error!(?e, "connect failed");
                    Disconnect::Dropped
                }
            };

            match outcome {
                Disconnect::Stopped => break,
                Disconnect::Resubscribe => {
                    info!("subscription changed, reconnecting");
                    continue;
                }
                Disconnect::Dropped => {
                    warn!(delay = ?self.reconnect_delay, "disconnected, will reconnect");
                    tokio::select! {
                        _ = sleep(self.reconnect_delay) => {}
                        _ = stop.changed() => break,
                    }
                }
            }
        }

        self.connected.store(false, Ordering::SeqCst);
        self.running.store(false, Ordering::SeqCst);
        info!("trade stream stopped");
    }
}

/// Generator trade mock (random walk) per subscribed symbol.
pub async fn run_mock(client: Arc<StreamClient>, every: Duration) {
    client.running.store(true, Ordering::SeqCst);
    let mut stop = client.stop_rx();
    let mut last_px: HashMap<String, f64> = HashMap::new();
    let mut trade_id: u64 = 0;

    while !*stop.borrow() {
        for symbol in client.subscribed_symbols() {
            let px = last_px.entry(symbol.clone()).or_insert(100.0);
            // jangan simpan ThreadRng melewati .await
            let (step, qty) = {
                let mut rng = rand::thread_rng();
                (rng.gen_range(-0.3..=0.3), rng.gen_range(0.001..0.5))
            };
            *px = (*px + step).max(50.0);
            trade_id += 1;
            client.ingest(Tick {
                symbol,
                price: *px,
                quantity: qty,
                timestamp: Utc::now(),
                trade_id: Some(trade_id),
            });
        }
        tokio::select! {
            _ = sleep(every) => {}
            _ = stop.changed() => {}
        }
    }
    client.running.store(false, Ordering::SeqCst);
    debug!("mock feed stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::SinkExt;
    use parking_lot::Mutex;
    use std::sync::atomic::AtomicUsize;
    use tokio::net::TcpListener;
    use tokio_tungstenite::accept_hdr_async;
    use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
    use tokio_tungstenite::tungstenite::Message;

    const BTC_TRADE: &str =
        r#"{"stream":"btcusdt@trade","data":{"e":"trade","s":"BTCUSDT","t":7,"p":"101.5","q":"0.2","T":1704067200000}}"#;

    // Local combined-stream endpoint: records every handshake path and
    // counts connections that ended with a client close.
    struct LocalStream {
        base: String,
        paths: Arc<Mutex<Vec<String>>>,
        closed: Arc<AtomicUsize>,
    }

    impl LocalStream {
        fn paths(&self) -> Vec<String> { self.paths.lock().clone() }
    }

    async fn local_stream(first_handshake_delay: Duration, drop_first: bool) -> LocalStream {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let base = format!("ws://{}/ws", listener.local_addr().unwrap());
        let paths = Arc::new(Mutex::new(Vec::new()));
        let closed = Arc::new(AtomicUsize::new(0));
        let (p, cl) = (paths.clone(), closed.clone());
        tokio::spawn(async move {
            let mut n = 0usize;
            while let Ok((tcp, _)) = listener.accept().await {
                let first = n == 0;
                n += 1;
                let (p, cl) = (p.clone(), cl.clone());
                tokio::spawn(async move {
                    if first {
                        sleep(first_handshake_delay).await;
                    }
                    let record = move |req: &Request, resp: Response| -> Result<Response, ErrorResponse> {
                        p.lock().push(req.uri().to_string());
                        Ok(resp)
                    };
                    let Ok(mut ws) = accept_hdr_async(tcp, record).await else { return };
                    let _ = ws.send(Message::Text(BTC_TRADE.to_string())).await;
                    if first && drop_first {
                        let _ = ws.close(None).await;
                        return;
                    }
                    while let Some(Ok(m)) = ws.next().await {
                        if m.is_close() {
                            break;
                        }
                    }
                    cl.fetch_add(1, Ordering::SeqCst);
                });
            }
        });
        LocalStream { base, paths, closed }
    }

    fn live_client(base: &str, symbols: &[&str], delay: Duration) -> Arc<StreamClient> {
        let symbols: Vec<String> = symbols.iter().map(|s| s.to_string()).collect();
        Arc::new(StreamClient::new(base, &symbols, Arc::new(TickStore::new()), delay).unwrap())
    }

    async fn wait_for(mut cond: impl FnMut() -> bool) -> bool {
        for _ in 0..300 {
            if cond() {
                return true;
            }
            sleep(Duration::from_millis(10)).await;
        }
        false
    }

    fn set(items: &[&str]) -> BTreeSet<String> { items.iter().map(|s| s.to_string()).collect() }

    fn client(symbols: &[&str]) -> Arc<StreamClient> {
        let symbols: Vec<String> = symbols.iter().map(|s| s.to_string()).collect();
        Arc::new(
            StreamClient::new(
                "wss://testnet.binance.vision/ws",
                &symbols,
                Arc::new(TickStore::new()),
                Duration::from_millis(50),
            )
            .unwrap(),
        )
    }

    #[test]
    fn combined_stream_url() {
        let u = stream_url("wss://testnet.binance.vision/ws", &set(&["ETHUSDT", "BTCUSDT"])).unwrap();
        assert_eq!(u.as_str(), "wss://testnet.binance.vision/stream?streams=btcusdt@trade/ethusdt@trade");

        let u = stream_url("wss://stream.binance.com:9443/ws/", &set(&["BTCUSDT"])).unwrap();
        assert_eq!(u.as_str(), "wss://stream.binance.com:9443/stream?streams=btcusdt@trade");

        assert!(StreamClient::new("nope", &[], Arc::new(TickStore::new()), Duration::from_secs(1)).is_err());
    }

    #[test]
    fn parses_combined_and_bare_frames() {
        let combined = r#"{"stream":"btcusdt@trade","data":{"e":"trade","E":1,"s":"BTCUSDT","t":12345,
            "p":"42000.50","q":"0.010","T":1704067260000,"m":true}}"#;
        let t = parse_frame(combined).unwrap();
        assert_eq!(t.symbol, "BTCUSDT");
        assert_eq!(t.price, 42000.5);
        assert_eq!(t.quantity, 0.01);
        assert_eq!(t.trade_id, Some(12345));
        assert_eq!(t.timestamp, Utc.with_ymd_and_hms(2024, 1, 1, 0, 1, 0).unwrap());

        let bare = r#"{"e":"trade","s":"ethusdt","t":1,"p":"2000","q":"1","T":1704067200000}"#;
        assert_eq!(parse_frame(bare).unwrap().symbol, "ETHUSDT");
    }

    #[test]
    fn rejects_bad_frames() {
        assert!(matches!(parse_frame("not json"), Err(FeedError::Parse(_))));
        assert!(matches!(parse_frame(r#"{"result":null,"id":1}"#), Err(FeedError::Parse(_))));
        let zero = r#"{"e":"trade","s":"BTCUSDT","p":"0","q":"1","T":1704067200000}"#;
        assert!(matches!(parse_frame(zero), Err(FeedError::InvalidTrade(_))));
        let neg_qty = r#"{"e":"trade","s":"BTCUSDT","p":"1","q":"-1","T":1704067200000}"#;
        assert!(matches!(parse_frame(neg_qty), Err(FeedError::InvalidTrade(_))));
        let no_sym = r#"{"e":"trade","p":"1","q":"1","T":1704067200000}"#;
        assert!(matches!(parse_frame(no_sym), Err(FeedError::InvalidTrade(_))));
        let other = r#"{"e":"aggTrade","s":"BTCUSDT","p":"1","q":"1","T":1704067200000}"#;
        assert!(matches!(parse_frame(other), Err(FeedError::InvalidTrade(_))));
    }

    #[test]
    fn subscribe_and_unsubscribe_track_the_set() {
        let c = client(&["btcusdt"]);
        assert_eq!(c.subscribe(&["ETHUSDT".into(), "BTCUSDT".into()]), vec!["ETHUSDT".to_string()]);
        assert_eq!(c.subscribed_symbols(), vec!["BTCUSDT".to_string(), "ETHUSDT".to_string()]);
        assert_eq!(c.unsubscribe(&["btcusdt".into(), "XRPUSDT".into()]), vec!["BTCUSDT".to_string()]);

        c.unsubscribe(&["ETHUSDT".into()]);
        assert_eq!(c.build_stream_url().unwrap(), None);
        assert!(!c.is_connected());
    }

    #[test]
    fn text_frames_reach_store_and_subscribers() {
        let c = client(&["BTCUSDT"]);
        let n = Arc::new(AtomicUsize::new(0));
        let n2 = n.clone();
        c.ticks().subscribe_fn("count", move |_| {
            n2.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
        c.handle_text(r#"{"stream":"btcusdt@trade","data":{"e":"trade","s":"BTCUSDT","t":1,"p":"10","q":"1","T":1704067200000}}"#);
        c.handle_text("garbage");
        assert_eq!(n.load(Ordering::SeqCst), 1);
        assert_eq!(c.store.get("BTCUSDT").map(|t| t.price), Some(10.0));
    }

    #[tokio::test]
    async fn idle_client_stops_promptly() {
        let c = client(&[]);
        let task = tokio::spawn(c.clone().run());
        sleep(Duration::from_millis(20)).await;
        assert!(c.is_running());
        c.stop();
        tokio::time::timeout(Duration::from_secs(1), task).await.unwrap().unwrap();
        assert!(!c.is_running());
    }

    #[tokio::test]
    async fn mock_feed_produces_ticks_until_stopped() {
        let c = client(&["BTCUSDT", "ETHUSDT"]);
        let task = tokio::spawn(run_mock(c.clone(), Duration::from_millis(5)));
        sleep(Duration::from_millis(30)).await;
        c.stop();
        tokio::time::timeout(Duration::from_secs(1), task).await.unwrap().unwrap();
        assert!(c.store.contains("BTCUSDT"));
        assert!(c.store.contains("ETHUSDT"));
        assert!(c.store.get("BTCUSDT").unwrap().price >= 50.0);
    }

    #[tokio::test]
    async fn subscribe_during_handshake_reaches_the_socket() {
        let srv = local_stream(Duration::from_millis(300), false).await;
        let c = live_client(&srv.base, &["BTCUSDT"], Duration::from_millis(50));
        let task = tokio::spawn(c.clone().run());

        sleep(Duration::from_millis(100)).await;
        assert!(!c.is_connected());
        c.subscribe(&["ETHUSDT".into()]);

        assert!(
            wait_for(|| srv.paths().iter().any(|p| p.contains("ethusdt@trade"))).await,
            "paths seen: {:?}",
            srv.paths()
        );
        assert_eq!(srv.paths()[0], "/stream?streams=btcusdt@trade");
        assert!(srv.paths().last().unwrap().contains("btcusdt@trade/ethusdt@trade"));

        c.stop();
        tokio::time::timeout(Duration::from_secs(1), task).await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn server_close_reconnects_with_current_symbols() {
        let srv = local_stream(Duration::ZERO, true).await;
        let c = live_client(&srv.base, &["BTCUSDT"], Duration::from_millis(300));
        let task = tokio::spawn(c.clone().run());

        assert!(wait_for(|| srv.paths().len() == 1).await);
        assert!(wait_for(|| c.store.contains("BTCUSDT")).await);
        // inside the backoff window: the next socket must carry the new set
        sleep(Duration::from_millis(100)).await;
        c.subscribe(&["ETHUSDT".into()]);

        assert!(wait_for(|| srv.paths().len() == 2).await);
        assert_eq!(srv.paths()[1], "/stream?streams=btcusdt@trade/ethusdt@trade");
        assert!(wait_for(|| c.is_connected()).await);

        // no leftover wakeup recycles the fresh socket
        sleep(Duration::from_millis(200)).await;
        assert_eq!(srv.paths().len(), 2);

        c.stop();
        tokio::time::timeout(Duration::from_secs(1), task).await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn unsubscribe_recycles_socket_and_stop_closes_it() {
        let srv = local_stream(Duration::ZERO, false).await;
        let c = live_client(&srv.base, &["BTCUSDT", "ETHUSDT"], Duration::from_millis(50));
        let task = tokio::spawn(c.clone().run());

        assert!(wait_for(|| c.is_connected()).await);
        assert_eq!(srv.paths(), vec!["/stream?streams=btcusdt@trade/ethusdt@trade".to_string()]);

        c.unsubscribe(&["ETHUSDT".into()]);
        assert!(wait_for(|| srv.paths().len() == 2).await);
        assert_eq!(srv.paths()[1], "/stream?streams=btcusdt@trade");
        assert!(wait_for(|| srv.closed.load(Ordering::SeqCst) == 1).await);

        assert!(wait_for(|| c.is_connected()).await);
        c.stop();
        c.stop();
        tokio::time::timeout(Duration::from_secs(1), task).await.unwrap().unwrap();
        assert!(!c.is_connected());
        assert!(!c.is_running());
        assert!(wait_for(|| srv.closed.load(Ordering::SeqCst) == 2).await);
        assert_eq!(srv.paths().len(), 2);
    }
}
