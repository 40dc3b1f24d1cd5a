// ===============================
// src/system.rs
// ===============================
//
// Wiring pipeline:
//   feed -> TickStore -> ticks fan-out -> CandleAggregator
//        -> closed candles (mpsc) -> StrategyManager
//        -> signals (mpsc) -> OrderExecutor -> venue
//        -> trades (mpsc) -> TradeBook
// Recorder (opsional) menerima candle/sinyal/trade lewat fan-out yang sama.
//
// Urutan shutdown: stop ingestion -> stop timer + close_all -> global stop.
//
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::bus::SinkError;
use crate::candles::CandleAggregator;
use crate::config::{MarketMode, Settings};
use crate::domain::{Candle, Event, SignalEvent, TradeRecord};
use crate::executor::{self, OrderExecutor};
use crate::feed::{self, FeedError, StreamClient};
use crate::gateway::{ExecutionVenue, MockVenue, VenueError};
use crate::gateway_binance::BinanceRestVenue;
use crate::metrics::{CONFIG_MODE, CONFIG_SYMBOL};
use crate::posttrade::{self, TradeBook};
use crate::recorder;
use crate::strategy::StrategyError;
use crate::strategy_manager::{self, StrategyManager};
use crate::tick_store::TickStore;

const MOCK_FILL_MS: u64 = 50;
const MOCK_TICK_EVERY: Duration = Duration::from_millis(200);
const HEARTBEAT_EVERY: Duration = Duration::from_secs(60);

#[derive(Debug, Error)]
pub enum SystemError {
    #[error(transparent)]
    Feed(#[from] FeedError),
    #[error(transparent)]
    Strategy(#[from] StrategyError),
    #[error(transparent)]
    Venue(#[from] VenueError),
}

/// Venue per VENUE_MODE. Live venues are pinged once; a failed ping only warns.
pub async fn build_venue(settings: &Settings) -> Result<Arc<dyn ExecutionVenue>, VenueError> {
    match settings.venue_mode {
        MarketMode::Mock => Ok(Arc::new(MockVenue::new(MOCK_FILL_MS))),
        MarketMode::BinanceSandbox | MarketMode::BinanceMainnet => {
            let venue = BinanceRestVenue::new(
                &settings.binance_rest_url,
                settings.binance_api_key.clone(),
                settings.binance_api_secret.clone(),
                settings.recv_window,
            )?;
            match venue.ping().await {
                Ok(()) => info!(rest = %settings.binance_rest_url, "binance REST reachable"),
                Err(e) => warn!(error = %e, rest = %settings.binance_rest_url, "binance REST ping failed"),
            }
            Ok(Arc::new(venue))
        }
    }
}

fn forward(tx: &mpsc::Sender<Event>, ev: Event) -> Result<(), SinkError> {
    tx.try_send(ev).map_err(|e| match e {
        mpsc::error::TrySendError::Full(_) => SinkError::Full,
        mpsc::error::TrySendError::Closed(_) => SinkError::Closed,
    })
}

// Receiver yang belum dipakai sampai pipeline di-spawn.
struct Pending {
    candle_rx: mpsc::Receiver<Candle>,
    sig_rx: mpsc::Receiver<SignalEvent>,
    trade_rx: mpsc::Receiver<TradeRecord>,
    rec: Option<(mpsc::Receiver<Event>, String)>,
}

pub struct System {
    pub settings: Settings,
    pub store: Arc<TickStore>,
    pub client: Arc<StreamClient>,
    pub aggregator: Arc<CandleAggregator>,
    pub manager: Arc<StrategyManager>,
    pub executor: Arc<OrderExecutor>,
    pub book: Arc<TradeBook>,
    stop_tx: watch::Sender<bool>,
    notes: Option<mpsc::Sender<Event>>,
    pending: Option<Pending>,
    tasks: Vec<JoinHandle<()>>,
    feed_task: Option<JoinHandle<()>>,
    timer_task: Option<JoinHandle<()>>,
}

impl System {
    /// Build every component and register the fan-out sinks. Nothing runs yet.
    pub fn build(settings: Settings, venue: Arc<dyn ExecutionVenue>) -> Result<Self, SystemError> {
        let store = Arc::new(TickStore::new());
        let client = Arc::new(StreamClient::new(
            &settings.binance_ws_url,
            &settings.symbols,
            store.clone(),
            Duration::from_secs(settings.reconnect_delay_secs),
        )?);
        let aggregator = Arc::new(CandleAggregator::new(settings.candle_history_size));
        let manager = Arc::new(StrategyManager::new(
            &settings.symbols,
            settings.variants(),
            settings.sma_period,
            settings.ema_period,
        )?);
        let executor = Arc::new(OrderExecutor::new(manager.clone(), venue, settings.order_sizes));
        let book = Arc::new(TradeBook::new());

        // ---- Buses ----
        let (candle_tx, candle_rx) = mpsc::channel::<Candle>(1024);
        let (sig_tx, sig_rx) = mpsc::channel::<SignalEvent>(2048);
        let (trade_tx, trade_rx) = mpsc::channel::<TradeRecord>(2048);

        let agg = aggregator.clone();
        client.ticks().subscribe_fn("candles", move |t| {
            agg.process_tick(t);
            Ok(())
        });
        aggregator.closed_candles().subscribe_channel("strategy", candle_tx);
        manager.signals().subscribe_channel("executor", sig_tx);
        executor.trades().subscribe_channel("posttrade", trade_tx);

        // ---- Recorder (optional) ----
        let rec = settings.record_file.clone().map(|path| {
            let (rec_tx, rec_rx) = mpsc::channel::<Event>(8192);
            let rec_tx_notes = rec_tx.clone();
            let tx = rec_tx.clone();
            aggregator
                .closed_candles()
                .subscribe_fn("recorder", move |c: &Candle| forward(&tx, Event::Candle(c.clone())));
            let tx = rec_tx.clone();
            manager
                .signals()
                .subscribe_fn("recorder", move |s: &SignalEvent| forward(&tx, Event::Signal(s.clone())));
            executor
                .trades()
                .subscribe_fn("recorder", move |t: &TradeRecord| forward(&rec_tx, Event::Trade(t.clone())));
            (rec_rx, path, rec_tx_notes)
        });
        let (rec, notes) = match rec {
            Some((rx, path, notes)) => (Some((rx, path)), Some(notes)),
            None => (None, None),
        };

        let (stop_tx, _) = watch::channel(false);
        Ok(Self {
            settings,
            store,
            client,
            aggregator,
            manager,
            executor,
            book,
            stop_tx,
            notes,
            pending: Some(Pending { candle_rx, sig_rx, trade_rx, rec }),
            tasks: Vec::new(),
            feed_task: None,
            timer_task: None,
        })
    }

    fn note(&self, text: String) {
        if let Some(tx) = &self.notes {
            let _ = forward(tx, Event::Note(text));
        }
    }

    pub fn stop_signal(&self) -> watch::Receiver<bool> { self.stop_tx.subscribe() }

    // Loop konsumen berhenti saat global stop di-flip.
    fn spawn_until_stopped<F>(&mut self, fut: F)
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        let mut stop = self.stop_signal();
        self.tasks.push(tokio::spawn(async move {
            tokio::select! {
                _ = fut => {}
                _ = stop.changed() => {}
            }
        }));
    }

    /// Spawn the consumer side: strategy, executor, post-trade, recorder.
    pub fn spawn_pipeline(&mut self) {
        let Some(p) = self.pending.take() else { return };
        let manager = self.manager.clone();
        let exec = self.executor.clone();
        let book = self.book.clone();
        self.spawn_until_stopped(strategy_manager::run(p.candle_rx, manager));
        self.spawn_until_stopped(executor::run(p.sig_rx, exec));
        self.spawn_until_stopped(posttrade::run(p.trade_rx, book));
        if let Some((rec_rx, path)) = p.rec {
            let stop = self.stop_signal();
            self.tasks.push(tokio::spawn(recorder::run(rec_rx, path, stop)));
        }
    }

    // Heartbeat: ringkasan status tiap interval.
    fn spawn_heartbeat(&mut self, every: Duration) {
        let store = self.store.clone();
        let client = self.client.clone();
        let agg = self.aggregator.clone();
        let manager = self.manager.clone();
        let book = self.book.clone();
        self.spawn_until_stopped(async move {
            let mut tick = tokio::time::interval(every);
            tick.tick().await;
            loop {
                tick.tick().await;
                let long: usize = manager
                    .positions()
                    .values()
                    .map(|by_variant| by_variant.values().filter(|p| p.is_long()).count())
                    .sum();
                let s = book.summary(None, None);
                info!(
                    connected = client.is_connected(),
                    symbols_seen = store.len(),
                    open_candles = agg.current_candles().len(),
                    long_positions = long,
                    trades = s.total_trades,
                    pnl = s.total_pnl,
                    "heartbeat"
                );
            }
        });
    }

    /// Everything: pipeline, boundary timer, ingestion, metrics server.
    pub fn start(&mut self) {
        let s = &self.settings;
        info!(
            feed_mode = s.feed_mode.as_str(),
            venue_mode = s.venue_mode.as_str(),
            symbols = ?s.symbols,
            sma = s.sma_period,
            ema = s.ema_period,
            variant_a_sl = s.variant_a_sl,
            variant_b_sl = s.variant_b_sl,
            binance_ws = %s.binance_ws_url,
            binance_rest = %s.binance_rest_url,
            record_file = ?s.record_file,
            "startup config"
        );
        CONFIG_MODE.with_label_values(&["feed", s.feed_mode.as_str()]).set(1);
        CONFIG_MODE.with_label_values(&["venue", s.venue_mode.as_str()]).set(1);
        for sym in &s.symbols {
            CONFIG_SYMBOL.with_label_values(&[sym.as_str()]).set(1);
        }

        self.note(format!(
            "started feed={} venue={} symbols={}",
            s.feed_mode.as_str(),
            s.venue_mode.as_str(),
            s.symbols.join(",")
        ));
        self.spawn_pipeline();
        self.timer_task = Some(self.aggregator.spawn_boundary_timer());

        let client = self.client.clone();
        self.feed_task = Some(match self.settings.feed_mode {
            MarketMode::Mock => tokio::spawn(feed::run_mock(client, MOCK_TICK_EVERY)),
            MarketMode::BinanceSandbox | MarketMode::BinanceMainnet => tokio::spawn(client.run()),
        });

        self.spawn_heartbeat(HEARTBEAT_EVERY);

        let port = self.settings.metrics_port;
        let stop = self.stop_signal();
        self.tasks.push(tokio::spawn(crate::metrics::serve_metrics(port, stop)));
    }

    /// Track a symbol end to end: strategies first, then the stream.
    ///
    /// Runtime control surface for the reporting layer; `main` itself never
    /// changes the symbol set after startup.
    #[allow(dead_code)]
    pub fn add_symbol(&self, symbol: &str) -> Result<bool, SystemError> {
        let symbol = symbol.to_ascii_uppercase();
        let added = self.manager.add_symbol(&symbol)?;
        self.client.subscribe(&[symbol.clone()]);
        CONFIG_SYMBOL.with_label_values(&[&symbol]).set(1);
        Ok(added)
    }

    /// Stop streaming and trading a symbol. Closed candle history is kept.
    #[allow(dead_code)]
    pub fn remove_symbol(&self, symbol: &str) -> bool {
        let symbol = symbol.to_ascii_uppercase();
        self.client.unsubscribe(&[symbol.clone()]);
        self.store.clear(Some(&symbol));
        CONFIG_SYMBOL.with_label_values(&[&symbol]).set(0);
        self.manager.remove_symbol(&symbol)
    }

    /// Ordered shutdown; every wait is bounded.
    pub async fn shutdown(mut self) {
        info!("shutting down");

        // 1) ingestion: no more ticks, socket closed
        self.client.stop();
        if let Some(t) = self.feed_task.take() {
            if tokio::time::timeout(Duration::from_secs(5), t).await.is_err() {
                warn!("feed did not stop in time");
            }
        }

        // 2) timer + force-close open candles (published like any other close)
        let flushed = self.aggregator.stop();
        info!(candles = flushed.len(), "open candles force-closed");
        if let Some(t) = self.timer_task.take() {
            let _ = tokio::time::timeout(Duration::from_secs(1), t).await;
        }

        // 3) global stop: metrics server, dispatch loops, recorder
        self.note(format!("shutdown, {} open candles flushed", flushed.len()));
        self.stop_tx.send_replace(true);
        for t in self.tasks.drain(..) {
            let _ = tokio::time::timeout(Duration::from_secs(5), t).await;
        }

        let summary = self.book.summary(None, None);
        info!(
            trades = summary.total_trades,
            pnl = summary.total_pnl,
            win_rate = summary.win_rate,
            "stopped"
        );
    }
}
