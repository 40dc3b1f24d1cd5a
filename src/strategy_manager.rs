// ===============================
// src/strategy_manager.rs
// ===============================
//
// Satu instance strategi per (symbol, variant). Candle closed dikirim ke
// semua variant untuk symbol tsb; sinyal non-HOLD dipublikasikan ke bus.
//
use std::collections::BTreeMap;
use std::sync::Arc;

use ahash::AHashMap as HashMap;
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::bus::Fanout;
use crate::domain::{Candle, Position, Signal, SignalEvent, StrategyVariant};
use crate::metrics::{PNL_REALIZED, PNL_UNREALIZED, SIGNALS_BY};
use crate::strategy::{IndicatorSnapshot, SignalModel, SmaEmaCrossover, Strategy, StrategyError};

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StrategyKey {
    pub symbol: String,
    pub variant: String,
}

impl StrategyKey {
    pub fn new(symbol: &str, variant: &str) -> Self {
        Self { symbol: symbol.to_ascii_uppercase(), variant: variant.to_string() }
    }
}

pub type ModelFactory = Box<dyn Fn() -> Result<Box<dyn SignalModel>, StrategyError> + Send + Sync>;

#[derive(Debug, Clone, Serialize)]
pub struct InstanceStatus {
    pub position: Position,
    pub indicators: IndicatorSnapshot,
}

#[derive(Debug, Clone, Serialize)]
pub struct ManagerStatus {
    pub symbols: Vec<String>,
    pub variants: Vec<StrategyVariant>,
    pub sma_period: usize,
    pub ema_period: usize,
    pub positions: BTreeMap<String, BTreeMap<String, InstanceStatus>>,
}

pub struct StrategyManager {
    variants: Vec<StrategyVariant>,
    sma_period: usize,
    ema_period: usize,
    factory: ModelFactory,
    instances: RwLock<HashMap<StrategyKey, Arc<Mutex<Strategy>>>>,
    signals: Fanout<SignalEvent>,
}

impl StrategyManager {
    /// EMA/SMA crossover for every (symbol, variant).
    pub fn new(
        symbols: &[String],
        variants: Vec<StrategyVariant>,
        sma_period: usize,
        ema_period: usize,
    ) -> Result<Self, StrategyError> {
        // validasi sekali di awal: periode invalid = fatal
        SmaEmaCrossover::new(sma_period, ema_period)?;
        let factory: ModelFactory = Box::new(move || {
            Ok(Box::new(SmaEmaCrossover::new(sma_period, ema_period)?) as Box<dyn SignalModel>)
        });
        Self::with_model(symbols, variants, sma_period, ema_period, factory)
    }

    /// Any `SignalModel` per instance; `new` goes through here with the crossover.
    pub fn with_model(
        symbols: &[String],
        variants: Vec<StrategyVariant>,
        sma_period: usize,
        ema_period: usize,
        factory: ModelFactory,
    ) -> Result<Self, StrategyError> {
        let mgr = Self {
            variants,
            sma_period,
            ema_period,
            factory,
            instances: RwLock::new(HashMap::new()),
            signals: Fanout::new("signals"),
        };
        for s in symbols {
            mgr.add_symbol(s)?;
        }
        info!(
            symbols = symbols.len(),
            variants = mgr.variants.len(),
            sma = sma_period,
            ema = ema_period,
            "strategy manager ready"
        );
        Ok(mgr)
    }

    /// Signal consumers.
    pub fn signals(&self) -> &Fanout<SignalEvent> { &self.signals }

    pub fn variants(&self) -> &[StrategyVariant] { &self.variants }

    /// Create the full variant set; `Ok(false)` when the symbol is already tracked.
    pub fn add_symbol(&self, symbol: &str) -> Result<bool, StrategyError> {
        let symbol = symbol.to_ascii_uppercase();
        let mut built = Vec::with_capacity(self.variants.len());
        for v in &self.variants {
            let strat = Strategy::new(&symbol, v.stop_loss_pct, (self.factory)()?)?;
            built.push((StrategyKey::new(&symbol, &v.name), Arc::new(Mutex::new(strat))));
        }

        let mut map = self.instances.write();
        if map.keys().any(|k| k.symbol == symbol) {
            warn!(%symbol, "symbol already tracked");
            return Ok(false);
        }
        for (key, strat) in built {
            debug!(symbol = %key.symbol, variant = %key.variant, "strategy created");
            map.insert(key, strat);
        }
        info!(%symbol, "symbol added");
        Ok(true)
    }

    /// Drop every variant of `symbol`; `false` if it was not tracked.
    pub fn remove_symbol(&self, symbol: &str) -> bool {
        let symbol = symbol.to_ascii_uppercase();
        let mut map = self.instances.write();
        let before = map.len();
        map.retain(|k, _| k.symbol != symbol);
        let removed = map.len() != before;
        if removed {
            info!(%symbol, "symbol removed");
        }
        removed
    }

    fn instance(&self, symbol: &str, variant: &str) -> Option<Arc<Mutex<Strategy>>> {
        self.instances.read().get(&StrategyKey::new(symbol, variant)).cloned()
    }

    /// Run a closed candle through every variant of its symbol.
    pub fn on_candle(&self, candle: &Candle) -> Vec<SignalEvent> {
        let symbol = candle.symbol.to_ascii_uppercase();
        let mut out = Vec::new();

        for v in &self.variants {
            let Some(inst) = self.instance(&symbol, &v.name) else { continue };
            let (signal, position) = {
                let mut strat = inst.lock();
                (strat.on_candle(candle), strat.position().clone())
            };
            PNL_UNREALIZED.with_label_values(&[&symbol, &v.name]).set(position.unrealized_pnl);

            let Some(signal) = signal.filter(|s| *s != Signal::Hold) else { continue };
            let ev = SignalEvent {
                ts: Utc::now(),
                symbol: symbol.clone(),
                variant: v.name.clone(),
                signal,
                price: candle.close,
            };
            info!(symbol = %ev.symbol, variant = %ev.variant, signal = ev.signal.as_str(), px = ev.price, "signal");
            SIGNALS_BY.with_label_values(&[&symbol, &v.name, signal.as_str()]).inc();
            self.signals.publish(&ev);
            out.push(ev);
        }
        out
    }

    pub fn enter_position(&self, symbol: &str, variant: &str, price: f64, qty: f64, at: DateTime<Utc>) -> bool {
        let Some(inst) = self.instance(symbol, variant) else { return false };
        inst.lock().enter_position(price, qty, at);
        info!(%symbol, %variant, px = price, qty, "position entered");
        true
    }

    /// Realized P&L of the exit, `None` for an unknown key.
    pub fn exit_position(&self, symbol: &str, variant: &str, price: f64) -> Option<f64> {
        let inst = self.instance(symbol, variant)?;
        let (pnl, total) = {
            let mut strat = inst.lock();
            let pnl = strat.exit_position(price);
            (pnl, strat.position().realized_pnl)
        };
        let key = StrategyKey::new(symbol, variant);
        PNL_REALIZED.with_label_values(&[&key.symbol, variant]).set(total);
        PNL_UNREALIZED.with_label_values(&[&key.symbol, variant]).set(0.0);
        info!(%symbol, %variant, px = price, pnl, "position exited");
        Some(pnl)
    }

    pub fn position(&self, symbol: &str, variant: &str) -> Option<Position> {
        self.instance(symbol, variant).map(|i| i.lock().position().clone())
    }

    pub fn indicators(&self, symbol: &str, variant: &str) -> Option<IndicatorSnapshot> {
        self.instance(symbol, variant).map(|i| i.lock().indicators())
    }

    /// symbol -> variant -> position
    pub fn positions(&self) -> BTreeMap<String, BTreeMap<String, Position>> {
        let mut out: BTreeMap<String, BTreeMap<String, Position>> = BTreeMap::new();
        for (k, inst) in self.instances.read().iter() {
            out.entry(k.symbol.clone())
                .or_default()
                .insert(k.variant.clone(), inst.lock().position().clone());
        }
        out
    }

    pub fn symbols(&self) -> Vec<String> {
        let mut out: Vec<String> = self.instances.read().keys().map(|k| k.symbol.clone()).collect();
        out.sort();
        out.dedup();
        out
    }

    pub fn status(&self) -> ManagerStatus {
        let mut positions: BTreeMap<String, BTreeMap<String, InstanceStatus>> = BTreeMap::new();
        for (k, inst) in self.instances.read().iter() {
            let strat = inst.lock();
            positions.entry(k.symbol.clone()).or_default().insert(
                k.variant.clone(),
                InstanceStatus { position: strat.position().clone(), indicators: strat.indicators() },
            );
        }
        ManagerStatus {
            symbols: positions.keys().cloned().collect(),
            variants: self.variants.clone(),
            sma_period: self.sma_period,
            ema_period: self.ema_period,
            positions,
        }
    }
}

/// Strategy dispatch loop: closed candles in, signals out through the bus.
pub async fn run(mut candle_rx: mpsc::Receiver<Candle>, manager: Arc<StrategyManager>) {
    while let Some(candle) = candle_rx.recv().await {
        let fired = manager.on_candle(&candle);
        if !fired.is_empty() {
            debug!(symbol = %candle.symbol, n = fired.len(), "signals dispatched");
        }
    }
    info!("candle channel closed, strategy loop stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::SinkError;
    use chrono::TimeZone;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn variants() -> Vec<StrategyVariant> {
        vec![StrategyVariant::new("A", 0.15), StrategyVariant::new("B", 0.10)]
    }

    fn candle(symbol: &str, close: f64, minute: u32) -> Candle {
        Candle {
            symbol: symbol.into(),
            open: close,
            high: close,
            low: close,
            close,
            timestamp: Utc.with_ymd_and_hms(2024, 1, 1, 0, minute, 0).unwrap(),
            volume: 1.0,
            tick_count: 1,
            closed: true,
        }
    }

    fn manager() -> StrategyManager {
        StrategyManager::new(&["BTCUSDT".to_string()], variants(), 3, 2).unwrap()
    }

    #[test]
    fn invalid_period_is_fatal() {
        assert!(StrategyManager::new(&["BTCUSDT".to_string()], variants(), 0, 2).is_err());
    }

    #[test]
    fn add_and_remove_symbol_are_idempotent() {
        let m = manager();
        assert_eq!(m.add_symbol("btcusdt"), Ok(false));
        assert_eq!(m.add_symbol("ETHUSDT"), Ok(true));
        assert_eq!(m.symbols(), vec!["BTCUSDT".to_string(), "ETHUSDT".to_string()]);
        assert!(m.position("ETHUSDT", "B").is_some());

        assert!(m.remove_symbol("ethusdt"));
        assert!(!m.remove_symbol("ETHUSDT"));
        assert!(m.position("ETHUSDT", "A").is_none());
        assert_eq!(m.positions().len(), 1);
    }

    #[test]
    fn candle_fans_out_to_every_variant() {
        let m = manager();
        let seen = Arc::new(AtomicUsize::new(0));
        m.signals().subscribe_fn("broken", |_| Err(SinkError::Failed("x".into())));
        let s = seen.clone();
        m.signals().subscribe_fn("count", move |ev: &SignalEvent| {
            assert_eq!(ev.signal, Signal::Buy);
            assert_eq!(ev.price, 12.0);
            s.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

        let mut fired = Vec::new();
        for (i, c) in [10.0, 10.0, 10.0, 10.0, 12.0].iter().enumerate() {
            fired = m.on_candle(&candle("BTCUSDT", *c, i as u32));
        }
        let mut variants: Vec<_> = fired.iter().map(|e| e.variant.clone()).collect();
        variants.sort();
        assert_eq!(variants, vec!["A".to_string(), "B".to_string()]);
        assert_eq!(seen.load(Ordering::SeqCst), 2);

        // unknown symbol is ignored
        assert!(m.on_candle(&candle("DOGEUSDT", 1.0, 9)).is_empty());
    }

    #[test]
    fn variants_differ_only_by_stop_loss() {
        let m = manager();
        let now = Utc::now();
        assert!(m.enter_position("BTCUSDT", "A", 100.0, 1.0, now));
        assert!(m.enter_position("BTCUSDT", "B", 100.0, 1.0, now));
        assert!((m.position("BTCUSDT", "A").unwrap().stop_loss_price - 85.0).abs() < 1e-9);
        assert!((m.position("BTCUSDT", "B").unwrap().stop_loss_price - 90.0).abs() < 1e-9);

        // 88 breaches B (90) but not A (85)
        let fired = m.on_candle(&candle("BTCUSDT", 88.0, 0));
        assert_eq!(fired.len(), 1);
        assert_eq!(fired[0].variant, "B");
        assert_eq!(fired[0].signal, Signal::Sell);

        assert_eq!(m.exit_position("BTCUSDT", "B", 88.0), Some(-12.0));
        assert_eq!(m.exit_position("NOPE", "B", 1.0), None);
        assert!(!m.position("BTCUSDT", "B").unwrap().is_long());
    }

    #[test]
    fn status_reports_parameters_and_indicators() {
        let m = manager();
        for (i, c) in [10.0, 10.0, 10.0, 10.0].iter().enumerate() {
            m.on_candle(&candle("BTCUSDT", *c, i as u32));
        }
        let st = m.status();
        assert_eq!((st.sma_period, st.ema_period), (3, 2));
        assert_eq!(st.variants.len(), 2);
        let a = &st.positions["BTCUSDT"]["A"];
        assert_eq!(a.indicators.sma, Some(10.0));
        assert_eq!(m.indicators("BTCUSDT", "B").unwrap().ema, Some(10.0));
    }

    #[tokio::test]
    async fn dispatch_loop_drains_channel() {
        let m = Arc::new(manager());
        let (tx, rx) = mpsc::channel(16);
        let task = tokio::spawn(run(rx, m.clone()));
        for (i, c) in [10.0, 10.0, 10.0, 10.0, 12.0].iter().enumerate() {
            tx.send(candle("BTCUSDT", *c, i as u32)).await.unwrap();
        }
        drop(tx);
        task.await.unwrap();
        assert_eq!(m.indicators("BTCUSDT", "A").unwrap().sma.map(|v| (v * 3.0).round()), Some(32.0));
    }
}
