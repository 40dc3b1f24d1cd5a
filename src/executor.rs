// ===============================
// src/executor.rs
// ===============================
//
// Sinyal -> order ke venue -> update posisi strategi -> trade record.
//
// Guard duplikasi per (symbol, variant): selama satu order untuk key tsb
// masih in-flight, sinyal berikutnya untuk key yang sama di-skip.
// Key yang berbeda jalan paralel. Posisi di strategi = satu-satunya sumber
// kebenaran untuk "sudah LONG / belum".
//
use std::sync::Arc;

use ahash::AHashSet as HashSet;
use chrono::Utc;
use parking_lot::Mutex;
use tokio::{sync::mpsc, time::Instant};
use tracing::{debug, error, info, warn};

use crate::bus::Fanout;
use crate::domain::{Side, Signal, SignalEvent, TradeRecord};
use crate::gateway::{ExecutionVenue, OrderRequest};
use crate::metrics::{DUPLICATE_SKIPS, LAT_SIG_FILL, ORDERS};
use crate::strategy_manager::{StrategyKey, StrategyManager};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct OrderSizes {
    pub btc: f64,
    pub eth: f64,
    pub default: f64,
}

impl Default for OrderSizes {
    fn default() -> Self { Self { btc: 0.001, eth: 0.01, default: 0.001 } }
}

impl OrderSizes {
    /// Entry size by base asset prefix.
    pub fn for_symbol(&self, symbol: &str) -> f64 {
        let s = symbol.to_ascii_uppercase();
        if s.starts_with("BTC") {
            self.btc
        } else if s.starts_with("ETH") {
            self.eth
        } else {
            self.default
        }
    }
}

// Lepas key saat guard di-drop (sukses, gagal, atau future dibatalkan).
struct BusyGuard<'a> {
    busy: &'a Mutex<HashSet<StrategyKey>>,
    key: StrategyKey,
}

impl Drop for BusyGuard<'_> {
    fn drop(&mut self) {
        self.busy.lock().remove(&self.key);
    }
}

pub struct OrderExecutor {
    manager: Arc<StrategyManager>,
    venue: Arc<dyn ExecutionVenue>,
    sizes: OrderSizes,
    busy: Mutex<HashSet<StrategyKey>>,
    trades: Fanout<TradeRecord>,
}

impl OrderExecutor {
    pub fn new(manager: Arc<StrategyManager>, venue: Arc<dyn ExecutionVenue>, sizes: OrderSizes) -> Self {
        info!(venue = venue.name(), ?sizes, "order executor ready");
        Self { manager, venue, sizes, busy: Mutex::new(HashSet::new()), trades: Fanout::new("trades") }
    }

    pub fn trades(&self) -> &Fanout<TradeRecord> { &self.trades }

    pub fn is_busy(&self, symbol: &str, variant: &str) -> bool {
        self.busy.lock().contains(&StrategyKey::new(symbol, variant))
    }

    fn try_acquire(&self, key: StrategyKey) -> Option<BusyGuard<'_>> {
        if !self.busy.lock().insert(key.clone()) {
            return None;
        }
        Some(BusyGuard { busy: &self.busy, key })
    }

    /// Execute one signal. `None` when skipped, duplicate or failed.
    pub async fn execute_signal(&self, symbol: &str, variant: &str, signal: Signal, price: f64) -> Option<TradeRecord> {
        let key = StrategyKey::new(symbol, variant);
        let Some(_guard) = self.try_acquire(key.clone()) else {
            info!(symbol = %key.symbol, %variant, "order already in flight, signal skipped");
            DUPLICATE_SKIPS.with_label_values(&[&key.symbol, variant]).inc();
            return None;
        };

        match signal {
            Signal::Buy => self.enter(&key, price).await,
            Signal::Sell => self.exit(&key, price).await,
            Signal::Hold => None,
        }
    }

    async fn enter(&self, key: &StrategyKey, price: f64) -> Option<TradeRecord> {
        let Some(pos) = self.manager.position(&key.symbol, &key.variant) else {
            warn!(symbol = %key.symbol, variant = %key.variant, "no strategy for key");
            return None;
        };
        if pos.is_long() {
            info!(symbol = %key.symbol, variant = %key.variant, "already LONG, entry skipped");
            return None;
        }

        let qty = self.sizes.for_symbol(&key.symbol);
        let req = OrderRequest { symbol: key.symbol.clone(), side: Side::Buy, quantity: qty, reference_price: price };
        let started = Instant::now();
        let ack = match self.venue.place_market_order(&req).await {
            Ok(a) => a,
            Err(e) => {
                error!(symbol = %key.symbol, variant = %key.variant, error = %e, "BUY order failed");
                ORDERS.with_label_values(&["BUY", "failed"]).inc();
                return None;
            }
        };
        LAT_SIG_FILL.observe(started.elapsed().as_secs_f64() * 1000.0);
        ORDERS.with_label_values(&["BUY", "filled"]).inc();

        let fill = ack.fill_price.unwrap_or(price);
        let now = Utc::now();
        self.manager.enter_position(&key.symbol, &key.variant, fill, qty, now);

        let rec = TradeRecord {
            timestamp: now,
            symbol: key.symbol.clone(),
            side: Side::Buy,
            size: qty,
            price: fill,
            variant: key.variant.clone(),
            order_id: ack.order_id,
            status: ack.status,
            pnl: None,
            notes: "crossover entry".into(),
        };
        info!(symbol = %rec.symbol, variant = %rec.variant, order_id = %rec.order_id, px = fill, "BUY executed");
        self.trades.publish(&rec);
        Some(rec)
    }

    async fn exit(&self, key: &StrategyKey, price: f64) -> Option<TradeRecord> {
        let pos = match self.manager.position(&key.symbol, &key.variant) {
            Some(p) if p.is_long() => p,
            _ => {
                info!(symbol = %key.symbol, variant = %key.variant, "no LONG position, exit skipped");
                return None;
            }
        };
        let notes = if pos.is_stop_loss_triggered() { "stop loss triggered" } else { "crossover exit" };

        let req = OrderRequest {
            symbol: key.symbol.clone(),
            side: Side::Sell,
            quantity: pos.quantity,
            reference_price: price,
        };
        let started = Instant::now();
        let ack = match self.venue.place_market_order(&req).await {
            Ok(a) => a,
            Err(e) => {
                error!(symbol = %key.symbol, variant = %key.variant, error = %e, "SELL order failed");
                ORDERS.with_label_values(&["SELL", "failed"]).inc();
                return None;
            }
        };
        LAT_SIG_FILL.observe(started.elapsed().as_secs_f64() * 1000.0);
        ORDERS.with_label_values(&["SELL", "filled"]).inc();

        let fill = ack.fill_price.unwrap_or(price);
        let pnl = self.manager.exit_position(&key.symbol, &key.variant, fill).unwrap_or(0.0);

        let rec = TradeRecord {
            timestamp: Utc::now(),
            symbol: key.symbol.clone(),
            side: Side::Sell,
            size: pos.quantity,
            price: fill,
            variant: key.variant.clone(),
            order_id: ack.order_id,
            status: ack.status,
            pnl: Some(pnl),
            notes: notes.into(),
        };
        info!(symbol = %rec.symbol, variant = %rec.variant, order_id = %rec.order_id, px = fill, pnl, "SELL executed");
        self.trades.publish(&rec);
        Some(rec)
    }
}

/// Signal dispatch loop; one task per signal so different keys run in parallel.
pub async fn run(mut sig_rx: mpsc::Receiver<SignalEvent>, exec: Arc<OrderExecutor>) {
    while let Some(ev) = sig_rx.recv().await {
        if ev.signal == Signal::Hold {
            continue;
        }
        debug!(symbol = %ev.symbol, variant = %ev.variant, signal = ev.signal.as_str(), "dispatch");
        let exec = exec.clone();
        tokio::spawn(async move {
            exec.execute_signal(&ev.symbol, &ev.variant, ev.signal, ev.price).await;
        });
    }
    info!("signal channel closed, executor loop stopped");
}
