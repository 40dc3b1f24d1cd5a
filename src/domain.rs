// ===============================
// src/domain.rs
// ===============================
use chrono::{DateTime, DurationRound, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Side { Buy, Sell }
impl Side {
    pub fn as_str(&self) -> &'static str { match self { Side::Buy => "BUY", Side::Sell => "SELL" } }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Signal { Buy, Sell, Hold }
impl Signal {
    pub fn as_str(&self) -> &'static str {
        match self { Signal::Buy => "BUY", Signal::Sell => "SELL", Signal::Hold => "HOLD" }
    }
}

/// One trade print from the venue. Immutable once built.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tick {
    pub symbol: String,
    pub price: f64,
    pub quantity: f64,
    pub timestamp: DateTime<Utc>,
    pub trade_id: Option<u64>,
}

/// Start of the one-minute bucket `ts` falls into.
pub fn minute_bucket(ts: DateTime<Utc>) -> DateTime<Utc> {
    ts.duration_trunc(chrono::Duration::minutes(1)).unwrap_or(ts)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candle {
    pub symbol: String,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    /// bucket start, floored to the minute
    pub timestamp: DateTime<Utc>,
    pub volume: f64,
    pub tick_count: u64,
    pub closed: bool,
}

impl Candle {
    pub fn from_tick(tick: &Tick, bucket: DateTime<Utc>) -> Self {
        Self {
            symbol: tick.symbol.clone(),
            open: tick.price,
            high: tick.price,
            low: tick.price,
            close: tick.price,
            timestamp: bucket,
            volume: tick.quantity,
            tick_count: 1,
            closed: false,
        }
    }

    /// Fold a tick into an open candle. Closed candles are never touched.
    pub fn apply(&mut self, tick: &Tick) {
        if self.closed { return; }
        self.high = self.high.max(tick.price);
        self.low = self.low.min(tick.price);
        self.close = tick.price;
        self.volume += tick.quantity;
        self.tick_count += 1;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum PositionSide { #[default] Flat, Long }

/// Per (symbol, variant) position. FLAT implies qty, entry and stop are zero.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Position {
    pub symbol: String,
    pub side: PositionSide,
    pub entry_price: f64,
    pub entry_time: Option<DateTime<Utc>>,
    pub quantity: f64,
    pub current_price: f64,
    pub unrealized_pnl: f64,
    pub realized_pnl: f64,
    pub stop_loss_price: f64,
}

impl Position {
    pub fn flat(symbol: &str) -> Self {
        Self { symbol: symbol.to_string(), ..Default::default() }
    }

    pub fn is_long(&self) -> bool { self.side == PositionSide::Long }

    pub fn mark(&mut self, price: f64) {
        self.current_price = price;
        self.unrealized_pnl = if self.is_long() {
            (price - self.entry_price) * self.quantity
        } else {
            0.0
        };
    }

    pub fn is_stop_loss_triggered(&self) -> bool {
        self.is_long()
            && self.current_price > 0.0
            && self.stop_loss_price > 0.0
            && self.current_price <= self.stop_loss_price
    }
}

/// Static variant config, shared process-wide.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StrategyVariant {
    pub name: String,
    pub stop_loss_pct: f64,
    pub description: String,
}

impl StrategyVariant {
    pub fn new(name: &str, stop_loss_pct: f64) -> Self {
        Self {
            name: name.to_string(),
            stop_loss_pct,
            description: format!("Stop loss {:.0}% below entry", stop_loss_pct * 100.0),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignalEvent {
    pub ts: DateTime<Utc>,
    pub symbol: String,
    pub variant: String,
    pub signal: Signal,
    pub price: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TradeRecord {
    pub timestamp: DateTime<Utc>,
    pub symbol: String,
    pub side: Side,
    pub size: f64,
    pub price: f64,
    pub variant: String,
    pub order_id: String,
    pub status: String,
    pub pnl: Option<f64>,
    pub notes: String,
}

/// Everything the recorder writes, one JSON line each.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", content = "data", rename_all = "snake_case")]
pub enum Event { Candle(Candle), Signal(SignalEvent), Trade(TradeRecord), Note(String) }
