// ===============================
// src/posttrade.rs
// ===============================
use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::info;

use crate::domain::{Side, TradeRecord};

#[derive(Debug, Clone, Default)]
pub struct TradeFilter {
    pub symbol: Option<String>,
    pub variant: Option<String>,
    pub side: Option<Side>,
    /// most recent N
    pub limit: Option<usize>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct TradeSummary {
    pub total_trades: usize,
    pub buy_trades: usize,
    pub sell_trades: usize,
    pub total_pnl: f64,
    pub winning_trades: usize,
    pub losing_trades: usize,
    /// winners / trades that carry a P&L
    pub win_rate: f64,
}

pub const DEFAULT_TRADE_RETENTION: usize = 10_000;

/// In-memory trade book, bounded FIFO: the oldest record goes first.
/// Queries and summaries only see what is retained.
pub struct TradeBook {
    trades: RwLock<VecDeque<TradeRecord>>,
    retention: usize,
}

impl Default for TradeBook {
    fn default() -> Self { Self::with_retention(DEFAULT_TRADE_RETENTION) }
}

impl TradeBook {
    pub fn new() -> Self { Self::default() }

    pub fn with_retention(retention: usize) -> Self {
        Self { trades: RwLock::new(VecDeque::new()), retention: retention.max(1) }
    }

    pub fn record(&self, rec: TradeRecord) {
        let mut trades = self.trades.write();
        trades.push_back(rec);
        while trades.len() > self.retention {
            trades.pop_front();
        }
    }

    pub fn len(&self) -> usize { self.trades.read().len() }

    pub fn is_empty(&self) -> bool { self.len() == 0 }

    /// Oldest -> newest after filtering.
    pub fn trades(&self, f: &TradeFilter) -> Vec<TradeRecord> {
        let sym = f.symbol.as_ref().map(|s| s.to_ascii_uppercase());
        let mut out: Vec<TradeRecord> = self
            .trades
            .read()
            .iter()
            .filter(|t| sym.as_ref().map_or(true, |s| &t.symbol == s))
            .filter(|t| f.variant.as_ref().map_or(true, |v| &t.variant == v))
            .filter(|t| f.side.map_or(true, |s| t.side == s))
            .cloned()
            .collect();
        if let Some(n) = f.limit {
            let skip = out.len().saturating_sub(n);
            out.drain(..skip);
        }
        out
    }

    pub fn summary(&self, symbol: Option<&str>, variant: Option<&str>) -> TradeSummary {
        let trades = self.trades(&TradeFilter {
            symbol: symbol.map(str::to_string),
            variant: variant.map(str::to_string),
            ..Default::default()
        });

        let mut s = TradeSummary { total_trades: trades.len(), ..Default::default() };
        let mut with_pnl = 0usize;
        for t in &trades {
            match t.side {
                Side::Buy => s.buy_trades += 1,
                Side::Sell => s.sell_trades += 1,
            }
            if let Some(p) = t.pnl {
                with_pnl += 1;
                s.total_pnl += p;
                if p > 0.0 {
                    s.winning_trades += 1;
                } else if p < 0.0 {
                    s.losing_trades += 1;
                }
            }
        }
        if with_pnl > 0 {
            s.win_rate = s.winning_trades as f64 / with_pnl as f64;
        }
        s
    }
}

pub async fn run(mut trade_rx: mpsc::Receiver<TradeRecord>, book: Arc<TradeBook>) {
    while let Some(t) = trade_rx.recv().await {
        match t.pnl {
            Some(pnl) => info!(symbol=%t.symbol, variant=%t.variant, side=t.side.as_str(), px=t.price, size=t.size, pnl, notes=%t.notes, "TRADE"),
            None => info!(symbol=%t.symbol, variant=%t.variant, side=t.side.as_str(), px=t.price, size=t.size, notes=%t.notes, "TRADE"),
        }
        book.record(t);
    }
    let s = book.summary(None, None);
    info!(trades = s.total_trades, pnl = s.total_pnl, win_rate = s.win_rate, "post-trade stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn trade(symbol: &str, variant: &str, side: Side, pnl: Option<f64>) -> TradeRecord {
        TradeRecord {
            timestamp: Utc::now(),
            symbol: symbol.into(),
            side,
            size: 1.0,
            price: 100.0,
            variant: variant.into(),
            order_id: "1".into(),
            status: "FILLED".into(),
            pnl,
            notes: String::new(),
        }
    }

    fn book() -> TradeBook {
        let b = TradeBook::new();
        b.record(trade("BTCUSDT", "A", Side::Buy, None));
        b.record(trade("BTCUSDT", "A", Side::Sell, Some(5.0)));
        b.record(trade("BTCUSDT", "B", Side::Buy, None));
        b.record(trade("BTCUSDT", "B", Side::Sell, Some(-2.0)));
        b.record(trade("ETHUSDT", "A", Side::Buy, None));
        b
    }

    #[test]
    fn filters_and_limit() {
        let b = book();
        assert_eq!(b.len(), 5);
        let f = TradeFilter { symbol: Some("btcusdt".into()), side: Some(Side::Sell), ..Default::default() };
        assert_eq!(b.trades(&f).len(), 2);

        let last = b.trades(&TradeFilter { limit: Some(2), ..Default::default() });
        assert_eq!(last.len(), 2);
        assert_eq!(last[1].symbol, "ETHUSDT");

        let a = b.trades(&TradeFilter { variant: Some("A".into()), ..Default::default() });
        assert_eq!(a.len(), 3);
    }

    #[test]
    fn summary_counts_wins_and_losses() {
        let s = book().summary(Some("BTCUSDT"), None);
        assert_eq!(s.total_trades, 4);
        assert_eq!((s.buy_trades, s.sell_trades), (2, 2));
        assert_eq!(s.total_pnl, 3.0);
        assert_eq!((s.winning_trades, s.losing_trades), (1, 1));
        assert_eq!(s.win_rate, 0.5);

        assert_eq!(TradeBook::new().summary(None, None), TradeSummary::default());
    }

    #[test]
    fn retention_drops_oldest_first() {
        let b = TradeBook::with_retention(3);
        for pnl in 1..=5 {
            b.record(trade("BTCUSDT", "A", Side::Sell, Some(pnl as f64)));
        }
        assert_eq!(b.len(), 3);
        let pnls: Vec<_> = b.trades(&TradeFilter::default()).iter().filter_map(|t| t.pnl).collect();
        assert_eq!(pnls, vec![3.0, 4.0, 5.0]);
        assert_eq!(b.summary(None, None).total_pnl, 12.0);
        assert_eq!(TradeBook::new().retention, DEFAULT_TRADE_RETENTION);
    }

    #[tokio::test]
    async fn run_drains_into_book() {
        let b = Arc::new(TradeBook::new());
        let (tx, rx) = mpsc::channel(4);
        let task = tokio::spawn(run(rx, b.clone()));
        tx.send(trade("BTCUSDT", "A", Side::Buy, None)).await.unwrap();
        drop(tx);
        task.await.unwrap();
        assert_eq!(b.len(), 1);
    }
}
