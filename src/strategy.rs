// ===============================
// src/strategy.rs
// ===============================
//
// Strategi berjalan di atas candle 1 menit yang sudah closed.
//
// Struktur:
// - SignalModel     : kontrak indikator (compute_signal + required_window)
// - SmaEmaCrossover : implementasi EMA vs SMA crossover
// - Strategy        : "base strategy" per (symbol, variant). Memegang history
//                     candle, Position, dan stop-loss; lalu mendelegasikan
//                     perhitungan sinyal ke SignalModel.
//
// Model lain bisa ditambahkan dengan implement SignalModel tanpa mengubah
// dispatch di StrategyManager.
//
use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;
use tracing::info;

use crate::domain::{Candle, Position, PositionSide, Signal};

#[derive(Debug, Error, PartialEq)]
pub enum StrategyError {
    #[error("{name} period must be a positive integer, got {value}")]
    InvalidPeriod { name: &'static str, value: usize },
    #[error("stop loss fraction must be in (0, 1), got {0}")]
    InvalidStopLoss(f64),
}

/// Indicator values exposed for reporting.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct IndicatorSnapshot {
    pub sma: Option<f64>,
    pub ema: Option<f64>,
    pub sma_period: usize,
    pub ema_period: usize,
}

pub trait SignalModel: Send {
    /// Candles needed before `compute_signal` is called.
    fn required_window(&self) -> usize;
    /// `history` is oldest -> newest and has at least `required_window` entries.
    fn compute_signal(&mut self, history: &VecDeque<Candle>) -> Signal;
    fn indicators(&self) -> IndicatorSnapshot;
    fn reset(&mut self);
}

pub fn sma(closes: &[f64], period: usize) -> Option<f64> {
    if period == 0 || closes.len() < period {
        return None;
    }
    Some(closes[closes.len() - period..].iter().sum::<f64>() / period as f64)
}

/// One EMA step; seeds from the raw close when there is no previous value.
pub fn ema_step(close: f64, prev: Option<f64>, k: f64) -> f64 {
    match prev {
        None => close,
        Some(p) => close * k + p * (1.0 - k),
    }
}

// -----------------------------------------------------------------------------
// EMA / SMA CROSSOVER
//    Bullish: prev EMA <= prev SMA dan EMA sekarang > SMA sekarang -> Buy
//    Bearish: prev EMA >= prev SMA dan EMA sekarang < SMA sekarang -> Sell
//    EMA di-seed dari close mentah (bukan dari SMA).
//    Nilai prev disimpan antar pemanggilan.
// -----------------------------------------------------------------------------
#[derive(Debug, Clone)]
pub struct SmaEmaCrossover {
    sma_period: usize,
    ema_period: usize,
    k: f64,
    prev_sma: Option<f64>,
    prev_ema: Option<f64>,
    cur_sma: Option<f64>,
    cur_ema: Option<f64>,
}

impl SmaEmaCrossover {
    pub fn new(sma_period: usize, ema_period: usize) -> Result<Self, StrategyError> {
        if sma_period == 0 {
            return Err(StrategyError::InvalidPeriod { name: "SMA", value: sma_period });
        }
        if ema_period == 0 {
            return Err(StrategyError::InvalidPeriod { name: "EMA", value: ema_period });
        }
        Ok(Self {
            sma_period,
            ema_period,
            k: 2.0 / (ema_period as f64 + 1.0),
            prev_sma: None,
            prev_ema: None,
            cur_sma: None,
            cur_ema: None,
        })
    }
}

impl SignalModel for SmaEmaCrossover {
    fn required_window(&self) -> usize {
        self.sma_period.max(self.ema_period) + 1
    }

    fn compute_signal(&mut self, history: &VecDeque<Candle>) -> Signal {
        if history.len() < self.required_window() {
            return Signal::Hold;
        }
        let closes: Vec<f64> = history.iter().map(|c| c.close).collect();

        self.prev_sma = self.cur_sma;
        self.prev_ema = self.cur_ema;
        let cur_sma = sma(&closes, self.sma_period).unwrap_or(0.0);
        let cur_ema = ema_step(closes[closes.len() - 1], self.prev_ema, self.k);
        self.cur_sma = Some(cur_sma);
        self.cur_ema = Some(cur_ema);

        let (Some(prev_ema), Some(prev_sma)) = (self.prev_ema, self.prev_sma) else {
            return Signal::Hold;
        };

        if prev_ema <= prev_sma && cur_ema > cur_sma {
            info!(ema = cur_ema, sma = cur_sma, "bullish crossover");
            return Signal::Buy;
        }
        if prev_ema >= prev_sma && cur_ema < cur_sma {
            info!(ema = cur_ema, sma = cur_sma, "bearish crossover");
            return Signal::Sell;
        }
        Signal::Hold
    }

    fn indicators(&self) -> IndicatorSnapshot {
        IndicatorSnapshot {
            sma: self.cur_sma,
            ema: self.cur_ema,
            sma_period: self.sma_period,
            ema_period: self.ema_period,
        }
    }

    fn reset(&mut self) {
        self.prev_sma = None;
        self.prev_ema = None;
        self.cur_sma = None;
        self.cur_ema = None;
    }
}

/// Base strategy for one (symbol, variant): history, position, stop loss.
pub struct Strategy {
    symbol: String,
    stop_loss_pct: f64,
    position: Position,
    history: VecDeque<Candle>,
    model: Box<dyn SignalModel>,
}

impl Strategy {
    pub fn new(symbol: &str, stop_loss_pct: f64, model: Box<dyn SignalModel>) -> Result<Self, StrategyError> {
        if !(stop_loss_pct > 0.0 && stop_loss_pct < 1.0) {
            return Err(StrategyError::InvalidStopLoss(stop_loss_pct));
        }
        let symbol = symbol.to_ascii_uppercase();
        Ok(Self {
            position: Position::flat(&symbol),
            symbol,
            stop_loss_pct,
            history: VecDeque::new(),
            model,
        })
    }

    pub fn required_window(&self) -> usize { self.model.required_window() }

    /// `None` for another symbol's candle; otherwise the signal for this close.
    pub fn on_candle(&mut self, candle: &Candle) -> Option<Signal> {
        if !candle.symbol.eq_ignore_ascii_case(&self.symbol) {
            return None;
        }

        let window = self.model.required_window();
        self.history.push_back(candle.clone());
        while self.history.len() > window * 2 {
            self.history.pop_front();
        }

        self.position.mark(candle.close);
        if self.position.is_stop_loss_triggered() {
            info!(
                symbol = %self.symbol, px = candle.close, stop = self.position.stop_loss_price,
                "stop loss hit"
            );
            return Some(Signal::Sell);
        }

        if self.history.len() >= window {
            return Some(self.model.compute_signal(&self.history));
        }
        Some(Signal::Hold)
    }

    pub fn enter_position(&mut self, price: f64, qty: f64, at: DateTime<Utc>) {
        let p = &mut self.position;
        p.side = PositionSide::Long;
        p.entry_price = price;
        p.entry_time = Some(at);
        p.quantity = qty;
        p.current_price = price;
        p.unrealized_pnl = 0.0;
        p.stop_loss_price = price * (1.0 - self.stop_loss_pct);
    }

    /// Close the position; returns the P&L realized by this exit (0 when flat).
    pub fn exit_position(&mut self, price: f64) -> f64 {
        let p = &mut self.position;
        let pnl = if p.is_long() { (price - p.entry_price) * p.quantity } else { 0.0 };
        p.realized_pnl += pnl;
        p.side = PositionSide::Flat;
        p.entry_price = 0.0;
        p.entry_time = None;
        p.quantity = 0.0;
        p.unrealized_pnl = 0.0;
        p.stop_loss_price = 0.0;
        pnl
    }

    pub fn position(&self) -> &Position { &self.position }

    pub fn indicators(&self) -> IndicatorSnapshot { self.model.indicators() }

    pub fn history_len(&self) -> usize { self.history.len() }

    pub fn reset(&mut self) {
        self.model.reset();
        self.history.clear();
        let realized = self.position.realized_pnl;
        self.position = Position { realized_pnl: realized, ..Position::flat(&self.symbol) };
    }
}
