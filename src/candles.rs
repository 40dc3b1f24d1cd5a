// ===============================
// src/candles.rs (1-minute OHLC aggregator)
// ===============================
//
// Per symbol: no-candle -> open -> closed (archived, immutable).
//
// Ada dua jalur penutupan candle:
// - jalur tick  : tick dari bucket yang lebih baru menutup candle lama
// - jalur timer : bangun sedikit setelah pergantian menit dan menutup
//                 candle yang bucket-nya sudah lewat (saat pasar sepi)
// Keduanya mengambil candle dari map `open` di bawah lock yang sama,
// jadi satu bucket hanya bisa diarsipkan sekali.
//
// Closed-candle events are published after the lock is released.
//
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use ahash::AHashMap as HashMap;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::sync::watch;
use tracing::{debug, info};

use crate::bus::Fanout;
use crate::domain::{minute_bucket, Candle, Tick};
use crate::metrics::CANDLES_CLOSED;

pub const DEFAULT_HISTORY_SIZE: usize = 100;
/// Slack after the minute rollover before the timer sweeps.
pub const BOUNDARY_BUFFER: Duration = Duration::from_millis(100);

#[derive(Default)]
struct Book {
    open: HashMap<String, Candle>,
    history: HashMap<String, VecDeque<Candle>>,
    last_closed: HashMap<String, DateTime<Utc>>,
}

impl Book {
    // caller holds the lock
    fn archive(&mut self, symbol: &str, retention: usize) -> Option<Candle> {
        let mut candle = self.open.remove(symbol)?;
        candle.closed = true;
        self.last_closed.insert(symbol.to_string(), candle.timestamp);
        let hist = self.history.entry(symbol.to_string()).or_default();
        hist.push_back(candle.clone());
        while hist.len() > retention {
            hist.pop_front();
        }
        Some(candle)
    }
}

pub struct CandleAggregator {
    book: Mutex<Book>,
    history_size: usize,
    closed: Fanout<Candle>,
    stop_tx: watch::Sender<bool>,
}

impl Default for CandleAggregator {
    fn default() -> Self { Self::new(DEFAULT_HISTORY_SIZE) }
}

impl CandleAggregator {
    pub fn new(history_size: usize) -> Self {
        let (stop_tx, _) = watch::channel(false);
        Self {
            book: Mutex::new(Book::default()),
            history_size: history_size.max(1),
            closed: Fanout::new("candles"),
            stop_tx,
        }
    }

    /// Closed-candle consumers.
    pub fn closed_candles(&self) -> &Fanout<Candle> { &self.closed }

    pub fn history_size(&self) -> usize { self.history_size }

    /// Fold a tick in; returns the candle it closed, if any.
    pub fn process_tick(&self, tick: &Tick) -> Option<Candle> {
        let symbol = tick.symbol.to_ascii_uppercase();
        let bucket = minute_bucket(tick.timestamp);

        let closed = {
            let mut guard = self.book.lock();
            let book = &mut *guard;
            let open_bucket = book.open.get(&symbol).map(|c| c.timestamp);
            match open_bucket {
                None => {
                    if book.last_closed.get(&symbol).is_some_and(|last| bucket <= *last) {
                        debug!(%symbol, %bucket, "tick for an archived bucket, dropped");
                        return None;
                    }
                    book.open.insert(symbol.clone(), Candle::from_tick(tick, bucket));
                    debug!(%symbol, %bucket, "candle opened");
                    None
                }
                Some(open_bucket) if open_bucket < bucket => {
                    let closed = book.archive(&symbol, self.history_size);
                    book.open.insert(symbol.clone(), Candle::from_tick(tick, bucket));
                    closed
                }
                Some(open_bucket) => {
                    if bucket < open_bucket {
                        // late tick: merged into the open candle rather than reopening history
                        debug!(%symbol, tick_bucket = %bucket, %open_bucket, "late tick merged");
                    }
                    if let Some(open) = book.open.get_mut(&symbol) {
                        open.apply(tick);
                    }
                    None
                }
            }
        };

        if let Some(c) = &closed {
            self.emit(c, "tick");
        }
        closed
    }

    /// Close every open candle whose bucket is before `now`'s bucket.
    pub fn close_expired(&self, now: DateTime<Utc>) -> Vec<Candle> {
        let current = minute_bucket(now);
        let closed: Vec<Candle> = {
            let mut book = self.book.lock();
            let expired: Vec<String> = book
                .open
                .iter()
                .filter(|(_, c)| c.timestamp < current)
                .map(|(s, _)| s.clone())
                .collect();
            expired
                .iter()
                .filter_map(|s| book.archive(s, self.history_size))
                .collect()
        };
        for c in &closed {
            self.emit(c, "timer");
        }
        closed
    }

    /// Force-close everything (shutdown path).
    pub fn close_all(&self) -> Vec<Candle> {
        let closed: Vec<Candle> = {
            let mut book = self.book.lock();
            let symbols: Vec<String> = book.open.keys().cloned().collect();
            symbols
                .iter()
                .filter_map(|s| book.archive(s, self.history_size))
                .collect()
        };
        for c in &closed {
            self.emit(c, "shutdown");
        }
        closed
    }

    fn emit(&self, c: &Candle, path: &str) {
        info!(
            symbol = %c.symbol, bucket = %c.timestamp, o = c.open, h = c.high, l = c.low,
            c = c.close, v = c.volume, ticks = c.tick_count, path, "candle closed"
        );
        CANDLES_CLOSED.with_label_values(&[&c.symbol, path]).inc();
        self.closed.publish(c);
    }

    /// Background sweep: sleeps to the next minute (+buffer) and closes stale candles.
    pub fn spawn_boundary_timer(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let this = Arc::clone(self);
        let mut stop = self.stop_tx.subscribe();
        tokio::spawn(async move {
            info!("candle boundary timer started");
            loop {
                if *stop.borrow() {
                    break;
                }
                let wait = until_next_boundary(Utc::now());
                tokio::select! {
                    _ = tokio::time::sleep(wait) => {
                        this.close_expired(Utc::now());
                    }
                    res = stop.changed() => {
                        if res.is_err() { break; }
                    }
                }
            }
            info!("candle boundary timer stopped");
        })
    }

    /// Stop the timer and force-close open candles. Safe to call twice.
    pub fn stop(&self) -> Vec<Candle> {
        self.stop_tx.send_replace(true);
        self.close_all()
    }

    pub fn current_candle(&self, symbol: &str) -> Option<Candle> {
        self.book.lock().open.get(&symbol.to_ascii_uppercase()).cloned()
    }

    pub fn current_candles(&self) -> HashMap<String, Candle> { self.book.lock().open.clone() }

    /// Most recent `limit` closed candles, oldest first.
    pub fn history(&self, symbol: &str, limit: Option<usize>) -> Vec<Candle> {
        let book = self.book.lock();
        let Some(hist) = book.history.get(&symbol.to_ascii_uppercase()) else {
            return Vec::new();
        };
        let skip = limit.map(|n| hist.len().saturating_sub(n)).unwrap_or(0);
        hist.iter().skip(skip).cloned().collect()
    }

    pub fn symbols(&self) -> Vec<String> {
        let book = self.book.lock();
        let mut out: Vec<String> = book.open.keys().chain(book.history.keys()).cloned().collect();
        out.sort();
        out.dedup();
        out
    }
}

/// Time left until the next minute rollover plus `BOUNDARY_BUFFER`.
pub fn until_next_boundary(now: DateTime<Utc>) -> Duration {
    let next = minute_bucket(now) + chrono::Duration::minutes(1);
    (next - now).to_std().unwrap_or(Duration::ZERO) + BOUNDARY_BUFFER
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn at(min: u32, sec: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 10, min, sec).unwrap()
    }

    fn tick(px: f64, qty: f64, ts: DateTime<Utc>) -> Tick {
        Tick { symbol: "BTCUSDT".into(), price: px, quantity: qty, timestamp: ts, trade_id: None }
    }

    #[test]
    fn two_ticks_same_bucket_fold_into_one_candle() {
        let agg = CandleAggregator::new(10);
        assert!(agg.process_tick(&tick(100.0, 1.0, at(0, 5))).is_none());
        assert!(agg.process_tick(&tick(97.0, 0.5, at(0, 40))).is_none());

        let c = agg.current_candle("BTCUSDT").unwrap();
        assert_eq!((c.open, c.high, c.low, c.close), (100.0, 100.0, 97.0, 97.0));
        assert_eq!(c.volume, 1.5);
        assert_eq!(c.tick_count, 2);
        assert_eq!(c.timestamp, at(0, 0));
        assert!(!c.closed);
    }

    #[test]
    fn next_bucket_tick_closes_exactly_one_candle() {
        let agg = CandleAggregator::new(10);
        let emitted = Arc::new(AtomicUsize::new(0));
        let e = emitted.clone();
        agg.closed_candles().subscribe_fn("count", move |_| {
            e.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

        agg.process_tick(&tick(100.0, 1.0, at(0, 1)));
        agg.process_tick(&tick(101.0, 1.0, at(0, 59)));
        let closed = agg.process_tick(&tick(102.0, 2.0, at(1, 0))).unwrap();

        assert!(closed.closed);
        assert_eq!(closed.timestamp, at(0, 0));
        assert_eq!(closed.close, 101.0);
        assert_eq!(agg.history("BTCUSDT", None).len(), 1);
        assert_eq!(emitted.load(Ordering::SeqCst), 1);

        let open = agg.current_candle("BTCUSDT").unwrap();
        assert_eq!(open.timestamp, at(1, 0));
        assert_eq!(open.open, 102.0);
        assert_eq!(open.tick_count, 1);
    }

    #[test]
    fn history_is_bounded_fifo() {
        let agg = CandleAggregator::new(3);
        for m in 0..6u32 {
            agg.process_tick(&tick(100.0 + m as f64, 1.0, at(m, 0)));
        }
        let hist = agg.history("BTCUSDT", None);
        assert_eq!(hist.len(), 3);
        let buckets: Vec<_> = hist.iter().map(|c| c.timestamp).collect();
        assert_eq!(buckets, vec![at(2, 0), at(3, 0), at(4, 0)]);
        assert_eq!(agg.history("BTCUSDT", Some(2)).first().map(|c| c.timestamp), Some(at(3, 0)));
        assert_eq!(CandleAggregator::default().history_size(), DEFAULT_HISTORY_SIZE);
    }

    #[test]
    fn timer_closes_idle_candle_once_and_late_tick_cannot_reopen_it() {
        let agg = CandleAggregator::new(10);
        let emitted = Arc::new(AtomicUsize::new(0));
        let e = emitted.clone();
        agg.closed_candles().subscribe_fn("count", move |_| {
            e.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

        agg.process_tick(&tick(100.0, 1.0, at(0, 10)));
        assert!(agg.close_expired(at(0, 59)).is_empty());

        let closed = agg.close_expired(at(1, 0));
        assert_eq!(closed.len(), 1);
        assert!(agg.close_expired(at(1, 5)).is_empty());
        assert!(agg.current_candle("BTCUSDT").is_none());

        // tick for the bucket the timer already archived
        assert!(agg.process_tick(&tick(99.0, 1.0, at(0, 59))).is_none());
        assert!(agg.current_candle("BTCUSDT").is_none());
        agg.process_tick(&tick(101.0, 1.0, at(1, 30)));

        assert_eq!(agg.history("BTCUSDT", None).len(), 1);
        assert_eq!(emitted.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn late_tick_merges_into_open_candle() {
        let agg = CandleAggregator::new(10);
        agg.process_tick(&tick(100.0, 1.0, at(0, 30)));
        agg.process_tick(&tick(105.0, 1.0, at(1, 0)));
        agg.process_tick(&tick(90.0, 1.0, at(0, 45)));

        let open = agg.current_candle("BTCUSDT").unwrap();
        assert_eq!(open.timestamp, at(1, 0));
        assert_eq!(open.low, 90.0);
        assert_eq!(open.tick_count, 2);
        assert_eq!(agg.history("BTCUSDT", None).len(), 1);
    }

    #[test]
    fn racing_tick_and_timer_archive_bucket_once() {
        let agg = Arc::new(CandleAggregator::new(100));
        agg.process_tick(&tick(100.0, 1.0, at(0, 0)));

        let a = agg.clone();
        let timer = std::thread::spawn(move || a.close_expired(at(1, 0)).len());
        let b = agg.clone();
        let ticker = std::thread::spawn(move || b.process_tick(&tick(101.0, 1.0, at(1, 1))).is_some());

        let by_timer = timer.join().unwrap();
        let by_tick = ticker.join().unwrap() as usize;
        assert_eq!(by_timer + by_tick, 1);
        assert_eq!(agg.history("BTCUSDT", None).len(), 1);
    }

    #[test]
    fn stop_closes_all_open_candles() {
        let agg = CandleAggregator::new(10);
        agg.process_tick(&tick(1.0, 1.0, at(0, 0)));
        agg.process_tick(&Tick { symbol: "ETHUSDT".into(), ..tick(2.0, 1.0, at(0, 0)) });
        let closed = agg.stop();
        assert_eq!(closed.len(), 2);
        assert!(closed.iter().all(|c| c.closed));
        assert!(agg.current_candles().is_empty());
        assert!(agg.stop().is_empty());
        assert_eq!(agg.symbols(), vec!["BTCUSDT".to_string(), "ETHUSDT".to_string()]);
    }

    #[test]
    fn boundary_delay_lands_just_after_rollover() {
        let d = until_next_boundary(at(0, 45));
        assert_eq!(d, Duration::from_secs(15) + BOUNDARY_BUFFER);
        let d = until_next_boundary(at(0, 0));
        assert_eq!(d, Duration::from_secs(60) + BOUNDARY_BUFFER);
    }

    #[tokio::test]
    async fn boundary_timer_exits_on_stop() {
        let agg = Arc::new(CandleAggregator::new(10));
        let handle = agg.spawn_boundary_timer();
        agg.stop();
        tokio::time::timeout(Duration::from_secs(2), handle).await.unwrap().unwrap();
    }
}
