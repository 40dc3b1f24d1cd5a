// ===============================
// src/tick_store.rs
// ===============================
//
// Latest trade per symbol. No history, only "last seen".
// Lock dipegang hanya selama baca/tulis map; notifikasi subscriber
// dilakukan setelah lock dilepas.
//
use ahash::AHashMap as HashMap;
use parking_lot::RwLock;

use crate::bus::Fanout;
use crate::domain::Tick;

pub struct TickStore {
    ticks: RwLock<HashMap<String, Tick>>,
    updates: Fanout<Tick>,
}

impl Default for TickStore {
    fn default() -> Self { Self::new() }
}

impl TickStore {
    pub fn new() -> Self {
        Self { ticks: RwLock::new(HashMap::new()), updates: Fanout::new("tick_store") }
    }

    /// Change notifications, fired after every `update`. For reporting
    /// consumers (UI push etc.); the trading pipeline reads the feed fan-out.
    #[allow(dead_code)]
    pub fn updates(&self) -> &Fanout<Tick> { &self.updates }

    pub fn update(&self, tick: &Tick) {
        self.ticks.write().insert(tick.symbol.to_ascii_uppercase(), tick.clone());
        self.updates.publish(tick);
    }

    pub fn get(&self, symbol: &str) -> Option<Tick> {
        self.ticks.read().get(&symbol.to_ascii_uppercase()).cloned()
    }

    pub fn all(&self) -> HashMap<String, Tick> { self.ticks.read().clone() }

    pub fn symbols(&self) -> Vec<String> {
        let mut out: Vec<String> = self.ticks.read().keys().cloned().collect();
        out.sort();
        out
    }

    pub fn contains(&self, symbol: &str) -> bool {
        self.ticks.read().contains_key(&symbol.to_ascii_uppercase())
    }

    pub fn len(&self) -> usize { self.ticks.read().len() }

    pub fn is_empty(&self) -> bool { self.len() == 0 }

    pub fn clear(&self, symbol: Option<&str>) {
        let mut ticks = self.ticks.write();
        match symbol {
            Some(s) => { ticks.remove(&s.to_ascii_uppercase()); }
            None => ticks.clear(),
        }
    }
}
