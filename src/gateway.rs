// ===============================
// src/gateway.rs (venue contract + mock venue)
// ===============================
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use thiserror::Error;
use tokio::time::{sleep, Duration};
use tracing::debug;

use crate::domain::Side;

#[derive(Debug, Clone, PartialEq)]
pub struct OrderRequest {
    pub symbol: String,
    pub side: Side,
    pub quantity: f64,
    /// Price of the signal that caused the order.
    pub reference_price: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct OrderAck {
    pub order_id: String,
    pub status: String,
    pub fill_price: Option<f64>,
}

#[derive(Debug, Error)]
pub enum VenueError {
    #[error("transport: {0}")]
    Transport(String),
    #[error("http {status}: {body}")]
    Http { status: u16, body: String },
    #[error("response has no order id")]
    MissingOrderId,
    #[error("api key / secret not configured")]
    MissingCredentials,
    #[error("decode: {0}")]
    Decode(String),
}

#[async_trait]
pub trait ExecutionVenue: Send + Sync {
    fn name(&self) -> &str;
    async fn place_market_order(&self, req: &OrderRequest) -> Result<OrderAck, VenueError>;
}

/// Simulated venue: fixed latency, then a full fill at the reference price.
pub struct MockVenue {
    fill_ms: u64,
    seq: AtomicU64,
}

impl MockVenue {
    pub fn new(fill_ms: u64) -> Self {
        Self { fill_ms, seq: AtomicU64::new(1) }
    }
}

#[async_trait]
impl ExecutionVenue for MockVenue {
    fn name(&self) -> &str { "mock" }

    async fn place_market_order(&self, req: &OrderRequest) -> Result<OrderAck, VenueError> {
        sleep(Duration::from_millis(self.fill_ms)).await;
        let n = self.seq.fetch_add(1, Ordering::Relaxed);
        let order_id = format!("MOCK-{}-{n}", req.symbol);
        debug!(%order_id, side = req.side.as_str(), qty = req.quantity, px = req.reference_price, "mock fill");
        Ok(OrderAck { order_id, status: "FILLED".into(), fill_price: Some(req.reference_price) })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn mock_fills_at_reference_with_unique_ids() {
        let v = MockVenue::new(0);
        let req = OrderRequest { symbol: "BTCUSDT".into(), side: Side::Buy, quantity: 0.5, reference_price: 101.0 };
        let a = v.place_market_order(&req).await.unwrap();
        let b = v.place_market_order(&req).await.unwrap();
        assert_eq!(a.fill_price, Some(101.0));
        assert_eq!(a.status, "FILLED");
        assert_ne!(a.order_id, b.order_id);
        assert_eq!(v.name(), "mock");
    }
}
