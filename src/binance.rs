// ===============================
// src/binance.rs
// ===============================
//
// Helper Binance Spot: signing + model JSON (trade stream & order response).
//
use chrono::Utc;
use hmac::{digest::InvalidLength, Hmac, Mac};
use serde::Deserialize;
use sha2::Sha256;

pub fn timestamp_ms() -> u64 {
    Utc::now().timestamp_millis().max(0) as u64
}

/// HMAC-SHA256 of the query string, hex encoded.
pub fn sign_query(secret: &str, query: &str) -> Result<String, InvalidLength> {
    let mut mac = Hmac::<Sha256>::new_from_slice(secret.as_bytes())?;
    mac.update(query.as_bytes());
    Ok(hex::encode(mac.finalize().into_bytes()))
}

/// `k=v&k=v` with url-encoded values, in the given order.
pub fn encode_params(params: &[(&str, String)]) -> String {
    params
        .iter()
        .map(|(k, v)| format!("{}={}", k, urlencoding::encode(v)))
        .collect::<Vec<_>>()
        .join("&")
}

// ---- Market stream models ----

/// Combined stream envelope: `{"stream":"btcusdt@trade","data":{...}}`
#[derive(Debug, Deserialize)]
pub struct CombinedFrame {
    pub stream: String,
    pub data: TradePayload,
}

#[derive(Debug, Deserialize)]
pub struct TradePayload {
    #[serde(rename = "e", default)]
    pub event: Option<String>,
    #[serde(rename = "s", default)]
    pub symbol: Option<String>,
    #[serde(rename = "t", default)]
    pub trade_id: Option<u64>,
    #[serde(rename = "p")]
    pub price: String,
    #[serde(rename = "q")]
    pub quantity: String,
    #[serde(rename = "T")]
    pub trade_time: i64, // ms
}

// ---- REST order response ----

#[derive(Debug, Deserialize)]
pub struct OrderResponse {
    #[serde(rename = "orderId", default)]
    pub order_id: Option<u64>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub fills: Vec<OrderFill>,
}

#[derive(Debug, Deserialize)]
pub struct OrderFill {
    pub price: String,
    pub qty: String,
}

impl OrderResponse {
    /// Quantity-weighted average fill price; None when nothing usable was filled.
    pub fn avg_fill_price(&self) -> Option<f64> {
        let (mut notional, mut qty) = (0.0, 0.0);
        for f in &self.fills {
            let (Ok(p), Ok(q)) = (f.price.parse::<f64>(), f.qty.parse::<f64>()) else { continue };
            notional += p * q;
            qty += q;
        }
        (qty > 0.0).then(|| notional / qty)
    }
}
