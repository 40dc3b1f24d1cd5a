// ===============================
// src/gateway_binance.rs
// ===============================
use async_trait::async_trait;
use tracing::{info, warn};

use crate::binance::{encode_params, sign_query, timestamp_ms, OrderResponse};
use crate::gateway::{ExecutionVenue, OrderAck, OrderRequest, VenueError};

/// Binance Spot REST venue: signed MARKET orders, fill price from `fills`.
pub struct BinanceRestVenue {
    http: reqwest::Client,
    rest_base: String,
    api_key: String,
    api_sec: String,
    recv_window: u64,
}

impl BinanceRestVenue {
    pub fn new(
        rest_base: &str,
        api_key: Option<String>,
        api_sec: Option<String>,
        recv_window: u64,
    ) -> Result<Self, VenueError> {
        let (Some(api_key), Some(api_sec)) = (api_key, api_sec) else {
            return Err(VenueError::MissingCredentials);
        };
        if api_key.is_empty() || api_sec.is_empty() {
            return Err(VenueError::MissingCredentials);
        }
        Ok(Self {
            http: reqwest::Client::new(),
            rest_base: rest_base.trim_end_matches('/').to_string(),
            api_key,
            api_sec,
            recv_window,
        })
    }

    /// Signed query string for a MARKET order (signature appended last).
    fn order_query(&self, req: &OrderRequest, ts: u64) -> Result<String, VenueError> {
        let params = vec![
            ("symbol", req.symbol.to_ascii_uppercase()),
            ("side", req.side.as_str().to_string()),
            ("type", "MARKET".to_string()),
            ("quantity", format!("{}", req.quantity)),
            ("timestamp", ts.to_string()),
            ("recvWindow", self.recv_window.to_string()),
        ];
        let query = encode_params(&params);
        let sig = sign_query(&self.api_sec, &query).map_err(|e| VenueError::Transport(e.to_string()))?;
        Ok(format!("{query}&signature={sig}"))
    }

    /// REST connectivity check (`GET /api/v3/ping`).
    pub async fn ping(&self) -> Result<(), VenueError> {
        let url = format!("{}/api/v3/ping", self.rest_base);
        let rsp = self.http.get(url).send().await.map_err(|e| VenueError::Transport(e.to_string()))?;
        if !rsp.status().is_success() {
            let status = rsp.status().as_u16();
            let body = rsp.text().await.unwrap_or_default();
            return Err(VenueError::Http { status, body });
        }
        Ok(())
    }
}

fn ack_from_response(rsp: OrderResponse) -> Result<OrderAck, VenueError> {
    let order_id = rsp.order_id.ok_or(VenueError::MissingOrderId)?;
    Ok(OrderAck {
        order_id: order_id.to_string(),
        fill_price: rsp.avg_fill_price(),
        status: rsp.status.unwrap_or_else(|| "FILLED".to_string()),
    })
}

#[async_trait]
impl ExecutionVenue for BinanceRestVenue {
    fn name(&self) -> &str { "binance" }

    async fn place_market_order(&self, req: &OrderRequest) -> Result<OrderAck, VenueError> {
        let query = self.order_query(req, timestamp_ms())?;
        let url = format!("{}/api/v3/order?{}", self.rest_base, query);

        let rsp = self
            .http
            .post(url)
            .header("X-MBX-APIKEY", &self.api_key)
            .send()
            .await
            .map_err(|e| VenueError::Transport(e.to_string()))?;

        if !rsp.status().is_success() {
            let status = rsp.status().as_u16();
            let body = rsp.text().await.unwrap_or_default();
            warn!(status, %body, symbol = %req.symbol, "order rejected");
            return Err(VenueError::Http { status, body });
        }

        let body = rsp.text().await.map_err(|e| VenueError::Transport(e.to_string()))?;
        let parsed: OrderResponse = serde_json::from_str(&body).map_err(|e| VenueError::Decode(e.to_string()))?;
        let ack = ack_from_response(parsed)?;
        info!(order_id = %ack.order_id, status = %ack.status, symbol = %req.symbol, "order sent OK");
        Ok(ack)
    }
}
