// ===============================
// src/metrics.rs
// ===============================
use std::convert::Infallible;
use std::net::SocketAddr;

use hyper::{
    header::{HeaderValue, CONTENT_TYPE},
    service::{make_service_fn, service_fn},
    Body, Request, Response, Server, StatusCode,
};
use once_cell::sync::Lazy;
use prometheus::{
    Encoder, GaugeVec, Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGauge, IntGaugeVec,
    Opts, Registry, TextEncoder,
};
use tokio::sync::watch;
use tracing::{error, info, warn};

// Single custom registry (we register everything here)
pub static REGISTRY: Lazy<Registry> = Lazy::new(Registry::new);

// -------- Market data --------
pub static TICKS_BY_SYMBOL: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("ticks_total_by_symbol", "trade ticks per symbol"),
        &["symbol"],
    )
    .unwrap()
});

pub static FEED_PARSE_ERRORS: Lazy<IntCounter> = Lazy::new(|| {
    IntCounter::new("feed_parse_errors_total", "ws frames dropped because they did not parse")
        .unwrap()
});

pub static WS_CONNECTED: Lazy<IntGauge> = Lazy::new(|| {
    IntGauge::new("market_ws_connected", "1 if the trade stream is connected, 0 otherwise").unwrap()
});

pub static WS_RECONNECTS: Lazy<IntCounter> = Lazy::new(|| {
    IntCounter::new("market_ws_reconnects_total", "trade stream (re)connect attempts").unwrap()
});

// -------- Candles / strategy --------
pub static CANDLES_CLOSED: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("candles_closed_total", "closed candles (labels: symbol, path=tick|timer|shutdown)"),
        &["symbol", "path"],
    )
    .unwrap()
});

pub static SIGNALS_BY: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("signals_total_by", "actionable signals by symbol, variant & signal"),
        &["symbol", "variant", "signal"],
    )
    .unwrap()
});

// -------- Execution --------
pub static ORDERS: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("orders_total", "venue order attempts (labels: side, outcome)"),
        &["side", "outcome"],
    )
    .unwrap()
});

pub static DUPLICATE_SKIPS: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("orders_duplicate_skipped_total", "signals dropped because the key was busy"),
        &["symbol", "variant"],
    )
    .unwrap()
});

// Latency from signal -> fill (milliseconds)
pub static LAT_SIG_FILL: Lazy<Histogram> = Lazy::new(|| {
    Histogram::with_opts(HistogramOpts::new(
        "latency_signal_to_fill_ms",
        "Latency from signal to venue fill (ms)",
    ))
    .unwrap()
});

pub static PNL_REALIZED: Lazy<GaugeVec> = Lazy::new(|| {
    GaugeVec::new(
        Opts::new("pnl_realized", "realized PnL per symbol & variant"),
        &["symbol", "variant"],
    )
    .unwrap()
});

pub static PNL_UNREALIZED: Lazy<GaugeVec> = Lazy::new(|| {
    GaugeVec::new(
        Opts::new("pnl_unrealized", "unrealized PnL per symbol & variant"),
        &["symbol", "variant"],
    )
    .unwrap()
});

pub static SINK_FAILURES: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("fanout_sink_failures_total", "events a consumer failed to take"),
        &["topic", "sink"],
    )
    .unwrap()
});

// ---- Config visibility ----
pub static CONFIG_SYMBOL: Lazy<IntGaugeVec> = Lazy::new(|| {
    IntGaugeVec::new(
        Opts::new("config_symbol", "tracked symbols (label: symbol)"),
        &["symbol"],
    )
    .unwrap()
});

pub static CONFIG_MODE: Lazy<IntGaugeVec> = Lazy::new(|| {
    IntGaugeVec::new(
        Opts::new("config_mode", "feed / venue mode (labels: component, mode)"),
        &["component", "mode"],
    )
    .unwrap()
});

pub fn init() {
    let collectors: Vec<Box<dyn prometheus::core::Collector>> = vec![
        Box::new(TICKS_BY_SYMBOL.clone()),
        Box::new(FEED_PARSE_ERRORS.clone()),
        Box::new(WS_CONNECTED.clone()),
        Box::new(WS_RECONNECTS.clone()),
        Box::new(CANDLES_CLOSED.clone()),
        Box::new(SIGNALS_BY.clone()),
        Box::new(ORDERS.clone()),
        Box::new(DUPLICATE_SKIPS.clone()),
        Box::new(LAT_SIG_FILL.clone()),
        Box::new(PNL_REALIZED.clone()),
        Box::new(PNL_UNREALIZED.clone()),
        Box::new(SINK_FAILURES.clone()),
        Box::new(CONFIG_SYMBOL.clone()),
        Box::new(CONFIG_MODE.clone()),
    ];
    for c in collectors {
        if let Err(e) = REGISTRY.register(c) {
            warn!(?e, "metric registration failed");
        }
    }
}

// Encode all metrics in Prometheus text format
fn encode_metrics() -> Vec<u8> {
    let encoder = TextEncoder::new();
    let families = REGISTRY.gather();
    let mut buf = Vec::new();
    if encoder.encode(&families, &mut buf).is_err() || buf.is_empty() {
        buf.extend_from_slice(b"# no metrics\n");
    }
    buf
}

async fn handle(req: Request<Body>) -> Result<Response<Body>, Infallible> {
    match req.uri().path() {
        "/" | "/metrics" => {
            let mut rsp = Response::new(Body::from(encode_metrics()));
            rsp.headers_mut().insert(
                CONTENT_TYPE,
                HeaderValue::from_static("text/plain; version=0.0.4; charset=utf-8"),
            );
            Ok(rsp)
        }
        _ => {
            let mut rsp = Response::new(Body::from("not found\n"));
            *rsp.status_mut() = StatusCode::NOT_FOUND;
            Ok(rsp)
        }
    }
}

/// Serve `/metrics` until the stop watch flips to true.
pub async fn serve_metrics(port: u16, mut stop: watch::Receiver<bool>) {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let make_svc = make_service_fn(|_conn| async { Ok::<_, Infallible>(service_fn(handle)) });

    let builder = match Server::try_bind(&addr) {
        Ok(b) => b,
        Err(e) => {
            error!(?e, %addr, "metrics bind failed");
            return;
        }
    };
    info!(%addr, "metrics listening on /metrics");

    let server = builder.serve(make_svc).with_graceful_shutdown(async move {
        while !*stop.borrow() {
            if stop.changed().await.is_err() {
                break;
            }
        }
    });
    if let Err(e) = server.await {
        error!(?e, "metrics server error");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn unknown_path_is_404() {
        let req = Request::builder().uri("/nope").body(Body::empty()).unwrap();
        let rsp = handle(req).await.unwrap();
        assert_eq!(rsp.status(), StatusCode::NOT_FOUND);

        let req = Request::builder().uri("/metrics").body(Body::empty()).unwrap();
        let rsp = handle(req).await.unwrap();
        assert_eq!(rsp.status(), StatusCode::OK);
    }
}
