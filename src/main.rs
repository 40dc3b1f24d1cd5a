// ===============================
// src/main.rs
// ===============================
/*
 # jalankan (mock feed + mock venue)
 cargo run -- --symbols btcusdt,ethusdt --log info

 # konfigurasi yang aktif
 curl -s localhost:9898/metrics | egrep '^config_(mode|symbol)'

 # aktivitas per symbol & variant
 curl -s localhost:9898/metrics | grep '^candles_closed_total'
 curl -s localhost:9898/metrics | grep '^signals_total_by'
*/
/*
=============================================================================
Project : candle_signal_bot — async 1m candle / SMA-EMA crossover trader
Module  : main.rs
Version : 0.1.0
Author  : Kukuh Tripamungkas Wicaksono (Kukuh TW)
Email   : kukuhtw@gmail.com
WhatsApp: https://wa.me/628129893706
LinkedIn: https://id.linkedin.com/in/kukuhtw
License : MIT (see LICENSE)

Summary : Streams Binance trade ticks (or a mock feed), folds them into
          one-minute candles, runs SMA/EMA crossover variants with
          per-variant stop loss, executes market orders on a mock or
          Binance venue, exposes Prometheus metrics and records JSONL events.

(c) 2025 Kukuh TW. All rights reserved where applicable.
=============================================================================
*/
mod domain;
mod config;
mod metrics;
mod bus;              // fan-out ke konsumen (isolasi error per sink)
mod recorder;
mod feed;
mod tick_store;
mod candles;
mod strategy;
mod strategy_manager;
mod executor;
mod gateway;          // venue contract + mock venue
mod binance;          // helper (signer/types) for Binance
mod gateway_binance;  // real Binance Spot (REST MARKET orders)
mod posttrade;
mod system;

use std::process::ExitCode;

use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> ExitCode {
    let cli = config::Cli::parse();

    // ---- Logging ----
    let filter = cli
        .log
        .clone()
        .map(EnvFilter::new)
        .or_else(|| EnvFilter::try_from_default_env().ok())
        .unwrap_or_else(|| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    // ---- Load config (fatal on error) ----
    let settings = match config::Settings::load(&cli) {
        Ok(s) => s,
        Err(e) => {
            error!(error = %e, "invalid configuration");
            return ExitCode::FAILURE;
        }
    };

    // ---- Metrics ----
    metrics::init();

    // ---- Venue ----
    let venue = match system::build_venue(&settings).await {
        Ok(v) => v,
        Err(e) => {
            error!(error = %e, "venue setup failed");
            return ExitCode::FAILURE;
        }
    };

    let mut sys = match system::System::build(settings, venue) {
        Ok(s) => s,
        Err(e) => {
            error!(error = %e, "startup failed");
            return ExitCode::FAILURE;
        }
    };
    sys.start();
    info!("running, Ctrl-C to stop");

    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(?e, "ctrl-c handler failed");
    }
    sys.shutdown().await;
    ExitCode::SUCCESS
}
