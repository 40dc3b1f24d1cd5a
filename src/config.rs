// ===============================
// src/config.rs
// ===============================
/*
=============================================================================
Project : candle_signal_bot — async 1m candle / SMA-EMA crossover trader
Module  : config.rs
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
use std::env;
use std::path::PathBuf;
use std::str::FromStr;

use clap::Parser;
use thiserror::Error;
use url::Url;

use crate::domain::StrategyVariant;
use crate::executor::OrderSizes;

#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("{key}={value:?}: {reason}")]
    Invalid { key: &'static str, value: String, reason: String },
    #[error("{0} is required")]
    Missing(&'static str),
    #[error("env file {path}: {reason}")]
    EnvFile { path: String, reason: String },
}

fn invalid(key: &'static str, value: &str, reason: impl Into<String>) -> ConfigError {
    ConfigError::Invalid { key, value: value.to_string(), reason: reason.into() }
}

/// Flag CLI (override env / .env)
#[derive(Parser, Debug, Clone, Default)]
#[command(name = "candle_signal_bot", version, about = "1m candle SMA/EMA crossover bot")]
pub struct Cli {
    /// Path .env (default: ./.env bila ada)
    #[arg(long)]
    pub env_file: Option<PathBuf>,
    /// Comma separated symbols, overrides SYMBOLS
    #[arg(long)]
    pub symbols: Option<String>,
    /// tracing filter, e.g. "info" or "candle_signal_bot=debug"
    #[arg(long)]
    pub log: Option<String>,
}

/// Mode sumber market data / venue trading
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MarketMode {
    Mock,
    BinanceSandbox,
    BinanceMainnet,
}

impl MarketMode {
    pub fn parse(key: &'static str, raw: &str) -> Result<Self, ConfigError> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "mock"             => Ok(MarketMode::Mock),
            "binance_sandbox"  => Ok(MarketMode::BinanceSandbox),
            "binance_mainnet"  => Ok(MarketMode::BinanceMainnet),
            _ => Err(invalid(key, raw, "expected mock | binance_sandbox | binance_mainnet")),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            MarketMode::Mock            => "mock",
            MarketMode::BinanceSandbox  => "binance_sandbox",
            MarketMode::BinanceMainnet  => "binance_mainnet",
        }
    }

    // Endpoint default per mode
    pub fn default_ws_url(&self) -> &'static str {
        match self {
            MarketMode::Mock            => "wss://testnet.binance.vision/ws", // tidak dipakai saat mock
            MarketMode::BinanceSandbox  => "wss://testnet.binance.vision/ws",
            MarketMode::BinanceMainnet  => "wss://stream.binance.com:9443/ws",
        }
    }

    pub fn default_rest_url(&self) -> &'static str {
        match self {
            MarketMode::Mock            => "https://testnet.binance.vision", // placeholder
            MarketMode::BinanceSandbox  => "https://testnet.binance.vision",
            MarketMode::BinanceMainnet  => "https://api.binance.com",
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct Settings {
    pub symbols: Vec<String>,

    // strategy
    pub sma_period: usize,
    pub ema_period: usize,
    pub variant_a_sl: f64,
    pub variant_b_sl: f64,

    // candles / feed
    pub candle_history_size: usize,
    pub reconnect_delay_secs: u64,

    // market mode
    pub feed_mode: MarketMode,
    pub venue_mode: MarketMode,
    pub binance_ws_url: String,
    pub binance_rest_url: String,
    pub binance_api_key: Option<String>,
    pub binance_api_secret: Option<String>,
    pub recv_window: u64,

    pub order_sizes: OrderSizes,

    // files/metrics
    pub record_file: Option<String>,
    pub metrics_port: u16,
}

pub fn parse_symbols(raw: &str) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    for s in raw.split(',').map(|x| x.trim()).filter(|x| !x.is_empty()) {
        let s = s.to_ascii_uppercase();
        if !out.contains(&s) {
            out.push(s);
        }
    }
    out
}

impl Settings {
    /// Build from any key lookup (env, map in tests). Empty values count as unset.
    pub fn from_lookup<F>(get: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |k: &str| get(k).filter(|v| !v.trim().is_empty());

        fn num<T: FromStr>(v: Option<String>, key: &'static str, default: T) -> Result<T, ConfigError>
        where
            T::Err: std::fmt::Display,
        {
            match v {
                None => Ok(default),
                Some(raw) => raw.trim().parse::<T>().map_err(|e| invalid(key, &raw, e.to_string())),
            }
        }
        fn positive(v: usize, key: &'static str) -> Result<usize, ConfigError> {
            if v == 0 { Err(invalid(key, "0", "must be > 0")) } else { Ok(v) }
        }
        fn fraction(v: f64, key: &'static str) -> Result<f64, ConfigError> {
            if v > 0.0 && v < 1.0 { Ok(v) } else { Err(invalid(key, &v.to_string(), "must be in (0, 1)")) }
        }
        fn size(v: f64, key: &'static str) -> Result<f64, ConfigError> {
            if v > 0.0 && v.is_finite() { Ok(v) } else { Err(invalid(key, &v.to_string(), "must be > 0")) }
        }

        // ===== Symbols =====
        let symbols = match get("SYMBOLS") {
            Some(raw) => {
                let v = parse_symbols(&raw);
                if v.is_empty() {
                    return Err(invalid("SYMBOLS", &raw, "no symbols"));
                }
                v
            }
            None => vec!["BTCUSDT".to_string(), "ETHUSDT".to_string()],
        };

        // ===== Strategy =====
        let sma_period = positive(num(get("SMA_PERIOD"), "SMA_PERIOD", 10)?, "SMA_PERIOD")?;
        let ema_period = positive(num(get("EMA_PERIOD"), "EMA_PERIOD", 5)?, "EMA_PERIOD")?;
        let variant_a_sl = fraction(num(get("VARIANT_A_SL"), "VARIANT_A_SL", 0.15)?, "VARIANT_A_SL")?;
        let variant_b_sl = fraction(num(get("VARIANT_B_SL"), "VARIANT_B_SL", 0.10)?, "VARIANT_B_SL")?;

        let candle_history_size =
            positive(num(get("CANDLE_HISTORY_SIZE"), "CANDLE_HISTORY_SIZE", 100)?, "CANDLE_HISTORY_SIZE")?;
        let reconnect_delay_secs: u64 = num(get("RECONNECT_DELAY_SECS"), "RECONNECT_DELAY_SECS", 5)?;
        if reconnect_delay_secs == 0 {
            return Err(invalid("RECONNECT_DELAY_SECS", "0", "must be > 0"));
        }

        // ===== Mode =====
        let feed_mode = match get("FEED_MODE") {
            Some(raw) => MarketMode::parse("FEED_MODE", &raw)?,
            None => MarketMode::Mock,
        };
        let venue_mode = match get("VENUE_MODE") {
            Some(raw) => MarketMode::parse("VENUE_MODE", &raw)?,
            None => MarketMode::Mock,
        };

        let binance_ws_url = get("BINANCE_WS_URL").unwrap_or_else(|| feed_mode.default_ws_url().to_string());
        Url::parse(&binance_ws_url).map_err(|e| invalid("BINANCE_WS_URL", &binance_ws_url, e.to_string()))?;
        let binance_rest_url =
            get("BINANCE_REST_URL").unwrap_or_else(|| venue_mode.default_rest_url().to_string());

        let binance_api_key = get("BINANCE_API_KEY");
        let binance_api_secret = get("BINANCE_API_SECRET");
        if venue_mode != MarketMode::Mock {
            if binance_api_key.is_none() {
                return Err(ConfigError::Missing("BINANCE_API_KEY"));
            }
            if binance_api_secret.is_none() {
                return Err(ConfigError::Missing("BINANCE_API_SECRET"));
            }
        }
        let recv_window = num(get("BINANCE_RECV_WINDOW"), "BINANCE_RECV_WINDOW", 5000)?;

        // ===== Order size =====
        let defaults = OrderSizes::default();
        let order_sizes = OrderSizes {
            btc: size(num(get("ORDER_SIZE_BTC"), "ORDER_SIZE_BTC", defaults.btc)?, "ORDER_SIZE_BTC")?,
            eth: size(num(get("ORDER_SIZE_ETH"), "ORDER_SIZE_ETH", defaults.eth)?, "ORDER_SIZE_ETH")?,
            default: size(num(get("ORDER_SIZE_DEFAULT"), "ORDER_SIZE_DEFAULT", defaults.default)?, "ORDER_SIZE_DEFAULT")?,
        };

        let record_file = get("RECORD_FILE");
        let metrics_port = num(get("METRICS_PORT"), "METRICS_PORT", 9898u16)?;

        Ok(Settings {
            symbols,
            sma_period,
            ema_period,
            variant_a_sl,
            variant_b_sl,
            candle_history_size,
            reconnect_delay_secs,
            feed_mode,
            venue_mode,
            binance_ws_url,
            binance_rest_url,
            binance_api_key,
            binance_api_secret,
            recv_window,
            order_sizes,
            record_file,
            metrics_port,
        })
    }

    /// CLI > env > .env > default.
    pub fn load(cli: &Cli) -> Result<Self, ConfigError> {
        // Pastikan .env dibaca (agar SYMBOLS, mode, dll ter-load)
        match &cli.env_file {
            Some(path) => {
                dotenvy::from_path(path).map_err(|e| ConfigError::EnvFile {
                    path: path.display().to_string(),
                    reason: e.to_string(),
                })?;
            }
            None => {
                let _ = dotenvy::dotenv();
            }
        }

        let cli_symbols = cli.symbols.clone();
        Settings::from_lookup(|k| match (k, &cli_symbols) {
            ("SYMBOLS", Some(s)) => Some(s.clone()),
            _ => env::var(k).ok(),
        })
    }

    /// Variant A / B, identical except for the stop loss.
    pub fn variants(&self) -> Vec<StrategyVariant> {
        vec![
            StrategyVariant::new("A", self.variant_a_sl),
            StrategyVariant::new("B", self.variant_b_sl),
        ]
    }
}
