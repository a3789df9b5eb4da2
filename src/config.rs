// ===============================
// src/config.rs
// ===============================
/*
=============================================================================
Project : grid_bot_rust — concurrent grid liquidity engine in Rust
Module  : config.rs
Version : 0.5.0
Author  : Kukuh Tripamungkas Wicaksono (Kukuh TW)
Email   : kukuhtw@gmail.com
WhatsApp: https://wa.me/628129893706
LinkedIn: https://id.linkedin.com/in/kukuhtw
License : MIT (see LICENSE)

Summary : Keeps a window of resting limit orders around a moving price per
          symbol, reacts to fills with mirrored orders, gates buys behind a
          market-anomaly breaker, audits local state against the venue, and
          guards order placement with a cross-instance lock.

(c) 2025 Kukuh TW. All rights reserved where applicable.
=============================================================================
*/
use std::{env, path::PathBuf, str::FromStr, time::Duration};

use clap::Parser;
use dotenvy::dotenv;
use rust_decimal::Decimal;
use thiserror::Error;

#[derive(Debug, Parser)]
#[command(name = "grid_bot_rust", about = "Grid liquidity engine")]
pub struct Cli {
    /// Extra env file loaded before `.env`
    #[arg(long)]
    pub env_file: Option<PathBuf>,
    /// Overrides SYMBOLS (comma separated)
    #[arg(long, value_delimiter = ',')]
    pub symbols: Vec<String>,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid value for {key}: {value:?}")]
    Parse { key: String, value: String },
    #[error("invalid {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
    #[error("failed to load env file: {0}")]
    EnvFile(#[from] dotenvy::Error),
}

/// Backend for the cross-instance lock
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LockMode {
    /// single instance, every acquisition succeeds
    None,
    /// in-process store (several runtimes in one process)
    Memory,
    Redis,
}

impl LockMode {
    fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "none" | "noop" | "single" => Some(LockMode::None),
            "memory" | "local" => Some(LockMode::Memory),
            "redis" => Some(LockMode::Redis),
            _ => None,
        }
    }
}

#[derive(Clone, Debug)]
pub struct Args {
    pub symbols: Vec<String>,

    // files/metrics
    pub record_file: Option<String>,
    pub data_dir: Option<PathBuf>,
    pub metrics_port: u16,

    // lock backend
    pub lock_mode: LockMode,
    pub redis_url: String,

    // event delivery
    pub event_workers: usize,
    pub event_queue_capacity: usize,

    pub shutdown_cancel_timeout: Duration,
    pub startup_price_timeout: Duration,
}

/// Per-symbol grid parameters
#[derive(Clone, Debug)]
pub struct GridConfig {
    pub symbol: String,
    pub quote_asset: String,
    pub price_interval: Decimal,
    /// Quote-denominated size of each level
    pub order_quantity: Decimal,
    pub quantity_precision: u32,
    pub buy_window_size: u32,
    pub sell_window_size: u32,
    pub reconcile_interval: Duration,
    pub reconcile_tolerance: Decimal,
    /// Minimum number of levels the account must be able to fund before start
    pub position_safety_check: u32,
    pub margin_lock_duration: Duration,
    pub max_leverage: Decimal,
    pub cleanup_interval: Duration,
    pub cancel_on_start: bool,
    /// Price bucket for placement lock keys; at most one level wide
    pub lock_bucket_size: Decimal,
}

#[derive(Clone, Debug)]
pub struct ExecutorConfig {
    pub lock_ttl: Duration,
    pub max_attempts: u32,
    pub base_backoff: Duration,
    pub max_backoff: Duration,
    pub call_timeout: Duration,
    pub max_qps: u32,
}

#[derive(Clone, Debug)]
pub struct RiskConfig {
    pub enabled: bool,
    pub candle_secs: i64,
    pub window: usize,
    pub min_candles: usize,
    pub volume_spike_multiplier: Decimal,
    pub price_gap_pct: Decimal,
    pub cooldown_secs: i64,
}

/// Settings for the built-in paper venue and random-walk feed
#[derive(Clone, Debug)]
pub struct PaperConfig {
    pub quote_balance: Decimal,
    pub fee_rate: Decimal,
    pub start_price: Decimal,
    pub tick_ms: u64,
    pub step: Decimal,
    pub leverage: Decimal,
    /// inventory the venue already holds per symbol at start
    pub start_position: Decimal,
    /// simulated order-entry round trip
    pub latency_ms: u64,
}

#[derive(Clone, Debug)]
pub struct Settings {
    pub args: Args,
    pub grids: Vec<GridConfig>,
    pub executor: ExecutorConfig,
    pub risk: RiskConfig,
    pub paper: PaperConfig,
}

fn var(key: &str) -> Option<String> {
    env::var(key).ok().map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
}

fn parse_or<T: FromStr>(key: &str, default: T) -> Result<T, ConfigError> {
    match var(key) {
        Some(v) => v.parse().map_err(|_| ConfigError::Parse { key: key.to_string(), value: v }),
        None => Ok(default),
    }
}

fn bool_or(key: &str, default: bool) -> Result<bool, ConfigError> {
    match var(key) {
        Some(v) => match v.to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Ok(true),
            "0" | "false" | "no" | "off" => Ok(false),
            _ => Err(ConfigError::Parse { key: key.to_string(), value: v }),
        },
        None => Ok(default),
    }
}

/// `{KEY}_{SYMBOL}` wins over `{KEY}`
fn symbol_key(key: &str, symbol: &str) -> String {
    let scoped = format!("{key}_{symbol}");
    if var(&scoped).is_some() { scoped } else { key.to_string() }
}

impl GridConfig {
    pub fn from_env(symbol: &str) -> Result<Self, ConfigError> {
        let k = |key: &str| symbol_key(key, symbol);
        let default_quote = ["USDT", "USDC", "BUSD", "USD"]
            .iter()
            .find(|q| symbol.ends_with(*q) && symbol.len() > q.len())
            .map(|q| q.to_string())
            .unwrap_or_else(|| "USDT".to_string());

        let price_interval = parse_or(&k("GRID_PRICE_INTERVAL"), Decimal::from(10))?;

        Ok(Self {
            symbol: symbol.to_string(),
            quote_asset: var(&k("QUOTE_ASSET")).unwrap_or(default_quote),
            price_interval,
            order_quantity: parse_or(&k("GRID_ORDER_QUANTITY"), Decimal::from(100))?,
            quantity_precision: parse_or(&k("GRID_QTY_PRECISION"), 6)?,
            buy_window_size: parse_or(&k("GRID_BUY_WINDOW"), 10)?,
            sell_window_size: parse_or(&k("GRID_SELL_WINDOW"), 10)?,
            reconcile_interval: Duration::from_secs(parse_or(&k("RECONCILE_INTERVAL_SECS"), 60)?),
            reconcile_tolerance: parse_or(&k("RECONCILE_TOLERANCE"), Decimal::new(1, 6))?,
            position_safety_check: parse_or(&k("POSITION_SAFETY_CHECK"), 5)?,
            margin_lock_duration: Duration::from_secs(parse_or(&k("MARGIN_LOCK_DURATION_SECS"), 30)?),
            max_leverage: parse_or(&k("MAX_LEVERAGE"), Decimal::ONE)?,
            cleanup_interval: Duration::from_secs(parse_or(&k("WINDOW_CLEANUP_SECS"), 30)?),
            cancel_on_start: bool_or(&k("CANCEL_ON_START"), true)?,
            lock_bucket_size: parse_or(&k("LOCK_BUCKET_SIZE"), price_interval)?,
        })
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |field, reason: &str| Err(ConfigError::Invalid { field, reason: format!("{reason} ({})", self.symbol) });
        if self.price_interval <= Decimal::ZERO {
            return invalid("price_interval", "must be positive");
        }
        if self.order_quantity <= Decimal::ZERO {
            return invalid("order_quantity", "must be positive");
        }
        if self.buy_window_size == 0 && self.sell_window_size == 0 {
            return invalid("window", "buy and sell windows are both empty");
        }
        if self.max_leverage < Decimal::ONE {
            return invalid("max_leverage", "must be at least 1");
        }
        if self.reconcile_interval.is_zero() || self.cleanup_interval.is_zero() {
            return invalid("interval", "ticker intervals must be non-zero");
        }
        if self.quantity_precision > 18 {
            return invalid("quantity_precision", "at most 18 decimals");
        }
        // wider buckets make neighbouring levels share one placement lock
        if self.lock_bucket_size <= Decimal::ZERO || self.lock_bucket_size > self.price_interval {
            return invalid("lock_bucket_size", "must be in (0, price_interval]");
        }
        Ok(())
    }
}

impl ExecutorConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Ok(Self {
            lock_ttl: Duration::from_millis(parse_or("LOCK_TTL_MS", 5_000)?),
            max_attempts: parse_or("EXEC_MAX_ATTEMPTS", 4)?,
            base_backoff: Duration::from_millis(parse_or("EXEC_BASE_BACKOFF_MS", 200)?),
            max_backoff: Duration::from_millis(parse_or("EXEC_MAX_BACKOFF_MS", 5_000)?),
            call_timeout: Duration::from_millis(parse_or("EXEC_CALL_TIMEOUT_MS", 5_000)?),
            max_qps: parse_or("EXEC_MAX_QPS", 20)?,
        })
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_attempts == 0 {
            return Err(ConfigError::Invalid { field: "max_attempts", reason: "must be at least 1".into() });
        }
        if self.lock_ttl.is_zero() || self.call_timeout.is_zero() {
            return Err(ConfigError::Invalid { field: "timeouts", reason: "must be non-zero".into() });
        }
        Ok(())
    }
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            lock_ttl: Duration::from_secs(5),
            max_attempts: 4,
            base_backoff: Duration::from_millis(200),
            max_backoff: Duration::from_secs(5),
            call_timeout: Duration::from_secs(5),
            max_qps: 20,
        }
    }
}

impl RiskConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Ok(Self {
            enabled: bool_or("RISK_ENABLED", true)?,
            candle_secs: parse_or("RISK_CANDLE_SECS", 60)?,
            window: parse_or("RISK_WINDOW", 20)?,
            min_candles: parse_or("RISK_MIN_CANDLES", 5)?,
            volume_spike_multiplier: parse_or("RISK_VOLUME_SPIKE_MULTIPLIER", Decimal::from(5))?,
            price_gap_pct: parse_or("RISK_PRICE_GAP_PCT", Decimal::new(3, 2))?,
            cooldown_secs: parse_or("RISK_COOLDOWN_SECS", 300)?,
        })
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.candle_secs <= 0 {
            return Err(ConfigError::Invalid { field: "candle_secs", reason: "must be positive".into() });
        }
        if self.window < 2 || self.min_candles == 0 || self.min_candles > self.window {
            return Err(ConfigError::Invalid { field: "window", reason: "need 1 <= min_candles <= window, window >= 2".into() });
        }
        if self.price_gap_pct <= Decimal::ZERO || self.volume_spike_multiplier <= Decimal::ONE {
            return Err(ConfigError::Invalid { field: "thresholds", reason: "gap must be > 0 and spike multiplier > 1".into() });
        }
        Ok(())
    }
}

impl Default for RiskConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            candle_secs: 60,
            window: 20,
            min_candles: 5,
            volume_spike_multiplier: Decimal::from(5),
            price_gap_pct: Decimal::new(3, 2),
            cooldown_secs: 300,
        }
    }
}

impl PaperConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Ok(Self {
            quote_balance: parse_or("PAPER_QUOTE_BALANCE", Decimal::from(10_000))?,
            fee_rate: parse_or("PAPER_FEE_RATE", Decimal::new(1, 3))?,
            start_price: parse_or("PAPER_START_PRICE", Decimal::from(1_000))?,
            tick_ms: parse_or("PAPER_TICK_MS", 200)?,
            step: parse_or("PAPER_STEP", Decimal::from(2))?,
            leverage: parse_or("PAPER_LEVERAGE", Decimal::ONE)?,
            start_position: parse_or("PAPER_START_POSITION", Decimal::ZERO)?,
            latency_ms: parse_or("PAPER_LATENCY_MS", 0)?,
        })
    }
}

impl Settings {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.grids.is_empty() {
            return Err(ConfigError::Invalid { field: "symbols", reason: "no symbols configured".into() });
        }
        if self.args.event_workers == 0 || self.args.event_queue_capacity == 0 {
            return Err(ConfigError::Invalid { field: "events", reason: "workers and queue capacity must be non-zero".into() });
        }
        for g in &self.grids {
            g.validate()?;
        }
        self.executor.validate()?;
        self.risk.validate()
    }
}

pub fn load(cli: &Cli) -> Result<Settings, ConfigError> {
    if let Some(path) = &cli.env_file {
        dotenvy::from_path(path)?;
    }
    let _ = dotenv();

    // SYMBOLS=BTCUSDT,ETHUSDT
    let symbols: Vec<String> = if !cli.symbols.is_empty() {
        cli.symbols.clone()
    } else {
        var("SYMBOLS")
            .or_else(|| var("SYMBOL"))
            .unwrap_or_else(|| "BTCUSDT".to_string())
            .split(',')
            .map(|s| s.to_string())
            .collect()
    };
    let mut symbols: Vec<String> = symbols
        .iter()
        .map(|s| s.trim().to_ascii_uppercase())
        .filter(|s| !s.is_empty())
        .collect();
    symbols.dedup();

    let lock_mode = match var("LOCK_MODE") {
        Some(v) => LockMode::parse(&v).ok_or(ConfigError::Parse { key: "LOCK_MODE".into(), value: v })?,
        None => LockMode::None,
    };

    let args = Args {
        symbols: symbols.clone(),
        record_file: var("RECORD_FILE"),
        data_dir: var("DATA_DIR").map(PathBuf::from),
        metrics_port: parse_or("METRICS_PORT", 9898)?,
        lock_mode,
        redis_url: var("REDIS_URL").unwrap_or_else(|| "redis://127.0.0.1:6379".to_string()),
        event_workers: parse_or("EVENT_WORKERS", 2)?,
        event_queue_capacity: parse_or("EVENT_QUEUE_CAPACITY", 1024)?,
        shutdown_cancel_timeout: Duration::from_millis(parse_or("SHUTDOWN_CANCEL_TIMEOUT_MS", 10_000)?),
        startup_price_timeout: Duration::from_millis(parse_or("STARTUP_PRICE_TIMEOUT_MS", 15_000)?),
    };

    let grids = symbols.iter().map(|s| GridConfig::from_env(s)).collect::<Result<Vec<_>, _>>()?;

    let settings = Settings {
        args,
        grids,
        executor: ExecutorConfig::from_env()?,
        risk: RiskConfig::from_env()?,
        paper: PaperConfig::from_env()?,
    };
    settings.validate()?;
    Ok(settings)
}

#[cfg(test)]
pub(crate) fn test_grid(symbol: &str) -> GridConfig {
    GridConfig {
        symbol: symbol.to_string(),
        quote_asset: "USDT".to_string(),
        price_interval: Decimal::from(10),
        order_quantity: Decimal::from(100),
        quantity_precision: 6,
        buy_window_size: 3,
        sell_window_size: 3,
        reconcile_interval: Duration::from_secs(60),
        reconcile_tolerance: Decimal::new(1, 6),
        position_safety_check: 3,
        margin_lock_duration: Duration::from_secs(30),
        max_leverage: Decimal::ONE,
        cleanup_interval: Duration::from_secs(30),
        cancel_on_start: true,
        lock_bucket_size: Decimal::from(10),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn grid_validation_rejects_bad_values() {
        let mut g = test_grid("BTCUSDT");
        assert!(g.validate().is_ok());

        g.price_interval = Decimal::ZERO;
        assert!(matches!(g.validate(), Err(ConfigError::Invalid { field: "price_interval", .. })));

        let mut g = test_grid("BTCUSDT");
        g.buy_window_size = 0;
        g.sell_window_size = 0;
        assert!(g.validate().is_err());

        let mut g = test_grid("BTCUSDT");
        g.max_leverage = Decimal::new(5, 1);
        assert!(g.validate().is_err());

        let mut g = test_grid("BTCUSDT");
        g.lock_bucket_size = Decimal::from(20);
        assert!(matches!(g.validate(), Err(ConfigError::Invalid { field: "lock_bucket_size", .. })));
    }

    #[test]
    fn lock_bucket_follows_price_interval() {
        env::set_var("GRID_PRICE_INTERVAL_BUCKETTESTUSDT", "0.1");
        let g = GridConfig::from_env("BUCKETTESTUSDT").unwrap();
        assert_eq!(g.lock_bucket_size, Decimal::new(1, 1));
        assert!(g.validate().is_ok());
        env::remove_var("GRID_PRICE_INTERVAL_BUCKETTESTUSDT");
    }

    #[test]
    fn symbol_scoped_keys_override_globals() {
        env::set_var("GRID_BUY_WINDOW_CFGTESTUSDT", "7");
        env::set_var("QUOTE_ASSET_CFGTESTUSDT", "FDUSD");
        let g = GridConfig::from_env("CFGTESTUSDT").unwrap();
        assert_eq!(g.buy_window_size, 7);
        assert_eq!(g.quote_asset, "FDUSD");
        env::remove_var("GRID_BUY_WINDOW_CFGTESTUSDT");
        env::remove_var("QUOTE_ASSET_CFGTESTUSDT");
    }

    #[test]
    fn quote_asset_defaults_from_symbol_suffix() {
        let g = GridConfig::from_env("ETHUSDC").unwrap();
        assert_eq!(g.quote_asset, "USDC");
    }

    #[test]
    fn lock_mode_parsing() {
        assert_eq!(LockMode::parse("Redis"), Some(LockMode::Redis));
        assert_eq!(LockMode::parse("noop"), Some(LockMode::None));
        assert_eq!(LockMode::parse("zookeeper"), None);
    }

    #[test]
    fn risk_validation() {
        assert!(RiskConfig::default().validate().is_ok());
        let bad = RiskConfig { min_candles: 50, ..RiskConfig::default() };
        assert!(bad.validate().is_err());
    }
}
