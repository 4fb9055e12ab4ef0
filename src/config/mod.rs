use anyhow::{ensure, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub exchange: ExchangeConfig,
    #[serde(default)]
    pub trading: TradingConfig,
    #[serde(default)]
    pub strategy: StrategyConfig,
    #[serde(default)]
    pub execution: ExecutionConfig,
    #[serde(default)]
    pub protection: ProtectionConfig,
    #[serde(default)]
    pub telegram: TelegramConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ExchangeConfig {
    pub api_key: Option<String>,
    pub api_secret: Option<String>,
    #[serde(default)]
    pub testnet: bool,
    #[serde(default = "default_ws_url")]
    pub ws_url: String,
    #[serde(default = "default_rest_url")]
    pub rest_url: String,
    #[serde(default = "default_recv_window")]
    pub recv_window: u64,
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
    /// Upper bound on exchange calls in flight across all symbols.
    #[serde(default = "default_max_concurrent_requests")]
    pub max_concurrent_requests: usize,
    /// Kline interval in Bybit notation ("1", "15", "60", "D", ...).
    #[serde(default = "default_kline_interval")]
    pub kline_interval: String,
    /// Bybit v5 product category.
    #[serde(default = "default_category")]
    pub category: String,
}

impl Default for ExchangeConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            api_secret: None,
            testnet: false,
            ws_url: default_ws_url(),
            rest_url: default_rest_url(),
            recv_window: default_recv_window(),
            request_timeout_ms: default_request_timeout_ms(),
            max_concurrent_requests: default_max_concurrent_requests(),
            kline_interval: default_kline_interval(),
            category: default_category(),
        }
    }
}

impl ExchangeConfig {
    /// REST base URL, switched to the testnet host when `testnet` is set and
    /// the URL was left at its default.
    pub fn effective_rest_url(&self) -> String {
        if self.testnet && self.rest_url == default_rest_url() {
            return TESTNET_REST_URL.to_string();
        }
        self.rest_url.clone()
    }

    pub fn effective_ws_url(&self) -> String {
        if self.testnet && self.ws_url == default_ws_url() {
            return TESTNET_WS_URL.to_string();
        }
        self.ws_url.clone()
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

const TESTNET_REST_URL: &str = "https://api-testnet.bybit.com";
const TESTNET_WS_URL: &str = "wss://stream-testnet.bybit.com/v5/public/linear";

fn default_ws_url() -> String { "wss://stream.bybit.com/v5/public/linear".to_string() }
fn default_rest_url() -> String { "https://api.bybit.com".to_string() }
fn default_recv_window() -> u64 { 5000 }
fn default_request_timeout_ms() -> u64 { 10_000 }
fn default_max_concurrent_requests() -> usize { 4 }
fn default_kline_interval() -> String { "15".to_string() }
fn default_category() -> String { "linear".to_string() }

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TradingConfig {
    #[serde(default = "default_symbols")]
    pub symbols: Vec<String>,
    /// Symbols listed here are ignored even if present in `symbols`.
    #[serde(default)]
    pub excluded_symbols: Vec<String>,
    #[serde(default)]
    pub leverage: HashMap<String, u32>,
    #[serde(default = "default_leverage")]
    pub default_leverage: u32,
    /// Margin committed per trade, in quote currency (USDT).
    #[serde(default = "default_margin_per_trade")]
    pub margin_per_trade: f64,
    #[serde(default = "default_min_notional")]
    pub min_notional: f64,
    #[serde(default = "default_true")]
    pub use_market_entry: bool,
    #[serde(default = "default_true")]
    pub use_market_tp: bool,
    /// Route orders to the in-process paper exchange.
    #[serde(default)]
    pub dry_run: bool,
}

impl Default for TradingConfig {
    fn default() -> Self {
        Self {
            symbols: default_symbols(),
            excluded_symbols: Vec::new(),
            leverage: HashMap::new(),
            default_leverage: default_leverage(),
            margin_per_trade: default_margin_per_trade(),
            min_notional: default_min_notional(),
            use_market_entry: true,
            use_market_tp: true,
            dry_run: false,
        }
    }
}

fn default_symbols() -> Vec<String> {
    ["BTCUSDT", "ETHUSDT", "LINKUSDT", "DOGEUSDT"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}
fn default_leverage() -> u32 { 5 }
fn default_margin_per_trade() -> f64 { 200.0 }
fn default_min_notional() -> f64 { 5.0 }
fn default_true() -> bool { true }

impl TradingConfig {
    pub fn active_symbols(&self) -> Vec<String> {
        self.symbols
            .iter()
            .filter(|s| !self.excluded_symbols.contains(s))
            .cloned()
            .collect()
    }

    pub fn leverage_for(&self, symbol: &str) -> u32 {
        self.leverage
            .get(symbol)
            .copied()
            .unwrap_or(self.default_leverage)
    }

    /// Quote-currency notional committed to one entry on `symbol`.
    pub fn notional_for(&self, symbol: &str) -> f64 {
        self.margin_per_trade * self.leverage_for(symbol) as f64
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StrategyConfig {
    #[serde(default = "default_ema_fast")]
    pub ema_fast: usize,
    #[serde(default = "default_ema_slow")]
    pub ema_slow: usize,
    #[serde(default = "default_donchian_period")]
    pub donchian_period: usize,
    #[serde(default = "default_atr_period")]
    pub atr_period: usize,
    #[serde(default = "default_sl_multiplier")]
    pub sl_multiplier: f64,
    #[serde(default = "default_tp_multiplier")]
    pub tp_multiplier: f64,
    /// Fractional offset pushing SL/TP away from entry (0.001 = 0.1%).
    #[serde(default = "default_price_buffer")]
    pub price_buffer: f64,
}

impl Default for StrategyConfig {
    fn default() -> Self {
        Self {
            ema_fast: default_ema_fast(),
            ema_slow: default_ema_slow(),
            donchian_period: default_donchian_period(),
            atr_period: default_atr_period(),
            sl_multiplier: default_sl_multiplier(),
            tp_multiplier: default_tp_multiplier(),
            price_buffer: default_price_buffer(),
        }
    }
}

fn default_ema_fast() -> usize { 8 }
fn default_ema_slow() -> usize { 21 }
fn default_donchian_period() -> usize { 55 }
fn default_atr_period() -> usize { 14 }
fn default_sl_multiplier() -> f64 { 1.0 }
fn default_tp_multiplier() -> f64 { 1.5 }
fn default_price_buffer() -> f64 { 0.001 }

impl StrategyConfig {
    /// Number of bars needed before every indicator is defined.
    pub fn warmup_bars(&self) -> usize {
        self.ema_fast
            .max(self.ema_slow)
            .max(self.donchian_period)
            .max(self.atr_period)
            + 1
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ExecutionConfig {
    /// Attempts per SL/TP leg, including the first.
    #[serde(default = "default_leg_attempts")]
    pub leg_attempts: u32,
    #[serde(default = "default_leg_backoff_ms")]
    pub leg_backoff_ms: u64,
    #[serde(default = "default_order_timeout_ms")]
    pub order_timeout_ms: u64,
    #[serde(default = "default_ledger_timeout_ms")]
    pub ledger_timeout_ms: u64,
    /// How long shutdown waits for brackets in flight before aborting.
    #[serde(default = "default_shutdown_grace_ms")]
    pub shutdown_grace_ms: u64,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            leg_attempts: default_leg_attempts(),
            leg_backoff_ms: default_leg_backoff_ms(),
            order_timeout_ms: default_order_timeout_ms(),
            ledger_timeout_ms: default_ledger_timeout_ms(),
            shutdown_grace_ms: default_shutdown_grace_ms(),
        }
    }
}

fn default_leg_attempts() -> u32 { 3 }
fn default_leg_backoff_ms() -> u64 { 1000 }
fn default_order_timeout_ms() -> u64 { 10_000 }
fn default_ledger_timeout_ms() -> u64 { 5_000 }
fn default_shutdown_grace_ms() -> u64 { 60_000 }

impl ExecutionConfig {
    pub fn leg_backoff(&self) -> Duration {
        Duration::from_millis(self.leg_backoff_ms)
    }

    pub fn order_timeout(&self) -> Duration {
        Duration::from_millis(self.order_timeout_ms)
    }

    pub fn ledger_timeout(&self) -> Duration {
        Duration::from_millis(self.ledger_timeout_ms)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }
}

/// Stop management once a bracket is in place.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ProtectionConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// ATR multiples in favour before the stop moves to entry.
    #[serde(default = "default_break_even_activation")]
    pub break_even_activation: f64,
    #[serde(default = "default_true")]
    pub use_trailing_stop: bool,
    /// ATR multiples in favour before the trailing stop takes over.
    #[serde(default = "default_trailing_activation")]
    pub trailing_activation: f64,
    /// Trailing distance as a percentage of the activation price.
    #[serde(default = "default_trailing_callback_pct")]
    pub trailing_callback_pct: f64,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
}

impl Default for ProtectionConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            break_even_activation: default_break_even_activation(),
            use_trailing_stop: true,
            trailing_activation: default_trailing_activation(),
            trailing_callback_pct: default_trailing_callback_pct(),
            poll_interval_ms: default_poll_interval_ms(),
        }
    }
}

fn default_break_even_activation() -> f64 { 0.5 }
fn default_trailing_activation() -> f64 { 1.0 }
fn default_trailing_callback_pct() -> f64 { 0.5 }
fn default_poll_interval_ms() -> u64 { 2_000 }

impl ProtectionConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct TelegramConfig {
    #[serde(default)]
    pub enabled: bool,
    pub bot_token: Option<String>,
    pub chat_id: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

fn default_log_level() -> String { "info".to_string() }

impl Config {
    pub fn load() -> Result<Arc<Self>> {
        dotenv::dotenv().ok();

        let mut builder = config::Config::builder()
            .add_source(config::File::with_name("config/default").required(false))
            .add_source(config::Environment::with_prefix("BOT").separator("__"));

        // Load API keys from environment
        if let Ok(api_key) = std::env::var("BYBIT_API_KEY") {
            builder = builder.set_override("exchange.api_key", api_key)?;
        }

        if let Ok(api_secret) = std::env::var("BYBIT_API_SECRET") {
            builder = builder.set_override("exchange.api_secret", api_secret)?;
        }

        let config: Config = builder.build()?.try_deserialize()?;
        config.validate()?;
        Ok(Arc::new(config))
    }

    pub fn validate(&self) -> Result<()> {
        let s = &self.strategy;
        ensure!(s.ema_fast > 0 && s.ema_slow > 0, "EMA periods must be positive");
        ensure!(
            s.ema_fast < s.ema_slow,
            "ema_fast ({}) must be shorter than ema_slow ({})",
            s.ema_fast,
            s.ema_slow
        );
        ensure!(s.donchian_period > 0, "donchian_period must be positive");
        ensure!(s.atr_period > 0, "atr_period must be positive");
        ensure!(
            s.price_buffer > 0.0 && s.price_buffer < 0.1,
            "price_buffer must be in (0, 0.1), got {}",
            s.price_buffer
        );
        ensure!(self.execution.leg_attempts >= 1, "leg_attempts must be at least 1");
        ensure!(
            self.exchange.max_concurrent_requests >= 1,
            "max_concurrent_requests must be at least 1"
        );
        ensure!(
            !self.trading.active_symbols().is_empty(),
            "no active symbols configured"
        );

        let p = &self.protection;
        if p.enabled {
            ensure!(
                p.break_even_activation > 0.0 && p.trailing_activation > 0.0,
                "protection activations must be positive"
            );
            ensure!(
                p.trailing_callback_pct > 0.0 && p.trailing_callback_pct <= 10.0,
                "trailing_callback_pct must be in (0, 10], got {}",
                p.trailing_callback_pct
            );
            ensure!(p.poll_interval_ms > 0, "poll_interval_ms must be positive");
        }
        Ok(())
    }
}
