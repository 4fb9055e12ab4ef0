// Rolling indicator state per symbol: EMA pair, Donchian channel, ATR.

pub mod atr;
pub mod donchian;
pub mod ema;

pub use atr::AverageTrueRange;
pub use donchian::DonchianChannel;
pub use ema::Ema;

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::warn;

use crate::config::StrategyConfig;
use crate::error::BarError;

/// One closed bar from the market data feed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PriceBar {
    pub symbol: String,
    pub close: f64,
    pub high: f64,
    pub low: f64,
    /// Bar start, epoch milliseconds.
    pub timestamp: i64,
}

impl PriceBar {
    /// Bar carrying only a close; high and low collapse onto it.
    pub fn new(symbol: impl Into<String>, close: f64, timestamp: i64) -> Self {
        Self {
            symbol: symbol.into(),
            close,
            high: close,
            low: close,
            timestamp,
        }
    }

    pub fn with_range(mut self, high: f64, low: f64) -> Self {
        self.high = high;
        self.low = low;
        self
    }
}

/// Indicator values after a bar, plus the EMA values before it.
///
/// The Donchian bounds cover the `donchian_period` closes *preceding* this
/// bar, so `close > donchian_high` is a genuine breakout.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IndicatorSnapshot {
    pub symbol: String,
    pub timestamp: i64,
    pub close: f64,
    pub fast_ema: Option<f64>,
    pub slow_ema: Option<f64>,
    pub prior_fast_ema: Option<f64>,
    pub prior_slow_ema: Option<f64>,
    pub donchian_high: Option<f64>,
    pub donchian_low: Option<f64>,
    pub atr: Option<f64>,
}

/// Indicators for a single symbol. Bars must arrive in timestamp order.
#[derive(Debug, Clone)]
pub struct SymbolIndicators {
    symbol: String,
    fast: Ema,
    slow: Ema,
    channel: DonchianChannel,
    atr: AverageTrueRange,
    last_timestamp: Option<i64>,
    bars_seen: usize,
}

impl SymbolIndicators {
    pub fn new(symbol: impl Into<String>, config: &StrategyConfig) -> Self {
        Self {
            symbol: symbol.into(),
            fast: Ema::new(config.ema_fast),
            slow: Ema::new(config.ema_slow),
            channel: DonchianChannel::new(config.donchian_period),
            atr: AverageTrueRange::new(config.atr_period),
            last_timestamp: None,
            bars_seen: 0,
        }
    }

    pub fn bars_seen(&self) -> usize {
        self.bars_seen
    }

    pub fn update(&mut self, bar: &PriceBar) -> Result<IndicatorSnapshot, BarError> {
        self.validate(bar)?;

        let prior_fast_ema = self.fast.value();
        let prior_slow_ema = self.slow.value();

        // Channel bounds are read before the bar enters the window.
        let bounds = self.channel.bounds();
        self.channel.push(bar.close);

        let fast_ema = self.fast.update(bar.close);
        let slow_ema = self.slow.update(bar.close);
        let atr = self.atr.update(bar.high, bar.low, bar.close);

        self.last_timestamp = Some(bar.timestamp);
        self.bars_seen += 1;

        Ok(IndicatorSnapshot {
            symbol: self.symbol.clone(),
            timestamp: bar.timestamp,
            close: bar.close,
            fast_ema,
            slow_ema,
            prior_fast_ema,
            prior_slow_ema,
            donchian_high: bounds.map(|(high, _)| high),
            donchian_low: bounds.map(|(_, low)| low),
            atr,
        })
    }

    fn validate(&self, bar: &PriceBar) -> Result<(), BarError> {
        if bar.symbol != self.symbol {
            return Err(BarError::WrongSymbol {
                expected: self.symbol.clone(),
                got: bar.symbol.clone(),
            });
        }

        let prices_ok = [bar.close, bar.high, bar.low]
            .iter()
            .all(|p| p.is_finite() && *p > 0.0);
        if !prices_ok || bar.high < bar.low {
            return Err(BarError::InvalidPrice {
                symbol: bar.symbol.clone(),
                close: bar.close,
            });
        }

        if let Some(last) = self.last_timestamp {
            if bar.timestamp <= last {
                return Err(BarError::OutOfOrder {
                    symbol: bar.symbol.clone(),
                    timestamp: bar.timestamp,
                    last,
                });
            }
        }

        Ok(())
    }
}

/// Indicator state for every tracked symbol, keyed by symbol.
pub struct IndicatorState {
    config: StrategyConfig,
    symbols: HashMap<String, SymbolIndicators>,
}

impl IndicatorState {
    pub fn new(config: StrategyConfig) -> Self {
        Self {
            config,
            symbols: HashMap::new(),
        }
    }

    /// Fold `bar` into its symbol's indicators. Bad bars are dropped with a
    /// warning and leave the state untouched.
    pub fn update(&mut self, bar: &PriceBar) -> Option<IndicatorSnapshot> {
        let config = &self.config;
        let indicators = self
            .symbols
            .entry(bar.symbol.clone())
            .or_insert_with(|| SymbolIndicators::new(bar.symbol.clone(), config));

        match indicators.update(bar) {
            Ok(snapshot) => Some(snapshot),
            Err(e) => {
                warn!("Dropping bar: {}", e);
                None
            }
        }
    }

    pub fn get(&self, symbol: &str) -> Option<&SymbolIndicators> {
        self.symbols.get(symbol)
    }
}
