//! Exchange port used by the bracket executor.
//!
//! The executor only sees [`ExchangeClient`]; the Bybit REST client, the
//! paper venue and the test doubles all implement it.

pub mod gate;
pub mod paper;

pub use gate::GatedExchange;
pub use paper::PaperExchange;

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::info;

use crate::error::ExchangeError;
use crate::strategy::TradingSide;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum OrderType {
    Market,
    Limit,
    /// Conditional market order that closes at `price` against the position.
    StopMarket,
    /// Conditional market order that takes profit at `price`.
    TakeProfitMarket,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderRequest {
    pub symbol: String,
    pub side: TradingSide,
    pub order_type: OrderType,
    pub qty: f64,
    /// Limit price for `Limit`, trigger price for conditional types.
    pub price: Option<f64>,
    pub reduce_only: bool,
    pub client_order_id: String,
}

impl OrderRequest {
    pub fn new(symbol: &str, side: TradingSide, order_type: OrderType, qty: f64) -> Self {
        Self {
            symbol: symbol.to_string(),
            side,
            order_type,
            qty,
            price: None,
            reduce_only: false,
            client_order_id: uuid::Uuid::new_v4().simple().to_string(),
        }
    }

    pub fn with_price(mut self, price: f64) -> Self {
        self.price = Some(price);
        self
    }

    pub fn reduce_only(mut self) -> Self {
        self.reduce_only = true;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderAck {
    pub order_id: String,
}

/// Static per-symbol trading rules.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SymbolRules {
    /// Every price sent must be a multiple of this.
    pub tick_size: f64,
    /// Every quantity sent must be a multiple of this.
    pub qty_step: f64,
    pub min_qty: f64,
    /// Decimal places of `tick_size`, used to print grid values cleanly.
    pub price_precision: u32,
    pub quantity_precision: u32,
}

impl Default for SymbolRules {
    fn default() -> Self {
        Self::new(0.01, 0.001, 0.001)
    }
}

impl SymbolRules {
    pub fn new(tick_size: f64, qty_step: f64, min_qty: f64) -> Self {
        Self {
            tick_size,
            qty_step,
            min_qty,
            price_precision: step_decimals(&tick_size.to_string()),
            quantity_precision: step_decimals(&qty_step.to_string()),
        }
    }

    /// Build rules from exchange step strings such as `"0.10"` / `"0.001"`.
    /// `None` when either step is not a positive number.
    pub fn from_steps(tick_size: &str, qty_step: &str, min_qty: f64) -> Option<Self> {
        Some(Self {
            tick_size: parse_step(tick_size)?,
            qty_step: parse_step(qty_step)?,
            min_qty,
            price_precision: step_decimals(tick_size),
            quantity_precision: step_decimals(qty_step),
        })
    }
}

fn parse_step(step: &str) -> Option<f64> {
    step.trim()
        .parse::<f64>()
        .ok()
        .filter(|v| v.is_finite() && *v > 0.0)
}

/// Significant decimal places of a step size string.
fn step_decimals(step: &str) -> u32 {
    match step.trim().split_once('.') {
        Some((_, frac)) => frac.trim_end_matches('0').len() as u32,
        None => 0,
    }
}

/// Venue-side trailing stop attached to an open position.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TrailingStop {
    /// How far the stop trails the best price, in quote units.
    pub distance: f64,
    /// Price at which the stop starts trailing.
    pub activation_price: f64,
}

#[async_trait]
pub trait ExchangeClient: Send + Sync {
    async fn place_order(&self, request: &OrderRequest) -> Result<OrderAck, ExchangeError>;

    /// Cancel a resting order by the client order id it was placed with.
    async fn cancel_order(&self, symbol: &str, client_order_id: &str) -> Result<(), ExchangeError>;

    async fn set_trailing_stop(&self, symbol: &str, stop: &TrailingStop) -> Result<(), ExchangeError>;

    async fn get_symbol_rules(&self, symbol: &str) -> Result<SymbolRules, ExchangeError>;

    /// Whether `symbol` currently carries a non-zero position.
    async fn has_open_position(&self, symbol: &str) -> Result<bool, ExchangeError>;
}

/// Last traded price, polled by the stop monitor.
#[async_trait]
pub trait PriceSource: Send + Sync {
    async fn last_price(&self, symbol: &str) -> Result<f64, ExchangeError>;
}

/// Symbol rules fetched once per symbol and kept for the process lifetime.
pub struct SymbolRulesCache {
    client: Arc<dyn ExchangeClient>,
    rules: DashMap<String, SymbolRules>,
}

impl SymbolRulesCache {
    pub fn new(client: Arc<dyn ExchangeClient>) -> Self {
        Self {
            client,
            rules: DashMap::new(),
        }
    }

    pub async fn get(&self, symbol: &str) -> Result<SymbolRules, ExchangeError> {
        if let Some(rules) = self.rules.get(symbol) {
            return Ok(*rules);
        }

        let rules = self.client.get_symbol_rules(symbol).await?;
        info!(
            "📐 {} rules: tick {}, qty step {}, min qty {}",
            symbol, rules.tick_size, rules.qty_step, rules.min_qty
        );
        self.rules.insert(symbol.to_string(), rules);
        Ok(rules)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_step_decimals() {
        assert_eq!(step_decimals("0.10"), 1);
        assert_eq!(step_decimals("0.001"), 3);
        assert_eq!(step_decimals("0.0000001"), 7);
        assert_eq!(step_decimals("1"), 0);
        assert_eq!(step_decimals("1000"), 0);
    }

    #[test]
    fn test_rules_from_steps() {
        let rules = SymbolRules::from_steps("0.10", "0.001", 0.001).unwrap();
        assert_eq!(rules.tick_size, 0.1);
        assert_eq!(rules.qty_step, 0.001);
        assert_eq!(rules.price_precision, 1);
        assert_eq!(rules.quantity_precision, 3);

        // Steps that are not powers of ten survive as-is.
        let rules = SymbolRules::from_steps("0.5", "1000", 1000.0).unwrap();
        assert_eq!(rules.tick_size, 0.5);
        assert_eq!(rules.qty_step, 1000.0);

        assert!(SymbolRules::from_steps("0", "0.001", 0.001).is_none());
        assert!(SymbolRules::from_steps("0.1", "abc", 0.001).is_none());
    }

    #[test]
    fn test_rules_new_derives_precision() {
        let rules = SymbolRules::new(0.0001, 0.001, 0.001);
        assert_eq!(rules.price_precision, 4);
        assert_eq!(rules.quantity_precision, 3);
        assert_eq!(SymbolRules::new(0.5, 1000.0, 1000.0).quantity_precision, 0);
        assert_eq!(SymbolRules::default().price_precision, 2);
    }

    struct CountingClient {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl ExchangeClient for CountingClient {
        async fn place_order(&self, _: &OrderRequest) -> Result<OrderAck, ExchangeError> {
            unreachable!()
        }

        async fn cancel_order(&self, _: &str, _: &str) -> Result<(), ExchangeError> {
            unreachable!()
        }

        async fn set_trailing_stop(&self, _: &str, _: &TrailingStop) -> Result<(), ExchangeError> {
            unreachable!()
        }

        async fn get_symbol_rules(&self, _: &str) -> Result<SymbolRules, ExchangeError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(SymbolRules::default())
        }

        async fn has_open_position(&self, _: &str) -> Result<bool, ExchangeError> {
            unreachable!()
        }
    }

    #[tokio::test]
    async fn test_rules_fetched_once() {
        let client = Arc::new(CountingClient { calls: AtomicUsize::new(0) });
        let cache = SymbolRulesCache::new(client.clone());

        cache.get("BTCUSDT").await.unwrap();
        cache.get("BTCUSDT").await.unwrap();
        cache.get("ETHUSDT").await.unwrap();

        assert_eq!(client.calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_order_request_builder() {
        let req = OrderRequest::new("BTCUSDT", TradingSide::Sell, OrderType::StopMarket, 0.01)
            .with_price(29520.45)
            .reduce_only();
        assert!(req.reduce_only);
        assert_eq!(req.price, Some(29520.45));
        assert_eq!(req.client_order_id.len(), 32);
    }
}
