use async_trait::async_trait;
use dashmap::DashMap;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::info;

use super::{ExchangeClient, OrderAck, OrderRequest, SymbolRules, TrailingStop};
use crate::error::ExchangeError;
use crate::strategy::TradingSide;

/// In-process venue for dry runs: every order is accepted, entries open a
/// position, protective legs rest untriggered until cancelled.
pub struct PaperExchange {
    rules: HashMap<String, SymbolRules>,
    positions: DashMap<String, f64>,
    /// Order id handed out per client order id.
    known: DashMap<String, String>,
    /// Reduce-only legs by client order id.
    resting: DashMap<String, OrderRequest>,
    trailing: DashMap<String, TrailingStop>,
    next_id: AtomicU64,
}

impl PaperExchange {
    pub fn new(rules: HashMap<String, SymbolRules>) -> Self {
        Self {
            rules,
            positions: DashMap::new(),
            known: DashMap::new(),
            resting: DashMap::new(),
            trailing: DashMap::new(),
            next_id: AtomicU64::new(1),
        }
    }

    /// Signed position size for `symbol` (positive long).
    pub fn position(&self, symbol: &str) -> f64 {
        self.positions.get(symbol).map(|p| *p).unwrap_or(0.0)
    }

    /// Reduce-only legs still resting on `symbol`.
    pub fn resting_orders(&self, symbol: &str) -> Vec<OrderRequest> {
        self.resting
            .iter()
            .filter(|r| r.symbol == symbol)
            .map(|r| r.value().clone())
            .collect()
    }

    pub fn trailing_stop(&self, symbol: &str) -> Option<TrailingStop> {
        self.trailing.get(symbol).map(|t| *t)
    }
}

impl Default for PaperExchange {
    fn default() -> Self {
        Self::new(HashMap::new())
    }
}

#[async_trait]
impl ExchangeClient for PaperExchange {
    async fn place_order(&self, request: &OrderRequest) -> Result<OrderAck, ExchangeError> {
        if request.qty <= 0.0 {
            return Err(ExchangeError::rejected(&request.symbol, "quantity must be positive"));
        }
        if self.known.contains_key(&request.client_order_id) {
            return Err(ExchangeError::Duplicate {
                symbol: request.symbol.clone(),
                client_order_id: request.client_order_id.clone(),
            });
        }

        let order_id = format!("paper-{}", self.next_id.fetch_add(1, Ordering::Relaxed));
        self.known
            .insert(request.client_order_id.clone(), order_id.clone());

        if request.reduce_only {
            self.resting
                .insert(request.client_order_id.clone(), request.clone());
        } else {
            let signed = match request.side {
                TradingSide::Buy => request.qty,
                TradingSide::Sell => -request.qty,
            };
            *self.positions.entry(request.symbol.clone()).or_insert(0.0) += signed;
        }

        info!(
            "📝 [paper] {} {} {:?} qty={} price={:?} reduce_only={} -> {}",
            request.symbol,
            request.side,
            request.order_type,
            request.qty,
            request.price,
            request.reduce_only,
            order_id
        );

        Ok(OrderAck { order_id })
    }

    async fn cancel_order(&self, symbol: &str, client_order_id: &str) -> Result<(), ExchangeError> {
        match self.resting.remove(client_order_id) {
            Some(_) => {
                info!("📝 [paper] {} cancelled {}", symbol, client_order_id);
                Ok(())
            }
            None => Err(ExchangeError::rejected(symbol, "order not found")),
        }
    }

    async fn set_trailing_stop(&self, symbol: &str, stop: &TrailingStop) -> Result<(), ExchangeError> {
        if self.position(symbol).abs() <= f64::EPSILON {
            return Err(ExchangeError::rejected(symbol, "no open position"));
        }
        info!(
            "📝 [paper] {} trailing stop {} from {}",
            symbol, stop.distance, stop.activation_price
        );
        self.trailing.insert(symbol.to_string(), *stop);
        Ok(())
    }

    async fn get_symbol_rules(&self, symbol: &str) -> Result<SymbolRules, ExchangeError> {
        Ok(self.rules.get(symbol).copied().unwrap_or_default())
    }

    async fn has_open_position(&self, symbol: &str) -> Result<bool, ExchangeError> {
        Ok(self.position(symbol).abs() > f64::EPSILON)
    }
}
