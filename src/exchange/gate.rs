use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::Semaphore;

use super::{ExchangeClient, OrderAck, OrderRequest, SymbolRules, TrailingStop};
use crate::error::ExchangeError;

/// Caps the number of exchange calls in flight across every symbol worker.
pub struct GatedExchange {
    inner: Arc<dyn ExchangeClient>,
    permits: Semaphore,
}

impl GatedExchange {
    pub fn new(inner: Arc<dyn ExchangeClient>, max_in_flight: usize) -> Self {
        Self {
            inner,
            permits: Semaphore::new(max_in_flight.max(1)),
        }
    }

    async fn permit(&self, symbol: &str) -> Result<tokio::sync::SemaphorePermit<'_>, ExchangeError> {
        self.permits
            .acquire()
            .await
            .map_err(|e| ExchangeError::transport(symbol, e))
    }
}

#[async_trait]
impl ExchangeClient for GatedExchange {
    async fn place_order(&self, request: &OrderRequest) -> Result<OrderAck, ExchangeError> {
        let _permit = self.permit(&request.symbol).await?;
        self.inner.place_order(request).await
    }

    async fn cancel_order(&self, symbol: &str, client_order_id: &str) -> Result<(), ExchangeError> {
        let _permit = self.permit(symbol).await?;
        self.inner.cancel_order(symbol, client_order_id).await
    }

    async fn set_trailing_stop(&self, symbol: &str, stop: &TrailingStop) -> Result<(), ExchangeError> {
        let _permit = self.permit(symbol).await?;
        self.inner.set_trailing_stop(symbol, stop).await
    }

    async fn get_symbol_rules(&self, symbol: &str) -> Result<SymbolRules, ExchangeError> {
        let _permit = self.permit(symbol).await?;
        self.inner.get_symbol_rules(symbol).await
    }

    async fn has_open_position(&self, symbol: &str) -> Result<bool, ExchangeError> {
        let _permit = self.permit(symbol).await?;
        self.inner.has_open_position(symbol).await
    }
}
