//! Stop management after a bracket is in place: move the stop to entry once
//! price runs far enough, then hand the position to a venue-side trailing
//! stop.
//!
//! A new stop is always placed before the old one is cancelled, so the
//! position never goes without a resting stop.

use std::sync::Arc;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::config::ProtectionConfig;
use crate::exchange::{
    ExchangeClient, OrderRequest, OrderType, PriceSource, SymbolRules, TrailingStop,
};
use crate::risk::{round_to_step, BracketOrderPlan};
use crate::strategy::TradingSide;

#[derive(Debug, Clone)]
pub struct ProtectionSettings {
    pub break_even_activation: f64,
    pub use_trailing_stop: bool,
    pub trailing_activation: f64,
    pub trailing_callback_pct: f64,
    pub poll_interval: Duration,
}

impl ProtectionSettings {
    pub fn from_config(config: &ProtectionConfig) -> Self {
        Self {
            break_even_activation: config.break_even_activation,
            use_trailing_stop: config.use_trailing_stop,
            trailing_activation: config.trailing_activation,
            trailing_callback_pct: config.trailing_callback_pct,
            poll_interval: config.poll_interval(),
        }
    }
}

impl Default for ProtectionSettings {
    fn default() -> Self {
        Self::from_config(&ProtectionConfig::default())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ProtectionOutcome {
    /// Stopped out, took profit or closed by hand.
    PositionClosed,
    TrailingStopSet,
    /// A stop move failed; the last stop placed keeps resting.
    Abandoned(String),
}

/// Prices at which the stop is tightened for one position.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProtectionLevels {
    pub break_even_trigger: f64,
    pub trailing_trigger: f64,
}

impl ProtectionLevels {
    pub fn new(side: TradingSide, entry: f64, atr: f64, settings: &ProtectionSettings) -> Self {
        let be = atr * settings.break_even_activation;
        let trail = atr * settings.trailing_activation;
        match side {
            TradingSide::Buy => Self {
                break_even_trigger: entry + be,
                trailing_trigger: entry + trail,
            },
            TradingSide::Sell => Self {
                break_even_trigger: entry - be,
                trailing_trigger: entry - trail,
            },
        }
    }
}

fn reached(side: TradingSide, price: f64, trigger: f64) -> bool {
    match side {
        TradingSide::Buy => price >= trigger,
        TradingSide::Sell => price <= trigger,
    }
}

pub struct ProtectionMonitor {
    exchange: Arc<dyn ExchangeClient>,
    prices: Arc<dyn PriceSource>,
    settings: ProtectionSettings,
}

impl ProtectionMonitor {
    pub fn new(
        exchange: Arc<dyn ExchangeClient>,
        prices: Arc<dyn PriceSource>,
        settings: ProtectionSettings,
    ) -> Self {
        Self {
            exchange,
            prices,
            settings,
        }
    }

    /// Watch the position opened by `plan` until it closes, the trailing
    /// stop takes over, or a stop move fails. `stop_id` is the client order
    /// id of the resting stop-loss.
    pub async fn watch(
        &self,
        plan: &BracketOrderPlan,
        atr: f64,
        stop_id: String,
        rules: &SymbolRules,
    ) -> ProtectionOutcome {
        let symbol = &plan.symbol;
        let levels = ProtectionLevels::new(plan.side, plan.entry_price, atr, &self.settings);
        info!(
            "👁️ Watching {} {}: break-even at {:.4}, trailing at {:.4}",
            symbol, plan.side, levels.break_even_trigger, levels.trailing_trigger
        );

        let mut stop_id = stop_id;
        let mut at_break_even = false;
        let mut ticker = tokio::time::interval(self.settings.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            ticker.tick().await;

            match self.exchange.has_open_position(symbol).await {
                Ok(true) => {}
                Ok(false) => {
                    info!("{} position closed, watch ends", symbol);
                    return ProtectionOutcome::PositionClosed;
                }
                Err(e) => {
                    warn!("[{}] Position check failed: {}", symbol, e);
                    continue;
                }
            }

            let price = match self.prices.last_price(symbol).await {
                Ok(price) => price,
                Err(e) => {
                    warn!("[{}] Error fetching price: {}", symbol, e);
                    continue;
                }
            };
            debug!("{} last price {}", symbol, price);

            if !at_break_even && reached(plan.side, price, levels.break_even_trigger) {
                match self.move_stop_to_entry(plan, &stop_id).await {
                    Ok(new_id) => {
                        stop_id = new_id;
                        at_break_even = true;
                    }
                    Err(reason) => return ProtectionOutcome::Abandoned(reason),
                }
                continue;
            }

            if self.settings.use_trailing_stop
                && reached(plan.side, price, levels.trailing_trigger)
            {
                let stop = self.trailing_stop(levels.trailing_trigger, rules);
                if let Err(e) = self.exchange.set_trailing_stop(symbol, &stop).await {
                    warn!("[{}] Failed to set trailing stop: {}", symbol, e);
                    return ProtectionOutcome::Abandoned(e.to_string());
                }
                info!(
                    "[{}] 🤠 Trailing stop set: {} behind, active from {}",
                    symbol, stop.distance, stop.activation_price
                );
                if let Err(e) = self.exchange.cancel_order(symbol, &stop_id).await {
                    warn!("[{}] Failed to cancel stop {}: {}", symbol, stop_id, e);
                }
                return ProtectionOutcome::TrailingStopSet;
            }
        }
    }

    /// Returns the client order id of the new stop.
    async fn move_stop_to_entry(
        &self,
        plan: &BracketOrderPlan,
        old_id: &str,
    ) -> Result<String, String> {
        let request = OrderRequest::new(
            &plan.symbol,
            plan.side.opposite(),
            OrderType::StopMarket,
            plan.quantity,
        )
        .with_price(plan.entry_price)
        .reduce_only();

        if let Err(e) = self.exchange.place_order(&request).await {
            warn!("[{}] Failed to place break-even stop: {}", plan.symbol, e);
            return Err(e.to_string());
        }
        info!(
            "[{}] 🛡️ Moved stop-loss to break-even at {}",
            plan.symbol, plan.entry_price
        );

        if let Err(e) = self.exchange.cancel_order(&plan.symbol, old_id).await {
            warn!("[{}] Failed to cancel initial stop {}: {}", plan.symbol, old_id, e);
        }
        Ok(request.client_order_id)
    }

    fn trailing_stop(&self, trigger: f64, rules: &SymbolRules) -> TrailingStop {
        let activation_price = round_to_step(trigger, rules.tick_size, rules.price_precision);
        let distance = round_to_step(
            activation_price * self.settings.trailing_callback_pct / 100.0,
            rules.tick_size,
            rules.price_precision,
        )
        .max(rules.tick_size);
        TrailingStop {
            distance,
            activation_price,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ExchangeError;
    use crate::exchange::{OrderAck, PaperExchange};
    use crate::strategy::SignalKind;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::collections::VecDeque;

    /// Replays prices, repeating the last one.
    struct ScriptedPrices {
        prices: Mutex<VecDeque<f64>>,
    }

    impl ScriptedPrices {
        fn new(prices: &[f64]) -> Arc<Self> {
            Arc::new(Self {
                prices: Mutex::new(prices.iter().copied().collect()),
            })
        }
    }

    #[async_trait]
    impl PriceSource for ScriptedPrices {
        async fn last_price(&self, symbol: &str) -> Result<f64, ExchangeError> {
            let mut prices = self.prices.lock();
            let price = if prices.len() > 1 {
                prices.pop_front()
            } else {
                prices.front().copied()
            };
            price.ok_or_else(|| ExchangeError::rejected(symbol, "no price"))
        }
    }

    /// Paper venue that refuses trailing stops.
    struct NoTrailing {
        inner: PaperExchange,
    }

    #[async_trait]
    impl ExchangeClient for NoTrailing {
        async fn place_order(&self, req: &OrderRequest) -> Result<OrderAck, ExchangeError> {
            self.inner.place_order(req).await
        }

        async fn cancel_order(&self, symbol: &str, id: &str) -> Result<(), ExchangeError> {
            self.inner.cancel_order(symbol, id).await
        }

        async fn set_trailing_stop(&self, symbol: &str, _: &TrailingStop) -> Result<(), ExchangeError> {
            Err(ExchangeError::rejected(symbol, "trailing stop not allowed"))
        }

        async fn get_symbol_rules(&self, symbol: &str) -> Result<SymbolRules, ExchangeError> {
            self.inner.get_symbol_rules(symbol).await
        }

        async fn has_open_position(&self, symbol: &str) -> Result<bool, ExchangeError> {
            self.inner.has_open_position(symbol).await
        }
    }

    fn plan() -> BracketOrderPlan {
        BracketOrderPlan {
            symbol: "BTCUSDT".to_string(),
            side: TradingSide::Buy,
            kind: SignalKind::DonchianBreakout,
            quantity: 0.01,
            entry_price: 30000.0,
            stop_loss_price: 29520.45,
            take_profit_price: 30480.45,
        }
    }

    fn settings() -> ProtectionSettings {
        ProtectionSettings {
            poll_interval: Duration::from_millis(1),
            ..ProtectionSettings::default()
        }
    }

    /// Open a long with resting SL and TP; returns the SL client id.
    async fn open_long(venue: &dyn ExchangeClient) -> String {
        let p = plan();
        let entry = OrderRequest::new(&p.symbol, p.side, OrderType::Market, p.quantity);
        venue.place_order(&entry).await.unwrap();
        let sl = OrderRequest::new(&p.symbol, TradingSide::Sell, OrderType::StopMarket, p.quantity)
            .with_price(p.stop_loss_price)
            .reduce_only();
        venue.place_order(&sl).await.unwrap();
        let tp = OrderRequest::new(&p.symbol, TradingSide::Sell, OrderType::TakeProfitMarket, p.quantity)
            .with_price(p.take_profit_price)
            .reduce_only();
        venue.place_order(&tp).await.unwrap();
        sl.client_order_id
    }

    #[test]
    fn test_levels_mirror_for_short() {
        let s = ProtectionSettings::default();
        let long = ProtectionLevels::new(TradingSide::Buy, 100.0, 4.0, &s);
        assert_eq!(long.break_even_trigger, 102.0);
        assert_eq!(long.trailing_trigger, 104.0);

        let short = ProtectionLevels::new(TradingSide::Sell, 100.0, 4.0, &s);
        assert_eq!(short.break_even_trigger, 98.0);
        assert_eq!(short.trailing_trigger, 96.0);
    }

    #[tokio::test]
    async fn test_break_even_then_trailing() {
        let paper = Arc::new(PaperExchange::default());
        let sl_id = open_long(paper.as_ref()).await;
        // ATR 450: break-even from 30225, trailing from 30450
        let prices = ScriptedPrices::new(&[30100.0, 30250.0, 30300.0, 30500.0]);
        let monitor = ProtectionMonitor::new(paper.clone(), prices, settings());

        let outcome = monitor
            .watch(&plan(), 450.0, sl_id.clone(), &SymbolRules::default())
            .await;

        assert_eq!(outcome, ProtectionOutcome::TrailingStopSet);
        assert_eq!(
            paper.trailing_stop("BTCUSDT"),
            Some(TrailingStop {
                distance: 152.25,
                activation_price: 30450.0,
            })
        );
        // Initial and break-even stops are both gone; only the TP rests.
        let resting = paper.resting_orders("BTCUSDT");
        assert_eq!(resting.len(), 1);
        assert_eq!(resting[0].order_type, OrderType::TakeProfitMarket);
    }

    #[tokio::test]
    async fn test_break_even_stop_sits_at_entry() {
        let paper = Arc::new(PaperExchange::default());
        let sl_id = open_long(paper.as_ref()).await;
        let prices = ScriptedPrices::new(&[30250.0]);
        let monitor = Arc::new(ProtectionMonitor::new(
            paper.clone(),
            prices,
            ProtectionSettings {
                use_trailing_stop: false,
                ..settings()
            },
        ));

        let watch = {
            let monitor = monitor.clone();
            tokio::spawn(async move {
                monitor
                    .watch(&plan(), 450.0, sl_id, &SymbolRules::default())
                    .await
            })
        };

        let mut stop = None;
        for _ in 0..1000 {
            stop = paper
                .resting_orders("BTCUSDT")
                .into_iter()
                .find(|o| o.order_type == OrderType::StopMarket && o.price == Some(30000.0));
            if stop.is_some() && paper.resting_orders("BTCUSDT").len() == 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        watch.abort();

        let stop = stop.expect("break-even stop not placed");
        assert_eq!(stop.side, TradingSide::Sell);
        assert!(stop.reduce_only);
        assert_eq!(paper.resting_orders("BTCUSDT").len(), 2);
        assert!(paper.trailing_stop("BTCUSDT").is_none());
    }

    #[tokio::test]
    async fn test_closed_position_ends_watch() {
        let paper = Arc::new(PaperExchange::default());
        let monitor = ProtectionMonitor::new(paper, ScriptedPrices::new(&[30000.0]), settings());

        let outcome = monitor
            .watch(&plan(), 450.0, "gone".to_string(), &SymbolRules::default())
            .await;
        assert_eq!(outcome, ProtectionOutcome::PositionClosed);
    }

    #[tokio::test]
    async fn test_rejected_trailing_keeps_stop() {
        let venue = Arc::new(NoTrailing {
            inner: PaperExchange::default(),
        });
        let sl_id = open_long(venue.as_ref()).await;
        let monitor = ProtectionMonitor::new(
            venue.clone(),
            ScriptedPrices::new(&[30500.0]),
            ProtectionSettings {
                break_even_activation: 2.0,
                ..settings()
            },
        );

        let outcome = monitor
            .watch(&plan(), 450.0, sl_id.clone(), &SymbolRules::default())
            .await;

        assert!(matches!(outcome, ProtectionOutcome::Abandoned(_)));
        assert!(venue
            .inner
            .resting_orders("BTCUSDT")
            .iter()
            .any(|o| o.client_order_id == sl_id));
    }
}
