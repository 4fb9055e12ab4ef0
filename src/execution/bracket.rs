use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use super::{
    Alert, BracketState, ExecutionOutcome, ExecutionResult, LegRole, OrderAttempt,
};
use crate::config::Config;
use crate::error::{BracketError, ExchangeError};
use crate::exchange::{ExchangeClient, OrderAck, OrderRequest, OrderType};
use crate::ledger::{AlertSink, LedgerSink};
use crate::risk::BracketOrderPlan;

#[derive(Debug, Clone)]
pub struct ExecutorSettings {
    pub use_market_entry: bool,
    pub use_market_tp: bool,
    /// Attempts per protective leg, including the first.
    pub leg_attempts: u32,
    /// Delay before the second attempt; doubles after each failure.
    pub leg_backoff: Duration,
    pub order_timeout: Duration,
    pub ledger_timeout: Duration,
}

impl Default for ExecutorSettings {
    fn default() -> Self {
        Self {
            use_market_entry: true,
            use_market_tp: true,
            leg_attempts: 3,
            leg_backoff: Duration::from_secs(1),
            order_timeout: Duration::from_secs(10),
            ledger_timeout: Duration::from_secs(5),
        }
    }
}

impl ExecutorSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            use_market_entry: config.trading.use_market_entry,
            use_market_tp: config.trading.use_market_tp,
            leg_attempts: config.execution.leg_attempts.max(1),
            leg_backoff: config.execution.leg_backoff(),
            order_timeout: config.execution.order_timeout(),
            ledger_timeout: config.execution.ledger_timeout(),
        }
    }
}

/// Emulates a linked bracket with three independent order calls.
///
/// At most one plan per symbol is in flight; plans arriving meanwhile are
/// dropped, not queued.
pub struct BracketExecutor {
    exchange: Arc<dyn ExchangeClient>,
    ledger: Arc<dyn LedgerSink>,
    alerts: Arc<dyn AlertSink>,
    settings: ExecutorSettings,
    states: DashMap<String, BracketState>,
}

/// Returns the symbol to `Idle` however execution ends.
struct FlightGuard<'a> {
    states: &'a DashMap<String, BracketState>,
    symbol: String,
}

impl Drop for FlightGuard<'_> {
    fn drop(&mut self) {
        self.states.remove(&self.symbol);
    }
}

impl BracketExecutor {
    pub fn new(
        exchange: Arc<dyn ExchangeClient>,
        ledger: Arc<dyn LedgerSink>,
        alerts: Arc<dyn AlertSink>,
        settings: ExecutorSettings,
    ) -> Self {
        Self {
            exchange,
            ledger,
            alerts,
            settings,
            states: DashMap::new(),
        }
    }

    pub fn state(&self, symbol: &str) -> BracketState {
        self.states
            .get(symbol)
            .map(|s| *s)
            .unwrap_or(BracketState::Idle)
    }

    pub async fn execute(&self, plan: &BracketOrderPlan) -> Result<ExecutionResult, BracketError> {
        let _guard = self.claim(&plan.symbol)?;
        let mut transitions = vec![BracketState::Idle, BracketState::EntryPending];

        match self
            .bounded(&plan.symbol, self.exchange.has_open_position(&plan.symbol))
            .await
        {
            Ok(false) => {}
            Ok(true) => {
                info!("Existing position for {}, skipping trade", plan.symbol);
                return Err(BracketError::PositionOpen {
                    symbol: plan.symbol.clone(),
                });
            }
            Err(e) => {
                warn!("Position check failed for {}, skipping trade: {}", plan.symbol, e);
                return Err(BracketError::PositionCheck {
                    symbol: plan.symbol.clone(),
                    source: e,
                });
            }
        }

        info!(
            "Placing {} {} qty={} entry={} SL={} TP={}",
            plan.side, plan.symbol, plan.quantity, plan.entry_price,
            plan.stop_loss_price, plan.take_profit_price
        );

        let entry = self.entry_request(plan);
        let attempt = OrderAttempt::pending(LegRole::Entry, 1, &entry.client_order_id);
        let mut attempts = Vec::with_capacity(3);

        match self.submit(&entry).await {
            Ok(ack) => attempts.push(attempt.accepted(ack.order_id)),
            Err(e) => {
                // No retry: an ambiguous entry failure must not become a double entry.
                error!("❌ Entry failed for {}: {}", plan.symbol, e);
                attempts.push(attempt.failed(e.to_string()));
                self.transition(&plan.symbol, BracketState::EntryFailed, &mut transitions);

                let mut result = ExecutionResult::from_plan(plan, ExecutionOutcome::EntryFailed);
                result.attempts = attempts;
                result.error = Some(e.to_string());
                return Ok(self.finish(result, transitions).await);
            }
        }

        self.transition(&plan.symbol, BracketState::EntryPlaced, &mut transitions);
        self.transition(&plan.symbol, BracketState::SlTpPending, &mut transitions);

        let sl_ok = self
            .place_leg(LegRole::StopLoss, self.stop_loss_request(plan), &mut attempts)
            .await;
        let tp_ok = self
            .place_leg(LegRole::TakeProfit, self.take_profit_request(plan), &mut attempts)
            .await;

        let mut missing = Vec::new();
        if !sl_ok {
            missing.push(LegRole::StopLoss);
        }
        if !tp_ok {
            missing.push(LegRole::TakeProfit);
        }

        let mut result = if missing.is_empty() {
            self.transition(&plan.symbol, BracketState::BracketComplete, &mut transitions);
            ExecutionResult::from_plan(plan, ExecutionOutcome::BracketComplete)
        } else {
            self.transition(&plan.symbol, BracketState::PartialFailure, &mut transitions);
            let mut result = ExecutionResult::from_plan(plan, ExecutionOutcome::PartialFailure);
            result.error = attempts
                .iter()
                .rev()
                .find_map(|a| a.error.clone());
            self.escalate(plan, missing).await;
            result
        };
        result.attempts = attempts;

        Ok(self.finish(result, transitions).await)
    }

    fn claim(&self, symbol: &str) -> Result<FlightGuard<'_>, BracketError> {
        match self.states.entry(symbol.to_string()) {
            Entry::Occupied(state) => {
                warn!(
                    "{} bracket in flight ({:?}), dropping signal",
                    symbol,
                    state.get()
                );
                Err(BracketError::InFlight {
                    symbol: symbol.to_string(),
                })
            }
            Entry::Vacant(slot) => {
                slot.insert(BracketState::EntryPending);
                Ok(FlightGuard {
                    states: &self.states,
                    symbol: symbol.to_string(),
                })
            }
        }
    }

    fn transition(&self, symbol: &str, state: BracketState, transitions: &mut Vec<BracketState>) {
        debug!("{} bracket -> {:?}", symbol, state);
        self.states.insert(symbol.to_string(), state);
        transitions.push(state);
    }

    fn entry_request(&self, plan: &BracketOrderPlan) -> OrderRequest {
        if self.settings.use_market_entry {
            OrderRequest::new(&plan.symbol, plan.side, OrderType::Market, plan.quantity)
        } else {
            OrderRequest::new(&plan.symbol, plan.side, OrderType::Limit, plan.quantity)
                .with_price(plan.entry_price)
        }
    }

    fn stop_loss_request(&self, plan: &BracketOrderPlan) -> OrderRequest {
        OrderRequest::new(&plan.symbol, plan.side.opposite(), OrderType::StopMarket, plan.quantity)
            .with_price(plan.stop_loss_price)
            .reduce_only()
    }

    fn take_profit_request(&self, plan: &BracketOrderPlan) -> OrderRequest {
        let order_type = if self.settings.use_market_tp {
            OrderType::TakeProfitMarket
        } else {
            OrderType::Limit
        };
        OrderRequest::new(&plan.symbol, plan.side.opposite(), order_type, plan.quantity)
            .with_price(plan.take_profit_price)
            .reduce_only()
    }

    async fn submit(&self, request: &OrderRequest) -> Result<OrderAck, ExchangeError> {
        self.bounded(&request.symbol, self.exchange.place_order(request))
            .await
    }

    /// Exchange call bounded by the order timeout; expiry counts as failure.
    async fn bounded<T>(
        &self,
        symbol: &str,
        call: impl std::future::Future<Output = Result<T, ExchangeError>>,
    ) -> Result<T, ExchangeError> {
        let timeout = self.settings.order_timeout;
        match tokio::time::timeout(timeout, call).await {
            Ok(result) => result,
            Err(_) => Err(ExchangeError::Timeout {
                symbol: symbol.to_string(),
                after_ms: timeout.as_millis() as u64,
            }),
        }
    }

    /// Place a protective leg with bounded retries. The same request (and
    /// client order id) is resent so a late success cannot duplicate; a
    /// retry the venue reports as a duplicate means an earlier attempt
    /// landed after all.
    async fn place_leg(
        &self,
        role: LegRole,
        request: OrderRequest,
        attempts: &mut Vec<OrderAttempt>,
    ) -> bool {
        let mut delay = self.settings.leg_backoff;

        for n in 1..=self.settings.leg_attempts {
            let attempt = OrderAttempt::pending(role, n, &request.client_order_id);
            match self.submit(&request).await {
                Ok(ack) => {
                    info!("🛡️ {} {:?} placed: {}", request.symbol, role, ack.order_id);
                    attempts.push(attempt.accepted(ack.order_id));
                    return true;
                }
                Err(ExchangeError::Duplicate { .. }) if n > 1 => {
                    info!(
                        "🛡️ {} {:?} already resting from an earlier attempt: {}",
                        request.symbol, role, request.client_order_id
                    );
                    attempts.push(attempt.accepted(request.client_order_id.clone()));
                    return true;
                }
                Err(e) => {
                    warn!(
                        "{} {:?} failed on attempt {}/{}: {}",
                        request.symbol, role, n, self.settings.leg_attempts, e
                    );
                    attempts.push(attempt.failed(e.to_string()));
                    if n < self.settings.leg_attempts {
                        tokio::time::sleep(delay).await;
                        delay *= 2;
                    }
                }
            }
        }

        false
    }

    async fn escalate(&self, plan: &BracketOrderPlan, missing_legs: Vec<LegRole>) {
        let message = format!(
            "UNPROTECTED POSITION: {} {} qty={} entered at {} is missing {:?} after retries",
            plan.symbol, plan.side, plan.quantity, plan.entry_price, missing_legs
        );
        error!(target: "bracket_alert", symbol = %plan.symbol, "🚨 {}", message);

        let alert = Alert {
            symbol: plan.symbol.clone(),
            side: plan.side,
            quantity: plan.quantity,
            entry_price: plan.entry_price,
            missing_legs,
            message,
        };

        match tokio::time::timeout(self.settings.ledger_timeout, self.alerts.alert(&alert)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => error!("Alert delivery failed for {}: {}", plan.symbol, e),
            Err(_) => error!("Alert delivery timed out for {}", plan.symbol),
        }
    }

    async fn finish(
        &self,
        mut result: ExecutionResult,
        mut transitions: Vec<BracketState>,
    ) -> ExecutionResult {
        transitions.push(BracketState::Idle);
        result.transitions = transitions;
        result.finished_at = chrono::Utc::now();

        info!(
            target: "bracket_record",
            symbol = %result.symbol,
            side = %result.side,
            qty = result.quantity,
            entry = result.entry_price,
            stop_loss = result.stop_loss_price,
            take_profit = result.take_profit_price,
            outcome = ?result.outcome,
            "bracket finished"
        );

        match tokio::time::timeout(self.settings.ledger_timeout, self.ledger.record(&result)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!("Ledger record failed for {}: {}", result.symbol, e),
            Err(_) => warn!("Ledger record timed out for {}", result.symbol),
        }

        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exchange::{SymbolRules, TrailingStop};
    use crate::execution::AttemptStatus;
    use crate::ledger::MemoryLedger;
    use crate::strategy::{SignalKind, TradingSide};
    use async_trait::async_trait;
    use parking_lot::Mutex;

    /// Fails the first `n` calls of a given order type.
    struct FlakyExchange {
        fail_type: Option<OrderType>,
        failures: Mutex<u32>,
        sent: Mutex<Vec<OrderRequest>>,
    }

    impl FlakyExchange {
        fn new(fail_type: Option<OrderType>, failures: u32) -> Self {
            Self {
                fail_type,
                failures: Mutex::new(failures),
                sent: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl ExchangeClient for FlakyExchange {
        async fn place_order(&self, req: &OrderRequest) -> Result<OrderAck, ExchangeError> {
            let n = {
                let mut sent = self.sent.lock();
                sent.push(req.clone());
                sent.len()
            };
            if Some(req.order_type) == self.fail_type {
                let mut left = self.failures.lock();
                if *left > 0 {
                    *left -= 1;
                    return Err(ExchangeError::rejected(&req.symbol, "rejected"));
                }
            }
            Ok(OrderAck { order_id: format!("o{}", n) })
        }

        async fn cancel_order(&self, _: &str, _: &str) -> Result<(), ExchangeError> {
            unreachable!()
        }

        async fn set_trailing_stop(&self, _: &str, _: &TrailingStop) -> Result<(), ExchangeError> {
            unreachable!()
        }

        async fn get_symbol_rules(&self, _: &str) -> Result<SymbolRules, ExchangeError> {
            Ok(SymbolRules::default())
        }

        async fn has_open_position(&self, _: &str) -> Result<bool, ExchangeError> {
            Ok(false)
        }
    }

    /// Loses the answer to the first stop-loss call although the venue
    /// keeps the order; later sends of that id are duplicates.
    struct LostAckExchange {
        seen: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl ExchangeClient for LostAckExchange {
        async fn place_order(&self, req: &OrderRequest) -> Result<OrderAck, ExchangeError> {
            let mut seen = self.seen.lock();
            if seen.contains(&req.client_order_id) {
                return Err(ExchangeError::Duplicate {
                    symbol: req.symbol.clone(),
                    client_order_id: req.client_order_id.clone(),
                });
            }
            seen.push(req.client_order_id.clone());
            if req.order_type == OrderType::StopMarket {
                return Err(ExchangeError::transport(&req.symbol, "connection reset"));
            }
            Ok(OrderAck { order_id: format!("o{}", seen.len()) })
        }

        async fn cancel_order(&self, _: &str, _: &str) -> Result<(), ExchangeError> {
            unreachable!()
        }

        async fn set_trailing_stop(&self, _: &str, _: &TrailingStop) -> Result<(), ExchangeError> {
            unreachable!()
        }

        async fn get_symbol_rules(&self, _: &str) -> Result<SymbolRules, ExchangeError> {
            Ok(SymbolRules::default())
        }

        async fn has_open_position(&self, _: &str) -> Result<bool, ExchangeError> {
            Ok(false)
        }
    }

    fn plan() -> BracketOrderPlan {
        BracketOrderPlan {
            symbol: "BTCUSDT".to_string(),
            side: TradingSide::Buy,
            kind: SignalKind::EmaCross,
            quantity: 0.01,
            entry_price: 30000.0,
            stop_loss_price: 29520.45,
            take_profit_price: 30480.45,
        }
    }

    fn settings() -> ExecutorSettings {
        ExecutorSettings {
            leg_backoff: Duration::from_millis(1),
            ..ExecutorSettings::default()
        }
    }

    fn executor(exchange: Arc<FlakyExchange>, ledger: Arc<MemoryLedger>) -> BracketExecutor {
        BracketExecutor::new(exchange, ledger.clone(), ledger, settings())
    }

    #[tokio::test]
    async fn test_complete_bracket_orders() {
        let exchange = Arc::new(FlakyExchange::new(None, 0));
        let ledger = Arc::new(MemoryLedger::new());
        let exec = executor(exchange.clone(), ledger.clone());

        let result = exec.execute(&plan()).await.unwrap();

        assert_eq!(result.outcome, ExecutionOutcome::BracketComplete);
        assert_eq!(
            result.transitions,
            vec![
                BracketState::Idle,
                BracketState::EntryPending,
                BracketState::EntryPlaced,
                BracketState::SlTpPending,
                BracketState::BracketComplete,
                BracketState::Idle,
            ]
        );

        let sent = exchange.sent.lock().clone();
        assert_eq!(sent.len(), 3);
        assert_eq!(sent[0].order_type, OrderType::Market);
        assert_eq!(sent[0].side, TradingSide::Buy);
        assert!(!sent[0].reduce_only);
        assert_eq!(sent[1].order_type, OrderType::StopMarket);
        assert_eq!(sent[1].side, TradingSide::Sell);
        assert_eq!(sent[1].price, Some(29520.45));
        assert!(sent[1].reduce_only);
        assert_eq!(sent[2].order_type, OrderType::TakeProfitMarket);
        assert_eq!(sent[2].price, Some(30480.45));
        assert!(sent.iter().all(|r| r.qty == 0.01));

        assert_eq!(ledger.records().len(), 1);
        assert!(ledger.alerts().is_empty());
        assert_eq!(exec.state("BTCUSDT"), BracketState::Idle);
    }

    #[tokio::test]
    async fn test_entry_failure_not_retried() {
        let exchange = Arc::new(FlakyExchange::new(Some(OrderType::Market), 5));
        let ledger = Arc::new(MemoryLedger::new());
        let exec = executor(exchange.clone(), ledger.clone());

        let result = exec.execute(&plan()).await.unwrap();

        assert_eq!(result.outcome, ExecutionOutcome::EntryFailed);
        assert_eq!(exchange.sent.lock().len(), 1);
        assert!(result.error.as_deref().unwrap().contains("BTCUSDT"));
        assert_eq!(
            result.transitions,
            vec![
                BracketState::Idle,
                BracketState::EntryPending,
                BracketState::EntryFailed,
                BracketState::Idle,
            ]
        );
        assert_eq!(ledger.records().len(), 1);
        assert!(ledger.alerts().is_empty());
    }

    #[tokio::test]
    async fn test_stop_loss_retried_until_accepted() {
        let exchange = Arc::new(FlakyExchange::new(Some(OrderType::StopMarket), 2));
        let ledger = Arc::new(MemoryLedger::new());
        let exec = executor(exchange.clone(), ledger.clone());

        let result = exec.execute(&plan()).await.unwrap();

        assert_eq!(result.outcome, ExecutionOutcome::BracketComplete);
        assert_eq!(result.attempts_for(LegRole::StopLoss), 3);
        assert!(result.order_id(LegRole::StopLoss).is_some());

        let sent = exchange.sent.lock().clone();
        let sl_ids: Vec<_> = sent
            .iter()
            .filter(|r| r.order_type == OrderType::StopMarket)
            .map(|r| r.client_order_id.clone())
            .collect();
        assert_eq!(sl_ids.len(), 3);
        assert!(sl_ids.iter().all(|id| *id == sl_ids[0]));
        assert!(ledger.alerts().is_empty());
    }

    #[tokio::test]
    async fn test_exhausted_leg_escalates_once() {
        let exchange = Arc::new(FlakyExchange::new(Some(OrderType::TakeProfitMarket), 10));
        let ledger = Arc::new(MemoryLedger::new());
        let exec = executor(exchange.clone(), ledger.clone());

        let result = exec.execute(&plan()).await.unwrap();

        assert_eq!(result.outcome, ExecutionOutcome::PartialFailure);
        assert_eq!(result.attempts_for(LegRole::TakeProfit), 3);
        assert!(result
            .attempts
            .iter()
            .filter(|a| a.role == LegRole::TakeProfit)
            .all(|a| a.status == AttemptStatus::Failed));
        assert!(result.order_id(LegRole::StopLoss).is_some());

        let alerts = ledger.alerts();
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].missing_legs, vec![LegRole::TakeProfit]);
        assert_eq!(ledger.records().len(), 1);
        assert_eq!(result.transitions[4], BracketState::PartialFailure);
    }

    #[tokio::test]
    async fn test_limit_entry_and_limit_take_profit() {
        let exchange = Arc::new(FlakyExchange::new(None, 0));
        let ledger = Arc::new(MemoryLedger::new());
        let exec = BracketExecutor::new(
            exchange.clone(),
            ledger.clone(),
            ledger,
            ExecutorSettings {
                use_market_entry: false,
                use_market_tp: false,
                ..settings()
            },
        );

        exec.execute(&plan()).await.unwrap();

        let sent = exchange.sent.lock().clone();
        assert_eq!(sent[0].order_type, OrderType::Limit);
        assert_eq!(sent[0].price, Some(30000.0));
        assert_eq!(sent[2].order_type, OrderType::Limit);
        assert!(sent[2].reduce_only);
    }

    #[tokio::test]
    async fn test_retry_reported_duplicate_counts_as_placed() {
        let exchange = Arc::new(LostAckExchange { seen: Mutex::new(Vec::new()) });
        let ledger = Arc::new(MemoryLedger::new());
        let exec = BracketExecutor::new(exchange, ledger.clone(), ledger.clone(), settings());

        let result = exec.execute(&plan()).await.unwrap();

        assert_eq!(result.outcome, ExecutionOutcome::BracketComplete);
        assert_eq!(result.attempts_for(LegRole::StopLoss), 2);
        let link = result.link_id(LegRole::StopLoss).unwrap().to_string();
        assert_eq!(result.order_id(LegRole::StopLoss), Some(link.as_str()));
        assert!(ledger.alerts().is_empty());
    }
}
