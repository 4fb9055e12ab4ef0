//! Per-symbol pipeline: bars in, bracket executions out.
//!
//! Each symbol runs in its own task, so a slow or failing symbol never
//! stalls the others.

use futures::future::join_all;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{error, info, warn};

use crate::config::Config;
use crate::error::{BracketError, ExchangeError, PlanError};
use crate::execution::{
    BracketExecutor, ExecutionOutcome, ExecutionResult, LegRole, ProtectionMonitor,
    ProtectionOutcome,
};
use crate::exchange::{SymbolRules, SymbolRulesCache};
use crate::indicators::{IndicatorState, PriceBar};
use crate::risk::{BracketOrderPlan, PriceCalculator};
use crate::strategy::SignalEngine;

/// What became of one signal.
#[derive(Debug)]
pub enum SignalOutcome {
    Executed(ExecutionResult),
    /// Sizing or level checks failed; nothing was sent.
    Rejected(PlanError),
    /// Dropped by the executor before any order was placed.
    Skipped(BracketError),
    RulesUnavailable(ExchangeError),
}

pub struct SymbolWorker {
    symbol: String,
    notional: f64,
    indicators: IndicatorState,
    signals: SignalEngine,
    calculator: PriceCalculator,
    rules: Arc<SymbolRulesCache>,
    executor: Arc<BracketExecutor>,
    protection: Option<Arc<ProtectionMonitor>>,
    /// Stop watches for this symbol's open brackets; dropped with the worker.
    watches: JoinSet<ProtectionOutcome>,
}

impl SymbolWorker {
    pub fn new(
        symbol: &str,
        config: &Config,
        rules: Arc<SymbolRulesCache>,
        executor: Arc<BracketExecutor>,
    ) -> Self {
        let strategy = &config.strategy;
        Self {
            symbol: symbol.to_string(),
            notional: config.trading.notional_for(symbol),
            indicators: IndicatorState::new(strategy.clone()),
            signals: SignalEngine::new(),
            calculator: PriceCalculator::new(
                strategy.price_buffer,
                strategy.sl_multiplier,
                strategy.tp_multiplier,
                config.trading.min_notional,
            ),
            rules,
            executor,
            protection: None,
            watches: JoinSet::new(),
        }
    }

    /// Watch every completed bracket with `monitor`.
    pub fn with_protection(mut self, monitor: Arc<ProtectionMonitor>) -> Self {
        self.protection = Some(monitor);
        self
    }

    /// Replay history through indicators and signal latches. Signals raised
    /// here are stale and discarded. Returns the number of bars accepted.
    pub fn warm_up(&mut self, bars: &[PriceBar]) -> usize {
        let mut accepted = 0;
        for bar in bars.iter().filter(|b| b.symbol == self.symbol) {
            if let Some(snapshot) = self.indicators.update(bar) {
                self.signals.on_snapshot(&snapshot);
                accepted += 1;
            }
        }
        info!("🔥 {} warmed up with {} bars", self.symbol, accepted);
        accepted
    }

    /// Process one closed bar. Signals from the same bar are handed to the
    /// executor together, so the per-symbol in-flight rule decides which of
    /// them trades.
    pub async fn on_bar(&mut self, bar: &PriceBar) -> Vec<SignalOutcome> {
        if bar.symbol != self.symbol {
            warn!("{} worker got bar for {}, dropping", self.symbol, bar.symbol);
            return Vec::new();
        }

        let snapshot = match self.indicators.update(bar) {
            Some(snapshot) => snapshot,
            None => return Vec::new(),
        };
        let signals = self.signals.on_snapshot(&snapshot);
        if signals.is_empty() {
            return Vec::new();
        }

        let rules = match self.rules.get(&self.symbol).await {
            Ok(rules) => rules,
            Err(e) => {
                error!(
                    "{}: symbol rules unavailable, dropping {} signal(s): {}",
                    self.symbol,
                    signals.len(),
                    e
                );
                return vec![SignalOutcome::RulesUnavailable(e)];
            }
        };

        let mut outcomes = Vec::with_capacity(signals.len());
        let mut plans = Vec::with_capacity(signals.len());
        for signal in &signals {
            match self.calculator.plan_from_atr(signal, &rules, self.notional) {
                Ok(plan) => plans.push((plan, signal.atr)),
                Err(e) => {
                    warn!("{} {} signal rejected: {}", signal.symbol, signal.kind, e);
                    outcomes.push(SignalOutcome::Rejected(e));
                }
            }
        }

        let executor = self.executor.clone();
        let results = join_all(plans.iter().map(|(plan, _)| executor.execute(plan))).await;
        for ((plan, atr), result) in plans.iter().zip(results) {
            match result {
                Ok(execution) => {
                    match execution.outcome {
                        ExecutionOutcome::BracketComplete => {
                            info!("✅ {} {} bracket complete", execution.symbol, execution.side);
                            self.start_watch(plan, *atr, &execution, rules);
                        }
                        ExecutionOutcome::EntryFailed => warn!(
                            "❌ {} {} entry failed: {}",
                            execution.symbol,
                            execution.side,
                            execution.error.as_deref().unwrap_or("unknown")
                        ),
                        ExecutionOutcome::PartialFailure => error!(
                            "🚨 {} {} position open without full protection",
                            execution.symbol, execution.side
                        ),
                    }
                    outcomes.push(SignalOutcome::Executed(execution));
                }
                Err(e) => {
                    info!("Signal skipped: {}", e);
                    outcomes.push(SignalOutcome::Skipped(e));
                }
            }
        }
        outcomes
    }

    fn start_watch(
        &mut self,
        plan: &BracketOrderPlan,
        atr: Option<f64>,
        execution: &ExecutionResult,
        rules: SymbolRules,
    ) {
        let (monitor, atr, stop_id) =
            match (&self.protection, atr, execution.link_id(LegRole::StopLoss)) {
                (Some(monitor), Some(atr), Some(id)) => (monitor.clone(), atr, id.to_string()),
                _ => return,
            };
        let plan = plan.clone();
        self.watches
            .spawn(async move { monitor.watch(&plan, atr, stop_id, &rules).await });
    }

    /// Consume bars until the feed closes or shutdown is signalled (or its
    /// sender dropped). A bar already being executed is always finished.
    pub async fn run(
        mut self,
        mut rx: mpsc::Receiver<PriceBar>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        info!("▶️  {} worker started", self.symbol);
        loop {
            if *shutdown.borrow() {
                break;
            }
            tokio::select! {
                biased;
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                bar = rx.recv() => match bar {
                    Some(bar) => {
                        self.on_bar(&bar).await;
                    }
                    None => break,
                },
                Some(done) = self.watches.join_next(), if !self.watches.is_empty() => {
                    match done {
                        Ok(outcome) => info!("{} stop watch finished: {:?}", self.symbol, outcome),
                        Err(e) => warn!("{} stop watch failed: {}", self.symbol, e),
                    }
                }
            }
        }
        info!("⏹️  {} worker stopped", self.symbol);
    }
}

/// Wait up to `grace` for workers to finish what they are executing, then
/// abort the rest. Returns how many were aborted.
pub async fn drain_workers(workers: Vec<JoinHandle<()>>, grace: Duration) -> usize {
    let deadline = tokio::time::Instant::now() + grace;
    let mut aborted = 0;
    for mut worker in workers {
        if tokio::time::timeout_at(deadline, &mut worker).await.is_err() {
            worker.abort();
            aborted += 1;
        }
    }
    if aborted > 0 {
        warn!("{} worker(s) still busy after {:?}, aborted", aborted, grace);
    }
    aborted
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use crate::exchange::{
        ExchangeClient, OrderAck, OrderRequest, PaperExchange, PriceSource, TrailingStop,
    };
    use crate::execution::{ExecutorSettings, ProtectionSettings};
    use crate::ledger::MemoryLedger;

    /// Paper venue whose protective legs take `delay` to be acknowledged.
    struct SlowLegs {
        paper: PaperExchange,
        delay: Duration,
    }

    #[async_trait]
    impl ExchangeClient for SlowLegs {
        async fn place_order(&self, request: &OrderRequest) -> Result<OrderAck, ExchangeError> {
            if request.reduce_only {
                tokio::time::sleep(self.delay).await;
            }
            self.paper.place_order(request).await
        }

        async fn cancel_order(&self, symbol: &str, client_order_id: &str) -> Result<(), ExchangeError> {
            self.paper.cancel_order(symbol, client_order_id).await
        }

        async fn set_trailing_stop(&self, symbol: &str, stop: &TrailingStop) -> Result<(), ExchangeError> {
            self.paper.set_trailing_stop(symbol, stop).await
        }

        async fn get_symbol_rules(&self, symbol: &str) -> Result<SymbolRules, ExchangeError> {
            self.paper.get_symbol_rules(symbol).await
        }

        async fn has_open_position(&self, symbol: &str) -> Result<bool, ExchangeError> {
            self.paper.has_open_position(symbol).await
        }
    }

    struct FixedPrice(f64);

    #[async_trait]
    impl PriceSource for FixedPrice {
        async fn last_price(&self, _symbol: &str) -> Result<f64, ExchangeError> {
            Ok(self.0)
        }
    }

    fn config() -> Config {
        let mut config = Config::default();
        config.strategy.ema_fast = 2;
        config.strategy.ema_slow = 3;
        config.strategy.donchian_period = 3;
        config.strategy.atr_period = 2;
        config.strategy.sl_multiplier = 1.0;
        config.strategy.tp_multiplier = 1.5;
        config.trading.margin_per_trade = 200.0;
        config.trading.default_leverage = 5;
        config.trading.leverage.clear();
        config
    }

    fn worker(exchange: Arc<PaperExchange>, ledger: Arc<MemoryLedger>) -> SymbolWorker {
        worker_on(exchange, ledger)
    }

    fn worker_on(client: Arc<dyn ExchangeClient>, ledger: Arc<MemoryLedger>) -> SymbolWorker {
        let executor = Arc::new(BracketExecutor::new(
            client.clone(),
            ledger.clone(),
            ledger,
            ExecutorSettings::default(),
        ));
        SymbolWorker::new(
            "BTCUSDT",
            &config(),
            Arc::new(SymbolRulesCache::new(client)),
            executor,
        )
    }

    fn flat_history() -> Vec<PriceBar> {
        (1..=4).map(|i| PriceBar::new("BTCUSDT", 100.0, i)).collect()
    }

    #[tokio::test]
    async fn test_warm_up_discards_signals() {
        let exchange = Arc::new(PaperExchange::default());
        let ledger = Arc::new(MemoryLedger::new());
        let mut worker = worker(exchange.clone(), ledger.clone());

        let mut history = flat_history();
        history.push(PriceBar::new("BTCUSDT", 110.0, 5));
        assert_eq!(worker.warm_up(&history), 5);

        assert!(ledger.records().is_empty());
        assert_eq!(exchange.position("BTCUSDT"), 0.0);
    }

    #[tokio::test]
    async fn test_breakout_bar_trades_once() {
        let exchange = Arc::new(PaperExchange::default());
        let ledger = Arc::new(MemoryLedger::new());
        let mut worker = worker(exchange.clone(), ledger.clone());
        worker.warm_up(&flat_history());

        // Both the EMA cross and the channel breakout fire on this bar.
        let outcomes = worker.on_bar(&PriceBar::new("BTCUSDT", 110.0, 5)).await;
        assert_eq!(outcomes.len(), 2);

        let executed: Vec<&ExecutionResult> = outcomes
            .iter()
            .filter_map(|o| match o {
                SignalOutcome::Executed(r) => Some(r),
                _ => None,
            })
            .collect();
        assert_eq!(executed.len(), 1);
        assert!(outcomes
            .iter()
            .any(|o| matches!(o, SignalOutcome::Skipped(_))));

        let trade = executed[0];
        assert_eq!(trade.outcome, ExecutionOutcome::BracketComplete);
        assert_eq!(trade.entry_price, 110.0);
        assert!(trade.stop_loss_price < trade.entry_price);
        assert!(trade.take_profit_price > trade.entry_price);
        // 200 margin x 5 leverage at 110, floored to 3 decimals
        assert!((trade.quantity - 9.09).abs() < 1e-9);

        assert_eq!(ledger.records().len(), 1);
        assert!((exchange.position("BTCUSDT") - 9.09).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_bad_bars_dropped() {
        let exchange = Arc::new(PaperExchange::default());
        let ledger = Arc::new(MemoryLedger::new());
        let mut worker = worker(exchange, ledger.clone());
        worker.warm_up(&flat_history());

        assert!(worker.on_bar(&PriceBar::new("ETHUSDT", 110.0, 5)).await.is_empty());
        assert!(worker.on_bar(&PriceBar::new("BTCUSDT", f64::NAN, 5)).await.is_empty());
        assert!(worker.on_bar(&PriceBar::new("BTCUSDT", 110.0, 3)).await.is_empty());
        assert!(ledger.records().is_empty());
    }

    #[tokio::test]
    async fn test_run_until_channel_closed() {
        let exchange = Arc::new(PaperExchange::default());
        let ledger = Arc::new(MemoryLedger::new());
        let mut worker = worker(exchange, ledger.clone());
        worker.warm_up(&flat_history());

        let (tx, rx) = mpsc::channel(8);
        let (_stop_tx, stop_rx) = watch::channel(false);
        let handle = tokio::spawn(worker.run(rx, stop_rx));
        tx.send(PriceBar::new("BTCUSDT", 110.0, 5)).await.unwrap();
        drop(tx);
        handle.await.unwrap();

        assert_eq!(ledger.records().len(), 1);
    }

    #[tokio::test]
    async fn test_shutdown_finishes_bracket_in_flight() {
        let venue = Arc::new(SlowLegs {
            paper: PaperExchange::default(),
            delay: Duration::from_millis(100),
        });
        let ledger = Arc::new(MemoryLedger::new());
        let mut worker = worker_on(venue.clone(), ledger.clone());
        worker.warm_up(&flat_history());

        let (tx, rx) = mpsc::channel(8);
        let (stop_tx, stop_rx) = watch::channel(false);
        let handle = tokio::spawn(worker.run(rx, stop_rx));
        tx.send(PriceBar::new("BTCUSDT", 110.0, 5)).await.unwrap();

        // Signal shutdown once the entry is filled and the legs are pending.
        while venue.paper.position("BTCUSDT") == 0.0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        stop_tx.send(true).unwrap();

        assert_eq!(drain_workers(vec![handle], Duration::from_secs(5)).await, 0);
        let records = ledger.records();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].outcome, ExecutionOutcome::BracketComplete);
        assert_eq!(venue.paper.resting_orders("BTCUSDT").len(), 2);
    }

    #[tokio::test]
    async fn test_drain_aborts_after_grace() {
        let venue = Arc::new(SlowLegs {
            paper: PaperExchange::default(),
            delay: Duration::from_secs(3),
        });
        let ledger = Arc::new(MemoryLedger::new());
        let mut worker = worker_on(venue.clone(), ledger.clone());
        worker.warm_up(&flat_history());

        let (tx, rx) = mpsc::channel(8);
        let (stop_tx, stop_rx) = watch::channel(false);
        let handle = tokio::spawn(worker.run(rx, stop_rx));
        tx.send(PriceBar::new("BTCUSDT", 110.0, 5)).await.unwrap();
        while venue.paper.position("BTCUSDT") == 0.0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        stop_tx.send(true).unwrap();

        assert_eq!(drain_workers(vec![handle], Duration::from_millis(50)).await, 1);
        assert!(ledger.records().is_empty());
    }

    #[tokio::test]
    async fn test_completed_bracket_gets_stop_watch() {
        let exchange = Arc::new(PaperExchange::default());
        let ledger = Arc::new(MemoryLedger::new());
        let settings = ProtectionSettings {
            poll_interval: Duration::from_millis(10),
            ..ProtectionSettings::default()
        };
        let monitor = Arc::new(ProtectionMonitor::new(
            exchange.clone(),
            Arc::new(FixedPrice(1000.0)),
            settings,
        ));
        let mut worker = worker(exchange.clone(), ledger).with_protection(monitor);
        worker.warm_up(&flat_history());

        worker.on_bar(&PriceBar::new("BTCUSDT", 110.0, 5)).await;
        assert_eq!(worker.watches.len(), 1);

        let outcome = tokio::time::timeout(Duration::from_secs(5), worker.watches.join_next())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(outcome, ProtectionOutcome::TrailingStopSet);
        assert!(exchange.trailing_stop("BTCUSDT").is_some());
        // Only the take-profit is left resting.
        assert_eq!(exchange.resting_orders("BTCUSDT").len(), 1);
    }
}
