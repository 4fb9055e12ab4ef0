//! Sinks for execution records and escalated alerts.
//!
//! Sinks are best-effort: the executor logs their failures and carries on.

use anyhow::Result;
use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::{error, info};

use crate::execution::{Alert, ExecutionResult};

#[async_trait]
pub trait LedgerSink: Send + Sync {
    async fn record(&self, result: &ExecutionResult) -> Result<()>;
}

#[async_trait]
pub trait AlertSink: Send + Sync {
    async fn alert(&self, alert: &Alert) -> Result<()>;
}

/// Writes records and alerts to the log only.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogLedger;

#[async_trait]
impl LedgerSink for LogLedger {
    async fn record(&self, r: &ExecutionResult) -> Result<()> {
        info!(
            target: "ledger",
            symbol = %r.symbol,
            side = %r.side,
            qty = r.quantity,
            entry = r.entry_price,
            stop_loss = r.stop_loss_price,
            take_profit = r.take_profit_price,
            outcome = ?r.outcome,
            "trade record"
        );
        Ok(())
    }
}

#[async_trait]
impl AlertSink for LogLedger {
    async fn alert(&self, alert: &Alert) -> Result<()> {
        error!(target: "ledger", symbol = %alert.symbol, "🚨 {}", alert.message);
        Ok(())
    }
}

/// Keeps every record and alert in memory.
#[derive(Debug, Default)]
pub struct MemoryLedger {
    records: Mutex<Vec<ExecutionResult>>,
    alerts: Mutex<Vec<Alert>>,
}

impl MemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<ExecutionResult> {
        self.records.lock().clone()
    }

    pub fn alerts(&self) -> Vec<Alert> {
        self.alerts.lock().clone()
    }
}

#[async_trait]
impl LedgerSink for MemoryLedger {
    async fn record(&self, result: &ExecutionResult) -> Result<()> {
        self.records.lock().push(result.clone());
        Ok(())
    }
}

#[async_trait]
impl AlertSink for MemoryLedger {
    async fn alert(&self, alert: &Alert) -> Result<()> {
        self.alerts.lock().push(alert.clone());
        Ok(())
    }
}
