pub mod bracket;
pub mod protection;

pub use bracket::{BracketExecutor, ExecutorSettings};
pub use protection::{ProtectionMonitor, ProtectionOutcome, ProtectionSettings};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::risk::BracketOrderPlan;
use crate::strategy::{SignalKind, TradingSide};

/// Per-symbol bracket lifecycle.
///
/// `Idle → EntryPending → (EntryFailed | EntryPlaced) → SlTpPending →
/// (BracketComplete | PartialFailure) → Idle`
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum BracketState {
    Idle,
    EntryPending,
    EntryFailed,
    EntryPlaced,
    SlTpPending,
    BracketComplete,
    PartialFailure,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum LegRole {
    Entry,
    StopLoss,
    TakeProfit,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum AttemptStatus {
    Pending,
    Accepted,
    Failed,
}

/// One placement call and the exchange's synchronous answer to it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OrderAttempt {
    pub role: LegRole,
    pub attempt: u32,
    /// Id the order was sent under; identical across retries of one leg.
    pub client_order_id: String,
    /// Venue order id. Falls back to `client_order_id` when the venue only
    /// reported the order as already existing.
    pub order_id: Option<String>,
    pub status: AttemptStatus,
    pub error: Option<String>,
}

impl OrderAttempt {
    pub fn pending(role: LegRole, attempt: u32, client_order_id: &str) -> Self {
        Self {
            role,
            attempt,
            client_order_id: client_order_id.to_string(),
            order_id: None,
            status: AttemptStatus::Pending,
            error: None,
        }
    }

    pub fn accepted(mut self, order_id: String) -> Self {
        self.order_id = Some(order_id);
        self.status = AttemptStatus::Accepted;
        self
    }

    pub fn failed(mut self, error: String) -> Self {
        self.error = Some(error);
        self.status = AttemptStatus::Failed;
        self
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ExecutionOutcome {
    BracketComplete,
    EntryFailed,
    /// Entry placed but at least one protective leg is missing.
    PartialFailure,
}

/// Terminal record of one bracket execution.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ExecutionResult {
    pub symbol: String,
    pub side: TradingSide,
    pub kind: SignalKind,
    pub quantity: f64,
    pub entry_price: f64,
    pub stop_loss_price: f64,
    pub take_profit_price: f64,
    pub outcome: ExecutionOutcome,
    pub attempts: Vec<OrderAttempt>,
    pub transitions: Vec<BracketState>,
    pub error: Option<String>,
    pub finished_at: DateTime<Utc>,
}

impl ExecutionResult {
    pub(crate) fn from_plan(plan: &BracketOrderPlan, outcome: ExecutionOutcome) -> Self {
        Self {
            symbol: plan.symbol.clone(),
            side: plan.side,
            kind: plan.kind,
            quantity: plan.quantity,
            entry_price: plan.entry_price,
            stop_loss_price: plan.stop_loss_price,
            take_profit_price: plan.take_profit_price,
            outcome,
            attempts: Vec::new(),
            transitions: Vec::new(),
            error: None,
            finished_at: Utc::now(),
        }
    }

    pub fn order_id(&self, role: LegRole) -> Option<&str> {
        self.attempts
            .iter()
            .find(|a| a.role == role && a.status == AttemptStatus::Accepted)
            .and_then(|a| a.order_id.as_deref())
    }

    /// Client order id of the accepted `role` leg, for later cancels.
    pub fn link_id(&self, role: LegRole) -> Option<&str> {
        self.attempts
            .iter()
            .find(|a| a.role == role && a.status == AttemptStatus::Accepted)
            .map(|a| a.client_order_id.as_str())
    }

    pub fn attempts_for(&self, role: LegRole) -> usize {
        self.attempts.iter().filter(|a| a.role == role).count()
    }
}

/// High-severity notice that a position is open without full protection.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Alert {
    pub symbol: String,
    pub side: TradingSide,
    pub quantity: f64,
    pub entry_price: f64,
    pub missing_legs: Vec<LegRole>,
    pub message: String,
}
