//! Error types shared across the bot.

use thiserror::Error;

/// Failure reported by an exchange call. Venue-specific codes are mapped
/// onto these variants by the adapter.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ExchangeError {
    #[error("{symbol}: {message}")]
    Rejected { symbol: String, message: String },

    /// The venue already holds an order with this client order id.
    #[error("{symbol}: order {client_order_id} already exists")]
    Duplicate {
        symbol: String,
        client_order_id: String,
    },

    #[error("{symbol}: request timed out after {after_ms}ms")]
    Timeout { symbol: String, after_ms: u64 },

    #[error("{symbol}: transport error: {message}")]
    Transport { symbol: String, message: String },
}

impl ExchangeError {
    pub fn rejected(symbol: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Rejected {
            symbol: symbol.into(),
            message: message.into(),
        }
    }

    pub fn transport(symbol: impl Into<String>, message: impl ToString) -> Self {
        Self::Transport {
            symbol: symbol.into(),
            message: message.to_string(),
        }
    }
}

/// Malformed or out-of-order market data. The bar is dropped.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum BarError {
    #[error("{symbol}: non-finite or non-positive close {close}")]
    InvalidPrice { symbol: String, close: f64 },

    #[error("{symbol}: bar at {timestamp} is not after last bar at {last}")]
    OutOfOrder {
        symbol: String,
        timestamp: i64,
        last: i64,
    },

    #[error("bar for {got} routed to indicator state of {expected}")]
    WrongSymbol { expected: String, got: String },
}

/// A signal that could not be turned into an order plan. Reported as a
/// rejected signal, never sent to the exchange.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum PlanError {
    #[error("{symbol}: quantity {qty} below minimum {min_qty}")]
    BelowMinQty { symbol: String, qty: f64, min_qty: f64 },

    #[error("{symbol}: notional {notional:.2} below minimum {min_notional:.2}")]
    BelowMinNotional {
        symbol: String,
        notional: f64,
        min_notional: f64,
    },

    #[error("{symbol}: bracket does not straddle entry (entry={entry}, sl={stop_loss}, tp={take_profit})")]
    InvalidBracket {
        symbol: String,
        entry: f64,
        stop_loss: f64,
        take_profit: f64,
    },

    #[error("{symbol}: invalid price input {value}")]
    InvalidPrice { symbol: String, value: f64 },

    #[error("{symbol}: ATR not yet available, no exit levels")]
    AtrUnavailable { symbol: String },
}

/// Reasons the executor refuses a plan before any order is sent.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum BracketError {
    #[error("{symbol}: bracket already in flight, signal dropped")]
    InFlight { symbol: String },

    #[error("{symbol}: position already open, signal dropped")]
    PositionOpen { symbol: String },

    #[error("{symbol}: position check failed: {source}")]
    PositionCheck {
        symbol: String,
        #[source]
        source: ExchangeError,
    },
}
