pub mod bybit;
pub mod config;
pub mod error;
pub mod exchange;
pub mod execution;
pub mod indicators;
pub mod ledger;
pub mod pipeline;
pub mod risk;
pub mod secrets;
pub mod strategy;
pub mod telegram;

pub use config::Config;
pub use bybit::{BybitAuth, BybitClient, KlineFeed};
pub use execution::{BracketExecutor, BracketState, ExecutionResult};
pub use pipeline::SymbolWorker;
pub use telegram::TelegramNotifier;
