use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde_json::json;

use crate::execution::{Alert, ExecutionOutcome, ExecutionResult, LegRole};
use crate::ledger::{AlertSink, LedgerSink};
use crate::strategy::TradingSide;

/// Sends trade records and alerts to a Telegram chat.
#[derive(Clone)]
pub struct TelegramNotifier {
    client: Client,
    bot_token: String,
    chat_id: String,
}

impl TelegramNotifier {
    pub fn new(bot_token: String, chat_id: String) -> Self {
        Self {
            client: Client::new(),
            bot_token,
            chat_id,
        }
    }

    pub async fn send_message(&self, message: &str) -> Result<()> {
        let url = format!(
            "https://api.telegram.org/bot{}/sendMessage",
            self.bot_token
        );

        self.client
            .post(&url)
            .json(&json!({
                "chat_id": self.chat_id,
                "text": message,
                "parse_mode": "HTML"
            }))
            .send()
            .await
            .context("Telegram request failed")?
            .error_for_status()
            .context("Telegram rejected message")?;

        Ok(())
    }

    pub async fn notify_startup(&self, symbols: &[String], testnet: bool, dry_run: bool) -> Result<()> {
        let network = if testnet { "TESTNET" } else { "MAINNET" };
        let mode = if dry_run { "DRY RUN" } else { "LIVE" };
        let message = format!(
            "🤖 <b>Bot Started</b>\n\n\
             📊 Symbols: {}\n\
             🌐 Network: {}\n\
             🧪 Mode: {}\n\
             ✅ Status: Running",
            symbols.join(", "),
            network,
            mode
        );
        self.send_message(&message).await
    }

    pub async fn notify_shutdown(&self) -> Result<()> {
        self.send_message("🛑 <b>Bot Stopped</b>").await
    }
}

fn side_emoji(side: TradingSide) -> &'static str {
    match side {
        TradingSide::Buy => "🟢",
        TradingSide::Sell => "🔴",
    }
}

fn leg_name(role: LegRole) -> &'static str {
    match role {
        LegRole::Entry => "Entry",
        LegRole::StopLoss => "Stop Loss",
        LegRole::TakeProfit => "Take Profit",
    }
}

pub(crate) fn format_record(r: &ExecutionResult) -> String {
    let order_id = |role| r.order_id(role).unwrap_or("-").to_string();
    match r.outcome {
        ExecutionOutcome::EntryFailed => format!(
            "❌ <b>Entry Failed</b>\n\n\
             {} Side: <b>{}</b>\n\
             📊 Symbol: {}\n\
             🔢 Qty: {}\n\
             ⚠️ Error: {}",
            side_emoji(r.side),
            r.side,
            r.symbol,
            r.quantity,
            r.error.as_deref().unwrap_or("unknown")
        ),
        ExecutionOutcome::BracketComplete | ExecutionOutcome::PartialFailure => format!(
            "📍 <b>Position Opened</b> ({:?})\n\n\
             📊 Symbol: {}\n\
             {} Side: <b>{}</b>\n\
             🎯 Entry: {} (id {})\n\
             🔢 Qty: {}\n\
             🛡️ Stop Loss: {} (id {})\n\
             🎯 Take Profit: {} (id {})",
            r.outcome,
            r.symbol,
            side_emoji(r.side),
            r.side,
            r.entry_price,
            order_id(LegRole::Entry),
            r.quantity,
            r.stop_loss_price,
            order_id(LegRole::StopLoss),
            r.take_profit_price,
            order_id(LegRole::TakeProfit)
        ),
    }
}

pub(crate) fn format_alert(alert: &Alert) -> String {
    let missing: Vec<&str> = alert.missing_legs.iter().map(|l| leg_name(*l)).collect();
    format!(
        "🚨 <b>UNPROTECTED POSITION</b>\n\n\
         📊 Symbol: {}\n\
         {} Side: <b>{}</b>\n\
         🔢 Qty: {}\n\
         🎯 Entry: {}\n\
         ⚠️ Missing: {}\n\n\
         {}",
        alert.symbol,
        side_emoji(alert.side),
        alert.side,
        alert.quantity,
        alert.entry_price,
        missing.join(", "),
        alert.message
    )
}

#[async_trait]
impl LedgerSink for TelegramNotifier {
    async fn record(&self, result: &ExecutionResult) -> Result<()> {
        self.send_message(&format_record(result)).await
    }
}

#[async_trait]
impl AlertSink for TelegramNotifier {
    async fn alert(&self, alert: &Alert) -> Result<()> {
        self.send_message(&format_alert(alert)).await
    }
}
