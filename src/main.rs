use anyhow::{anyhow, bail, Result};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use bybit_bracket_bot::bybit::{BybitAuth, BybitClient, KlineFeed};
use bybit_bracket_bot::config::{Config, LoggingConfig};
use bybit_bracket_bot::exchange::{
    ExchangeClient, GatedExchange, PaperExchange, PriceSource, SymbolRulesCache,
};
use bybit_bracket_bot::execution::{
    BracketExecutor, ExecutorSettings, ProtectionMonitor, ProtectionSettings,
};
use bybit_bracket_bot::ledger::{AlertSink, LedgerSink, LogLedger};
use bybit_bracket_bot::pipeline::{drain_workers, SymbolWorker};
use bybit_bracket_bot::secrets::{EnvSecrets, SecretsProvider};
use bybit_bracket_bot::TelegramNotifier;

const BAR_CHANNEL_CAPACITY: usize = 256;

#[tokio::main(flavor = "multi_thread", worker_threads = 4)]
async fn main() -> Result<()> {
    let config = Config::load()?;
    init_logging(&config.logging)?;

    info!("🚀 Bybit Bracket Bot - Starting...");
    let symbols = config.trading.active_symbols();
    info!("✅ Configuration loaded");
    info!("   Symbols: {}", symbols.join(", "));
    info!("   Testnet: {}", config.exchange.testnet);
    info!("   Dry run: {}", config.trading.dry_run);
    info!("   Interval: {}", config.exchange.kline_interval);
    info!(
        "   EMA {}/{} | Donchian {} | ATR {} | buffer {}",
        config.strategy.ema_fast,
        config.strategy.ema_slow,
        config.strategy.donchian_period,
        config.strategy.atr_period,
        config.strategy.price_buffer
    );

    // Initialize Telegram notifier
    let tg = match (&config.telegram.bot_token, &config.telegram.chat_id) {
        (Some(token), Some(chat_id)) if config.telegram.enabled && !token.is_empty() => {
            info!("📱 Telegram notifications enabled");
            let notifier = Arc::new(TelegramNotifier::new(token.clone(), chat_id.clone()));
            if let Err(e) = notifier
                .notify_startup(&symbols, config.exchange.testnet, config.trading.dry_run)
                .await
            {
                warn!("Failed to send startup notification: {}", e);
            }
            Some(notifier)
        }
        _ => {
            info!("📱 Telegram notifications disabled");
            None
        }
    };

    let credentials = EnvSecrets::new(&config.exchange).credentials()?;
    if credentials.is_none() && !config.trading.dry_run {
        bail!("live trading needs BYBIT_API_KEY and BYBIT_API_SECRET");
    }

    let market = Arc::new(BybitClient::new(
        config.exchange.effective_rest_url(),
        credentials.map(BybitAuth::new),
        config.exchange.recv_window,
        config.exchange.request_timeout(),
    )?
    .with_category(&config.exchange.category));
    info!("✅ REST client initialized");

    let venue: Arc<dyn ExchangeClient> = if config.trading.dry_run {
        let mut rules = HashMap::new();
        for symbol in &symbols {
            match market.get_symbol_rules(symbol).await {
                Ok(r) => {
                    rules.insert(symbol.clone(), r);
                }
                Err(e) => warn!("{}: using default rules for paper trading: {}", symbol, e),
            }
        }
        info!("📝 Paper trading venue initialized");
        Arc::new(PaperExchange::new(rules))
    } else {
        market.clone()
    };
    let venue: Arc<dyn ExchangeClient> = Arc::new(GatedExchange::new(
        venue,
        config.exchange.max_concurrent_requests,
    ));

    let (ledger, alerts): (Arc<dyn LedgerSink>, Arc<dyn AlertSink>) = match &tg {
        Some(notifier) => (notifier.clone(), notifier.clone()),
        None => (Arc::new(LogLedger), Arc::new(LogLedger)),
    };

    let executor = Arc::new(BracketExecutor::new(
        venue.clone(),
        ledger,
        alerts,
        ExecutorSettings::from_config(&config),
    ));
    info!("✅ Bracket executor initialized");

    let protection = if config.protection.enabled {
        let prices: Arc<dyn PriceSource> = market.clone();
        info!(
            "🛡️ Stop protection enabled: break-even at {}x ATR, trailing at {}x ATR ({})",
            config.protection.break_even_activation,
            config.protection.trailing_activation,
            if config.protection.use_trailing_stop { "on" } else { "off" }
        );
        Some(Arc::new(ProtectionMonitor::new(
            venue.clone(),
            prices,
            ProtectionSettings::from_config(&config.protection),
        )))
    } else {
        None
    };
    let rules = Arc::new(SymbolRulesCache::new(venue));

    let feed = Arc::new(KlineFeed::new(
        config.exchange.effective_ws_url(),
        config.exchange.kline_interval.clone(),
    ));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut workers = Vec::with_capacity(symbols.len());
    for symbol in &symbols {
        if !config.trading.dry_run {
            let leverage = config.trading.leverage_for(symbol);
            if let Err(e) = market.set_leverage(symbol, leverage).await {
                warn!("⚠️  {}: failed to set leverage {}x: {}", symbol, leverage, e);
            }
        }

        let mut worker = SymbolWorker::new(symbol, &config, rules.clone(), executor.clone());
        if let Some(monitor) = &protection {
            worker = worker.with_protection(monitor.clone());
        }
        match market
            .get_klines(
                symbol,
                &config.exchange.kline_interval,
                config.strategy.warmup_bars() * 2,
            )
            .await
        {
            Ok(history) => {
                worker.warm_up(&history);
            }
            Err(e) => warn!("{}: no history, warming up from live bars: {}", symbol, e),
        }

        let (tx, rx) = mpsc::channel(BAR_CHANNEL_CAPACITY);
        feed.subscribe(symbol, tx);
        workers.push(tokio::spawn(worker.run(rx, shutdown_rx.clone())));
    }
    drop(shutdown_rx);

    let mut feed_task = tokio::spawn(feed.clone().run());

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("🛑 Shutdown requested");
        }
        res = &mut feed_task => {
            match res {
                Ok(Ok(())) => warn!("Kline feed stopped"),
                Ok(Err(e)) => error!("Kline feed failed: {}", e),
                Err(e) => error!("Kline feed task panicked: {}", e),
            }
        }
    }

    // Stop taking bars, then let brackets already being placed finish.
    feed_task.abort();
    feed.close();
    let _ = shutdown_tx.send(true);
    let grace = config.execution.shutdown_grace();
    info!("⏳ Waiting up to {:?} for in-flight brackets", grace);
    let aborted = drain_workers(workers, grace).await;
    if aborted > 0 {
        error!("🚨 {} worker(s) aborted mid-execution, check open positions", aborted);
    }

    if let Some(notifier) = &tg {
        if let Err(e) = notifier.notify_shutdown().await {
            warn!("Failed to send shutdown notification: {}", e);
        }
    }

    info!("👋 Bot stopped");
    Ok(())
}

/// `RUST_LOG` wins over the configured level.
fn init_logging(logging: &LoggingConfig) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&logging.level))?;

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_thread_ids(true);

    let res = if logging.json {
        builder.json().try_init()
    } else {
        builder.try_init()
    };
    res.map_err(|e| anyhow!(e))
}
