use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::PlanError;
use crate::exchange::SymbolRules;
use crate::strategy::{Signal, SignalKind, TradingSide};

/// Round to the nearest multiple of `10^-precision`.
pub fn round_to_precision(value: f64, precision: u32) -> f64 {
    let factor = 10f64.powi(precision as i32);
    (value * factor).round() / factor
}

/// Round to the nearest multiple of `step`. `precision` trims the
/// representation error the multiplication leaves behind.
pub fn round_to_step(value: f64, step: f64, precision: u32) -> f64 {
    round_to_precision((value / step).round() * step, precision)
}

/// Round down to a multiple of `step`, tolerating representation error just
/// below an exact multiple.
pub fn floor_to_step(value: f64, step: f64, precision: u32) -> f64 {
    round_to_precision(((value / step) + 1e-9).floor() * step, precision)
}

/// Raw stop and take levels before buffering and rounding.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ExitLevels {
    pub stop_loss: f64,
    pub take_profit: f64,
}

impl ExitLevels {
    /// Levels `sl_multiplier × ATR` against and `tp_multiplier × ATR` in
    /// favour of the trade.
    pub fn from_atr(
        side: TradingSide,
        entry: f64,
        atr: f64,
        sl_multiplier: f64,
        tp_multiplier: f64,
    ) -> Self {
        match side {
            TradingSide::Buy => Self {
                stop_loss: entry - sl_multiplier * atr,
                take_profit: entry + tp_multiplier * atr,
            },
            TradingSide::Sell => Self {
                stop_loss: entry + sl_multiplier * atr,
                take_profit: entry - tp_multiplier * atr,
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BracketOrderPlan {
    pub symbol: String,
    pub side: TradingSide,
    pub kind: SignalKind,
    pub quantity: f64,
    pub entry_price: f64,
    pub stop_loss_price: f64,
    pub take_profit_price: f64,
}

/// Turns signals into tick-aligned bracket plans.
#[derive(Debug, Clone)]
pub struct PriceCalculator {
    buffer: f64,
    sl_multiplier: f64,
    tp_multiplier: f64,
    min_notional: f64,
}

impl PriceCalculator {
    pub fn new(buffer: f64, sl_multiplier: f64, tp_multiplier: f64, min_notional: f64) -> Self {
        Self {
            buffer,
            sl_multiplier,
            tp_multiplier,
            min_notional,
        }
    }

    /// Plan a bracket with exits derived from the signal's ATR.
    pub fn plan_from_atr(
        &self,
        signal: &Signal,
        rules: &SymbolRules,
        notional: f64,
    ) -> Result<BracketOrderPlan, PlanError> {
        let atr = signal.atr.ok_or_else(|| PlanError::AtrUnavailable {
            symbol: signal.symbol.clone(),
        })?;
        let entry = round_to_step(signal.trigger_price, rules.tick_size, rules.price_precision);
        let levels = ExitLevels::from_atr(
            signal.side,
            entry,
            atr,
            self.sl_multiplier,
            self.tp_multiplier,
        );
        self.compute_plan(signal, rules, levels, notional)
    }

    /// Build a plan from explicit raw exit levels.
    ///
    /// The buffer pushes each level further from entry (`SL × (1 − b)`,
    /// `TP × (1 + b)` for a BUY, mirrored for a SELL), then each level is
    /// kept at least `b × entry` away from entry before rounding.
    pub fn compute_plan(
        &self,
        signal: &Signal,
        rules: &SymbolRules,
        levels: ExitLevels,
        notional: f64,
    ) -> Result<BracketOrderPlan, PlanError> {
        let symbol = &signal.symbol;
        for value in [signal.trigger_price, levels.stop_loss, levels.take_profit, notional] {
            if !value.is_finite() || value <= 0.0 {
                return Err(PlanError::InvalidPrice {
                    symbol: symbol.clone(),
                    value,
                });
            }
        }

        let entry = round_to_step(signal.trigger_price, rules.tick_size, rules.price_precision);

        let qty = floor_to_step(notional / entry, rules.qty_step, rules.quantity_precision);
        if qty < rules.min_qty {
            warn!("{}: quantity {} below min {}, signal rejected", symbol, qty, rules.min_qty);
            return Err(PlanError::BelowMinQty {
                symbol: symbol.clone(),
                qty,
                min_qty: rules.min_qty,
            });
        }
        if qty * entry < self.min_notional {
            warn!(
                "{}: order notional {:.2} below minimum {:.2}, signal rejected",
                symbol,
                qty * entry,
                self.min_notional
            );
            return Err(PlanError::BelowMinNotional {
                symbol: symbol.clone(),
                notional: qty * entry,
                min_notional: self.min_notional,
            });
        }

        let min_distance = self.buffer * entry;
        let (sl, tp) = match signal.side {
            TradingSide::Buy => (
                (levels.stop_loss * (1.0 - self.buffer)).min(entry - min_distance),
                (levels.take_profit * (1.0 + self.buffer)).max(entry + min_distance),
            ),
            TradingSide::Sell => (
                (levels.stop_loss * (1.0 + self.buffer)).max(entry + min_distance),
                (levels.take_profit * (1.0 - self.buffer)).min(entry - min_distance),
            ),
        };
        let sl = round_to_step(sl, rules.tick_size, rules.price_precision);
        let tp = round_to_step(tp, rules.tick_size, rules.price_precision);

        let straddles = match signal.side {
            TradingSide::Buy => sl < entry && entry < tp,
            TradingSide::Sell => tp < entry && entry < sl,
        };
        if !straddles || sl <= 0.0 || tp <= 0.0 {
            warn!(
                "⚠️ {} {} TP/SL invalid after rounding: SL={}, TP={}, entry={}",
                symbol, signal.side, sl, tp, entry
            );
            return Err(PlanError::InvalidBracket {
                symbol: symbol.clone(),
                entry,
                stop_loss: sl,
                take_profit: tp,
            });
        }

        info!(
            "Rounded plan {} {}: qty={}, entry={}, SL={}, TP={}",
            symbol, signal.side, qty, entry, sl, tp
        );

        Ok(BracketOrderPlan {
            symbol: symbol.clone(),
            side: signal.side,
            kind: signal.kind,
            quantity: qty,
            entry_price: entry,
            stop_loss_price: sl,
            take_profit_price: tp,
        })
    }
}
