use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use tracing::{debug, info};

use crate::indicators::IndicatorSnapshot;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum TradingSide {
    Buy,
    Sell,
}

impl TradingSide {
    pub fn opposite(self) -> Self {
        match self {
            TradingSide::Buy => TradingSide::Sell,
            TradingSide::Sell => TradingSide::Buy,
        }
    }
}

impl fmt::Display for TradingSide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TradingSide::Buy => write!(f, "BUY"),
            TradingSide::Sell => write!(f, "SELL"),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum SignalKind {
    EmaCross,
    DonchianBreakout,
}

impl fmt::Display for SignalKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SignalKind::EmaCross => write!(f, "EMA cross"),
            SignalKind::DonchianBreakout => write!(f, "Donchian breakout"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Signal {
    pub symbol: String,
    pub side: TradingSide,
    pub kind: SignalKind,
    pub trigger_price: f64,
    pub timestamp: i64,
    /// ATR at the signal bar, if warm. Used to place raw exit levels.
    pub atr: Option<f64>,
}

/// Fires a rule at most once per event.
///
/// After firing in one direction the latch stays closed for that direction
/// until the rule's condition stops holding, or until it fires the other way.
#[derive(Debug, Clone, Default)]
struct Latch {
    last_fired: Option<TradingSide>,
    rearmed: bool,
}

impl Latch {
    fn observe(
        &mut self,
        condition: Option<TradingSide>,
        trigger: Option<TradingSide>,
    ) -> Option<TradingSide> {
        if let Some(side) = trigger {
            if self.last_fired != Some(side) || self.rearmed {
                self.last_fired = Some(side);
                self.rearmed = false;
                return Some(side);
            }
        }

        if self.last_fired.is_some() && condition != self.last_fired {
            self.rearmed = true;
        }
        None
    }
}

#[derive(Debug, Clone, Default)]
struct SymbolLatches {
    ema_cross: Latch,
    breakout: Latch,
}

/// Detects EMA crosses and Donchian breakouts from indicator snapshots.
///
/// The two rules are independent; a single snapshot can yield one signal
/// from each.
#[derive(Debug, Default)]
pub struct SignalEngine {
    latches: HashMap<String, SymbolLatches>,
}

impl SignalEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_snapshot(&mut self, snapshot: &IndicatorSnapshot) -> Vec<Signal> {
        let latches = self.latches.entry(snapshot.symbol.clone()).or_default();
        let mut signals = Vec::with_capacity(2);

        let (condition, trigger) = ema_cross(snapshot);
        if let Some(side) = latches.ema_cross.observe(condition, trigger) {
            signals.push(Self::signal(snapshot, side, SignalKind::EmaCross));
        }

        let state = breakout(snapshot);
        if let Some(side) = latches.breakout.observe(state, state) {
            signals.push(Self::signal(snapshot, side, SignalKind::DonchianBreakout));
        }

        if signals.is_empty() {
            debug!(
                "{} close={} EMA fast={:?} slow={:?} Donchian=({:?}, {:?}): no signal",
                snapshot.symbol,
                snapshot.close,
                snapshot.fast_ema,
                snapshot.slow_ema,
                snapshot.donchian_low,
                snapshot.donchian_high
            );
        }

        signals
    }

    fn signal(snapshot: &IndicatorSnapshot, side: TradingSide, kind: SignalKind) -> Signal {
        info!("🎯 SIGNAL | {} {} {} @ {}", snapshot.symbol, kind, side, snapshot.close);
        Signal {
            symbol: snapshot.symbol.clone(),
            side,
            kind,
            trigger_price: snapshot.close,
            timestamp: snapshot.timestamp,
            atr: snapshot.atr,
        }
    }
}

/// Current ordering of the EMAs, and a trigger when that ordering just
/// changed sign.
fn ema_cross(s: &IndicatorSnapshot) -> (Option<TradingSide>, Option<TradingSide>) {
    let (Some(fast), Some(slow)) = (s.fast_ema, s.slow_ema) else {
        return (None, None);
    };

    let condition = if fast > slow {
        Some(TradingSide::Buy)
    } else if fast < slow {
        Some(TradingSide::Sell)
    } else {
        None
    };

    let (Some(prior_fast), Some(prior_slow)) = (s.prior_fast_ema, s.prior_slow_ema) else {
        return (condition, None);
    };

    let trigger = if prior_fast <= prior_slow && fast > slow {
        Some(TradingSide::Buy)
    } else if prior_fast >= prior_slow && fast < slow {
        Some(TradingSide::Sell)
    } else {
        None
    };

    (condition, trigger)
}

fn breakout(s: &IndicatorSnapshot) -> Option<TradingSide> {
    let (Some(high), Some(low)) = (s.donchian_high, s.donchian_low) else {
        return None;
    };

    if s.close > high {
        Some(TradingSide::Buy)
    } else if s.close < low {
        Some(TradingSide::Sell)
    } else {
        None
    }
}
