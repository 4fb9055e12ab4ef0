use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ExchangeError;
use crate::exchange::SymbolRules;
use crate::indicators::PriceBar;

/// One kline from the public `kline.{interval}.{symbol}` stream.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct KlineData {
    pub start: i64,
    pub end: i64,
    pub interval: String,
    pub open: String,
    pub close: String,
    pub high: String,
    pub low: String,
    /// True once the interval has closed.
    pub confirm: bool,
    pub timestamp: i64,
}

impl KlineData {
    /// Convert a kline into a bar stamped with its close time. `None` when a
    /// price field does not parse.
    pub fn to_price_bar(&self, symbol: &str) -> Option<PriceBar> {
        let close = self.close.parse().ok()?;
        let high = self.high.parse().ok()?;
        let low = self.low.parse().ok()?;
        Some(PriceBar::new(symbol, close, self.end).with_range(high, low))
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct WsMessage {
    pub topic: Option<String>,
    pub data: Option<Value>,
}

impl WsMessage {
    /// Symbol of a `kline.{interval}.{symbol}` topic.
    pub fn kline_symbol(&self) -> Option<&str> {
        let topic = self.topic.as_deref()?;
        let rest = topic.strip_prefix("kline.")?;
        rest.split_once('.').map(|(_, symbol)| symbol)
    }
}

fn parse_str_f64(value: &Value) -> Option<f64> {
    value.as_str().and_then(|s| s.parse().ok())
}

/// Check the v5 envelope and hand back `result`.
pub fn check_response<'a>(symbol: &str, resp: &'a Value) -> Result<&'a Value, ExchangeError> {
    let ret_code = resp["retCode"].as_i64().unwrap_or(-1);
    if ret_code != 0 {
        let msg = resp["retMsg"].as_str().unwrap_or("Unknown error");
        return Err(ExchangeError::rejected(
            symbol,
            format!("{} (retCode {})", msg, ret_code),
        ));
    }
    Ok(&resp["result"])
}

/// Rules from a `/v5/market/instruments-info` result.
pub fn parse_instrument_rules(symbol: &str, result: &Value) -> Result<SymbolRules, ExchangeError> {
    let info = result["list"]
        .as_array()
        .and_then(|list| list.iter().find(|i| i["symbol"].as_str() == Some(symbol)))
        .ok_or_else(|| ExchangeError::rejected(symbol, "instrument not listed"))?;

    let tick_size = info["priceFilter"]["tickSize"]
        .as_str()
        .ok_or_else(|| ExchangeError::rejected(symbol, "missing tickSize"))?;
    let qty_step = info["lotSizeFilter"]["qtyStep"]
        .as_str()
        .ok_or_else(|| ExchangeError::rejected(symbol, "missing qtyStep"))?;
    let min_qty = parse_str_f64(&info["lotSizeFilter"]["minOrderQty"])
        .ok_or_else(|| ExchangeError::rejected(symbol, "missing minOrderQty"))?;

    SymbolRules::from_steps(tick_size, qty_step, min_qty)
        .ok_or_else(|| ExchangeError::rejected(symbol, "invalid tickSize or qtyStep"))
}

/// `lastPrice` from a `/v5/market/tickers` result.
pub fn parse_last_price(symbol: &str, result: &Value) -> Result<f64, ExchangeError> {
    result["list"]
        .as_array()
        .and_then(|list| list.iter().find(|t| t["symbol"].as_str() == Some(symbol)))
        .and_then(|ticker| parse_str_f64(&ticker["lastPrice"]))
        .filter(|price| *price > 0.0)
        .ok_or_else(|| ExchangeError::rejected(symbol, "no last price in ticker"))
}

/// Whether a `/v5/position/list` result holds a non-zero position.
pub fn parse_has_position(result: &Value) -> bool {
    result["list"]
        .as_array()
        .map(|list| {
            list.iter()
                .filter_map(|p| parse_str_f64(&p["size"]))
                .any(|size| size.abs() > 0.0)
        })
        .unwrap_or(false)
}

/// Closed bars from a `/v5/market/kline` result, oldest first.
///
/// The REST list is newest first and its head is the still-forming kline,
/// which is skipped. `interval_ms` turns each start time into a close time
/// matching the live stream's `end`.
pub fn parse_klines(symbol: &str, result: &Value, interval_ms: i64) -> Vec<PriceBar> {
    let rows = match result["list"].as_array() {
        Some(rows) => rows,
        None => return Vec::new(),
    };

    let mut bars: Vec<PriceBar> = rows
        .iter()
        .skip(1)
        .filter_map(|row| {
            let start: i64 = row.get(0)?.as_str()?.parse().ok()?;
            let high = parse_str_f64(row.get(2)?)?;
            let low = parse_str_f64(row.get(3)?)?;
            let close = parse_str_f64(row.get(4)?)?;
            Some(PriceBar::new(symbol, close, start + interval_ms - 1).with_range(high, low))
        })
        .collect();
    bars.reverse();
    bars
}

/// Milliseconds in a Bybit kline interval ("1", "15", "60", "D", "W").
pub fn interval_millis(interval: &str) -> Option<i64> {
    match interval {
        "D" => Some(86_400_000),
        "W" => Some(7 * 86_400_000),
        "M" => None,
        minutes => minutes.parse::<i64>().ok().map(|m| m * 60_000),
    }
}
