use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde_json::{json, Value};
use std::time::Duration;
use tracing::{debug, info, warn};

use super::auth::BybitAuth;
use super::types::{
    check_response, interval_millis, parse_has_position, parse_instrument_rules, parse_klines,
    parse_last_price,
};
use crate::error::ExchangeError;
use crate::exchange::{
    ExchangeClient, OrderAck, OrderRequest, OrderType, PriceSource, SymbolRules, TrailingStop,
};
use crate::indicators::PriceBar;
use crate::strategy::TradingSide;

/// Bybit v5 returns this when the requested leverage is already set.
const LEVERAGE_NOT_MODIFIED: i64 = 110043;

/// Bybit v5 returns this when an `orderLinkId` is reused.
const DUPLICATE_ORDER_LINK_ID: i64 = 110072;

/// REST client for Bybit v5 derivatives, `linear` category unless told
/// otherwise.
pub struct BybitClient {
    client: Client,
    auth: Option<BybitAuth>,
    rest_url: String,
    recv_window: u64,
    category: String,
}

impl BybitClient {
    pub fn new(
        rest_url: String,
        auth: Option<BybitAuth>,
        recv_window: u64,
        timeout: Duration,
    ) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .context("Failed to create HTTP client")?;
        Ok(Self {
            client,
            auth,
            rest_url,
            recv_window,
            category: "linear".to_string(),
        })
    }

    pub fn with_category(mut self, category: &str) -> Self {
        self.category = category.to_string();
        self
    }

    pub async fn set_leverage(&self, symbol: &str, leverage: u32) -> Result<()> {
        let body = json!({
            "category": self.category,
            "symbol": symbol,
            "buyLeverage": leverage.to_string(),
            "sellLeverage": leverage.to_string(),
        });

        let resp = self.signed_post(symbol, "/v5/position/set-leverage", &body).await?;
        let ret_code = resp["retCode"].as_i64().unwrap_or(-1);
        if ret_code == LEVERAGE_NOT_MODIFIED {
            debug!("{} leverage already {}x", symbol, leverage);
            return Ok(());
        }
        check_response(symbol, &resp)?;
        info!("⚙️  {} leverage set to {}x", symbol, leverage);
        Ok(())
    }

    /// Most recent closed bars, oldest first.
    pub async fn get_klines(
        &self,
        symbol: &str,
        interval: &str,
        limit: usize,
    ) -> Result<Vec<PriceBar>, ExchangeError> {
        let interval_ms = interval_millis(interval).ok_or_else(|| {
            ExchangeError::rejected(symbol, format!("unsupported kline interval {}", interval))
        })?;
        // One extra row for the kline still forming.
        let params = [
            ("category", self.category.clone()),
            ("symbol", symbol.to_string()),
            ("interval", interval.to_string()),
            ("limit", (limit + 1).min(1000).to_string()),
        ];
        let resp = self.public_get(symbol, "/v5/market/kline", &params).await?;
        let result = check_response(symbol, &resp)?;
        Ok(parse_klines(symbol, result, interval_ms))
    }

    async fn signed_post(
        &self,
        symbol: &str,
        path: &str,
        body: &Value,
    ) -> Result<Value, ExchangeError> {
        let auth = self.require_auth(symbol)?;
        let url = format!("{}{}", self.rest_url, path);
        let timestamp = BybitAuth::get_timestamp();
        let body_str = body.to_string();
        let sign = auth.generate_signature(timestamp, self.recv_window, &body_str);

        let response = self
            .client
            .post(&url)
            .header("X-BAPI-API-KEY", auth.get_api_key())
            .header("X-BAPI-SIGN", sign)
            .header("X-BAPI-SIGN-TYPE", "2")
            .header("X-BAPI-TIMESTAMP", timestamp.to_string())
            .header("X-BAPI-RECV-WINDOW", self.recv_window.to_string())
            .header("Content-Type", "application/json")
            .body(body_str)
            .send()
            .await
            .map_err(|e| ExchangeError::transport(symbol, e))?;

        response
            .json()
            .await
            .map_err(|e| ExchangeError::transport(symbol, e))
    }

    async fn signed_get(
        &self,
        symbol: &str,
        path: &str,
        params: &[(&str, String)],
    ) -> Result<Value, ExchangeError> {
        let auth = self.require_auth(symbol)?;
        let query = query_string(params);
        let url = format!("{}{}?{}", self.rest_url, path, query);
        let timestamp = BybitAuth::get_timestamp();
        let sign = auth.generate_signature(timestamp, self.recv_window, &query);

        let response = self
            .client
            .get(&url)
            .header("X-BAPI-API-KEY", auth.get_api_key())
            .header("X-BAPI-SIGN", sign)
            .header("X-BAPI-SIGN-TYPE", "2")
            .header("X-BAPI-TIMESTAMP", timestamp.to_string())
            .header("X-BAPI-RECV-WINDOW", self.recv_window.to_string())
            .send()
            .await
            .map_err(|e| ExchangeError::transport(symbol, e))?;

        response
            .json()
            .await
            .map_err(|e| ExchangeError::transport(symbol, e))
    }

    async fn public_get(
        &self,
        symbol: &str,
        path: &str,
        params: &[(&str, String)],
    ) -> Result<Value, ExchangeError> {
        let url = format!("{}{}?{}", self.rest_url, path, query_string(params));
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| ExchangeError::transport(symbol, e))?;

        response
            .json()
            .await
            .map_err(|e| ExchangeError::transport(symbol, e))
    }

    fn require_auth(&self, symbol: &str) -> Result<&BybitAuth, ExchangeError> {
        self.auth
            .as_ref()
            .ok_or_else(|| ExchangeError::rejected(symbol, "API credentials not configured"))
    }
}

#[async_trait]
impl ExchangeClient for BybitClient {
    async fn place_order(&self, request: &OrderRequest) -> Result<OrderAck, ExchangeError> {
        let body = order_body(&self.category, request)?;
        let resp = self
            .signed_post(&request.symbol, "/v5/order/create", &body)
            .await?;

        if resp["retCode"].as_i64() == Some(DUPLICATE_ORDER_LINK_ID) {
            return Err(ExchangeError::Duplicate {
                symbol: request.symbol.clone(),
                client_order_id: request.client_order_id.clone(),
            });
        }

        let result = match check_response(&request.symbol, &resp) {
            Ok(result) => result,
            Err(e) => {
                warn!("❌ Order rejected: {} | Request: {}", e, body);
                return Err(e);
            }
        };

        let order_id = result["orderId"].as_str().unwrap_or_default().to_string();
        if order_id.is_empty() {
            return Err(ExchangeError::rejected(
                &request.symbol,
                "order accepted without an orderId",
            ));
        }
        Ok(OrderAck { order_id })
    }

    async fn cancel_order(&self, symbol: &str, client_order_id: &str) -> Result<(), ExchangeError> {
        let body = json!({
            "category": self.category,
            "symbol": symbol,
            "orderLinkId": client_order_id,
        });
        let resp = self.signed_post(symbol, "/v5/order/cancel", &body).await?;
        check_response(symbol, &resp)?;
        debug!("{} order {} cancelled", symbol, client_order_id);
        Ok(())
    }

    async fn set_trailing_stop(&self, symbol: &str, stop: &TrailingStop) -> Result<(), ExchangeError> {
        let body = trailing_stop_body(&self.category, symbol, stop);
        let resp = self
            .signed_post(symbol, "/v5/position/trading-stop", &body)
            .await?;
        check_response(symbol, &resp)?;
        Ok(())
    }

    async fn get_symbol_rules(&self, symbol: &str) -> Result<SymbolRules, ExchangeError> {
        let params = [
            ("category", self.category.clone()),
            ("symbol", symbol.to_string()),
        ];
        let resp = self
            .public_get(symbol, "/v5/market/instruments-info", &params)
            .await?;
        let result = check_response(symbol, &resp)?;
        parse_instrument_rules(symbol, result)
    }

    async fn has_open_position(&self, symbol: &str) -> Result<bool, ExchangeError> {
        let params = [
            ("category", self.category.clone()),
            ("symbol", symbol.to_string()),
        ];
        let resp = self.signed_get(symbol, "/v5/position/list", &params).await?;
        let result = check_response(symbol, &resp)?;
        Ok(parse_has_position(result))
    }
}

#[async_trait]
impl PriceSource for BybitClient {
    async fn last_price(&self, symbol: &str) -> Result<f64, ExchangeError> {
        let params = [
            ("category", self.category.clone()),
            ("symbol", symbol.to_string()),
        ];
        let resp = self.public_get(symbol, "/v5/market/tickers", &params).await?;
        let result = check_response(symbol, &resp)?;
        parse_last_price(symbol, result)
    }
}

/// JSON body for `/v5/position/trading-stop` in one-way mode.
fn trailing_stop_body(category: &str, symbol: &str, stop: &TrailingStop) -> Value {
    json!({
        "category": category,
        "symbol": symbol,
        "tpslMode": "Full",
        "positionIdx": 0,
        "trailingStop": stop.distance.to_string(),
        "activePrice": stop.activation_price.to_string(),
    })
}

fn query_string(params: &[(&str, String)]) -> String {
    params
        .iter()
        .map(|(k, v)| format!("{}={}", k, v))
        .collect::<Vec<_>>()
        .join("&")
}

fn side_str(side: TradingSide) -> &'static str {
    match side {
        TradingSide::Buy => "Buy",
        TradingSide::Sell => "Sell",
    }
}

/// v5 `triggerDirection`: 1 fires when price rises to the trigger, 2 when it
/// falls to it.
fn trigger_direction(order_type: OrderType, side: TradingSide) -> u8 {
    match (order_type, side) {
        // A sell stop protects a long, so it fires on a fall.
        (OrderType::StopMarket, TradingSide::Sell) => 2,
        (OrderType::StopMarket, TradingSide::Buy) => 1,
        (_, TradingSide::Sell) => 1,
        (_, TradingSide::Buy) => 2,
    }
}

/// JSON body for `/v5/order/create`.
fn order_body(category: &str, request: &OrderRequest) -> Result<Value, ExchangeError> {
    let mut body = json!({
        "category": category,
        "symbol": request.symbol,
        "side": side_str(request.side),
        "qty": request.qty.to_string(),
        "reduceOnly": request.reduce_only,
        "orderLinkId": request.client_order_id,
    });

    let need_price = || {
        request
            .price
            .ok_or_else(|| ExchangeError::rejected(&request.symbol, "order needs a price"))
    };

    match request.order_type {
        OrderType::Market => {
            body["orderType"] = json!("Market");
        }
        OrderType::Limit => {
            body["orderType"] = json!("Limit");
            body["price"] = json!(need_price()?.to_string());
            body["timeInForce"] = json!("GTC");
        }
        OrderType::StopMarket | OrderType::TakeProfitMarket => {
            body["orderType"] = json!("Market");
            body["triggerPrice"] = json!(need_price()?.to_string());
            body["triggerDirection"] = json!(trigger_direction(request.order_type, request.side));
            body["triggerBy"] = json!("LastPrice");
            if request.order_type == OrderType::StopMarket {
                body["closeOnTrigger"] = json!(true);
            }
        }
    }

    Ok(body)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_market_entry_body() {
        let req = OrderRequest::new("BTCUSDT", TradingSide::Buy, OrderType::Market, 0.01);
        let body = order_body("linear", &req).unwrap();
        assert_eq!(body["orderType"], "Market");
        assert_eq!(body["side"], "Buy");
        assert_eq!(body["qty"], "0.01");
        assert_eq!(body["reduceOnly"], false);
        assert_eq!(body["orderLinkId"], req.client_order_id.as_str());
        assert!(body.get("price").is_none());
    }

    #[test]
    fn test_limit_body_requires_price() {
        let req = OrderRequest::new("BTCUSDT", TradingSide::Buy, OrderType::Limit, 0.01);
        assert!(order_body("linear", &req).is_err());

        let body = order_body("linear", &req.with_price(30000.5)).unwrap();
        assert_eq!(body["price"], "30000.5");
        assert_eq!(body["timeInForce"], "GTC");
    }

    #[test]
    fn test_protective_legs_for_long() {
        let sl = OrderRequest::new("BTCUSDT", TradingSide::Sell, OrderType::StopMarket, 0.01)
            .with_price(29520.45)
            .reduce_only();
        let body = order_body("linear", &sl).unwrap();
        assert_eq!(body["orderType"], "Market");
        assert_eq!(body["triggerPrice"], "29520.45");
        assert_eq!(body["triggerDirection"], 2);
        assert_eq!(body["reduceOnly"], true);
        assert_eq!(body["closeOnTrigger"], true);

        let tp = OrderRequest::new("BTCUSDT", TradingSide::Sell, OrderType::TakeProfitMarket, 0.01)
            .with_price(30480.45)
            .reduce_only();
        let body = order_body("linear", &tp).unwrap();
        assert_eq!(body["triggerDirection"], 1);
        assert!(body.get("closeOnTrigger").is_none());
    }

    #[test]
    fn test_protective_legs_for_short() {
        let sl = OrderRequest::new("ETHUSDT", TradingSide::Buy, OrderType::StopMarket, 0.1)
            .with_price(2100.0);
        assert_eq!(order_body("linear", &sl).unwrap()["triggerDirection"], 1);

        let tp = OrderRequest::new("ETHUSDT", TradingSide::Buy, OrderType::TakeProfitMarket, 0.1)
            .with_price(1900.0);
        assert_eq!(order_body("linear", &tp).unwrap()["triggerDirection"], 2);
    }

    #[test]
    fn test_trailing_stop_body() {
        let stop = TrailingStop {
            distance: 152.25,
            activation_price: 30450.0,
        };
        let body = trailing_stop_body("linear", "BTCUSDT", &stop);
        assert_eq!(body["trailingStop"], "152.25");
        assert_eq!(body["activePrice"], "30450");
        assert_eq!(body["positionIdx"], 0);
        assert_eq!(body["tpslMode"], "Full");
    }

    #[test]
    fn test_query_string_order() {
        let params = [
            ("category", "linear".to_string()),
            ("symbol", "BTCUSDT".to_string()),
        ];
        assert_eq!(query_string(&params), "category=linear&symbol=BTCUSDT");
    }

    #[tokio::test]
    async fn test_private_call_without_credentials() {
        let client = BybitClient::new(
            "http://127.0.0.1:9".to_string(),
            None,
            5000,
            Duration::from_millis(100),
        )
        .unwrap();
        let err = client.has_open_position("BTCUSDT").await.unwrap_err();
        assert!(matches!(err, ExchangeError::Rejected { .. }));
    }
}
