use anyhow::Result;
use dashmap::DashMap;
use futures::stream::SplitStream;
use futures::{SinkExt, StreamExt};
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, info, warn};

use super::types::{KlineData, WsMessage};
use crate::indicators::PriceBar;

pub type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Public kline stream fanned out to one channel per symbol.
///
/// Only confirmed (closed) klines are forwarded, in arrival order.
pub struct KlineFeed {
    url: String,
    interval: String,
    routes: Arc<DashMap<String, mpsc::Sender<PriceBar>>>,
}

impl KlineFeed {
    pub fn new(url: String, interval: String) -> Self {
        Self {
            url,
            interval,
            routes: Arc::new(DashMap::new()),
        }
    }

    /// Route closed bars for `symbol` to `tx`.
    pub fn subscribe(&self, symbol: &str, tx: mpsc::Sender<PriceBar>) {
        info!("Subscribing to topic: {}", self.topic(symbol));
        self.routes.insert(symbol.to_string(), tx);
    }

    /// Drop every route so workers see their channel close.
    pub fn close(&self) {
        self.routes.clear();
    }

    fn topic(&self, symbol: &str) -> String {
        format!("kline.{}.{}", self.interval, symbol)
    }

    pub async fn connect(&self) -> Result<WsStream> {
        info!("Connecting to Bybit WebSocket: {}", self.url);

        let (ws_stream, response) = connect_async(&self.url).await?;

        info!("WebSocket connected: {:?}", response.status());

        Ok(ws_stream)
    }

    /// Run until every worker channel is closed, reconnecting on errors.
    pub async fn run(self: Arc<Self>) -> Result<()> {
        loop {
            match self.connect().await {
                Ok(ws_stream) => {
                    if let Err(e) = self.handle_stream(ws_stream).await {
                        error!("WebSocket error: {}", e);
                    }
                }
                Err(e) => {
                    error!("Connection failed: {}", e);
                }
            }

            self.routes.retain(|_, tx| !tx.is_closed());
            if self.routes.is_empty() {
                info!("No kline consumers left, stopping feed");
                return Ok(());
            }

            warn!("Reconnecting in 5s...");
            tokio::time::sleep(tokio::time::Duration::from_secs(5)).await;
        }
    }

    async fn handle_stream(&self, ws_stream: WsStream) -> Result<()> {
        let (write, mut read) = ws_stream.split();
        let write = Arc::new(tokio::sync::Mutex::new(write));

        let topics: Vec<String> = self.routes.iter().map(|r| self.topic(r.key())).collect();
        for topic in &topics {
            let sub_msg = serde_json::json!({
                "op": "subscribe",
                "args": [topic]
            });

            write.lock().await.send(Message::Text(sub_msg.to_string())).await?;
            info!("Subscribed to: {}", topic);
        }

        // Bybit drops public connections without an app-level ping every 20s.
        let ping_task = {
            let write = write.clone();

            tokio::spawn(async move {
                let mut interval = tokio::time::interval(tokio::time::Duration::from_secs(20));

                loop {
                    interval.tick().await;
                    let ping = serde_json::json!({ "op": "ping" }).to_string();
                    let mut w = write.lock().await;
                    if w.send(Message::Text(ping)).await.is_err() {
                        break;
                    }
                }
            })
        };

        let result = self.read_loop(&mut read).await;
        ping_task.abort();
        result
    }

    async fn read_loop(&self, read: &mut SplitStream<WsStream>) -> Result<()> {
        while let Some(msg) = read.next().await {
            match msg? {
                Message::Text(text) => match serde_json::from_str::<WsMessage>(&text) {
                    Ok(parsed) => self.route_message(parsed),
                    Err(e) => error!("Failed to parse message: {}", e),
                },
                Message::Pong(_) => {
                    debug!("Pong received");
                }
                Message::Close(_) => {
                    warn!("WebSocket closed by server");
                    break;
                }
                _ => {}
            }
        }
        Ok(())
    }

    /// Forward confirmed klines to the owning symbol's channel.
    pub fn route_message(&self, msg: WsMessage) {
        let symbol = match msg.kline_symbol() {
            Some(symbol) => symbol.to_string(),
            // Subscription acks and pongs.
            None => return,
        };
        let data = match msg.data {
            Some(data) => data,
            None => return,
        };
        let klines: Vec<KlineData> = match serde_json::from_value(data) {
            Ok(klines) => klines,
            Err(e) => {
                warn!("{}: malformed kline payload: {}", symbol, e);
                return;
            }
        };

        let tx = match self.routes.get(&symbol) {
            Some(tx) => tx.clone(),
            None => return,
        };

        for kline in klines.iter().filter(|k| k.confirm) {
            let bar = match kline.to_price_bar(&symbol) {
                Some(bar) => bar,
                None => {
                    warn!("{}: unparseable kline prices, dropping", symbol);
                    continue;
                }
            };
            if let Err(e) = tx.try_send(bar) {
                warn!("{}: worker not keeping up, dropping bar: {}", symbol, e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn kline_msg(confirm: bool, close: &str) -> WsMessage {
        serde_json::from_value(json!({
            "topic": "kline.15.BTCUSDT",
            "type": "snapshot",
            "data": [{
                "start": 1, "end": 900000, "interval": "15",
                "open": "100", "close": close, "high": "110", "low": "90",
                "confirm": confirm, "timestamp": 2
            }]
        }))
        .unwrap()
    }

    #[test]
    fn test_routes_only_confirmed_klines() {
        let feed = KlineFeed::new("wss://unused".to_string(), "15".to_string());
        let (tx, mut rx) = mpsc::channel(8);
        feed.subscribe("BTCUSDT", tx);

        feed.route_message(kline_msg(false, "101"));
        feed.route_message(kline_msg(true, "102"));

        let bar = rx.try_recv().unwrap();
        assert_eq!(bar.symbol, "BTCUSDT");
        assert_eq!(bar.close, 102.0);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_unknown_symbol_ignored() {
        let feed = KlineFeed::new("wss://unused".to_string(), "15".to_string());
        let (tx, mut rx) = mpsc::channel(8);
        feed.subscribe("ETHUSDT", tx);

        feed.route_message(kline_msg(true, "102"));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_unparseable_price_dropped() {
        let feed = KlineFeed::new("wss://unused".to_string(), "15".to_string());
        let (tx, mut rx) = mpsc::channel(8);
        feed.subscribe("BTCUSDT", tx);

        feed.route_message(kline_msg(true, "abc"));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_close_disconnects_workers() {
        let feed = KlineFeed::new("wss://unused".to_string(), "15".to_string());
        let (tx, mut rx) = mpsc::channel(8);
        feed.subscribe("BTCUSDT", tx);

        feed.close();
        assert_eq!(
            rx.try_recv(),
            Err(mpsc::error::TryRecvError::Disconnected)
        );
    }
}
