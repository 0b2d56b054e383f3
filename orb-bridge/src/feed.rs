//! WebSocket tick feed
//!
//! Connects to a market data server, subscribes each configured symbol and
//! forwards every parsed tick into the session's channel. Lost connections
//! are re-established after `reconnect_interval` until
//! `max_reconnect_attempts` consecutive failures.
//!
//! Three message shapes are understood, alone or batched in a JSON array:
//!
//! * a native [`Tick`] (`{"symbol", "price", "volume", "timestamp"}`)
//! * a trade print `{"results": {"P": price, "S": size, "t": ns, "T": symbol}}`
//! * an aggregate bar `{"sym", "c": close, "v": volume, "s": start_ms}`

use crate::errors::{FeedError, FeedResult};
use chrono::{DateTime, Utc};
use futures_util::{SinkExt, StreamExt};
use orb_core::Tick;
use serde_json::Value;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, RwLock};
use tokio::task::JoinHandle;
use tokio::time::{interval, timeout};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, error, info, warn};
use url::Url;

/// WebSocket connection status
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    Failed,
}

/// Feed health metrics
#[derive(Debug, Clone, Default)]
pub struct FeedMetrics {
    pub messages_received: u64,
    pub ticks_parsed: u64,
    pub parse_errors: u64,
    pub connection_errors: u64,
    pub reconnection_count: u64,
    pub last_message_time: Option<Instant>,
}

#[derive(Debug, Clone)]
pub struct FeedConfig {
    pub url: String,
    pub symbols: Vec<String>,
    pub ping_interval: Duration,
    pub reconnect_interval: Duration,
    pub max_reconnect_attempts: u32,
    pub message_timeout: Duration,
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self {
            url: "ws://localhost:8765".to_string(),
            symbols: Vec::new(),
            ping_interval: Duration::from_secs(30),
            reconnect_interval: Duration::from_secs(3),
            max_reconnect_attempts: 10,
            message_timeout: Duration::from_secs(60),
        }
    }
}

impl FeedConfig {
    pub fn new(url: impl Into<String>, symbols: Vec<String>) -> Self {
        Self {
            url: url.into(),
            symbols,
            ..Self::default()
        }
    }
}

/// Why one connection ended
enum Disconnect {
    ReceiverClosed,
    Lost,
}

pub struct WebSocketTickFeed {
    config: FeedConfig,
    status: Arc<RwLock<ConnectionStatus>>,
    metrics: Arc<RwLock<FeedMetrics>>,
}

impl WebSocketTickFeed {
    pub fn new(config: FeedConfig) -> Self {
        Self {
            config,
            status: Arc::new(RwLock::new(ConnectionStatus::Disconnected)),
            metrics: Arc::new(RwLock::new(FeedMetrics::default())),
        }
    }

    pub async fn get_status(&self) -> ConnectionStatus {
        *self.status.read().await
    }

    pub async fn get_metrics(&self) -> FeedMetrics {
        self.metrics.read().await.clone()
    }

    /// Run the feed on its own task
    pub fn spawn(self: Arc<Self>, sender: mpsc::Sender<Tick>) -> JoinHandle<FeedResult<()>> {
        tokio::spawn(async move { self.run(sender).await })
    }

    /// Stream ticks into `sender` until its receiver is dropped or the
    /// reconnect budget is spent
    pub async fn run(&self, sender: mpsc::Sender<Tick>) -> FeedResult<()> {
        let url = Url::parse(&self.config.url)?;
        let mut reconnect_attempts = 0;

        loop {
            *self.status.write().await = if reconnect_attempts > 0 {
                ConnectionStatus::Reconnecting
            } else {
                ConnectionStatus::Connecting
            };

            let ws = match connect_async(url.clone()).await {
                Ok((ws, _)) => ws,
                Err(e) => {
                    error!("❌ Failed to connect to {}: {}", self.config.url, e);
                    self.metrics.write().await.connection_errors += 1;
                    reconnect_attempts += 1;

                    if reconnect_attempts >= self.config.max_reconnect_attempts {
                        error!("Max reconnection attempts reached, giving up");
                        *self.status.write().await = ConnectionStatus::Failed;
                        return Err(FeedError::ReconnectExhausted {
                            attempts: reconnect_attempts,
                        });
                    }

                    tokio::time::sleep(self.config.reconnect_interval).await;
                    continue;
                }
            };

            info!("✅ Connected to {}", self.config.url);
            *self.status.write().await = ConnectionStatus::Connected;
            reconnect_attempts = 0;

            let (mut sink, mut stream) = ws.split();
            for symbol in &self.config.symbols {
                let message = subscribe_message(symbol);
                if let Err(e) = sink.send(Message::Text(message.to_string())).await {
                    error!("Failed to subscribe to {}: {}", symbol, e);
                } else {
                    info!("  → Subscribed to {}", symbol);
                }
            }

            let mut ping_interval = interval(self.config.ping_interval);
            ping_interval.tick().await;

            let disconnect = loop {
                tokio::select! {
                    _ = sender.closed() => break Disconnect::ReceiverClosed,

                    received = timeout(self.config.message_timeout, stream.next()) => {
                        let message = match received {
                            Ok(Some(Ok(message))) => message,
                            Ok(Some(Err(e))) => {
                                error!("WebSocket error: {}", e);
                                self.metrics.write().await.connection_errors += 1;
                                break Disconnect::Lost;
                            }
                            Ok(None) => {
                                warn!("WebSocket connection closed");
                                break Disconnect::Lost;
                            }
                            Err(_) => {
                                warn!(
                                    "No message for {}s, reconnecting",
                                    self.config.message_timeout.as_secs()
                                );
                                break Disconnect::Lost;
                            }
                        };

                        {
                            let mut metrics = self.metrics.write().await;
                            metrics.messages_received += 1;
                            metrics.last_message_time = Some(Instant::now());
                        }

                        match self.process_message(message, &sender).await {
                            Ok(true) => {}
                            Ok(false) => break Disconnect::Lost,
                            Err(FeedError::ReceiverClosed) => break Disconnect::ReceiverClosed,
                            Err(e) => {
                                warn!("Failed to process message: {}", e);
                                self.metrics.write().await.parse_errors += 1;
                            }
                        }
                    }

                    _ = ping_interval.tick() => {
                        if let Err(e) = sink.send(Message::Ping(Vec::new())).await {
                            error!("Failed to send ping: {}", e);
                            break Disconnect::Lost;
                        }
                    }
                }
            };

            *self.status.write().await = ConnectionStatus::Disconnected;
            match disconnect {
                Disconnect::ReceiverClosed => {
                    info!("Tick receiver closed, stopping feed");
                    let _ = sink.close().await;
                    return Ok(());
                }
                Disconnect::Lost => {
                    self.metrics.write().await.reconnection_count += 1;
                    warn!(
                        "🔌 Feed disconnected, reconnecting in {:?}",
                        self.config.reconnect_interval
                    );
                    tokio::time::sleep(self.config.reconnect_interval).await;
                }
            }
        }
    }

    /// Returns `Ok(false)` when the server closed the connection
    async fn process_message(&self, message: Message, sender: &mpsc::Sender<Tick>) -> FeedResult<bool> {
        match message {
            Message::Text(text) => {
                let ticks = parse_message(&text)?;
                self.metrics.write().await.ticks_parsed += ticks.len() as u64;
                for tick in ticks {
                    sender.send(tick).await.map_err(|_| FeedError::ReceiverClosed)?;
                }
            }
            Message::Binary(_) => debug!("Received binary message"),
            Message::Pong(_) => debug!("Received pong"),
            Message::Close(frame) => {
                info!("WebSocket close frame: {:?}", frame);
                return Ok(false);
            }
            _ => debug!("Received other message type"),
        }
        Ok(true)
    }
}

pub fn subscribe_message(symbol: &str) -> Value {
    serde_json::json!({
        "type": "subscribe",
        "symbol": symbol,
    })
}

/// Parse one text frame into zero or more ticks. Frames that are valid JSON
/// but carry no market data (status messages, acks) yield nothing.
pub fn parse_message(text: &str) -> FeedResult<Vec<Tick>> {
    let value: Value = serde_json::from_str(text)?;
    match value {
        Value::Array(items) => {
            let mut ticks = Vec::with_capacity(items.len());
            for item in items {
                if let Some(tick) = parse_value(item)? {
                    ticks.push(tick);
                }
            }
            Ok(ticks)
        }
        other => Ok(parse_value(other)?.into_iter().collect()),
    }
}

fn parse_value(value: Value) -> FeedResult<Option<Tick>> {
    if let Some(results) = value.get("results") {
        return parse_trade(results).map(Some);
    }
    if value.get("sym").is_some() && value.get("c").is_some() {
        return parse_bar(&value).map(Some);
    }
    if value.get("symbol").is_some() && value.get("price").is_some() {
        return Ok(Some(serde_json::from_value(value)?));
    }
    debug!("Ignoring non-market message: {}", value);
    Ok(None)
}

fn parse_trade(results: &Value) -> FeedResult<Tick> {
    let symbol = str_field(results, "T")?;
    let price = f64_field(results, "P")?;
    let volume = volume_field(results, "S");
    let timestamp = match results.get("t").and_then(Value::as_i64) {
        Some(ns) => from_nanos(ns)?,
        None => Utc::now(),
    };
    Ok(Tick::new(symbol, price, volume, timestamp))
}

fn parse_bar(bar: &Value) -> FeedResult<Tick> {
    let symbol = str_field(bar, "sym")?;
    let price = f64_field(bar, "c")?;
    let volume = volume_field(bar, "v");
    let timestamp = match bar.get("s").and_then(Value::as_i64) {
        Some(ms) => DateTime::<Utc>::from_timestamp_millis(ms)
            .ok_or_else(|| FeedError::Parse(format!("bar start {} out of range", ms)))?,
        None => Utc::now(),
    };
    Ok(Tick::new(symbol, price, volume, timestamp))
}

fn from_nanos(ns: i64) -> FeedResult<DateTime<Utc>> {
    let secs = ns.div_euclid(1_000_000_000);
    let nanos = ns.rem_euclid(1_000_000_000) as u32;
    DateTime::<Utc>::from_timestamp(secs, nanos)
        .ok_or_else(|| FeedError::Parse(format!("trade timestamp {} out of range", ns)))
}

fn str_field<'a>(value: &'a Value, key: &str) -> FeedResult<&'a str> {
    value
        .get(key)
        .and_then(Value::as_str)
        .ok_or_else(|| FeedError::Parse(format!("missing string field '{}'", key)))
}

fn f64_field(value: &Value, key: &str) -> FeedResult<f64> {
    value
        .get(key)
        .and_then(Value::as_f64)
        .ok_or_else(|| FeedError::Parse(format!("missing numeric field '{}'", key)))
}

fn volume_field(value: &Value, key: &str) -> u64 {
    value
        .get(key)
        .and_then(Value::as_f64)
        .filter(|v| *v > 0.0)
        .map(|v| v as u64)
        .unwrap_or(0)
}
