use anyhow::{bail, Context, Result};
use base64::Engine;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures_util::{SinkExt, StreamExt};
use rand::Rng;
use serde::Serialize;
use serde_json::Value;
use solana_sdk::pubkey::Pubkey;
use std::fmt;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::time::{sleep, timeout, Duration, Instant};
use tokio_tungstenite::{connect_async, tungstenite::protocol::Message};
use tracing::{debug, error, info, instrument, warn};
use url::Url;

use super::decoder::{decode_pool, DecodeError};
use crate::core::types::{LogEvent, Pool, PriceSample, TokenId};

/// Reconnect behaviour shared by every subscription
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ReconnectPolicy {
    /// Base delay between reconnection attempts
    pub delay: Duration,
    /// Upper bound of the random jitter added to each delay
    pub jitter: Duration,
    /// Growth factor per consecutive failure; 1.0 keeps the delay fixed
    pub backoff_multiplier: f64,
    /// Ceiling for the delay once backoff is in effect
    pub max_delay: Duration,
    /// Connection timeout
    pub connect_timeout: Duration,
    /// How long to wait for the subscription ack
    pub ack_timeout: Duration,
    /// Ping interval to keep the connection alive
    pub heartbeat_interval: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            delay: Duration::from_secs(3),
            jitter: Duration::from_millis(250),
            backoff_multiplier: 1.0,
            max_delay: Duration::from_secs(60),
            connect_timeout: Duration::from_secs(15),
            ack_timeout: Duration::from_secs(10),
            heartbeat_interval: Duration::from_secs(2),
        }
    }
}

impl ReconnectPolicy {
    /// Delay before reconnect attempt number `attempt` (1-based consecutive failures).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(32) as i32;
        let base_ms = self.delay.as_millis() as f64 * self.backoff_multiplier.powi(exponent);
        let capped_ms = base_ms.min(self.max_delay.as_millis().max(self.delay.as_millis()) as f64);
        Duration::from_millis(capped_ms as u64) + self.jitter_sample()
    }

    fn jitter_sample(&self) -> Duration {
        let max_ms = self.jitter.as_millis() as u64;
        if max_ms == 0 {
            return Duration::ZERO;
        }
        Duration::from_millis(rand::thread_rng().gen_range(0..=max_ms))
    }
}

/// Cooperative stop signal.
///
/// A child signal fires when it is stopped itself or when any ancestor is
/// stopped; stopping a child leaves the parent running.
#[derive(Debug, Clone)]
pub struct StopSignal {
    chain: Vec<Arc<watch::Sender<bool>>>,
}

impl Default for StopSignal {
    fn default() -> Self {
        Self::new()
    }
}

impl StopSignal {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(false);
        Self {
            chain: vec![Arc::new(tx)],
        }
    }

    pub fn child(&self) -> Self {
        let (tx, _) = watch::channel(false);
        let mut chain = self.chain.clone();
        chain.push(Arc::new(tx));
        Self { chain }
    }

    pub fn stop(&self) {
        if let Some(own) = self.chain.last() {
            own.send_replace(true);
        }
    }

    pub fn is_stopped(&self) -> bool {
        self.chain.iter().any(|tx| *tx.borrow())
    }

    /// Resolves once this signal or any ancestor has been stopped.
    pub async fn stopped(&self) {
        let waits = self.chain.iter().map(|tx| {
            let mut rx = tx.subscribe();
            Box::pin(async move {
                let _ = rx.wait_for(|stopped| *stopped).await;
            })
        });
        futures_util::future::select_all(waits).await;
    }
}

/// JSON-RPC request for Solana WebSocket subscriptions
#[derive(Debug, Serialize)]
pub struct JsonRpcRequest {
    pub jsonrpc: String,
    pub id: u64,
    pub method: String,
    pub params: Value,
}

/// Streams this crate subscribes to
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Subscription {
    /// Log lines of transactions mentioning an address
    Logs { mentions: Pubkey },
    /// Raw data of a single account
    Account { address: Pubkey },
}

impl Subscription {
    pub fn request(&self, id: u64) -> JsonRpcRequest {
        let (method, params) = match self {
            Subscription::Logs { mentions } => (
                "logsSubscribe",
                serde_json::json!([
                    {"mentions": [mentions.to_string()]},
                    {"commitment": "processed"}
                ]),
            ),
            Subscription::Account { address } => (
                "accountSubscribe",
                serde_json::json!([
                    address.to_string(),
                    {"encoding": "base64", "commitment": "processed"}
                ]),
            ),
        };
        JsonRpcRequest {
            jsonrpc: "2.0".to_string(),
            id,
            method: method.to_string(),
            params,
        }
    }
}

impl fmt::Display for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Subscription::Logs { mentions } => write!(f, "logs({})", mentions),
            Subscription::Account { address } => write!(f, "account({})", address),
        }
    }
}

/// Notification payloads after unwrapping the JSON-RPC envelope
#[derive(Debug, Clone, PartialEq)]
pub enum Notification {
    Logs(LogEvent),
    Account(Vec<u8>),
}

/// Classified websocket text frame
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    /// Subscription confirmed with the node-assigned id
    Ack(u64),
    /// JSON-RPC error response
    Error(String),
    Notification(Notification),
    Ignored,
}

/// Classifies a text frame received on a subscription socket.
pub fn parse_frame(text: &str) -> Result<Frame, DecodeError> {
    let value: Value = serde_json::from_str(text)?;

    if let Some(error) = value.get("error") {
        return Ok(Frame::Error(error.to_string()));
    }

    match value.get("method").and_then(Value::as_str) {
        Some("logsNotification") => {
            let inner = value
                .pointer("/params/result/value")
                .cloned()
                .ok_or(DecodeError::MissingField("params.result.value"))?;
            let event: LogEvent = serde_json::from_value(inner)?;
            Ok(Frame::Notification(Notification::Logs(event)))
        }
        Some("accountNotification") => {
            let encoded = value
                .pointer("/params/result/value/data/0")
                .and_then(Value::as_str)
                .ok_or(DecodeError::MissingField("params.result.value.data[0]"))?;
            let bytes = base64::engine::general_purpose::STANDARD.decode(encoded)?;
            Ok(Frame::Notification(Notification::Account(bytes)))
        }
        Some(_) => Ok(Frame::Ignored),
        None => match (value.get("id"), value.get("result")) {
            (Some(_), Some(result)) => Ok(Frame::Ack(result.as_u64().unwrap_or_default())),
            _ => Ok(Frame::Ignored),
        },
    }
}

/// How a single websocket session ended without error
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SessionEnd {
    Stopped,
    ConsumerGone,
}

/// Reconnecting subscription source backed by one websocket endpoint
#[derive(Debug, Clone)]
pub struct EventSource {
    ws_url: String,
    policy: ReconnectPolicy,
}

impl EventSource {
    pub fn new(ws_url: impl Into<String>, policy: ReconnectPolicy) -> Self {
        Self {
            ws_url: ws_url.into(),
            policy,
        }
    }

    /// Starts a log subscription for `program`; events arrive on the returned
    /// receiver until `stop` fires.
    pub fn subscribe_logs(&self, program: Pubkey, stop: StopSignal) -> mpsc::Receiver<LogEvent> {
        let (tx, rx) = mpsc::channel(1024);
        let source = self.clone();
        tokio::spawn(async move {
            source
                .run_subscription(Subscription::Logs { mentions: program }, stop, tx, |n| match n {
                    Notification::Logs(event) => Some(event),
                    _ => None,
                })
                .await;
        });
        rx
    }

    /// Starts an account subscription; raw account bytes arrive on the returned
    /// receiver until `stop` fires or the receiver is dropped.
    pub fn subscribe_account(&self, address: Pubkey, stop: StopSignal) -> mpsc::Receiver<Vec<u8>> {
        let (tx, rx) = mpsc::channel(256);
        let source = self.clone();
        tokio::spawn(async move {
            source
                .run_subscription(Subscription::Account { address }, stop, tx, |n| match n {
                    Notification::Account(bytes) => Some(bytes),
                    _ => None,
                })
                .await;
        });
        rx
    }

    /// Keeps `subscription` alive until `stop` fires or the consumer goes away.
    /// There is no retry ceiling.
    #[instrument(skip(self, stop, tx, extract), fields(subscription = %subscription))]
    pub async fn run_subscription<T, F>(
        &self,
        subscription: Subscription,
        stop: StopSignal,
        tx: mpsc::Sender<T>,
        extract: F,
    ) where
        F: Fn(Notification) -> Option<T>,
    {
        let mut failures = 0u32;

        while !stop.is_stopped() {
            match self.stream_once(&subscription, &stop, &tx, &extract, &mut failures).await {
                Ok(SessionEnd::Stopped) => {
                    debug!("Subscription stopped");
                    break;
                }
                Ok(SessionEnd::ConsumerGone) => {
                    debug!("Subscription consumer dropped");
                    break;
                }
                Err(e) => {
                    failures = failures.saturating_add(1);
                    let delay = self.policy.delay_for(failures);
                    error!(
                        error = %e,
                        attempt = failures,
                        retry_in_ms = delay.as_millis() as u64,
                        "Subscription dropped, reconnecting"
                    );
                    tokio::select! {
                        _ = stop.stopped() => break,
                        _ = sleep(delay) => {}
                    }
                }
            }
        }
    }

    /// Connects, subscribes and forwards notifications for one session.
    async fn stream_once<T, F>(
        &self,
        subscription: &Subscription,
        stop: &StopSignal,
        tx: &mpsc::Sender<T>,
        extract: &F,
        failures: &mut u32,
    ) -> Result<SessionEnd>
    where
        F: Fn(Notification) -> Option<T>,
    {
        let url = Url::parse(&self.ws_url).context("Failed to parse WebSocket URL")?;
        let started = Instant::now();

        let connect = timeout(self.policy.connect_timeout, connect_async(url));
        let (ws_stream, _) = tokio::select! {
            _ = stop.stopped() => return Ok(SessionEnd::Stopped),
            result = connect => result
                .context("Connection timeout")?
                .context("Failed to connect to WebSocket")?,
        };
        let (mut write, mut read) = ws_stream.split();

        let request = serde_json::to_string(&subscription.request(1))
            .context("Failed to serialize JSON-RPC request")?;
        write
            .send(Message::Text(request))
            .await
            .context("Failed to send subscription request")?;

        let ack = async {
            while let Some(message) = read.next().await {
                if let Message::Text(text) = message.context("WebSocket receive error")? {
                    match parse_frame(&text) {
                        Ok(Frame::Ack(id)) => return Ok(id),
                        Ok(Frame::Error(error)) => bail!("subscription rejected: {}", error),
                        Ok(_) => {}
                        Err(e) => warn!(error = %e, "Unreadable frame while waiting for ack"),
                    }
                }
            }
            bail!("connection closed before subscription ack")
        };
        let subscription_id = tokio::select! {
            _ = stop.stopped() => return Ok(SessionEnd::Stopped),
            result = timeout(self.policy.ack_timeout, ack) => result.context("Subscription ack timeout")??,
        };

        *failures = 0;
        info!(
            subscription_id,
            latency_ms = started.elapsed().as_millis() as u64,
            "Subscribed to {}",
            subscription
        );

        let mut heartbeat = tokio::time::interval(self.policy.heartbeat_interval);
        heartbeat.tick().await;

        loop {
            tokio::select! {
                _ = stop.stopped() => {
                    let _ = write.close().await;
                    return Ok(SessionEnd::Stopped);
                }
                _ = heartbeat.tick() => {
                    write
                        .send(Message::Ping(Vec::new()))
                        .await
                        .context("Failed to send heartbeat")?;
                }
                message = read.next() => match message {
                    Some(Ok(Message::Text(text))) => match parse_frame(&text) {
                        Ok(Frame::Notification(notification)) => {
                            if let Some(item) = extract(notification) {
                                if tx.send(item).await.is_err() {
                                    let _ = write.close().await;
                                    return Ok(SessionEnd::ConsumerGone);
                                }
                            }
                        }
                        Ok(Frame::Error(error)) => bail!("subscription error: {}", error),
                        Ok(_) => {}
                        Err(e) => warn!(error = %e, "Dropping undecodable frame"),
                    },
                    Some(Ok(Message::Close(frame))) => bail!("connection closed by server: {:?}", frame),
                    Some(Ok(_)) => {}
                    Some(Err(e)) => return Err(e).context("WebSocket receive error"),
                    None => bail!("connection stream ended"),
                }
            }
        }
    }
}

/// Result of an account subscription request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscribeOutcome {
    Started,
    AlreadySubscribed,
}

/// Per-token account subscriptions that decode pool updates into price samples.
///
/// At most one live subscription exists per token; it is removed from the
/// registry when its stream ends.
#[derive(Debug, Clone)]
pub struct AccountSubscriptions {
    source: EventSource,
    active: Arc<DashMap<TokenId, Pubkey>>,
}

impl AccountSubscriptions {
    pub fn new(source: EventSource) -> Self {
        Self {
            source,
            active: Arc::new(DashMap::new()),
        }
    }

    pub fn active_count(&self) -> usize {
        self.active.len()
    }

    pub fn is_subscribed(&self, token: &TokenId) -> bool {
        self.active.contains_key(token)
    }

    /// Streams price samples for `pool` into `samples` until `stop` fires.
    /// A second request for a token that is already streaming is a no-op.
    pub fn subscribe(
        &self,
        pool: &Pool,
        stop: StopSignal,
        samples: mpsc::Sender<PriceSample>,
    ) -> SubscribeOutcome {
        match self.active.entry(pool.token) {
            Entry::Occupied(_) => {
                info!(token = %pool.token, "Already subscribed");
                return SubscribeOutcome::AlreadySubscribed;
            }
            Entry::Vacant(slot) => {
                slot.insert(pool.address);
            }
        }

        let mut raw = self.source.subscribe_account(pool.address, stop.clone());
        let active = Arc::clone(&self.active);
        let pool = pool.clone();

        tokio::spawn(async move {
            info!(token = %pool.token, pool = %pool.address, "Started price monitoring");
            loop {
                let bytes = tokio::select! {
                    _ = stop.stopped() => break,
                    next = raw.recv() => match next {
                        Some(bytes) => bytes,
                        None => break,
                    },
                };
                match sample_from_account(&pool, &bytes) {
                    Ok(sample) => {
                        if samples.send(sample).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => warn!(token = %pool.token, error = %e, "Dropping undecodable pool update"),
                }
            }
            active.remove(&pool.token);
            debug!(token = %pool.token, "Price monitoring ended");
        });

        SubscribeOutcome::Started
    }
}

fn sample_from_account(pool: &Pool, bytes: &[u8]) -> Result<PriceSample, DecodeError> {
    let decoded = decode_pool(bytes, pool.base_decimals, pool.quote_decimals)?;
    if decoded.base_mint != pool.token {
        return Err(DecodeError::Layout(format!(
            "pool base mint {} does not match {}",
            decoded.base_mint, pool.token
        )));
    }
    Ok(PriceSample {
        token: pool.token,
        price: decoded.price,
        raw_sqrt_price: decoded.raw_sqrt_price,
        pool_migrated: decoded.migrated,
        timestamp: chrono::Utc::now(),
    })
}
