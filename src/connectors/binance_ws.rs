//! Binance private user-data streams.
//!
//! One listen key per market, kept alive every 30 minutes while the socket is
//! open. Dropped sockets and failed listen key requests are retried after a
//! fixed 5 second pause until the stream is shut down. Rejected credentials
//! stop that market for good.

use super::binance::{map_http_error, EXCHANGE_NAME};
use super::{ConnectorError, ConnectorErrorKind, ConnectorResult, RateLimiter, RealtimeCallback};
use crate::services::normalizer::{self, usd_price};
use crate::types::{MarketType, RawBalance, RawOrder, RawPosition, RawTrade, RealtimeUpdate};
use futures_util::{SinkExt, StreamExt};
use reqwest::{Client, Method};
use serde::Deserialize;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex, RwLock};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, error, info, warn};

const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(30 * 60);
const RECONNECT_DELAY: Duration = Duration::from_secs(5);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Where one market's stream lives.
#[derive(Debug, Clone)]
pub struct StreamEndpoint {
    pub market: MarketType,
    pub rest_url: String,
    pub listen_key_path: &'static str,
    pub ws_url: String,
}

// =============================================================================
// Stream payloads
// =============================================================================

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ListenKeyResponse {
    listen_key: String,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "e")]
enum UserEvent {
    #[serde(rename = "outboundAccountPosition")]
    AccountPosition {
        #[serde(rename = "B")]
        balances: Vec<WsSpotBalance>,
    },
    #[serde(rename = "executionReport")]
    ExecutionReport(WsOrder),
    #[serde(rename = "ACCOUNT_UPDATE")]
    AccountUpdate {
        #[serde(rename = "E")]
        event_time: i64,
        #[serde(rename = "a")]
        account: WsAccount,
    },
    #[serde(rename = "ORDER_TRADE_UPDATE")]
    OrderTradeUpdate {
        #[serde(rename = "o")]
        order: WsOrder,
    },
    #[serde(rename = "listenKeyExpired")]
    ListenKeyExpired,
}

#[derive(Debug, Deserialize)]
struct WsSpotBalance {
    #[serde(rename = "a")]
    asset: String,
    #[serde(rename = "f")]
    free: String,
    #[serde(rename = "l")]
    locked: String,
}

#[derive(Debug, Deserialize)]
struct WsAccount {
    #[serde(rename = "B", default)]
    balances: Vec<WsFuturesBalance>,
    #[serde(rename = "P", default)]
    positions: Vec<WsFuturesPosition>,
}

#[derive(Debug, Deserialize)]
struct WsFuturesBalance {
    #[serde(rename = "a")]
    asset: String,
    #[serde(rename = "wb")]
    wallet_balance: String,
    #[serde(rename = "cw")]
    cross_wallet: String,
}

#[derive(Debug, Deserialize)]
struct WsFuturesPosition {
    #[serde(rename = "s")]
    symbol: String,
    #[serde(rename = "pa")]
    amount: String,
    #[serde(rename = "ep")]
    entry_price: String,
    #[serde(rename = "up")]
    unrealized_pnl: String,
    #[serde(rename = "ps", default)]
    position_side: String,
}

/// Order event shared by spot `executionReport` and the futures `o` object.
#[derive(Debug, Deserialize)]
struct WsOrder {
    #[serde(rename = "s")]
    symbol: String,
    #[serde(rename = "c", default)]
    client_order_id: Option<String>,
    #[serde(rename = "S")]
    side: String,
    #[serde(rename = "o")]
    order_type: String,
    #[serde(rename = "f", default)]
    time_in_force: Option<String>,
    #[serde(rename = "q")]
    quantity: String,
    #[serde(rename = "p")]
    price: String,
    #[serde(rename = "x")]
    execution_type: String,
    #[serde(rename = "X")]
    status: String,
    #[serde(rename = "i")]
    order_id: u64,
    #[serde(rename = "l")]
    last_qty: String,
    #[serde(rename = "z")]
    cumulative_qty: String,
    #[serde(rename = "L")]
    last_price: String,
    #[serde(rename = "n", default)]
    commission: Option<String>,
    #[serde(rename = "N", default)]
    commission_asset: Option<String>,
    #[serde(rename = "T")]
    transaction_time: i64,
    #[serde(rename = "t", default)]
    trade_id: i64,
    #[serde(rename = "m", default)]
    is_maker: bool,
    #[serde(rename = "rp", default)]
    realized_pnl: Option<String>,
}

/// Result of decoding one stream frame.
#[derive(Debug, PartialEq)]
pub(crate) enum StreamEvent {
    Updates(Vec<RealtimeUpdate>),
    ListenKeyExpired,
}

fn order_updates(order: WsOrder, market: MarketType) -> Vec<RealtimeUpdate> {
    let raw_order = RawOrder {
        order_id: order.order_id.to_string(),
        client_order_id: order.client_order_id.clone(),
        symbol: order.symbol.clone(),
        side: order.side.clone(),
        order_type: order.order_type.clone(),
        price: order.price.clone(),
        orig_qty: order.quantity.clone(),
        executed_qty: order.cumulative_qty.clone(),
        status: order.status.clone(),
        time_in_force: order.time_in_force.clone(),
        market,
        time: order.transaction_time,
    };
    let mut updates = vec![RealtimeUpdate::Order(normalizer::normalize_order(&raw_order, EXCHANGE_NAME))];

    if order.execution_type == "TRADE" {
        let raw_trade = RawTrade {
            trade_id: order.trade_id.to_string(),
            order_id: order.order_id.to_string(),
            symbol: order.symbol,
            side: order.side,
            price: order.last_price,
            qty: order.last_qty,
            commission: order.commission.unwrap_or_default(),
            commission_asset: order.commission_asset.unwrap_or_default(),
            realized_pnl: order.realized_pnl,
            is_maker: order.is_maker,
            market,
            time: order.transaction_time,
        };
        updates.push(RealtimeUpdate::Trade(normalizer::normalize_trade(&raw_trade, EXCHANGE_NAME)));
    }
    updates
}

/// Decode a user-data frame. Unknown event types yield `None`.
pub(crate) fn parse_message(market: MarketType, text: &str) -> Option<StreamEvent> {
    let event: UserEvent = match serde_json::from_str(text) {
        Ok(event) => event,
        Err(e) => {
            debug!("Ignoring Binance {} stream message: {}", market, e);
            return None;
        }
    };

    let updates = match event {
        UserEvent::ListenKeyExpired => return Some(StreamEvent::ListenKeyExpired),
        UserEvent::AccountPosition { balances } => balances
            .into_iter()
            .map(|b| {
                let price = usd_price(&b.asset);
                let raw = RawBalance {
                    asset: b.asset,
                    free: b.free,
                    locked: b.locked,
                    total: None,
                    market: MarketType::Spot,
                };
                RealtimeUpdate::Balance(normalizer::normalize_balance(&raw, EXCHANGE_NAME, price))
            })
            .collect(),
        UserEvent::AccountUpdate { event_time, account } => {
            let balances = account.balances.into_iter().map(|b| {
                let price = usd_price(&b.asset);
                let raw = RawBalance {
                    asset: b.asset,
                    free: b.cross_wallet,
                    locked: "0".to_string(),
                    total: Some(b.wallet_balance),
                    market: MarketType::Futures,
                };
                RealtimeUpdate::Balance(normalizer::normalize_balance(&raw, EXCHANGE_NAME, price))
            });
            let positions = account.positions.into_iter().map(|p| {
                // The event carries unrealized PnL but no mark price
                let amount = normalizer::parse_num(&p.amount);
                let entry = normalizer::parse_num(&p.entry_price);
                let mark = if amount != 0.0 {
                    entry + normalizer::parse_num(&p.unrealized_pnl) / amount
                } else {
                    entry
                };
                let raw = RawPosition {
                    symbol: p.symbol,
                    position_amt: p.amount,
                    position_side: p.position_side,
                    entry_price: p.entry_price,
                    mark_price: mark.to_string(),
                    leverage: None,
                    liquidation_price: None,
                    update_time: event_time,
                };
                RealtimeUpdate::Position(normalizer::normalize_position(&raw, EXCHANGE_NAME))
            });
            balances.chain(positions).collect()
        }
        UserEvent::ExecutionReport(order) => order_updates(order, MarketType::Spot),
        UserEvent::OrderTradeUpdate { order } => order_updates(order, MarketType::Futures),
    };
    Some(StreamEvent::Updates(updates))
}

enum ConnectionEnd {
    Shutdown,
    Disconnected,
}

/// Credentials the exchange refuses will not start working on retry.
fn is_fatal(e: &ConnectorError) -> bool {
    matches!(e.kind(), ConnectorErrorKind::Auth | ConnectorErrorKind::Permission)
}

/// Market tasks started by one subscribe.
struct RunningStreams {
    stop: watch::Sender<bool>,
    active: Arc<AtomicUsize>,
}

// =============================================================================
// Stream client
// =============================================================================

/// Private stream client shared by one connector.
#[derive(Clone)]
pub struct BinanceUserStream {
    http: Client,
    api_key: String,
    endpoints: Arc<Vec<StreamEndpoint>>,
    limiter: Arc<RateLimiter>,
    callbacks: Arc<RwLock<Vec<RealtimeCallback>>>,
    running: Arc<Mutex<Option<RunningStreams>>>,
}

impl BinanceUserStream {
    pub fn new(http: Client, api_key: String, endpoints: Vec<StreamEndpoint>, limiter: Arc<RateLimiter>) -> Self {
        Self {
            http,
            api_key,
            endpoints: Arc::new(endpoints),
            limiter,
            callbacks: Arc::new(RwLock::new(Vec::new())),
            running: Arc::new(Mutex::new(None)),
        }
    }

    /// Add a callback, starting the market streams on first use.
    pub async fn subscribe(&self, callback: RealtimeCallback) {
        self.callbacks.write().await.push(callback);

        let mut running = self.running.lock().await;
        if running.is_some() {
            return;
        }
        let (tx, rx) = watch::channel(false);
        let active = Arc::new(AtomicUsize::new(self.endpoints.len()));
        *running = Some(RunningStreams {
            stop: tx,
            active: active.clone(),
        });

        for endpoint in self.endpoints.iter().cloned() {
            let stream = self.clone();
            let rx = rx.clone();
            let active = active.clone();
            tokio::spawn(async move {
                stream.run_market(endpoint, rx).await;
                stream.market_finished(&active).await;
            });
        }
    }

    /// Stop all market streams and drop every callback.
    pub async fn shutdown(&self) {
        if let Some(running) = self.running.lock().await.take() {
            let _ = running.stop.send(true);
            info!("Stopping Binance user streams");
        }
        self.callbacks.write().await.clear();
    }

    pub async fn is_running(&self) -> bool {
        self.running.lock().await.is_some()
    }

    /// Forget the run once its last market task is gone so the next subscribe restarts it.
    async fn market_finished(&self, active: &Arc<AtomicUsize>) {
        if active.fetch_sub(1, Ordering::SeqCst) != 1 {
            return;
        }
        let mut running = self.running.lock().await;
        if running.as_ref().is_some_and(|r| Arc::ptr_eq(&r.active, active)) {
            *running = None;
            warn!("All Binance user streams stopped");
        }
    }

    async fn listen_key_request(&self, method: Method, endpoint: &StreamEndpoint, key: Option<&str>) -> ConnectorResult<String> {
        self.limiter.acquire(EXCHANGE_NAME).await;

        let mut url = format!("{}{}", endpoint.rest_url, endpoint.listen_key_path);
        if let Some(key) = key {
            url = format!("{}?listenKey={}", url, key);
        }
        let response = self
            .http
            .request(method, &url)
            .header("X-MBX-APIKEY", &self.api_key)
            .send()
            .await?;
        let status = response.status();
        let body = response.text().await?;
        if !status.is_success() {
            return Err(map_http_error(status, &body));
        }
        Ok(body)
    }

    async fn create_listen_key(&self, endpoint: &StreamEndpoint) -> ConnectorResult<String> {
        let body = self.listen_key_request(Method::POST, endpoint, None).await?;
        let response: ListenKeyResponse = serde_json::from_str(&body)?;
        Ok(response.listen_key)
    }

    /// Pause between attempts. Returns false once shutdown is signalled.
    async fn wait_retry(shutdown: &mut watch::Receiver<bool>) -> bool {
        tokio::select! {
            _ = tokio::time::sleep(RECONNECT_DELAY) => {}
            _ = shutdown.changed() => return false,
        }
        !*shutdown.borrow()
    }

    async fn open_listen_key(&self, endpoint: &StreamEndpoint, shutdown: &mut watch::Receiver<bool>) -> Option<String> {
        loop {
            match self.create_listen_key(endpoint).await {
                Ok(key) => return Some(key),
                Err(e) if is_fatal(&e) => {
                    error!("Binance {} user stream disabled: {}", endpoint.market, e);
                    return None;
                }
                Err(e) => warn!("Binance {} listen key request failed: {}, retrying...", endpoint.market, e),
            }
            if !Self::wait_retry(shutdown).await {
                return None;
            }
        }
    }

    async fn run_market(&self, endpoint: StreamEndpoint, mut shutdown: watch::Receiver<bool>) {
        let Some(mut listen_key) = self.open_listen_key(&endpoint, &mut shutdown).await else {
            return;
        };

        loop {
            match self.run_connection(&endpoint, &listen_key, &mut shutdown).await {
                Ok(ConnectionEnd::Shutdown) => break,
                Ok(ConnectionEnd::Disconnected) => {
                    warn!("Binance {} user stream disconnected, reconnecting...", endpoint.market);
                }
                Err(e) => {
                    error!("Binance {} user stream error: {}, reconnecting...", endpoint.market, e);
                }
            }

            if !Self::wait_retry(&mut shutdown).await {
                break;
            }

            // Creating a key for an account with a live key returns and extends it
            match self.create_listen_key(&endpoint).await {
                Ok(key) => listen_key = key,
                Err(e) if is_fatal(&e) => {
                    error!("Binance {} user stream disabled: {}", endpoint.market, e);
                    break;
                }
                Err(e) => warn!("Binance {} listen key refresh failed: {}", endpoint.market, e),
            }
        }

        if let Err(e) = self.listen_key_request(Method::DELETE, &endpoint, Some(&listen_key)).await {
            debug!("Binance {} listen key close failed: {}", endpoint.market, e);
        }
        info!("Binance {} user stream stopped", endpoint.market);
    }

    async fn run_connection(
        &self,
        endpoint: &StreamEndpoint,
        listen_key: &str,
        shutdown: &mut watch::Receiver<bool>,
    ) -> ConnectorResult<ConnectionEnd> {
        let url = format!("{}/{}", endpoint.ws_url, listen_key);
        let (ws_stream, _) = tokio::time::timeout(CONNECT_TIMEOUT, connect_async(url.as_str()))
            .await
            .map_err(|_| ConnectorError::Transport("user stream connect timed out".to_string()))?
            .map_err(|e| ConnectorError::Transport(e.to_string()))?;
        let (mut write, mut read) = ws_stream.split();
        info!("Connected to Binance {} user stream", endpoint.market);

        let mut keepalive = tokio::time::interval(KEEPALIVE_INTERVAL);
        keepalive.tick().await;

        loop {
            tokio::select! {
                msg = read.next() => {
                    match msg {
                        Some(Ok(Message::Text(text))) => {
                            if !self.handle_message(endpoint.market, &text).await {
                                return Ok(ConnectionEnd::Disconnected);
                            }
                        }
                        Some(Ok(Message::Ping(data))) => {
                            let _ = write.send(Message::Pong(data)).await;
                        }
                        Some(Ok(Message::Close(_))) => {
                            info!("Binance {} user stream closed", endpoint.market);
                            return Ok(ConnectionEnd::Disconnected);
                        }
                        Some(Err(e)) => return Err(ConnectorError::Transport(e.to_string())),
                        None => return Ok(ConnectionEnd::Disconnected),
                        _ => {}
                    }
                }
                _ = keepalive.tick() => {
                    match self.listen_key_request(Method::PUT, endpoint, Some(listen_key)).await {
                        Ok(_) => debug!("Binance {} listen key kept alive", endpoint.market),
                        Err(e) => warn!("Binance {} listen key keepalive failed: {}", endpoint.market, e),
                    }
                }
                _ = shutdown.changed() => {
                    let _ = write.send(Message::Close(None)).await;
                    return Ok(ConnectionEnd::Shutdown);
                }
            }
        }
    }

    /// Dispatch one frame. Returns false when the connection must be rebuilt.
    async fn handle_message(&self, market: MarketType, text: &str) -> bool {
        match parse_message(market, text) {
            Some(StreamEvent::Updates(updates)) => {
                let callbacks = self.callbacks.read().await;
                for update in updates {
                    for callback in callbacks.iter() {
                        callback(update.clone());
                    }
                }
                true
            }
            Some(StreamEvent::ListenKeyExpired) => {
                warn!("Binance {} listen key expired", market);
                false
            }
            None => true,
        }
    }
}
