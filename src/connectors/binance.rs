//! Binance connector over the spot (`/api/v3`) and USDⓈ-M futures (`/fapi`)
//! REST APIs.
//!
//! Both markets are queried for balances and orders and merged; an account
//! without futures (or spot) permission still gets the other side's data.

use super::binance_ws::{BinanceUserStream, StreamEndpoint};
use super::signing::{RequestSigner, DEFAULT_RECV_WINDOW};
use super::{
    ConnectorError, ConnectorErrorKind, ConnectorResult, ExchangeConnector, RateLimiter,
    RealtimeCallback, TradingConnector,
};
use crate::types::{
    ExchangeCredentials, MarketType, OrderParams, OrderResult, OrderSide, OrderStatus, OrderType,
    RawBalance, RawOrder, RawPosition, RawTrade, TimeInForce, TimeRange,
};
use async_trait::async_trait;
use reqwest::{Client, Method};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

pub const EXCHANGE_NAME: &str = "binance";

const SPOT_API_URL: &str = "https://api.binance.com";
const SPOT_TESTNET_URL: &str = "https://testnet.binance.vision";
const FUTURES_API_URL: &str = "https://fapi.binance.com";
const FUTURES_TESTNET_URL: &str = "https://testnet.binancefuture.com";
const SPOT_WS_URL: &str = "wss://stream.binance.com:9443/ws";
const SPOT_TESTNET_WS_URL: &str = "wss://testnet.binance.vision/ws";
const FUTURES_WS_URL: &str = "wss://fstream.binance.com/ws";
const FUTURES_TESTNET_WS_URL: &str = "wss://stream.binancefuture.com/ws";

/// Endpoints and signing settings.
#[derive(Debug, Clone)]
pub struct BinanceConfig {
    pub spot_rest_url: String,
    pub futures_rest_url: String,
    pub spot_ws_url: String,
    pub futures_ws_url: String,
    pub recv_window: u64,
}

impl Default for BinanceConfig {
    fn default() -> Self {
        Self {
            spot_rest_url: SPOT_API_URL.to_string(),
            futures_rest_url: FUTURES_API_URL.to_string(),
            spot_ws_url: SPOT_WS_URL.to_string(),
            futures_ws_url: FUTURES_WS_URL.to_string(),
            recv_window: DEFAULT_RECV_WINDOW,
        }
    }
}

impl BinanceConfig {
    pub fn testnet() -> Self {
        Self {
            spot_rest_url: SPOT_TESTNET_URL.to_string(),
            futures_rest_url: FUTURES_TESTNET_URL.to_string(),
            spot_ws_url: SPOT_TESTNET_WS_URL.to_string(),
            futures_ws_url: FUTURES_TESTNET_WS_URL.to_string(),
            ..Self::default()
        }
    }

    pub fn for_credentials(credentials: &ExchangeCredentials) -> Self {
        if credentials.sandbox {
            Self::testnet()
        } else {
            Self::default()
        }
    }

    fn rest_url(&self, market: MarketType) -> &str {
        match market {
            MarketType::Spot => &self.spot_rest_url,
            MarketType::Futures => &self.futures_rest_url,
        }
    }
}

// =============================================================================
// Wire types
// =============================================================================

#[derive(Debug, Deserialize)]
struct ErrorBody {
    code: i64,
    msg: String,
}

#[derive(Debug, Deserialize)]
struct SpotAccount {
    balances: Vec<SpotBalance>,
}

#[derive(Debug, Deserialize)]
struct SpotBalance {
    asset: String,
    free: String,
    locked: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FuturesBalance {
    asset: String,
    balance: String,
    available_balance: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FuturesPosition {
    symbol: String,
    position_amt: String,
    entry_price: String,
    mark_price: String,
    #[serde(default)]
    leverage: Option<String>,
    #[serde(default)]
    liquidation_price: Option<String>,
    #[serde(default)]
    position_side: Option<String>,
    #[serde(default)]
    update_time: i64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct BinanceOrder {
    symbol: String,
    order_id: u64,
    #[serde(default)]
    client_order_id: Option<String>,
    #[serde(default)]
    price: Option<String>,
    orig_qty: String,
    #[serde(default)]
    executed_qty: Option<String>,
    #[serde(default)]
    cummulative_quote_qty: Option<String>,
    #[serde(default)]
    avg_price: Option<String>,
    status: String,
    #[serde(default)]
    time_in_force: Option<String>,
    #[serde(rename = "type")]
    order_type: String,
    side: String,
    #[serde(default)]
    stop_price: Option<String>,
    #[serde(default)]
    reduce_only: Option<bool>,
    #[serde(default)]
    time: Option<i64>,
    #[serde(default)]
    update_time: Option<i64>,
    #[serde(default)]
    transact_time: Option<i64>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SpotTrade {
    symbol: String,
    id: u64,
    order_id: u64,
    price: String,
    qty: String,
    commission: String,
    commission_asset: String,
    time: i64,
    is_buyer: bool,
    is_maker: bool,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FuturesTrade {
    symbol: String,
    id: u64,
    order_id: u64,
    side: String,
    price: String,
    qty: String,
    realized_pnl: String,
    commission: String,
    commission_asset: String,
    time: i64,
    maker: bool,
}

// =============================================================================
// Mapping
// =============================================================================

/// Binance order status → closed enumeration.
pub fn map_order_status(status: &str) -> OrderStatus {
    match status.to_ascii_uppercase().as_str() {
        "NEW" | "PENDING_NEW" => OrderStatus::New,
        "PARTIALLY_FILLED" => OrderStatus::PartiallyFilled,
        "FILLED" => OrderStatus::Filled,
        "CANCELED" => OrderStatus::Canceled,
        "PENDING_CANCEL" => OrderStatus::Canceling,
        "REJECTED" => OrderStatus::Rejected,
        "EXPIRED" | "EXPIRED_IN_MATCH" => OrderStatus::Expired,
        other => {
            warn!(status = other, "unhandled Binance order status");
            OrderStatus::Unmapped(other.to_string())
        }
    }
}

/// Binance error code → error kind.
pub fn map_error_code(code: i64, message: &str) -> ConnectorError {
    let message = message.to_string();
    match code {
        -1002 | -2008 | -2014 => ConnectorError::Authentication(message),
        -1022 => ConnectorError::InvalidSignature(message),
        -2015 => ConnectorError::PermissionDenied(message),
        -1121 => ConnectorError::InvalidSymbol(message),
        -2018 | -2019 => ConnectorError::InsufficientBalance(message),
        -2010 if message.to_lowercase().contains("insufficient") => {
            ConnectorError::InsufficientBalance(message)
        }
        -1013 | -1111 | -4003 | -4005 => ConnectorError::InvalidQuantity(message),
        -1003 | -1015 => ConnectorError::RateLimited(message),
        _ => ConnectorError::Exchange { code, message },
    }
}

pub(super) fn map_http_error(status: reqwest::StatusCode, body: &str) -> ConnectorError {
    if let Ok(error) = serde_json::from_str::<ErrorBody>(body) {
        return map_error_code(error.code, &error.msg);
    }
    let snippet: String = body.chars().take(200).collect();
    match status.as_u16() {
        401 => ConnectorError::Authentication(snippet),
        403 => ConnectorError::PermissionDenied(snippet),
        418 | 429 => ConnectorError::RateLimited(snippet),
        code => ConnectorError::Exchange {
            code: code as i64,
            message: snippet,
        },
    }
}

fn parse_num(value: Option<&str>) -> f64 {
    value
        .and_then(|v| v.parse::<f64>().ok())
        .filter(|v| v.is_finite())
        .unwrap_or(0.0)
}

fn non_zero(value: Option<&str>) -> Option<f64> {
    Some(parse_num(value)).filter(|v| *v != 0.0)
}

fn format_decimal(value: f64) -> String {
    format!("{}", value)
}

fn side_str(side: OrderSide) -> &'static str {
    match side {
        OrderSide::Buy => "BUY",
        OrderSide::Sell => "SELL",
    }
}

/// Translate order intent into Binance request parameters.
fn build_order_params(params: &OrderParams) -> ConnectorResult<BTreeMap<String, String>> {
    if params.symbol.trim().is_empty() {
        return Err(ConnectorError::InvalidSymbol("symbol is required".to_string()));
    }
    if !(params.quantity.is_finite() && params.quantity > 0.0) {
        return Err(ConnectorError::InvalidQuantity(format!(
            "quantity must be positive, got {}",
            params.quantity
        )));
    }

    let futures = params.market == MarketType::Futures;
    let mut query = BTreeMap::new();
    query.insert("symbol".to_string(), params.symbol.to_uppercase());
    query.insert("side".to_string(), side_str(params.side).to_string());
    query.insert("quantity".to_string(), format_decimal(params.quantity));

    if params.order_type.requires_price() {
        let price = params
            .price
            .filter(|p| p.is_finite() && *p > 0.0)
            .ok_or_else(|| ConnectorError::InvalidRequest(format!("{} orders require a price", params.order_type)))?;
        query.insert("price".to_string(), format_decimal(price));
    }
    if params.order_type.requires_stop_price() {
        let stop = params
            .stop_price
            .filter(|p| p.is_finite() && *p > 0.0)
            .ok_or_else(|| ConnectorError::InvalidRequest(format!("{} orders require a stop price", params.order_type)))?;
        query.insert("stopPrice".to_string(), format_decimal(stop));
    }

    let tif = params.time_in_force.unwrap_or(TimeInForce::Gtc).as_str().to_string();
    let order_type = match (params.order_type, futures) {
        (OrderType::Market, _) => "MARKET",
        (OrderType::Limit, false) if params.post_only => "LIMIT_MAKER",
        (OrderType::Limit, true) if params.post_only => {
            query.insert("timeInForce".to_string(), "GTX".to_string());
            "LIMIT"
        }
        (OrderType::Limit, _) => {
            query.insert("timeInForce".to_string(), tif);
            "LIMIT"
        }
        (OrderType::StopMarket, false) => "STOP_LOSS",
        (OrderType::StopMarket, true) => "STOP_MARKET",
        (OrderType::StopLimit, futures) => {
            query.insert("timeInForce".to_string(), tif);
            if futures {
                "STOP"
            } else {
                "STOP_LOSS_LIMIT"
            }
        }
    };
    query.insert("type".to_string(), order_type.to_string());

    if futures && params.reduce_only {
        query.insert("reduceOnly".to_string(), "true".to_string());
    }
    if !futures {
        query.insert("newOrderRespType".to_string(), "RESULT".to_string());
    }
    if let Some(ref client_id) = params.client_order_id {
        query.insert("newClientOrderId".to_string(), client_id.clone());
    }

    Ok(query)
}

fn order_id_param(order_id: &str) -> (String, String) {
    if order_id.parse::<u64>().is_ok() {
        ("orderId".to_string(), order_id.to_string())
    } else {
        ("origClientOrderId".to_string(), order_id.to_string())
    }
}

fn to_order_result(order: &BinanceOrder, market: MarketType) -> OrderResult {
    let quantity = parse_num(Some(&order.orig_qty));
    let filled = parse_num(order.executed_qty.as_deref());
    let average_price = match market {
        MarketType::Futures => non_zero(order.avg_price.as_deref()),
        MarketType::Spot if filled > 0.0 => {
            non_zero(order.cummulative_quote_qty.as_deref()).map(|quote| quote / filled)
        }
        MarketType::Spot => None,
    };
    let created_at = order
        .time
        .or(order.transact_time)
        .or(order.update_time)
        .unwrap_or_else(|| chrono::Utc::now().timestamp_millis());

    OrderResult {
        order_id: order.order_id.to_string(),
        client_order_id: order.client_order_id.clone(),
        exchange: EXCHANGE_NAME.to_string(),
        symbol: order.symbol.clone(),
        side: OrderSide::parse(&order.side).unwrap_or(OrderSide::Buy),
        order_type: order.order_type.clone(),
        market,
        status: map_order_status(&order.status),
        price: non_zero(order.price.as_deref()),
        average_price,
        stop_price: non_zero(order.stop_price.as_deref()),
        quantity,
        filled_quantity: filled,
        remaining_quantity: (quantity - filled).max(0.0),
        time_in_force: order.time_in_force.clone(),
        reduce_only: order.reduce_only.unwrap_or(false),
        created_at,
        updated_at: order.update_time.or(order.transact_time).unwrap_or(created_at),
    }
}

fn to_raw_order(order: &BinanceOrder, market: MarketType) -> RawOrder {
    RawOrder {
        order_id: order.order_id.to_string(),
        client_order_id: order.client_order_id.clone(),
        symbol: order.symbol.clone(),
        side: order.side.clone(),
        order_type: order.order_type.clone(),
        price: order.price.clone().unwrap_or_default(),
        orig_qty: order.orig_qty.clone(),
        executed_qty: order.executed_qty.clone().unwrap_or_default(),
        status: order.status.clone(),
        time_in_force: order.time_in_force.clone(),
        market,
        time: order.time.or(order.update_time).unwrap_or_default(),
    }
}

/// Union of both markets; fails only when both sides fail.
fn merge_markets<T>(
    what: &str,
    spot: ConnectorResult<Vec<T>>,
    futures: ConnectorResult<Vec<T>>,
) -> ConnectorResult<Vec<T>> {
    match (spot, futures) {
        (Ok(mut spot), Ok(futures)) => {
            spot.extend(futures);
            Ok(spot)
        }
        (Ok(spot), Err(e)) => {
            warn!("Binance futures {} unavailable: {}", what, e);
            Ok(spot)
        }
        (Err(e), Ok(futures)) => {
            warn!("Binance spot {} unavailable: {}", what, e);
            Ok(futures)
        }
        (Err(spot_err), Err(futures_err)) => {
            warn!("Binance futures {} unavailable: {}", what, futures_err);
            Err(spot_err)
        }
    }
}

// =============================================================================
// Connector
// =============================================================================

/// Binance spot + futures connector.
pub struct BinanceConnector {
    http: Client,
    config: BinanceConfig,
    api_key: String,
    signer: RequestSigner,
    limiter: Arc<RateLimiter>,
    stream: BinanceUserStream,
}

impl BinanceConnector {
    /// Create a new Binance connector.
    pub fn new(credentials: &ExchangeCredentials, config: BinanceConfig, limiter: Arc<RateLimiter>) -> Self {
        let http = Client::builder()
            .user_agent("Meridian/1.0")
            .connect_timeout(Duration::from_secs(5))
            .timeout(Duration::from_secs(15))
            .build()
            .unwrap_or_else(|_| Client::new());

        let endpoints = vec![
            StreamEndpoint {
                market: MarketType::Spot,
                rest_url: config.spot_rest_url.clone(),
                listen_key_path: "/api/v3/userDataStream",
                ws_url: config.spot_ws_url.clone(),
            },
            StreamEndpoint {
                market: MarketType::Futures,
                rest_url: config.futures_rest_url.clone(),
                listen_key_path: "/fapi/v1/listenKey",
                ws_url: config.futures_ws_url.clone(),
            },
        ];
        let stream = BinanceUserStream::new(
            http.clone(),
            credentials.api_key.clone(),
            endpoints,
            limiter.clone(),
        );

        info!(
            "Created Binance connector (key {}, sandbox: {})",
            credentials.masked_key(),
            credentials.sandbox
        );

        Self {
            http,
            signer: RequestSigner::new(credentials.api_secret.clone(), config.recv_window),
            api_key: credentials.api_key.clone(),
            config,
            limiter,
            stream,
        }
    }

    /// Connector for the credentials' environment (production or testnet).
    pub fn from_credentials(credentials: &ExchangeCredentials, limiter: Arc<RateLimiter>) -> Self {
        Self::new(credentials, BinanceConfig::for_credentials(credentials), limiter)
    }

    async fn signed_request<T>(
        &self,
        method: Method,
        market: MarketType,
        path: &str,
        params: BTreeMap<String, String>,
    ) -> ConnectorResult<T>
    where
        T: DeserializeOwned,
    {
        self.limiter.acquire(EXCHANGE_NAME).await;

        let timestamp = chrono::Utc::now().timestamp_millis();
        let query = self.signer.signed_query(&params, timestamp);
        let url = format!("{}{}?{}", self.config.rest_url(market), path, query);

        debug!("Binance {} {} {}", method, market, path);
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
        Ok(serde_json::from_str(&body)?)
    }

    async fn fetch_spot_balances(&self) -> ConnectorResult<Vec<RawBalance>> {
        let account: SpotAccount = self
            .signed_request(Method::GET, MarketType::Spot, "/api/v3/account", BTreeMap::new())
            .await?;
        Ok(account
            .balances
            .into_iter()
            .filter(|b| parse_num(Some(&b.free)) + parse_num(Some(&b.locked)) > 0.0)
            .map(|b| RawBalance {
                asset: b.asset,
                free: b.free,
                locked: b.locked,
                total: None,
                market: MarketType::Spot,
            })
            .collect())
    }

    async fn fetch_futures_balances(&self) -> ConnectorResult<Vec<RawBalance>> {
        let balances: Vec<FuturesBalance> = self
            .signed_request(Method::GET, MarketType::Futures, "/fapi/v2/balance", BTreeMap::new())
            .await?;
        Ok(balances
            .into_iter()
            .filter(|b| parse_num(Some(&b.balance)) > 0.0)
            .map(|b| RawBalance {
                asset: b.asset,
                free: b.available_balance,
                locked: "0".to_string(),
                total: Some(b.balance),
                market: MarketType::Futures,
            })
            .collect())
    }

    async fn fetch_orders(&self, market: MarketType, symbol: Option<&str>) -> ConnectorResult<Vec<BinanceOrder>> {
        let path = match market {
            MarketType::Spot => "/api/v3/openOrders",
            MarketType::Futures => "/fapi/v1/openOrders",
        };
        let mut params = BTreeMap::new();
        if let Some(symbol) = symbol {
            params.insert("symbol".to_string(), symbol.to_uppercase());
        }
        self.signed_request(Method::GET, market, path, params).await
    }

    async fn fetch_spot_trades(&self, symbol: &str, range: TimeRange) -> ConnectorResult<Vec<RawTrade>> {
        let trades: Vec<SpotTrade> = self
            .signed_request(Method::GET, MarketType::Spot, "/api/v3/myTrades", trade_params(symbol, range))
            .await?;
        Ok(trades
            .into_iter()
            .map(|t| RawTrade {
                trade_id: t.id.to_string(),
                order_id: t.order_id.to_string(),
                symbol: t.symbol,
                side: if t.is_buyer { "BUY" } else { "SELL" }.to_string(),
                price: t.price,
                qty: t.qty,
                commission: t.commission,
                commission_asset: t.commission_asset,
                realized_pnl: None,
                is_maker: t.is_maker,
                market: MarketType::Spot,
                time: t.time,
            })
            .collect())
    }

    async fn fetch_futures_trades(&self, symbol: &str, range: TimeRange) -> ConnectorResult<Vec<RawTrade>> {
        let trades: Vec<FuturesTrade> = self
            .signed_request(Method::GET, MarketType::Futures, "/fapi/v1/userTrades", trade_params(symbol, range))
            .await?;
        Ok(trades
            .into_iter()
            .map(|t| RawTrade {
                trade_id: t.id.to_string(),
                order_id: t.order_id.to_string(),
                symbol: t.symbol,
                side: t.side,
                price: t.price,
                qty: t.qty,
                commission: t.commission,
                commission_asset: t.commission_asset,
                realized_pnl: Some(t.realized_pnl),
                is_maker: t.maker,
                market: MarketType::Futures,
                time: t.time,
            })
            .collect())
    }

    async fn set_leverage(&self, symbol: &str, leverage: u32) -> ConnectorResult<()> {
        let mut params = BTreeMap::new();
        params.insert("symbol".to_string(), symbol.to_uppercase());
        params.insert("leverage".to_string(), leverage.to_string());
        let _: serde_json::Value = self
            .signed_request(Method::POST, MarketType::Futures, "/fapi/v1/leverage", params)
            .await?;
        debug!("Set Binance leverage for {} to {}x", symbol, leverage);
        Ok(())
    }
}

fn trade_params(symbol: &str, range: TimeRange) -> BTreeMap<String, String> {
    let mut params = BTreeMap::new();
    params.insert("symbol".to_string(), symbol.to_uppercase());
    if let Some(start) = range.start {
        params.insert("startTime".to_string(), start.to_string());
    }
    if let Some(end) = range.end {
        params.insert("endTime".to_string(), end.to_string());
    }
    params
}

fn order_path(market: MarketType) -> &'static str {
    match market {
        MarketType::Spot => "/api/v3/order",
        MarketType::Futures => "/fapi/v1/order",
    }
}

#[async_trait]
impl ExchangeConnector for BinanceConnector {
    fn exchange_name(&self) -> &str {
        EXCHANGE_NAME
    }

    async fn fetch_balances(&self) -> ConnectorResult<Vec<RawBalance>> {
        let (spot, futures) = tokio::join!(self.fetch_spot_balances(), self.fetch_futures_balances());
        merge_markets("balances", spot, futures)
    }

    /// Spot carries no positions, so only the futures side is queried.
    async fn fetch_positions(&self) -> ConnectorResult<Vec<RawPosition>> {
        let result: ConnectorResult<Vec<FuturesPosition>> = self
            .signed_request(Method::GET, MarketType::Futures, "/fapi/v2/positionRisk", BTreeMap::new())
            .await;
        let positions = match result {
            Ok(positions) => positions,
            Err(e) if e.kind() == ConnectorErrorKind::Permission => {
                warn!("Binance futures positions unavailable: {}", e);
                return Ok(Vec::new());
            }
            Err(e) => return Err(e),
        };

        Ok(positions
            .into_iter()
            .filter(|p| parse_num(Some(&p.position_amt)) != 0.0)
            .map(|p| RawPosition {
                symbol: p.symbol,
                position_amt: p.position_amt,
                position_side: p.position_side.unwrap_or_else(|| "BOTH".to_string()),
                entry_price: p.entry_price,
                mark_price: p.mark_price,
                leverage: p.leverage,
                liquidation_price: p.liquidation_price,
                update_time: p.update_time,
            })
            .collect())
    }

    async fn fetch_open_orders(&self) -> ConnectorResult<Vec<RawOrder>> {
        let (spot, futures) = tokio::join!(
            self.fetch_orders(MarketType::Spot, None),
            self.fetch_orders(MarketType::Futures, None)
        );
        let spot = spot.map(|o| o.iter().map(|o| to_raw_order(o, MarketType::Spot)).collect());
        let futures = futures.map(|o| o.iter().map(|o| to_raw_order(o, MarketType::Futures)).collect());
        merge_markets("open orders", spot, futures)
    }

    async fn fetch_trade_history(&self, symbol: &str, range: TimeRange) -> ConnectorResult<Vec<RawTrade>> {
        let (spot, futures) = tokio::join!(
            self.fetch_spot_trades(symbol, range),
            self.fetch_futures_trades(symbol, range)
        );
        let mut trades = merge_markets("trades", spot, futures)?;
        trades.sort_by_key(|t| t.time);
        Ok(trades)
    }

    async fn subscribe_realtime_updates(&self, callback: RealtimeCallback) {
        self.stream.subscribe(callback).await;
    }

    async fn unsubscribe_realtime_updates(&self) {
        self.stream.shutdown().await;
    }

    async fn test_connection(&self) -> ConnectorResult<()> {
        let spot: ConnectorResult<serde_json::Value> = self
            .signed_request(Method::GET, MarketType::Spot, "/api/v3/account", BTreeMap::new())
            .await;
        let spot_err = match spot {
            Ok(_) => return Ok(()),
            Err(e) => e,
        };
        let futures: ConnectorResult<serde_json::Value> = self
            .signed_request(Method::GET, MarketType::Futures, "/fapi/v2/balance", BTreeMap::new())
            .await;
        match futures {
            Ok(_) => {
                debug!("Binance spot check failed ({}), futures access OK", spot_err);
                Ok(())
            }
            Err(_) => Err(spot_err),
        }
    }
}

#[async_trait]
impl TradingConnector for BinanceConnector {
    async fn place_order(&self, params: &OrderParams) -> ConnectorResult<OrderResult> {
        let query = build_order_params(params)?;

        if params.market == MarketType::Futures {
            if let Some(leverage) = params.leverage {
                self.set_leverage(&params.symbol, leverage).await?;
            }
        }

        let order: BinanceOrder = self
            .signed_request(Method::POST, params.market, order_path(params.market), query)
            .await?;
        let result = to_order_result(&order, params.market);
        info!(
            "Binance {} order {} placed: {} {} {} ({})",
            params.market, result.order_id, result.side, result.quantity, result.symbol, result.status
        );
        Ok(result)
    }

    async fn cancel_order(&self, symbol: &str, order_id: &str, market: MarketType) -> ConnectorResult<OrderResult> {
        let mut params = BTreeMap::new();
        params.insert("symbol".to_string(), symbol.to_uppercase());
        let (key, value) = order_id_param(order_id);
        params.insert(key, value);

        let order: BinanceOrder = self
            .signed_request(Method::DELETE, market, order_path(market), params)
            .await?;
        Ok(to_order_result(&order, market))
    }

    async fn cancel_all_orders(&self, symbol: &str, market: MarketType) -> ConnectorResult<Vec<OrderResult>> {
        let mut params = BTreeMap::new();
        params.insert("symbol".to_string(), symbol.to_uppercase());

        match market {
            MarketType::Spot => {
                let entries: Vec<serde_json::Value> = self
                    .signed_request(Method::DELETE, market, "/api/v3/openOrders", params)
                    .await?;
                // OCO list entries have a different shape and are skipped
                Ok(entries
                    .into_iter()
                    .filter_map(|entry| serde_json::from_value::<BinanceOrder>(entry).ok())
                    .map(|order| to_order_result(&order, market))
                    .collect())
            }
            MarketType::Futures => {
                // The futures endpoint only acknowledges; capture the orders first
                let open = self.fetch_orders(market, Some(symbol)).await?;
                let _: serde_json::Value = self
                    .signed_request(Method::DELETE, market, "/fapi/v1/allOpenOrders", params)
                    .await?;
                Ok(open
                    .iter()
                    .map(|order| {
                        let mut result = to_order_result(order, market);
                        result.status = OrderStatus::Canceled;
                        result.updated_at = chrono::Utc::now().timestamp_millis();
                        result
                    })
                    .collect())
            }
        }
    }

    async fn get_order_status(&self, symbol: &str, order_id: &str, market: MarketType) -> ConnectorResult<OrderResult> {
        let mut params = BTreeMap::new();
        params.insert("symbol".to_string(), symbol.to_uppercase());
        let (key, value) = order_id_param(order_id);
        params.insert(key, value);

        let order: BinanceOrder = self
            .signed_request(Method::GET, market, order_path(market), params)
            .await?;
        Ok(to_order_result(&order, market))
    }

    async fn get_open_orders(
        &self,
        symbol: Option<&str>,
        market: Option<MarketType>,
    ) -> ConnectorResult<Vec<OrderResult>> {
        let convert = |market: MarketType| {
            move |orders: Vec<BinanceOrder>| -> Vec<OrderResult> {
                orders.iter().map(|o| to_order_result(o, market)).collect()
            }
        };

        match market {
            Some(market) => self.fetch_orders(market, symbol).await.map(convert(market)),
            None => {
                let (spot, futures) = tokio::join!(
                    self.fetch_orders(MarketType::Spot, symbol),
                    self.fetch_orders(MarketType::Futures, symbol)
                );
                merge_markets(
                    "open orders",
                    spot.map(convert(MarketType::Spot)),
                    futures.map(convert(MarketType::Futures)),
                )
            }
        }
    }
}
