//! Fake connectors and factories shared by the integration tests.

#![allow(dead_code)]

use async_trait::async_trait;
use meridian::connectors::{
    ConnectorError, ConnectorFactory, ConnectorHandle, ConnectorResult, ExchangeConnector, RealtimeCallback,
    TradingConnector,
};
use meridian::types::{
    ExchangeCredentials, MarketType, OrderParams, OrderResult, OrderStatus, RawBalance, RawPosition, RawTrade,
    RealtimeUpdate, TimeRange,
};
use meridian::services::{CredentialStore, CredentialStoreError, OrderStore, PersistenceError};
use meridian::types::{OrderUpdate, RawOrder, TradeFill};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;

pub fn spot_balance(asset: &str, free: &str) -> RawBalance {
    RawBalance {
        asset: asset.to_string(),
        free: free.to_string(),
        locked: "0".to_string(),
        total: None,
        market: MarketType::Spot,
    }
}

pub fn long_position(symbol: &str, amount: &str, entry: &str, mark: &str) -> RawPosition {
    RawPosition {
        symbol: symbol.to_string(),
        position_amt: amount.to_string(),
        position_side: "BOTH".to_string(),
        entry_price: entry.to_string(),
        mark_price: mark.to_string(),
        leverage: Some("10".to_string()),
        liquidation_price: None,
        update_time: 1_700_000_000_000,
    }
}

pub fn fill(trade_id: &str, symbol: &str, price: &str, qty: &str) -> RawTrade {
    RawTrade {
        trade_id: trade_id.to_string(),
        order_id: format!("order-{}", trade_id),
        symbol: symbol.to_string(),
        side: "BUY".to_string(),
        price: price.to_string(),
        qty: qty.to_string(),
        commission: "0.01".to_string(),
        commission_asset: "USDT".to_string(),
        realized_pnl: None,
        is_maker: false,
        market: MarketType::Spot,
        time: 1_700_000_000_000,
    }
}

/// In-memory exchange account.
pub struct FakeConnector {
    name: String,
    pub balances: Mutex<Vec<RawBalance>>,
    pub positions: Mutex<Vec<RawPosition>>,
    pub trades: Mutex<Vec<RawTrade>>,
    pub fail_balances: AtomicBool,
    pub fail_positions: AtomicBool,
    pub reject_orders: AtomicBool,
    pub connection_ok: AtomicBool,
    pub placed: Mutex<Vec<OrderParams>>,
    pub callbacks: Mutex<Vec<RealtimeCallback>>,
    pub unsubscribed: AtomicUsize,
    next_id: AtomicUsize,
}

impl FakeConnector {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            balances: Mutex::new(Vec::new()),
            positions: Mutex::new(Vec::new()),
            trades: Mutex::new(Vec::new()),
            fail_balances: AtomicBool::new(false),
            fail_positions: AtomicBool::new(false),
            reject_orders: AtomicBool::new(false),
            connection_ok: AtomicBool::new(true),
            placed: Mutex::new(Vec::new()),
            callbacks: Mutex::new(Vec::new()),
            unsubscribed: AtomicUsize::new(0),
            next_id: AtomicUsize::new(1),
        }
    }

    pub fn with_balances(self, balances: Vec<RawBalance>) -> Self {
        *self.balances.lock() = balances;
        self
    }

    pub fn with_positions(self, positions: Vec<RawPosition>) -> Self {
        *self.positions.lock() = positions;
        self
    }

    pub fn with_trades(self, trades: Vec<RawTrade>) -> Self {
        *self.trades.lock() = trades;
        self
    }

    pub fn failing_balances(self) -> Self {
        self.fail_balances.store(true, Ordering::SeqCst);
        self
    }

    /// Push an update through every registered callback.
    pub fn emit(&self, update: RealtimeUpdate) {
        let callbacks = self.callbacks.lock().clone();
        for callback in callbacks {
            callback(update.clone());
        }
    }

    pub fn placed_count(&self) -> usize {
        self.placed.lock().len()
    }

    fn order_result(&self, order_id: String, symbol: &str, status: OrderStatus) -> OrderResult {
        OrderResult {
            order_id,
            client_order_id: None,
            exchange: self.name.clone(),
            symbol: symbol.to_uppercase(),
            side: meridian::types::OrderSide::Buy,
            order_type: "limit".to_string(),
            market: MarketType::Spot,
            status,
            price: Some(100.0),
            average_price: None,
            stop_price: None,
            quantity: 1.0,
            filled_quantity: 0.0,
            remaining_quantity: 1.0,
            time_in_force: Some("GTC".to_string()),
            reduce_only: false,
            created_at: 1_700_000_000_000,
            updated_at: 1_700_000_000_500,
        }
    }
}

#[async_trait]
impl ExchangeConnector for FakeConnector {
    fn exchange_name(&self) -> &str {
        &self.name
    }

    async fn fetch_balances(&self) -> ConnectorResult<Vec<RawBalance>> {
        if self.fail_balances.load(Ordering::SeqCst) {
            return Err(ConnectorError::Transport("connection reset".to_string()));
        }
        Ok(self.balances.lock().clone())
    }

    async fn fetch_positions(&self) -> ConnectorResult<Vec<RawPosition>> {
        if self.fail_positions.load(Ordering::SeqCst) {
            return Err(ConnectorError::PermissionDenied("futures disabled".to_string()));
        }
        Ok(self.positions.lock().clone())
    }

    async fn fetch_open_orders(&self) -> ConnectorResult<Vec<RawOrder>> {
        Ok(Vec::new())
    }

    async fn fetch_trade_history(&self, symbol: &str, range: TimeRange) -> ConnectorResult<Vec<RawTrade>> {
        Ok(self
            .trades
            .lock()
            .iter()
            .filter(|t| t.symbol.eq_ignore_ascii_case(symbol) && range.contains(t.time))
            .cloned()
            .collect())
    }

    async fn subscribe_realtime_updates(&self, callback: RealtimeCallback) {
        self.callbacks.lock().push(callback);
    }

    async fn unsubscribe_realtime_updates(&self) {
        self.callbacks.lock().clear();
        self.unsubscribed.fetch_add(1, Ordering::SeqCst);
    }

    async fn test_connection(&self) -> ConnectorResult<()> {
        if self.connection_ok.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(ConnectorError::Authentication("API-key format invalid".to_string()))
        }
    }
}

#[async_trait]
impl TradingConnector for FakeConnector {
    async fn place_order(&self, params: &OrderParams) -> ConnectorResult<OrderResult> {
        if self.reject_orders.load(Ordering::SeqCst) {
            return Err(ConnectorError::InsufficientBalance("Account has insufficient balance".to_string()));
        }
        self.placed.lock().push(params.clone());
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        Ok(self.order_result(format!("{}", id), &params.symbol, OrderStatus::New))
    }

    async fn cancel_order(&self, symbol: &str, order_id: &str, _market: MarketType) -> ConnectorResult<OrderResult> {
        Ok(self.order_result(order_id.to_string(), symbol, OrderStatus::Canceled))
    }

    async fn cancel_all_orders(&self, symbol: &str, _market: MarketType) -> ConnectorResult<Vec<OrderResult>> {
        Ok(vec![
            self.order_result("a".to_string(), symbol, OrderStatus::Canceled),
            self.order_result("b".to_string(), symbol, OrderStatus::Canceled),
        ])
    }

    async fn get_order_status(&self, symbol: &str, order_id: &str, _market: MarketType) -> ConnectorResult<OrderResult> {
        Ok(self.order_result(order_id.to_string(), symbol, OrderStatus::Filled))
    }

    async fn get_open_orders(
        &self,
        symbol: Option<&str>,
        _market: Option<MarketType>,
    ) -> ConnectorResult<Vec<OrderResult>> {
        Ok(vec![self.order_result("open-1".to_string(), symbol.unwrap_or("BTCUSDT"), OrderStatus::New)])
    }
}

/// Factory handing out pre-built fakes by exchange name.
#[derive(Default)]
pub struct FakeFactory {
    pub connectors: Mutex<HashMap<String, Arc<FakeConnector>>>,
    pub created: AtomicUsize,
}

impl FakeFactory {
    pub fn with(self, connector: FakeConnector) -> Self {
        let name = connector.exchange_name().to_string();
        self.connectors.lock().insert(name, Arc::new(connector));
        self
    }

    pub fn connector(&self, name: &str) -> Arc<FakeConnector> {
        self.connectors.lock().get(name).cloned().expect("fake connector registered")
    }

    pub fn created(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }
}

impl ConnectorFactory for FakeFactory {
    fn create(&self, credentials: &ExchangeCredentials) -> ConnectorResult<ConnectorHandle> {
        let connector = self
            .connectors
            .lock()
            .get(&credentials.exchange)
            .cloned()
            .ok_or_else(|| ConnectorError::InvalidRequest(format!("Unsupported exchange '{}'", credentials.exchange)))?;
        self.created.fetch_add(1, Ordering::SeqCst);
        Ok(ConnectorHandle::trading(connector))
    }

    fn supported_exchanges(&self) -> Vec<&'static str> {
        vec!["binance", "bybit"]
    }
}

/// Order store whose writes always fail.
#[derive(Default)]
pub struct FailingOrderStore {
    pub writes: AtomicUsize,
}

impl FailingOrderStore {
    fn fail(&self) -> PersistenceError {
        self.writes.fetch_add(1, Ordering::SeqCst);
        PersistenceError::Unavailable("database is locked".to_string())
    }
}

#[async_trait]
impl OrderStore for FailingOrderStore {
    async fn store_order(&self, _order: &OrderResult, _tenant_id: &str) -> Result<(), PersistenceError> {
        Err(self.fail())
    }

    async fn update_order(&self, _order_id: &str, _exchange: &str, _update: &OrderUpdate) -> Result<bool, PersistenceError> {
        Err(self.fail())
    }

    async fn store_trade(&self, _trade: &TradeFill, _tenant_id: &str) -> Result<bool, PersistenceError> {
        Err(self.fail())
    }

    async fn get_order_history(
        &self,
        _tenant_id: &str,
        _exchange: Option<&str>,
        _symbol: Option<&str>,
        _limit: usize,
    ) -> Vec<OrderResult> {
        Vec::new()
    }

    async fn get_trade_history(
        &self,
        _tenant_id: &str,
        _exchange: Option<&str>,
        _symbol: Option<&str>,
        _limit: usize,
    ) -> Vec<TradeFill> {
        Vec::new()
    }
}

/// Credential store whose first read pauses after loading until released.
pub struct GatedCredentialStore<S> {
    inner: S,
    armed: AtomicBool,
    pub loaded: Notify,
    pub release: Notify,
}

impl<S> GatedCredentialStore<S> {
    pub fn new(inner: S) -> Self {
        Self {
            inner,
            armed: AtomicBool::new(true),
            loaded: Notify::new(),
            release: Notify::new(),
        }
    }
}

#[async_trait]
impl<S: CredentialStore> CredentialStore for GatedCredentialStore<S> {
    async fn get_credentials_by_tenant(&self, tenant_id: &str) -> Result<Vec<ExchangeCredentials>, CredentialStoreError> {
        let credentials = self.inner.get_credentials_by_tenant(tenant_id).await?;
        if self.armed.swap(false, Ordering::SeqCst) {
            self.loaded.notify_one();
            self.release.notified().await;
        }
        Ok(credentials)
    }

    async fn save_credentials(&self, tenant_id: &str, credentials: &ExchangeCredentials) -> Result<(), CredentialStoreError> {
        self.inner.save_credentials(tenant_id, credentials).await
    }

    async fn remove_credentials(&self, tenant_id: &str, exchange: &str) -> Result<bool, CredentialStoreError> {
        self.inner.remove_credentials(tenant_id, exchange).await
    }
}
