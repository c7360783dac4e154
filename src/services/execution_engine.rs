//! Order orchestration for one tenant.
//!
//! Every order is risk-checked before it reaches the exchange. Once the
//! exchange confirms, persistence and event publication are best-effort: the
//! exchange is the source of truth and the caller always sees the result.

use super::event_bus::EventBus;
use super::normalizer;
use super::order_store::OrderStore;
use super::portfolio_manager::PortfolioManager;
use super::risk_manager::RiskManager;
use crate::connectors::{ConnectorError, TradingConnector};
use crate::types::{
    CurrentPosition, MarketType, OrderParams, OrderResult, OrderUpdate, PortfolioUpdate, RiskLimits,
    TimeRange, TradeFill, UpdateType,
};
use dashmap::DashMap;
use parking_lot::RwLock;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Quote assets recognised by symbol suffix, checked in order.
const QUOTE_ASSETS: &[&str] = &["USDT", "USDC", "BUSD", "FDUSD", "BTC", "ETH", "BNB"];
const DEFAULT_QUOTE_ASSET: &str = "USDT";

#[derive(Debug, Error)]
pub enum ExecutionError {
    #[error("Exchange '{exchange}' is not registered (registered: [{}])", .registered.join(", "))]
    ExchangeNotRegistered { exchange: String, registered: Vec<String> },

    #[error("Order rejected by risk checks: {}", .reasons.join("; "))]
    RiskRejected { reasons: Vec<String> },

    #[error(transparent)]
    Connector(#[from] ConnectorError),
}

impl ExecutionError {
    pub fn category(&self) -> &'static str {
        match self {
            ExecutionError::ExchangeNotRegistered { .. } => "exchange_not_registered",
            ExecutionError::RiskRejected { .. } => "risk_rejected",
            ExecutionError::Connector(e) => e.category(),
        }
    }
}

/// Quote asset of a trading pair by suffix. Pairs with no recognised suffix
/// fall back to USDT.
pub fn quote_asset(symbol: &str) -> &'static str {
    let symbol = symbol.to_uppercase();
    QUOTE_ASSETS
        .iter()
        .find(|quote| symbol.len() > quote.len() && symbol.ends_with(*quote))
        .copied()
        .unwrap_or(DEFAULT_QUOTE_ASSET)
}

pub struct ExecutionEngine {
    tenant_id: String,
    connectors: DashMap<String, Arc<dyn TradingConnector>>,
    risk: RwLock<RiskManager>,
    portfolio: Option<Arc<PortfolioManager>>,
    store: Arc<dyn OrderStore>,
    bus: Arc<EventBus>,
}

impl ExecutionEngine {
    pub fn new(tenant_id: impl Into<String>, store: Arc<dyn OrderStore>, bus: Arc<EventBus>) -> Self {
        Self {
            tenant_id: tenant_id.into(),
            connectors: DashMap::new(),
            risk: RwLock::new(RiskManager::default()),
            portfolio: None,
            store,
            bus,
        }
    }

    /// Use the portfolio's latest snapshot for balances and drawdown.
    pub fn with_portfolio(mut self, portfolio: Arc<PortfolioManager>) -> Self {
        self.portfolio = Some(portfolio);
        self
    }

    pub fn with_risk_limits(self, limits: RiskLimits) -> Self {
        self.risk.write().set_limits(limits);
        self
    }

    pub fn tenant_id(&self) -> &str {
        &self.tenant_id
    }

    pub fn set_risk_limits(&self, limits: RiskLimits) {
        self.risk.write().set_limits(limits);
    }

    pub fn risk_limits(&self) -> RiskLimits {
        *self.risk.read().limits()
    }

    pub fn register_connector(&self, connector: Arc<dyn TradingConnector>) {
        let name = connector.exchange_name().to_lowercase();
        self.connectors.insert(name.clone(), connector);
        debug!("Execution engine for {} registered {}", self.tenant_id, name);
    }

    pub fn remove_connector(&self, exchange: &str) -> bool {
        self.connectors.remove(&exchange.to_lowercase()).is_some()
    }

    pub fn registered_exchanges(&self) -> Vec<String> {
        let mut names: Vec<String> = self.connectors.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    fn connector(&self, exchange: &str) -> Result<Arc<dyn TradingConnector>, ExecutionError> {
        self.connectors
            .get(&exchange.to_lowercase())
            .map(|c| c.value().clone())
            .ok_or_else(|| ExecutionError::ExchangeNotRegistered {
                exchange: exchange.to_string(),
                registered: self.registered_exchanges(),
            })
    }

    /// Risk-check and submit an order.
    pub async fn place_order(&self, exchange: &str, params: &OrderParams) -> Result<OrderResult, ExecutionError> {
        let connector = self.connector(exchange)?;
        let exchange_name = connector.exchange_name().to_string();

        let snapshot = self.portfolio.as_ref().and_then(|p| p.get_latest_snapshot());
        if let Some(ref snapshot) = snapshot {
            self.risk.write().update_snapshot(snapshot.clone());
        }

        let quote = quote_asset(&params.symbol);
        let available = match snapshot.as_ref().and_then(|s| s.available_balance(&exchange_name, quote)) {
            Some(available) => available,
            None => self.live_available_balance(connector.as_ref(), quote).await,
        };
        let position = self.current_position(connector.as_ref(), &params.symbol).await;

        let check = self.risk.read().validate_order(params, available, position.as_ref());
        for warning in &check.warnings {
            warn!("Risk warning for {} on {}: {}", self.tenant_id, exchange_name, warning);
        }
        if !check.allowed {
            info!(
                "Rejected {} {} {} on {} for {}",
                params.side, params.quantity, params.symbol, exchange_name, self.tenant_id
            );
            return Err(ExecutionError::RiskRejected { reasons: check.reasons });
        }

        let order = connector.place_order(params).await?;
        info!(
            "Placed {} order {} on {} for {}",
            order.symbol, order.order_id, exchange_name, self.tenant_id
        );

        self.persist_order(&order).await;
        self.publish_order(&order).await;
        Ok(order)
    }

    async fn live_available_balance(&self, connector: &dyn TradingConnector, asset: &str) -> f64 {
        match connector.fetch_balances().await {
            Ok(balances) => balances
                .iter()
                .filter(|b| b.asset.eq_ignore_ascii_case(asset))
                .map(|b| normalizer::normalize_balance(b, connector.exchange_name(), None).available)
                .sum(),
            Err(e) => {
                warn!("Balance lookup on {} failed, assuming 0: {}", connector.exchange_name(), e);
                0.0
            }
        }
    }

    async fn current_position(&self, connector: &dyn TradingConnector, symbol: &str) -> Option<CurrentPosition> {
        let positions = match connector.fetch_positions().await {
            Ok(positions) => positions,
            Err(e) => {
                debug!("Position lookup on {} failed: {}", connector.exchange_name(), e);
                return None;
            }
        };
        positions
            .iter()
            .map(|p| normalizer::normalize_position(p, connector.exchange_name()))
            .find(|p| p.symbol.eq_ignore_ascii_case(symbol) && p.size > 0.0)
            .map(|p| CurrentPosition {
                symbol: p.symbol.clone(),
                size: p.size,
                value: p.notional(),
            })
    }

    pub async fn cancel_order(
        &self,
        exchange: &str,
        symbol: &str,
        order_id: &str,
        market: MarketType,
    ) -> Result<OrderResult, ExecutionError> {
        let connector = self.connector(exchange)?;
        let order = connector.cancel_order(symbol, order_id, market).await?;
        info!("Canceled order {} on {} for {}", order.order_id, order.exchange, self.tenant_id);

        self.persist_update(&order).await;
        self.publish_order(&order).await;
        Ok(order)
    }

    pub async fn cancel_all_orders(
        &self,
        exchange: &str,
        symbol: &str,
        market: MarketType,
    ) -> Result<Vec<OrderResult>, ExecutionError> {
        let connector = self.connector(exchange)?;
        let orders = connector.cancel_all_orders(symbol, market).await?;
        info!("Canceled {} {} orders on {} for {}", orders.len(), symbol, exchange, self.tenant_id);

        for order in &orders {
            self.persist_update(order).await;
            self.publish_order(order).await;
        }
        Ok(orders)
    }

    pub async fn get_open_orders(
        &self,
        exchange: &str,
        symbol: Option<&str>,
        market: Option<MarketType>,
    ) -> Result<Vec<OrderResult>, ExecutionError> {
        let connector = self.connector(exchange)?;
        Ok(connector.get_open_orders(symbol, market).await?)
    }

    /// Fetch an order's state and record it.
    pub async fn get_order_status(
        &self,
        exchange: &str,
        symbol: &str,
        order_id: &str,
        market: MarketType,
    ) -> Result<OrderResult, ExecutionError> {
        let connector = self.connector(exchange)?;
        let order = connector.get_order_status(symbol, order_id, market).await?;
        self.persist_update(&order).await;
        Ok(order)
    }

    /// Pull fills for `symbol`, store the new ones and publish them.
    pub async fn sync_trades(&self, exchange: &str, symbol: &str, range: TimeRange) -> Result<Vec<TradeFill>, ExecutionError> {
        let connector = self.connector(exchange)?;
        let raw = connector.fetch_trade_history(symbol, range).await?;
        let fills: Vec<TradeFill> = raw
            .iter()
            .map(|t| TradeFill::from(&normalizer::normalize_trade(t, connector.exchange_name())))
            .collect();

        let mut new_fills = 0;
        for fill in &fills {
            match self.store.store_trade(fill, &self.tenant_id).await {
                Ok(true) => {
                    new_fills += 1;
                    let update = PortfolioUpdate::new(UpdateType::Trade, Some(&fill.exchange), fill);
                    self.bus.publish_update(&update, Some(&self.tenant_id)).await;
                }
                Ok(false) => {}
                Err(e) => warn!("Failed to store trade {} on {}: {}", fill.trade_id, fill.exchange, e),
            }
        }
        debug!("Synced {} fills ({} new) for {} on {}", fills.len(), new_fills, symbol, exchange);
        Ok(fills)
    }

    pub async fn get_order_history(&self, exchange: Option<&str>, symbol: Option<&str>, limit: usize) -> Vec<OrderResult> {
        self.store.get_order_history(&self.tenant_id, exchange, symbol, limit).await
    }

    pub async fn get_trade_history(&self, exchange: Option<&str>, symbol: Option<&str>, limit: usize) -> Vec<TradeFill> {
        self.store.get_trade_history(&self.tenant_id, exchange, symbol, limit).await
    }

    async fn persist_order(&self, order: &OrderResult) {
        if let Err(e) = self.store.store_order(order, &self.tenant_id).await {
            warn!("Order {} on {} placed but not persisted: {}", order.order_id, order.exchange, e);
        }
    }

    async fn persist_update(&self, order: &OrderResult) {
        match self
            .store
            .update_order(&order.order_id, &order.exchange, &OrderUpdate::from(order))
            .await
        {
            Ok(true) => {}
            // Orders placed elsewhere are recorded on first sight
            Ok(false) => self.persist_order(order).await,
            Err(e) => warn!("Order {} on {} updated but not persisted: {}", order.order_id, order.exchange, e),
        }
    }

    async fn publish_order(&self, order: &OrderResult) {
        let update = PortfolioUpdate::new(UpdateType::Order, Some(&order.exchange), order);
        self.bus.publish_update(&update, Some(&self.tenant_id)).await;
    }
}
