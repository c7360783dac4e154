//! Per-tenant cache of portfolio and execution services.
//!
//! A tenant's context is built on first access from its stored credentials.
//! Concurrent first requests share one build through a per-tenant `OnceCell`,
//! so at most one connector set exists per tenant. Stream updates from all of
//! a tenant's connectors are published in arrival order by one forwarding task.

use super::credential_store::{CredentialStore, CredentialStoreError};
use super::event_bus::EventBus;
use super::execution_engine::ExecutionEngine;
use super::order_store::OrderStore;
use super::portfolio_manager::{PortfolioManager, DEFAULT_MAX_SNAPSHOTS};
use super::realtime_monitor::{MonitorThresholds, RealtimeMonitor};
use crate::connectors::{ConnectorError, ConnectorFactory, ConnectorHandle, RealtimeCallback};
use crate::types::{
    ExchangeCredentials, PortfolioSnapshot, PortfolioUpdate, RealtimeUpdate, RiskLimits, UpdateType,
};
use dashmap::DashMap;
use futures_util::future::join_all;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{mpsc, OnceCell};
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum ContextError {
    /// Unsupported exchange or a connector that could not be built.
    #[error(transparent)]
    Connector(#[from] ConnectorError),

    #[error("Connection test for {exchange} failed: {source}")]
    ConnectionTest {
        exchange: String,
        #[source]
        source: ConnectorError,
    },

    #[error(transparent)]
    Credentials(#[from] CredentialStoreError),
}

impl ContextError {
    pub fn category(&self) -> &'static str {
        match self {
            ContextError::Connector(e) => e.category(),
            ContextError::ConnectionTest { .. } => "connection_failed",
            ContextError::Credentials(_) => "credentials",
        }
    }
}

/// Settings applied to every tenant context.
#[derive(Debug, Clone, Copy)]
pub struct ContextSettings {
    pub max_snapshots: usize,
    pub risk_limits: RiskLimits,
    pub thresholds: MonitorThresholds,
}

impl Default for ContextSettings {
    fn default() -> Self {
        Self {
            max_snapshots: DEFAULT_MAX_SNAPSHOTS,
            risk_limits: RiskLimits::default(),
            thresholds: MonitorThresholds::default(),
        }
    }
}

/// Services owned by one tenant.
pub struct UserContext {
    tenant_id: String,
    portfolio: Arc<PortfolioManager>,
    execution: Arc<ExecutionEngine>,
    monitor: RealtimeMonitor,
    bus: Arc<EventBus>,
    updates: mpsc::UnboundedSender<RealtimeUpdate>,
}

impl UserContext {
    pub fn tenant_id(&self) -> &str {
        &self.tenant_id
    }

    pub fn portfolio(&self) -> &Arc<PortfolioManager> {
        &self.portfolio
    }

    pub fn execution(&self) -> &Arc<ExecutionEngine> {
        &self.execution
    }

    pub fn monitor(&self) -> &RealtimeMonitor {
        &self.monitor
    }

    /// One snapshot cycle: fetch, run the monitor, publish the snapshot.
    pub async fn refresh(&self) -> Arc<PortfolioSnapshot> {
        let snapshot = self.portfolio.fetch_portfolio_snapshot().await;
        self.monitor.process_snapshot(&snapshot).await;

        let update = PortfolioUpdate::new(UpdateType::Snapshot, None, snapshot.as_ref());
        self.bus.publish_update(&update, Some(&self.tenant_id)).await;
        snapshot
    }

    async fn attach(&self, handle: ConnectorHandle) {
        attach_connector(&self.tenant_id, &self.portfolio, &self.execution, &self.updates, handle).await;
    }

    async fn detach(&self, exchange: &str) {
        self.portfolio.remove_connector(exchange).await;
        self.execution.remove_connector(exchange);
    }
}

/// Register a connector with both services and start its private stream.
async fn attach_connector(
    tenant_id: &str,
    portfolio: &PortfolioManager,
    execution: &ExecutionEngine,
    updates: &mpsc::UnboundedSender<RealtimeUpdate>,
    handle: ConnectorHandle,
) {
    let ConnectorHandle { data, trading } = handle;
    match trading {
        Some(trading) => execution.register_connector(trading),
        None => debug!("{} connector for {} is read-only", data.exchange_name(), tenant_id),
    }
    portfolio.register_connector(data.clone()).await;
    data.subscribe_realtime_updates(realtime_callback(updates.clone())).await;
}

fn realtime_callback(updates: mpsc::UnboundedSender<RealtimeUpdate>) -> RealtimeCallback {
    Arc::new(move |update: RealtimeUpdate| {
        let _ = updates.send(update);
    })
}

/// Publish a tenant's stream updates in order. Stops once every sender is gone.
fn spawn_update_forwarder(bus: Arc<EventBus>, tenant_id: String) -> mpsc::UnboundedSender<RealtimeUpdate> {
    let (tx, mut rx) = mpsc::unbounded_channel::<RealtimeUpdate>();
    tokio::spawn(async move {
        while let Some(update) = rx.recv().await {
            bus.publish_update(&to_portfolio_update(&update), Some(&tenant_id)).await;
        }
        debug!("Update forwarding for {} stopped", tenant_id);
    });
    tx
}

fn to_portfolio_update(update: &RealtimeUpdate) -> PortfolioUpdate {
    let kind = update.update_type();
    let exchange = Some(update.exchange());
    match update {
        RealtimeUpdate::Balance(b) => PortfolioUpdate::new(kind, exchange, b),
        RealtimeUpdate::Position(p) => PortfolioUpdate::new(kind, exchange, p),
        RealtimeUpdate::Order(o) => PortfolioUpdate::new(kind, exchange, o),
        RealtimeUpdate::Trade(t) => PortfolioUpdate::new(kind, exchange, t),
    }
}

/// Tenant → context cache.
pub struct UserContextService {
    contexts: DashMap<String, Arc<OnceCell<Arc<UserContext>>>>,
    credentials: Arc<dyn CredentialStore>,
    factory: Arc<dyn ConnectorFactory>,
    orders: Arc<dyn OrderStore>,
    bus: Arc<EventBus>,
    settings: ContextSettings,
}

impl UserContextService {
    pub fn new(
        credentials: Arc<dyn CredentialStore>,
        factory: Arc<dyn ConnectorFactory>,
        orders: Arc<dyn OrderStore>,
        bus: Arc<EventBus>,
        settings: ContextSettings,
    ) -> Self {
        Self {
            contexts: DashMap::new(),
            credentials,
            factory,
            orders,
            bus,
            settings,
        }
    }

    /// The tenant's context, building it on first access.
    ///
    /// A failed build leaves nothing cached; the next call retries.
    pub async fn get_context(&self, tenant_id: &str) -> Result<Arc<UserContext>, ContextError> {
        let cell = self
            .contexts
            .entry(tenant_id.to_string())
            .or_insert_with(|| Arc::new(OnceCell::new()))
            .clone();
        let context = cell.get_or_try_init(|| self.build_context(tenant_id)).await?;
        Ok(context.clone())
    }

    pub async fn get_portfolio_manager(&self, tenant_id: &str) -> Result<Arc<PortfolioManager>, ContextError> {
        Ok(self.get_context(tenant_id).await?.portfolio.clone())
    }

    pub async fn get_execution_engine(&self, tenant_id: &str) -> Result<Arc<ExecutionEngine>, ContextError> {
        Ok(self.get_context(tenant_id).await?.execution.clone())
    }

    /// Context if already built; never triggers a build.
    pub fn cached(&self, tenant_id: &str) -> Option<Arc<UserContext>> {
        self.contexts.get(tenant_id).and_then(|cell| cell.value().get().cloned())
    }

    pub fn cached_tenants(&self) -> Vec<String> {
        self.contexts
            .iter()
            .filter(|e| e.value().initialized())
            .map(|e| e.key().clone())
            .collect()
    }

    async fn build_context(&self, tenant_id: &str) -> Result<Arc<UserContext>, ContextError> {
        let credentials = self.credentials.get_credentials_by_tenant(tenant_id).await?;

        let updates = spawn_update_forwarder(self.bus.clone(), tenant_id.to_string());
        let portfolio = Arc::new(PortfolioManager::new(self.settings.max_snapshots));
        let execution = Arc::new(
            ExecutionEngine::new(tenant_id, self.orders.clone(), self.bus.clone())
                .with_portfolio(portfolio.clone())
                .with_risk_limits(self.settings.risk_limits),
        );

        for creds in &credentials {
            match self.factory.create(creds) {
                Ok(handle) => attach_connector(tenant_id, &portfolio, &execution, &updates, handle).await,
                Err(e) => warn!("Skipping {} for {}: {}", creds.exchange, tenant_id, e),
            }
        }
        info!(
            "Built context for {} with {} exchange(s)",
            tenant_id,
            portfolio.connector_names().len()
        );

        Ok(Arc::new(UserContext {
            tenant_id: tenant_id.to_string(),
            portfolio,
            execution,
            monitor: RealtimeMonitor::new(self.settings.thresholds).with_bus(self.bus.clone(), tenant_id),
            bus: self.bus.clone(),
            updates,
        }))
    }

    /// Verify credentials against the exchange, store them, and attach the
    /// connector to the tenant's context if it is already live.
    pub async fn register_exchange(&self, tenant_id: &str, credentials: ExchangeCredentials) -> Result<(), ContextError> {
        let handle = self.factory.create(&credentials)?;
        if let Err(source) = handle.data.test_connection().await {
            warn!(
                "Rejected {} credentials for {} (key {}): {}",
                credentials.exchange,
                tenant_id,
                credentials.masked_key(),
                source
            );
            return Err(ContextError::ConnectionTest {
                exchange: credentials.exchange.clone(),
                source,
            });
        }

        self.credentials.save_credentials(tenant_id, &credentials).await?;

        let exchange = credentials.exchange.to_lowercase();
        let cell = self.contexts.get(tenant_id).map(|c| c.value().clone());
        match cell {
            Some(cell) => match cell.get() {
                Some(context) => context.attach(handle).await,
                None => {
                    // A build already underway may have read credentials before the save
                    match cell.get_or_try_init(|| self.build_context(tenant_id)).await {
                        Ok(context) if !context.portfolio.connector_names().contains(&exchange) => {
                            context.attach(handle).await
                        }
                        Ok(_) => debug!("Context build for {} already picked up {}", tenant_id, exchange),
                        Err(e) => debug!("Context for {} unavailable, {} attaches on next access: {}", tenant_id, exchange, e),
                    }
                }
            },
            None => debug!("{} not cached, {} attaches on first access", tenant_id, exchange),
        }
        info!("Registered {} for {}", credentials.exchange, tenant_id);
        Ok(())
    }

    /// Delete stored credentials and detach the live connector. Returns
    /// whether credentials were stored.
    pub async fn remove_exchange(&self, tenant_id: &str, exchange: &str) -> Result<bool, ContextError> {
        let removed = self.credentials.remove_credentials(tenant_id, exchange).await?;
        if let Some(context) = self.cached(tenant_id) {
            context.detach(exchange).await;
        }
        info!("Removed {} for {}", exchange, tenant_id);
        Ok(removed)
    }

    /// Drop a tenant's context, stopping its streams.
    pub async fn evict(&self, tenant_id: &str) -> bool {
        match self.contexts.remove(tenant_id) {
            Some((_, cell)) => {
                if let Some(context) = cell.get() {
                    context.portfolio.shutdown().await;
                }
                debug!("Evicted context for {}", tenant_id);
                true
            }
            None => false,
        }
    }

    /// Run one snapshot cycle for every cached tenant. Returns how many ran.
    pub async fn refresh_all(&self) -> usize {
        let contexts: Vec<Arc<UserContext>> = self
            .contexts
            .iter()
            .filter_map(|e| e.value().get().cloned())
            .collect();
        join_all(contexts.iter().map(|c| c.refresh())).await;
        contexts.len()
    }

    pub async fn shutdown(&self) {
        let tenants: Vec<String> = self.contexts.iter().map(|e| e.key().clone()).collect();
        for tenant in tenants {
            self.evict(&tenant).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{MarketType, PositionSide, UnifiedBalance, UnifiedPosition};

    #[test]
    fn test_realtime_update_keeps_record_shape() {
        let balance = UnifiedBalance {
            exchange: "binance".to_string(),
            asset: "USDT".to_string(),
            total: 10.0,
            available: 10.0,
            locked: 0.0,
            usd_value: 10.0,
            market: MarketType::Spot,
            timestamp: 1,
        };
        let update = to_portfolio_update(&RealtimeUpdate::Balance(balance));
        assert_eq!(update.update_type, UpdateType::Balance);
        assert_eq!(update.exchange.as_deref(), Some("binance"));
        assert_eq!(update.data["asset"], "USDT");

        let position = UnifiedPosition {
            exchange: "binance".to_string(),
            symbol: "BTCUSDT".to_string(),
            side: PositionSide::Long,
            size: 1.0,
            entry_price: 100.0,
            mark_price: 110.0,
            unrealized_pnl: 10.0,
            leverage: None,
            liquidation_price: None,
            timestamp: 1,
        };
        let update = to_portfolio_update(&RealtimeUpdate::Position(position));
        assert_eq!(update.update_type, UpdateType::Position);
        assert_eq!(update.data["symbol"], "BTCUSDT");
    }

    #[test]
    fn test_context_error_categories() {
        let err = ContextError::ConnectionTest {
            exchange: "binance".to_string(),
            source: ConnectorError::Authentication("bad key".to_string()),
        };
        assert_eq!(err.category(), "connection_failed");
        assert!(err.to_string().contains("binance"));
    }
}
