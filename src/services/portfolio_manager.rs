//! Per-tenant portfolio aggregation across exchange connectors.

use super::aggregator;
use super::normalizer::{self, usd_price};
use crate::connectors::{ConnectorResult, ExchangeConnector};
use crate::types::{PortfolioSnapshot, RawBalance, RawOrder, RawPosition, UnifiedBalance, UnifiedOrder, UnifiedPosition};
use dashmap::DashMap;
use futures_util::future::join_all;
use parking_lot::RwLock;
use std::collections::VecDeque;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Default snapshot history capacity.
pub const DEFAULT_MAX_SNAPSHOTS: usize = 1000;

struct ConnectorData {
    balances: Vec<UnifiedBalance>,
    positions: Vec<UnifiedPosition>,
    orders: Vec<UnifiedOrder>,
}

/// Fans fetches out to every registered connector and keeps snapshot history.
pub struct PortfolioManager {
    connectors: DashMap<String, Arc<dyn ExchangeConnector>>,
    history: RwLock<VecDeque<Arc<PortfolioSnapshot>>>,
    max_snapshots: usize,
}

impl PortfolioManager {
    pub fn new(max_snapshots: usize) -> Self {
        let max_snapshots = max_snapshots.max(1);
        Self {
            connectors: DashMap::new(),
            history: RwLock::new(VecDeque::with_capacity(max_snapshots.min(DEFAULT_MAX_SNAPSHOTS))),
            max_snapshots,
        }
    }

    /// Register a connector under its exchange name, stopping the streams of
    /// any connector it replaces.
    pub async fn register_connector(&self, connector: Arc<dyn ExchangeConnector>) {
        let name = connector.exchange_name().to_lowercase();
        if let Some(previous) = self.connectors.insert(name.clone(), connector) {
            previous.unsubscribe_realtime_updates().await;
            debug!("Replaced {} connector", name);
        }
        info!("Registered {} connector", name);
    }

    /// Unsubscribe and drop a connector. Returns false if none was registered.
    pub async fn remove_connector(&self, exchange: &str) -> bool {
        match self.connectors.remove(&exchange.to_lowercase()) {
            Some((name, connector)) => {
                connector.unsubscribe_realtime_updates().await;
                info!("Removed {} connector", name);
                true
            }
            None => false,
        }
    }

    /// Registered exchange names, sorted.
    pub fn connector_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.connectors.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    fn connectors(&self) -> Vec<Arc<dyn ExchangeConnector>> {
        self.connectors.iter().map(|e| e.value().clone()).collect()
    }

    /// Fetch every connector concurrently and build a new snapshot.
    ///
    /// A connector whose fetch fails is logged and left out; the others
    /// still make up the snapshot.
    pub async fn fetch_portfolio_snapshot(&self) -> Arc<PortfolioSnapshot> {
        let connectors = self.connectors();
        let results = join_all(connectors.iter().map(|c| fetch_connector(c.as_ref()))).await;

        let mut balances = Vec::new();
        let mut positions = Vec::new();
        let mut orders = Vec::new();
        for (connector, result) in connectors.iter().zip(results) {
            match result {
                Ok(data) => {
                    balances.extend(data.balances);
                    positions.extend(data.positions);
                    orders.extend(data.orders);
                }
                Err(e) => warn!("Excluding {} from snapshot: {}", connector.exchange_name(), e),
            }
        }

        let previous = self.get_latest_snapshot();
        let snapshot = aggregator::create_snapshot(
            balances,
            positions,
            orders,
            previous.as_deref(),
            chrono::Utc::now().timestamp_millis(),
        );
        debug!(
            "Snapshot: equity ${:.2}, {} balances, {} positions",
            snapshot.total_net_equity,
            snapshot.balances.len(),
            snapshot.positions.len()
        );
        self.record_snapshot(snapshot)
    }

    /// Append to history, evicting the oldest beyond capacity.
    pub fn record_snapshot(&self, snapshot: PortfolioSnapshot) -> Arc<PortfolioSnapshot> {
        let snapshot = Arc::new(snapshot);
        let mut history = self.history.write();
        history.push_back(snapshot.clone());
        while history.len() > self.max_snapshots {
            history.pop_front();
        }
        snapshot
    }

    pub fn get_latest_snapshot(&self) -> Option<Arc<PortfolioSnapshot>> {
        self.history.read().back().cloned()
    }

    /// Snapshots with `start <= timestamp <= end`, oldest first.
    pub fn get_snapshots_in_range(&self, start: i64, end: i64) -> Vec<Arc<PortfolioSnapshot>> {
        self.history
            .read()
            .iter()
            .filter(|s| s.timestamp >= start && s.timestamp <= end)
            .cloned()
            .collect()
    }

    pub fn history_len(&self) -> usize {
        self.history.read().len()
    }

    pub fn max_snapshots(&self) -> usize {
        self.max_snapshots
    }

    /// Stop every connector's streams and drop them.
    pub async fn shutdown(&self) {
        let names = self.connector_names();
        for name in names {
            self.remove_connector(&name).await;
        }
    }
}

impl Default for PortfolioManager {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_SNAPSHOTS)
    }
}

async fn fetch_connector(connector: &dyn ExchangeConnector) -> ConnectorResult<ConnectorData> {
    let exchange = connector.exchange_name().to_string();
    let (balances, positions, orders) = tokio::join!(
        connector.fetch_balances(),
        connector.fetch_positions(),
        connector.fetch_open_orders()
    );
    let balances: Vec<RawBalance> = balances?;
    let positions: Vec<RawPosition> = positions?;
    let orders: Vec<RawOrder> = orders?;

    Ok(ConnectorData {
        balances: balances
            .iter()
            .map(|b| normalizer::normalize_balance(b, &exchange, usd_price(&b.asset)))
            .collect(),
        positions: positions
            .iter()
            .map(|p| normalizer::normalize_position(p, &exchange))
            .collect(),
        orders: orders.iter().map(|o| normalizer::normalize_order(o, &exchange)).collect(),
    })
}
