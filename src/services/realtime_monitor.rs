//! Snapshot-to-snapshot anomaly detection.
//!
//! Each cycle is compared against the previous cycle only; state is replaced
//! after every check has run. Balance and equity checks need a previous cycle,
//! so the first snapshot only reports positions it sees opened.

use super::event_bus::EventBus;
use crate::types::{AlertEvent, AlertSeverity, AlertType, PortfolioSnapshot};
use parking_lot::Mutex;
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{info, warn};

/// Alert thresholds.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MonitorThresholds {
    /// Absolute USD change of one (exchange, asset) balance.
    pub large_balance_change: f64,
    /// Notional of a newly opened position.
    pub large_position: f64,
    /// Fractional equity change between cycles (negative).
    pub rapid_drawdown: f64,
}

impl Default for MonitorThresholds {
    fn default() -> Self {
        Self {
            large_balance_change: 10_000.0,
            large_position: 50_000.0,
            rapid_drawdown: -0.05,
        }
    }
}

/// Balance moves beyond this percentage are critical.
const CRITICAL_BALANCE_CHANGE_PCT: f64 = 50.0;

#[derive(Debug, Default)]
struct MonitorState {
    balances: HashMap<(String, String), f64>,
    positions: HashMap<(String, String), f64>,
    equity: Option<f64>,
}

pub struct RealtimeMonitor {
    tenant_id: Option<String>,
    thresholds: MonitorThresholds,
    state: Mutex<MonitorState>,
    bus: Option<Arc<EventBus>>,
}

impl RealtimeMonitor {
    pub fn new(thresholds: MonitorThresholds) -> Self {
        Self {
            tenant_id: None,
            thresholds,
            state: Mutex::new(MonitorState::default()),
            bus: None,
        }
    }

    /// Publish alerts on `bus`, tagged with `tenant_id`.
    pub fn with_bus(mut self, bus: Arc<EventBus>, tenant_id: impl Into<String>) -> Self {
        self.bus = Some(bus);
        self.tenant_id = Some(tenant_id.into());
        self
    }

    pub fn thresholds(&self) -> &MonitorThresholds {
        &self.thresholds
    }

    /// Detect anomalies in `snapshot` and publish them.
    pub async fn process_snapshot(&self, snapshot: &PortfolioSnapshot) -> Vec<AlertEvent> {
        let alerts = self.detect(snapshot);
        for alert in &alerts {
            info!("[{}] {}", alert.severity, alert.message);
            if let Some(ref bus) = self.bus {
                bus.publish_alert(alert, self.tenant_id.as_deref()).await;
            }
        }
        alerts
    }

    /// Compare against the previous cycle and then record this one.
    pub fn detect(&self, snapshot: &PortfolioSnapshot) -> Vec<AlertEvent> {
        let mut state = self.state.lock();

        let balances: HashMap<(String, String), f64> = snapshot
            .balances
            .iter()
            .fold(HashMap::new(), |mut acc, b| {
                *acc.entry((b.exchange.clone(), b.asset.clone())).or_insert(0.0) += b.usd_value;
                acc
            });
        let positions: HashMap<(String, String), f64> = snapshot
            .positions
            .iter()
            .filter(|p| p.size > 0.0)
            .map(|p| ((p.exchange.clone(), p.symbol.clone()), p.notional()))
            .collect();

        let mut alerts = Vec::new();
        if let Some(prev_equity) = state.equity {
            self.check_balances(&state.balances, &balances, &mut alerts);
            self.check_drawdown(prev_equity, snapshot.total_net_equity, &mut alerts);
        }
        self.check_positions(&state.positions, &positions, &mut alerts);

        state.balances = balances;
        state.positions = positions;
        state.equity = Some(snapshot.total_net_equity);
        alerts
    }

    fn check_balances(
        &self,
        previous: &HashMap<(String, String), f64>,
        current: &HashMap<(String, String), f64>,
        alerts: &mut Vec<AlertEvent>,
    ) {
        let mut keys: Vec<&(String, String)> = previous.keys().chain(current.keys()).collect();
        keys.sort();
        keys.dedup();

        for key in keys {
            let before = previous.get(key).copied().unwrap_or(0.0);
            let after = current.get(key).copied().unwrap_or(0.0);
            let change = after - before;
            if change.abs() < self.thresholds.large_balance_change {
                continue;
            }

            let change_pct = if before != 0.0 {
                Some(change / before * 100.0)
            } else {
                None
            };
            let severity = match change_pct {
                Some(pct) if pct.abs() <= CRITICAL_BALANCE_CHANGE_PCT => AlertSeverity::Warning,
                _ => AlertSeverity::Critical,
            };
            let (exchange, asset) = key;
            let message = match change_pct {
                Some(pct) => format!(
                    "Large balance change on {}: {} changed by ${:.2} ({:.2}%)",
                    exchange, asset, change, pct
                ),
                None => format!("Large balance change on {}: {} changed by ${:.2}", exchange, asset, change),
            };
            alerts.push(AlertEvent::new(
                AlertType::LargeBalanceChange,
                severity,
                message,
                Some(exchange.clone()),
                json!({
                    "asset": asset,
                    "previousUsdValue": before,
                    "currentUsdValue": after,
                    "change": change,
                    "changePercent": change_pct,
                }),
            ));
        }
    }

    fn check_positions(
        &self,
        previous: &HashMap<(String, String), f64>,
        current: &HashMap<(String, String), f64>,
        alerts: &mut Vec<AlertEvent>,
    ) {
        let mut opened: Vec<(&(String, String), f64)> = current
            .iter()
            .filter(|(key, notional)| !previous.contains_key(*key) && **notional >= self.thresholds.large_position)
            .map(|(key, notional)| (key, *notional))
            .collect();
        opened.sort_by(|a, b| a.0.cmp(b.0));

        for ((exchange, symbol), notional) in opened {
            alerts.push(AlertEvent::new(
                AlertType::LargePositionOpening,
                AlertSeverity::Warning,
                format!("Large position opened on {}: {} worth ${:.2}", exchange, symbol, notional),
                Some(exchange.clone()),
                json!({ "symbol": symbol, "notional": notional }),
            ));
        }
    }

    fn check_drawdown(&self, previous: f64, current: f64, alerts: &mut Vec<AlertEvent>) {
        if previous <= 0.0 {
            return;
        }
        let change = (current - previous) / previous;
        if change <= self.thresholds.rapid_drawdown {
            warn!("Rapid drawdown detected: {:.2}%", change * 100.0);
            alerts.push(AlertEvent::new(
                AlertType::RapidDrawdown,
                AlertSeverity::Critical,
                format!("Rapid drawdown: equity fell {:.2}% since last snapshot", change * 100.0),
                None,
                json!({
                    "previousEquity": previous,
                    "currentEquity": current,
                    "changePercent": change * 100.0,
                }),
            ));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{MarketType, PositionSide, UnifiedBalance, UnifiedPosition};

    fn balance(asset: &str, usd_value: f64) -> UnifiedBalance {
        UnifiedBalance {
            exchange: "binance".to_string(),
            asset: asset.to_string(),
            total: usd_value,
            available: usd_value,
            locked: 0.0,
            usd_value,
            market: MarketType::Spot,
            timestamp: 0,
        }
    }

    fn position(symbol: &str, size: f64, mark: f64) -> UnifiedPosition {
        UnifiedPosition {
            exchange: "binance".to_string(),
            symbol: symbol.to_string(),
            side: PositionSide::Long,
            size,
            entry_price: mark,
            mark_price: mark,
            unrealized_pnl: 0.0,
            leverage: None,
            liquidation_price: None,
            timestamp: 0,
        }
    }

    fn snapshot(balances: Vec<UnifiedBalance>, positions: Vec<UnifiedPosition>) -> PortfolioSnapshot {
        PortfolioSnapshot {
            timestamp: 0,
            total_net_equity: balances.iter().map(|b| b.usd_value).sum(),
            total_unrealized_pnl: 0.0,
            asset_allocation: Vec::new(),
            exchange_allocation: Vec::new(),
            positions,
            balances,
            open_orders: Vec::new(),
            change_24h: None,
        }
    }

    #[test]
    fn test_first_cycle_has_no_balance_baseline() {
        let monitor = RealtimeMonitor::new(MonitorThresholds::default());
        let alerts = monitor.detect(&snapshot(vec![balance("USDT", 1_000_000.0)], Vec::new()));
        assert!(alerts.is_empty());
    }

    #[test]
    fn test_large_position_on_first_cycle() {
        let monitor = RealtimeMonitor::new(MonitorThresholds::default());
        let alerts = monitor.detect(&snapshot(
            vec![balance("USDT", 1_000_000.0)],
            vec![position("BTCUSDT", 10.0, 40_000.0)],
        ));

        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].alert_type, AlertType::LargePositionOpening);
        assert_eq!(alerts[0].data["notional"], 400_000.0);

        // Already known on the next cycle
        assert!(monitor
            .detect(&snapshot(vec![balance("USDT", 1_000_000.0)], vec![position("BTCUSDT", 10.0, 40_000.0)]))
            .is_empty());
    }

    #[test]
    fn test_large_balance_jump_is_critical() {
        let monitor = RealtimeMonitor::new(MonitorThresholds::default());
        monitor.detect(&snapshot(vec![balance("BTC", 100.0)], Vec::new()));
        let alerts = monitor.detect(&snapshot(vec![balance("BTC", 20_100.0)], Vec::new()));

        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].alert_type, AlertType::LargeBalanceChange);
        assert_eq!(alerts[0].severity, AlertSeverity::Critical);
        assert_eq!(alerts[0].exchange.as_deref(), Some("binance"));
    }

    #[test]
    fn test_moderate_balance_change_is_warning() {
        let monitor = RealtimeMonitor::new(MonitorThresholds::default());
        monitor.detect(&snapshot(vec![balance("USDT", 100_000.0)], Vec::new()));
        let alerts = monitor.detect(&snapshot(vec![balance("USDT", 115_000.0)], Vec::new()));
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].severity, AlertSeverity::Warning);
    }

    #[test]
    fn test_large_position_opening() {
        let monitor = RealtimeMonitor::new(MonitorThresholds::default());
        monitor.detect(&snapshot(vec![balance("USDT", 10_000.0)], vec![position("ETHUSDT", 100.0, 3_000.0)]));
        let alerts = monitor.detect(&snapshot(
            vec![balance("USDT", 10_000.0)],
            vec![position("ETHUSDT", 100.0, 3_000.0), position("BTCUSDT", 2.0, 40_000.0), position("SOLUSDT", 1.0, 100.0)],
        ));

        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].alert_type, AlertType::LargePositionOpening);
        assert_eq!(alerts[0].severity, AlertSeverity::Warning);
        assert!(alerts[0].message.contains("BTCUSDT"));
    }

    #[test]
    fn test_rapid_drawdown() {
        let monitor = RealtimeMonitor::new(MonitorThresholds {
            large_balance_change: f64::MAX,
            ..MonitorThresholds::default()
        });
        monitor.detect(&snapshot(vec![balance("USDT", 10_000.0)], Vec::new()));
        let alerts = monitor.detect(&snapshot(vec![balance("USDT", 9_000.0)], Vec::new()));

        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].alert_type, AlertType::RapidDrawdown);
        assert_eq!(alerts[0].severity, AlertSeverity::Critical);

        // Compared against the previous cycle, not the first one
        assert!(monitor.detect(&snapshot(vec![balance("USDT", 8_800.0)], Vec::new())).is_empty());
    }

    #[tokio::test]
    async fn test_alerts_published_with_tenant() {
        let bus = Arc::new(EventBus::local());
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        bus.subscribe_to_alerts(move |envelope| {
            let _ = tx.send(envelope);
        });

        let monitor = RealtimeMonitor::new(MonitorThresholds::default()).with_bus(bus, "tenant-7");
        monitor.process_snapshot(&snapshot(vec![balance("BTC", 100.0)], Vec::new())).await;
        let alerts = monitor.process_snapshot(&snapshot(vec![balance("BTC", 20_100.0)], Vec::new())).await;
        assert_eq!(alerts.len(), 1);

        let envelope = tokio::time::timeout(std::time::Duration::from_millis(500), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(envelope.tenant_id.as_deref(), Some("tenant-7"));
        assert_eq!(envelope.payload.id, alerts[0].id);
    }
}
