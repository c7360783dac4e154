//! Portfolio aggregation across fake exchange connectors.

mod common;

use common::{long_position, spot_balance, FakeConnector};
use meridian::services::aggregator::{calculate_asset_allocation, create_snapshot};
use meridian::services::normalizer::{normalize_balance, usd_price};
use meridian::services::{MonitorThresholds, PortfolioManager, RealtimeMonitor};
use meridian::types::{AlertSeverity, AlertType, MarketType, UnifiedBalance};
use std::sync::atomic::Ordering;
use std::sync::Arc;

const HOUR_MS: i64 = 60 * 60 * 1000;

fn balance(exchange: &str, asset: &str, total: f64, usd_value: f64) -> UnifiedBalance {
    UnifiedBalance {
        exchange: exchange.to_string(),
        asset: asset.to_string(),
        total,
        available: total,
        locked: 0.0,
        usd_value,
        market: MarketType::Spot,
        timestamp: 0,
    }
}

// =============================================================================
// Snapshot fan-out
// =============================================================================

#[tokio::test]
async fn test_partial_failure_keeps_healthy_connector() {
    let manager = PortfolioManager::default();
    manager
        .register_connector(Arc::new(
            FakeConnector::new("binance").with_balances(vec![spot_balance("usdt", "1500")]),
        ))
        .await;
    manager
        .register_connector(Arc::new(
            FakeConnector::new("bybit")
                .with_balances(vec![spot_balance("USDC", "99")])
                .failing_balances(),
        ))
        .await;

    let snapshot = manager.fetch_portfolio_snapshot().await;

    assert_eq!(snapshot.balances.len(), 1);
    assert_eq!(snapshot.balances[0].exchange, "binance");
    assert_eq!(snapshot.balances[0].asset, "USDT");
    assert_eq!(snapshot.total_net_equity, 1500.0);
    assert_eq!(manager.history_len(), 1);
}

#[tokio::test]
async fn test_unpriced_assets_add_no_equity() {
    let manager = PortfolioManager::default();
    manager
        .register_connector(Arc::new(FakeConnector::new("binance").with_balances(vec![
            spot_balance("USDT", "1000"),
            spot_balance("BTC", "0.5"),
        ])))
        .await;

    let snapshot = manager.fetch_portfolio_snapshot().await;

    assert_eq!(snapshot.total_net_equity, 1000.0);
    let btc = snapshot.balances.iter().find(|b| b.asset == "BTC").unwrap();
    assert_eq!(btc.total, 0.5);
    assert_eq!(btc.usd_value, 0.0);
}

#[tokio::test]
async fn test_positions_feed_unrealized_pnl() {
    let manager = PortfolioManager::default();
    manager
        .register_connector(Arc::new(
            FakeConnector::new("binance")
                .with_balances(vec![spot_balance("USDT", "10000")])
                .with_positions(vec![long_position("BTCUSDT", "-2", "100", "90")]),
        ))
        .await;

    let snapshot = manager.fetch_portfolio_snapshot().await;

    assert_eq!(snapshot.positions.len(), 1);
    // Short 2 from 100 to 90 gains 20
    assert_eq!(snapshot.total_unrealized_pnl, 20.0);
}

#[tokio::test]
async fn test_remove_connector_unsubscribes_first() {
    let manager = PortfolioManager::default();
    let connector = Arc::new(FakeConnector::new("binance"));
    manager.register_connector(connector.clone()).await;

    assert!(manager.remove_connector("BINANCE").await);
    assert_eq!(connector.unsubscribed.load(Ordering::SeqCst), 1);
    assert!(manager.connector_names().is_empty());
}

#[tokio::test]
async fn test_replacing_connector_stops_old_streams() {
    let manager = PortfolioManager::default();
    let old = Arc::new(FakeConnector::new("binance"));
    manager.register_connector(old.clone()).await;
    manager.register_connector(Arc::new(FakeConnector::new("binance"))).await;

    assert_eq!(old.unsubscribed.load(Ordering::SeqCst), 1);
    assert_eq!(manager.connector_names(), vec!["binance".to_string()]);
}

// =============================================================================
// History and 24h change
// =============================================================================

#[test]
fn test_history_keeps_newest() {
    let manager = PortfolioManager::new(2);
    for ts in [1, 2, 3] {
        manager.record_snapshot(create_snapshot(Vec::new(), Vec::new(), Vec::new(), None, ts));
    }
    let kept: Vec<i64> = manager
        .get_snapshots_in_range(i64::MIN, i64::MAX)
        .iter()
        .map(|s| s.timestamp)
        .collect();
    assert_eq!(kept, vec![2, 3]);
}

#[test]
fn test_change_24h_dropped_after_a_day() {
    let previous = create_snapshot(vec![balance("binance", "USDT", 1000.0, 1000.0)], Vec::new(), Vec::new(), None, 0);

    let late = create_snapshot(
        vec![balance("binance", "USDT", 1200.0, 1200.0)],
        Vec::new(),
        Vec::new(),
        Some(&previous),
        25 * HOUR_MS,
    );
    assert!(late.change_24h.is_none());

    let recent = create_snapshot(
        vec![balance("binance", "USDT", 1200.0, 1200.0)],
        Vec::new(),
        Vec::new(),
        Some(&previous),
        23 * HOUR_MS,
    );
    let change = recent.change_24h.unwrap();
    assert_eq!(change.absolute, 200.0);
    assert!((change.percentage - 20.0).abs() < 1e-9);
}

#[test]
fn test_asset_allocation_sums_to_hundred() {
    let balances = vec![
        balance("binance", "USDT", 333.0, 333.0),
        balance("bybit", "USDC", 333.0, 333.0),
        balance("binance", "DAI", 334.0, 334.0),
        balance("binance", "BTC", 1.0, 0.0),
    ];
    let allocation = calculate_asset_allocation(&balances);
    let sum: f64 = allocation.iter().map(|a| a.percentage).sum();
    assert!((sum - 100.0).abs() <= 0.01);
    assert!(allocation.iter().all(|a| a.asset != "BTC"));

    assert!(calculate_asset_allocation(&[balance("binance", "BTC", 1.0, 0.0)]).is_empty());
}

#[test]
fn test_stablecoin_pricing() {
    let usdt = normalize_balance(&spot_balance("usdt", "12.5"), "binance", usd_price("usdt"));
    assert_eq!(usdt.usd_value, 12.5);
    let eth = normalize_balance(&spot_balance("eth", "3"), "binance", usd_price("eth"));
    assert_eq!(eth.usd_value, 0.0);
}

// =============================================================================
// Monitor over real snapshot cycles
// =============================================================================

#[tokio::test]
async fn test_balance_jump_raises_one_critical_alert() {
    let monitor = RealtimeMonitor::new(MonitorThresholds::default());

    let before = create_snapshot(vec![balance("binance", "BTC", 1.0, 100.0)], Vec::new(), Vec::new(), None, 0);
    assert!(monitor.process_snapshot(&before).await.is_empty());

    let after = create_snapshot(
        vec![balance("binance", "BTC", 1.0, 20_100.0)],
        Vec::new(),
        Vec::new(),
        Some(&before),
        60_000,
    );
    let alerts = monitor.process_snapshot(&after).await;

    let balance_alerts: Vec<_> = alerts
        .iter()
        .filter(|a| a.alert_type == AlertType::LargeBalanceChange)
        .collect();
    assert_eq!(balance_alerts.len(), 1);
    assert_eq!(balance_alerts[0].severity, AlertSeverity::Critical);
}
