//! Portfolio aggregation math over unified records.

use crate::types::{
    AssetAllocation, EquityChange, ExchangeAllocation, PortfolioSnapshot, UnifiedBalance,
    UnifiedOrder, UnifiedPosition,
};
use std::collections::HashMap;

const DAY_MS: i64 = 24 * 60 * 60 * 1000;

/// Merge balances that share (exchange, asset), summing the amounts.
///
/// Spot and futures wallets of the same asset collapse into one entry; the
/// first entry's market tag is kept.
pub fn aggregate_balances(balances: &[UnifiedBalance]) -> Vec<UnifiedBalance> {
    let mut order: Vec<(String, String)> = Vec::new();
    let mut merged: HashMap<(String, String), UnifiedBalance> = HashMap::new();

    for balance in balances {
        let key = (balance.exchange.clone(), balance.asset.clone());
        match merged.get_mut(&key) {
            Some(existing) => {
                existing.total += balance.total;
                existing.available += balance.available;
                existing.locked += balance.locked;
                existing.usd_value += balance.usd_value;
                existing.timestamp = existing.timestamp.max(balance.timestamp);
            }
            None => {
                order.push(key.clone());
                merged.insert(key, balance.clone());
            }
        }
    }

    order.into_iter().filter_map(|key| merged.remove(&key)).collect()
}

fn allocation_groups<F>(balances: &[UnifiedBalance], key: F) -> (Vec<(String, f64)>, f64)
where
    F: Fn(&UnifiedBalance) -> &str,
{
    let mut groups: HashMap<String, f64> = HashMap::new();
    for balance in balances.iter().filter(|b| b.usd_value > 0.0) {
        *groups.entry(key(balance).to_string()).or_insert(0.0) += balance.usd_value;
    }
    let total: f64 = groups.values().sum();
    let mut groups: Vec<(String, f64)> = groups.into_iter().collect();
    groups.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal).then_with(|| a.0.cmp(&b.0)));
    (groups, total)
}

fn percentage(part: f64, total: f64) -> f64 {
    if total > 0.0 {
        part / total * 100.0
    } else {
        0.0
    }
}

/// USD share per asset across all exchanges, largest first.
pub fn calculate_asset_allocation(balances: &[UnifiedBalance]) -> Vec<AssetAllocation> {
    let (groups, total) = allocation_groups(balances, |b| &b.asset);
    groups
        .into_iter()
        .map(|(asset, usd_value)| AssetAllocation {
            asset,
            usd_value,
            percentage: percentage(usd_value, total),
        })
        .collect()
}

/// USD share per exchange, largest first.
pub fn calculate_exchange_allocation(balances: &[UnifiedBalance]) -> Vec<ExchangeAllocation> {
    let (groups, total) = allocation_groups(balances, |b| &b.exchange);
    groups
        .into_iter()
        .map(|(exchange, usd_value)| ExchangeAllocation {
            exchange,
            usd_value,
            percentage: percentage(usd_value, total),
        })
        .collect()
}

/// Equity change against `previous`, defined only when it is at most 24h old.
pub fn calculate_change_24h(total_net_equity: f64, timestamp: i64, previous: Option<&PortfolioSnapshot>) -> Option<EquityChange> {
    let previous = previous?;
    if timestamp - previous.timestamp > DAY_MS {
        return None;
    }
    let absolute = total_net_equity - previous.total_net_equity;
    Some(EquityChange {
        absolute,
        percentage: percentage_change(absolute, previous.total_net_equity),
    })
}

fn percentage_change(absolute: f64, base: f64) -> f64 {
    if base != 0.0 {
        absolute / base * 100.0
    } else {
        0.0
    }
}

/// Build an immutable snapshot from one fetch cycle.
pub fn create_snapshot(
    balances: Vec<UnifiedBalance>,
    positions: Vec<UnifiedPosition>,
    open_orders: Vec<UnifiedOrder>,
    previous: Option<&PortfolioSnapshot>,
    timestamp: i64,
) -> PortfolioSnapshot {
    let balances = aggregate_balances(&balances);
    let total_net_equity: f64 = balances.iter().map(|b| b.usd_value).sum();
    let total_unrealized_pnl: f64 = positions.iter().map(|p| p.unrealized_pnl).sum();

    PortfolioSnapshot {
        timestamp,
        total_net_equity,
        total_unrealized_pnl,
        asset_allocation: calculate_asset_allocation(&balances),
        exchange_allocation: calculate_exchange_allocation(&balances),
        change_24h: calculate_change_24h(total_net_equity, timestamp, previous),
        positions,
        balances,
        open_orders,
    }
}
