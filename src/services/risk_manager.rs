//! Pre-trade risk validation.

use crate::types::{CurrentPosition, OrderParams, OrderSide, PortfolioSnapshot, RiskCheckResult, RiskLimits};
use std::sync::Arc;
use tracing::debug;

/// Validates orders against configured limits and the latest snapshot.
#[derive(Debug, Clone, Default)]
pub struct RiskManager {
    limits: RiskLimits,
    snapshot: Option<Arc<PortfolioSnapshot>>,
}

impl RiskManager {
    pub fn new(limits: RiskLimits) -> Self {
        Self { limits, snapshot: None }
    }

    pub fn limits(&self) -> &RiskLimits {
        &self.limits
    }

    pub fn set_limits(&mut self, limits: RiskLimits) {
        self.limits = limits;
    }

    /// Use this snapshot for the drawdown check.
    pub fn update_snapshot(&mut self, snapshot: Arc<PortfolioSnapshot>) {
        self.snapshot = Some(snapshot);
    }

    /// Run every check; `allowed` is false if any blocking check failed.
    pub fn validate_order(
        &self,
        params: &OrderParams,
        available_balance: f64,
        current_position: Option<&CurrentPosition>,
    ) -> RiskCheckResult {
        let limits = &self.limits;
        let notional = params.notional();
        let mut reasons = Vec::new();
        let mut warnings = Vec::new();

        if notional > limits.max_order_size {
            reasons.push(format!(
                "Order size {:.2} exceeds maximum {:.2}",
                notional, limits.max_order_size
            ));
        }

        let position_value = current_position.map(|p| p.value).unwrap_or(0.0);
        if position_value + notional > limits.max_position_size {
            reasons.push(format!(
                "Resulting position {:.2} exceeds maximum position size {:.2}",
                position_value + notional,
                limits.max_position_size
            ));
        }

        if params.side == OrderSide::Buy && notional > available_balance {
            reasons.push(format!(
                "Insufficient balance: order requires {:.2}, available {:.2}",
                notional, available_balance
            ));
        }

        if let Some(drawdown) = self.snapshot.as_ref().map(|s| s.drawdown()) {
            if drawdown < limits.max_drawdown {
                reasons.push(format!(
                    "Portfolio drawdown {:.2}% exceeds maximum {:.2}%",
                    drawdown * 100.0,
                    limits.max_drawdown * 100.0
                ));
            }
        }

        if available_balance < limits.min_balance {
            warnings.push(format!(
                "Available balance {:.2} is below minimum {:.2}",
                available_balance, limits.min_balance
            ));
        }

        if !reasons.is_empty() {
            debug!("Risk check failed for {} {}: {}", params.side, params.symbol, reasons.join("; "));
        }

        RiskCheckResult {
            allowed: reasons.is_empty(),
            reasons,
            warnings,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::MarketType;

    fn snapshot(equity: f64, pnl: f64) -> Arc<PortfolioSnapshot> {
        Arc::new(PortfolioSnapshot {
            timestamp: 0,
            total_net_equity: equity,
            total_unrealized_pnl: pnl,
            asset_allocation: Vec::new(),
            exchange_allocation: Vec::new(),
            positions: Vec::new(),
            balances: Vec::new(),
            open_orders: Vec::new(),
            change_24h: None,
        })
    }

    #[test]
    fn test_rejects_order_above_max_size() {
        let risk = RiskManager::default();
        let params = OrderParams::limit("BTCUSDT", OrderSide::Buy, 1.0, 200_000.0, MarketType::Spot);
        let result = risk.validate_order(&params, 1_000_000.0, None);
        assert!(!result.allowed);
        assert!(result.reason().unwrap().contains("exceeds maximum"));
    }

    #[test]
    fn test_evaluates_all_checks() {
        let risk = RiskManager::default();
        let params = OrderParams::limit("BTCUSDT", OrderSide::Buy, 1.0, 200_000.0, MarketType::Spot);
        let position = CurrentPosition {
            symbol: "BTCUSDT".to_string(),
            size: 10.0,
            value: 400_000.0,
        };
        let result = risk.validate_order(&params, 50.0, Some(&position));
        assert_eq!(result.reasons.len(), 3);
        assert_eq!(result.warnings.len(), 1);
        assert_eq!(result.reason().unwrap().matches("; ").count(), 2);
    }

    #[test]
    fn test_min_balance_is_warning_only() {
        let risk = RiskManager::default();
        let params = OrderParams::limit("BTCUSDT", OrderSide::Sell, 1.0, 10.0, MarketType::Spot);
        let result = risk.validate_order(&params, 50.0, None);
        assert!(result.allowed);
        assert!(!result.warnings.is_empty());
    }

    #[test]
    fn test_sell_side_skips_balance_check() {
        let risk = RiskManager::default();
        let params = OrderParams::limit("BTCUSDT", OrderSide::Sell, 1.0, 50_000.0, MarketType::Spot);
        assert!(risk.validate_order(&params, 1_000.0, None).allowed);
    }

    #[test]
    fn test_market_orders_have_zero_notional() {
        let risk = RiskManager::default();
        let params = OrderParams::market("BTCUSDT", OrderSide::Buy, 1_000.0, MarketType::Spot);
        assert!(risk.validate_order(&params, 1_000.0, None).allowed);
    }

    #[test]
    fn test_drawdown_check_uses_snapshot() {
        let mut risk = RiskManager::default();
        let params = OrderParams::limit("BTCUSDT", OrderSide::Buy, 1.0, 10.0, MarketType::Spot);

        risk.update_snapshot(snapshot(10_000.0, -500.0));
        assert!(risk.validate_order(&params, 1_000.0, None).allowed);

        risk.update_snapshot(snapshot(10_000.0, -2_000.0));
        let result = risk.validate_order(&params, 1_000.0, None);
        assert!(!result.allowed);
        assert!(result.reason().unwrap().contains("drawdown"));
    }

    #[test]
    fn test_loss_without_equity_rejects() {
        let mut risk = RiskManager::default();
        let params = OrderParams::limit("BTCUSDT", OrderSide::Sell, 1.0, 10.0, MarketType::Spot);

        risk.update_snapshot(snapshot(0.0, -5_000.0));
        let result = risk.validate_order(&params, 1_000.0, None);
        assert!(!result.allowed);
        assert!(result.reason().unwrap().contains("drawdown"));

        risk.update_snapshot(snapshot(0.0, 0.0));
        assert!(risk.validate_order(&params, 1_000.0, None).allowed);
    }

    #[test]
    fn test_set_limits() {
        let mut risk = RiskManager::default();
        risk.set_limits(RiskLimits {
            max_order_size: 5.0,
            ..RiskLimits::default()
        });
        let params = OrderParams::limit("BTCUSDT", OrderSide::Sell, 1.0, 10.0, MarketType::Spot);
        assert!(!risk.validate_order(&params, 1_000.0, None).allowed);
        assert_eq!(risk.limits().max_order_size, 5.0);
    }
}
