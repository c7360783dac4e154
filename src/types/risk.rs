use serde::{Deserialize, Serialize};

/// Pre-trade risk limits.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RiskLimits {
    /// Largest single order notional (USD).
    pub max_order_size: f64,
    /// Largest resulting position notional (USD).
    pub max_position_size: f64,
    /// Most negative unrealized PnL / equity ratio tolerated (e.g. -0.10).
    pub max_drawdown: f64,
    /// Balance floor that triggers a warning.
    pub min_balance: f64,
}

impl Default for RiskLimits {
    fn default() -> Self {
        Self {
            max_order_size: 100_000.0,
            max_position_size: 500_000.0,
            max_drawdown: -0.10,
            min_balance: 100.0,
        }
    }
}

/// Existing exposure in the symbol being traded.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CurrentPosition {
    pub symbol: String,
    pub size: f64,
    /// Notional value (USD).
    pub value: f64,
}

/// Outcome of a pre-trade check.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RiskCheckResult {
    pub allowed: bool,
    pub reasons: Vec<String>,
    pub warnings: Vec<String>,
}

impl RiskCheckResult {
    /// Blocking reasons joined with "; ".
    pub fn reason(&self) -> Option<String> {
        (!self.reasons.is_empty()).then(|| self.reasons.join("; "))
    }
}
