//! Portfolio Types
//!
//! Canonical records every connector is normalized into, and the aggregated
//! snapshot built from them.

use super::{MarketType, OrderSide, OrderStatus};
use serde::{Deserialize, Serialize};

/// Position direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PositionSide {
    Long,
    Short,
}

impl PositionSide {
    /// +1 for long, -1 for short.
    pub fn sign(&self) -> f64 {
        match self {
            PositionSide::Long => 1.0,
            PositionSide::Short => -1.0,
        }
    }
}

impl std::fmt::Display for PositionSide {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PositionSide::Long => write!(f, "long"),
            PositionSide::Short => write!(f, "short"),
        }
    }
}

/// Balance of one asset on one exchange.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UnifiedBalance {
    pub exchange: String,
    /// Uppercased asset code.
    pub asset: String,
    /// available + locked
    pub total: f64,
    pub available: f64,
    pub locked: f64,
    pub usd_value: f64,
    pub market: MarketType,
    pub timestamp: i64,
}

/// Open derivatives position.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UnifiedPosition {
    pub exchange: String,
    pub symbol: String,
    pub side: PositionSide,
    /// Absolute size in base units.
    pub size: f64,
    pub entry_price: f64,
    pub mark_price: f64,
    pub unrealized_pnl: f64,
    pub leverage: Option<f64>,
    pub liquidation_price: Option<f64>,
    pub timestamp: i64,
}

impl UnifiedPosition {
    /// Dollar size at the mark price.
    pub fn notional(&self) -> f64 {
        self.size * self.mark_price
    }
}

/// Open order in canonical form.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UnifiedOrder {
    pub exchange: String,
    pub order_id: String,
    pub client_order_id: Option<String>,
    pub symbol: String,
    pub side: OrderSide,
    #[serde(rename = "type")]
    pub order_type: String,
    pub price: f64,
    pub quantity: f64,
    pub filled_quantity: f64,
    pub status: OrderStatus,
    pub market: MarketType,
    pub timestamp: i64,
}

/// Executed trade in canonical form.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UnifiedTrade {
    pub exchange: String,
    pub trade_id: String,
    pub order_id: String,
    pub symbol: String,
    pub side: OrderSide,
    pub price: f64,
    pub quantity: f64,
    pub fee: f64,
    pub fee_asset: String,
    /// 0 when the venue does not report it.
    pub realized_pnl: f64,
    pub is_maker: bool,
    pub market: MarketType,
    pub timestamp: i64,
}

impl From<&UnifiedTrade> for super::TradeFill {
    fn from(trade: &UnifiedTrade) -> Self {
        Self {
            trade_id: trade.trade_id.clone(),
            order_id: trade.order_id.clone(),
            exchange: trade.exchange.clone(),
            symbol: trade.symbol.clone(),
            side: trade.side,
            price: trade.price,
            quantity: trade.quantity,
            fee: trade.fee,
            fee_asset: trade.fee_asset.clone(),
            realized_pnl: trade.realized_pnl,
            is_maker: trade.is_maker,
            timestamp: trade.timestamp,
        }
    }
}

/// Share of portfolio value held in one asset.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AssetAllocation {
    pub asset: String,
    pub usd_value: f64,
    pub percentage: f64,
}

/// Share of portfolio value held on one exchange.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExchangeAllocation {
    pub exchange: String,
    pub usd_value: f64,
    pub percentage: f64,
}

/// Equity change against the preceding snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EquityChange {
    pub absolute: f64,
    pub percentage: f64,
}

/// Aggregated view of every balance and position at one instant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PortfolioSnapshot {
    pub timestamp: i64,
    pub total_net_equity: f64,
    pub total_unrealized_pnl: f64,
    pub asset_allocation: Vec<AssetAllocation>,
    pub exchange_allocation: Vec<ExchangeAllocation>,
    pub positions: Vec<UnifiedPosition>,
    pub balances: Vec<UnifiedBalance>,
    #[serde(default)]
    pub open_orders: Vec<UnifiedOrder>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub change_24h: Option<EquityChange>,
}

impl PortfolioSnapshot {
    /// Available amount of an asset on one exchange, summed across markets.
    pub fn available_balance(&self, exchange: &str, asset: &str) -> Option<f64> {
        let asset = asset.to_uppercase();
        let mut found = false;
        let total: f64 = self
            .balances
            .iter()
            .filter(|b| b.exchange == exchange && b.asset == asset)
            .inspect(|_| found = true)
            .map(|b| b.available)
            .sum();
        found.then_some(total)
    }

    /// Unrealized PnL as a fraction of net equity.
    ///
    /// With no positive equity any loss is unbounded and anything else is flat.
    pub fn drawdown(&self) -> f64 {
        if self.total_net_equity > 0.0 {
            self.total_unrealized_pnl / self.total_net_equity
        } else if self.total_unrealized_pnl < 0.0 {
            f64::NEG_INFINITY
        } else {
            0.0
        }
    }
}
