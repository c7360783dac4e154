//! Vendor-native records as they come off the wire.
//!
//! Numeric fields stay as the strings the exchange sent; the normalizer turns
//! them into unified records. None of these outlive a single fetch.

use super::MarketType;
use serde::{Deserialize, Serialize};

/// Balance line for one asset on one market segment.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RawBalance {
    pub asset: String,
    /// Freely usable amount.
    pub free: String,
    /// Amount held by open orders or margin.
    pub locked: String,
    /// Wallet total when the venue reports it separately from free/locked.
    pub total: Option<String>,
    pub market: MarketType,
}

/// Derivatives position line.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RawPosition {
    pub symbol: String,
    /// Signed size; negative means short when `position_side` is "BOTH".
    pub position_amt: String,
    /// "BOTH" (one-way mode), "LONG" or "SHORT" (hedge mode).
    pub position_side: String,
    pub entry_price: String,
    pub mark_price: String,
    pub leverage: Option<String>,
    pub liquidation_price: Option<String>,
    pub update_time: i64,
}

/// Open order line.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RawOrder {
    pub order_id: String,
    pub client_order_id: Option<String>,
    pub symbol: String,
    pub side: String,
    pub order_type: String,
    pub price: String,
    pub orig_qty: String,
    pub executed_qty: String,
    pub status: String,
    pub time_in_force: Option<String>,
    pub market: MarketType,
    pub time: i64,
}

/// Account trade line.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RawTrade {
    pub trade_id: String,
    pub order_id: String,
    pub symbol: String,
    pub side: String,
    pub price: String,
    pub qty: String,
    pub commission: String,
    pub commission_asset: String,
    /// Only derivatives venues report this.
    pub realized_pnl: Option<String>,
    pub is_maker: bool,
    pub market: MarketType,
    pub time: i64,
}
