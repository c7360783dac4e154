//! Order Types
//!
//! Order intent, confirmed order state, and execution fills shared by every
//! connector and the execution engine.

use serde::{Deserialize, Serialize};

// =============================================================================
// Enums
// =============================================================================

/// Order side (buy or sell).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderSide {
    Buy,
    Sell,
}

impl OrderSide {
    /// Parse a vendor side string ("BUY", "Sell", "buy").
    pub fn parse(value: &str) -> Option<Self> {
        match value.to_ascii_uppercase().as_str() {
            "BUY" => Some(OrderSide::Buy),
            "SELL" => Some(OrderSide::Sell),
            _ => None,
        }
    }
}

impl std::fmt::Display for OrderSide {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OrderSide::Buy => write!(f, "buy"),
            OrderSide::Sell => write!(f, "sell"),
        }
    }
}

/// Order type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderType {
    /// Execute immediately at best available price
    Market,
    /// Execute at specified price or better
    Limit,
    /// Market order released once the stop price trades
    StopMarket,
    /// Limit order released once the stop price trades
    StopLimit,
}

impl OrderType {
    /// Whether the order rests on the book at an explicit price.
    pub fn requires_price(&self) -> bool {
        matches!(self, OrderType::Limit | OrderType::StopLimit)
    }

    /// Whether the order needs a trigger price.
    pub fn requires_stop_price(&self) -> bool {
        matches!(self, OrderType::StopMarket | OrderType::StopLimit)
    }
}

impl std::fmt::Display for OrderType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OrderType::Market => write!(f, "market"),
            OrderType::Limit => write!(f, "limit"),
            OrderType::StopMarket => write!(f, "stop_market"),
            OrderType::StopLimit => write!(f, "stop_limit"),
        }
    }
}

/// Market segment an order or record belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum MarketType {
    #[default]
    Spot,
    Futures,
}

impl MarketType {
    pub fn parse(value: &str) -> Option<Self> {
        match value.to_ascii_lowercase().as_str() {
            "spot" => Some(MarketType::Spot),
            "futures" | "future" | "usdm" => Some(MarketType::Futures),
            _ => None,
        }
    }
}

impl std::fmt::Display for MarketType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MarketType::Spot => write!(f, "spot"),
            MarketType::Futures => write!(f, "futures"),
        }
    }
}

/// Time in force for resting orders.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "UPPERCASE")]
pub enum TimeInForce {
    /// Good till cancelled
    #[default]
    Gtc,
    /// Immediate or cancel
    Ioc,
    /// Fill or kill
    Fok,
}

impl TimeInForce {
    pub fn as_str(&self) -> &'static str {
        match self {
            TimeInForce::Gtc => "GTC",
            TimeInForce::Ioc => "IOC",
            TimeInForce::Fok => "FOK",
        }
    }
}

/// Confirmed order status.
///
/// Every connector maps its vendor strings onto this closed set. Strings no
/// adapter recognises land in `Unmapped`, carrying the uppercased original.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(into = "String", from = "String")]
pub enum OrderStatus {
    New,
    PartiallyFilled,
    Filled,
    Canceled,
    Canceling,
    Rejected,
    Expired,
    Unmapped(String),
}

impl OrderStatus {
    pub fn as_str(&self) -> &str {
        match self {
            OrderStatus::New => "NEW",
            OrderStatus::PartiallyFilled => "PARTIALLY_FILLED",
            OrderStatus::Filled => "FILLED",
            OrderStatus::Canceled => "CANCELED",
            OrderStatus::Canceling => "CANCELING",
            OrderStatus::Rejected => "REJECTED",
            OrderStatus::Expired => "EXPIRED",
            OrderStatus::Unmapped(raw) => raw.as_str(),
        }
    }
}

impl From<String> for OrderStatus {
    fn from(value: String) -> Self {
        match value.to_ascii_uppercase().as_str() {
            "NEW" => OrderStatus::New,
            "PARTIALLY_FILLED" => OrderStatus::PartiallyFilled,
            "FILLED" => OrderStatus::Filled,
            "CANCELED" => OrderStatus::Canceled,
            "CANCELING" => OrderStatus::Canceling,
            "REJECTED" => OrderStatus::Rejected,
            "EXPIRED" => OrderStatus::Expired,
            other => OrderStatus::Unmapped(other.to_string()),
        }
    }
}

impl From<OrderStatus> for String {
    fn from(status: OrderStatus) -> Self {
        status.as_str().to_string()
    }
}

impl std::fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// =============================================================================
// Order intent and results
// =============================================================================

/// Caller intent for a new order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderParams {
    pub symbol: String,
    pub side: OrderSide,
    #[serde(rename = "type")]
    pub order_type: OrderType,
    pub quantity: f64,
    #[serde(default)]
    pub price: Option<f64>,
    #[serde(default)]
    pub market: MarketType,
    #[serde(default)]
    pub leverage: Option<u32>,
    #[serde(default)]
    pub reduce_only: bool,
    #[serde(default)]
    pub time_in_force: Option<TimeInForce>,
    #[serde(default)]
    pub stop_price: Option<f64>,
    #[serde(default)]
    pub post_only: bool,
    #[serde(default)]
    pub client_order_id: Option<String>,
}

impl OrderParams {
    /// Market order on the given segment.
    pub fn market(symbol: impl Into<String>, side: OrderSide, quantity: f64, market: MarketType) -> Self {
        Self {
            symbol: symbol.into(),
            side,
            order_type: OrderType::Market,
            quantity,
            price: None,
            market,
            leverage: None,
            reduce_only: false,
            time_in_force: None,
            stop_price: None,
            post_only: false,
            client_order_id: None,
        }
    }

    /// Good-till-cancelled limit order on the given segment.
    pub fn limit(
        symbol: impl Into<String>,
        side: OrderSide,
        quantity: f64,
        price: f64,
        market: MarketType,
    ) -> Self {
        Self {
            order_type: OrderType::Limit,
            price: Some(price),
            time_in_force: Some(TimeInForce::Gtc),
            ..Self::market(symbol, side, quantity, market)
        }
    }

    /// Dollar size of the order. Market orders carry no price and count as 0.
    pub fn notional(&self) -> f64 {
        match self.order_type {
            OrderType::Market => 0.0,
            _ => self.price.map(|p| p * self.quantity).unwrap_or(0.0),
        }
    }
}

/// Order state as confirmed by an exchange.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderResult {
    pub order_id: String,
    pub client_order_id: Option<String>,
    pub exchange: String,
    pub symbol: String,
    pub side: OrderSide,
    #[serde(rename = "type")]
    pub order_type: String,
    pub market: MarketType,
    pub status: OrderStatus,
    pub price: Option<f64>,
    pub average_price: Option<f64>,
    pub stop_price: Option<f64>,
    pub quantity: f64,
    pub filled_quantity: f64,
    pub remaining_quantity: f64,
    pub time_in_force: Option<String>,
    pub reduce_only: bool,
    /// Creation time (ms)
    pub created_at: i64,
    /// Last update time (ms)
    pub updated_at: i64,
}

/// Partial update applied to a stored order.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderUpdate {
    pub status: Option<OrderStatus>,
    pub filled_quantity: Option<f64>,
    pub remaining_quantity: Option<f64>,
    pub average_price: Option<f64>,
    pub updated_at: Option<i64>,
}

impl From<&OrderResult> for OrderUpdate {
    fn from(order: &OrderResult) -> Self {
        Self {
            status: Some(order.status.clone()),
            filled_quantity: Some(order.filled_quantity),
            remaining_quantity: Some(order.remaining_quantity),
            average_price: order.average_price,
            updated_at: Some(order.updated_at),
        }
    }
}

/// Execution record for a single fill.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TradeFill {
    pub trade_id: String,
    pub order_id: String,
    pub exchange: String,
    pub symbol: String,
    pub side: OrderSide,
    pub price: f64,
    pub quantity: f64,
    pub fee: f64,
    pub fee_asset: String,
    pub realized_pnl: f64,
    pub is_maker: bool,
    /// Execution time (ms)
    pub timestamp: i64,
}

/// Inclusive time window (ms) for history queries.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TimeRange {
    pub start: Option<i64>,
    pub end: Option<i64>,
}

impl TimeRange {
    pub fn between(start: i64, end: i64) -> Self {
        Self {
            start: Some(start),
            end: Some(end),
        }
    }

    pub fn contains(&self, timestamp: i64) -> bool {
        self.start.map_or(true, |s| timestamp >= s) && self.end.map_or(true, |e| timestamp <= e)
    }
}
