//! Exchange connectors.
//!
//! A connector translates one vendor API into raw records plus, when it can
//! trade, confirmed `OrderResult`s. Read access and trading are separate
//! traits so the execution engine only ever sees trading-capable connectors.

pub mod binance;
pub mod binance_ws;
pub mod factory;
pub mod rate_limiter;
pub mod signing;

pub use binance::{BinanceConfig, BinanceConnector};
pub use binance_ws::BinanceUserStream;
pub use factory::{ConnectorFactory, ConnectorHandle, ExchangeFactory};
pub use rate_limiter::{RateLimit, RateLimiter};
pub use signing::RequestSigner;

use crate::types::{
    MarketType, OrderParams, OrderResult, RawBalance, RawOrder, RawPosition, RawTrade,
    RealtimeUpdate, TimeRange,
};
use async_trait::async_trait;
use std::sync::Arc;
use thiserror::Error;

/// Convenience alias for connector results.
pub type ConnectorResult<T> = Result<T, ConnectorError>;

/// Callback receiving normalized stream messages.
pub type RealtimeCallback = Arc<dyn Fn(RealtimeUpdate) + Send + Sync>;

/// Errors surfaced by exchange connectors.
#[derive(Debug, Error)]
pub enum ConnectorError {
    #[error("Authentication failed: {0}")]
    Authentication(String),

    #[error("Invalid signature: {0}")]
    InvalidSignature(String),

    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error("Invalid symbol: {0}")]
    InvalidSymbol(String),

    #[error("Insufficient balance: {0}")]
    InsufficientBalance(String),

    #[error("Invalid quantity: {0}")]
    InvalidQuantity(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Exchange error {code}: {message}")]
    Exchange { code: i64, message: String },

    #[error("Rate limited: {0}")]
    RateLimited(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// Broad families of connector errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectorErrorKind {
    Auth,
    Permission,
    InvalidRequest,
    Exchange,
    Transport,
}

impl ConnectorError {
    pub fn kind(&self) -> ConnectorErrorKind {
        match self {
            ConnectorError::Authentication(_) | ConnectorError::InvalidSignature(_) => {
                ConnectorErrorKind::Auth
            }
            ConnectorError::PermissionDenied(_) => ConnectorErrorKind::Permission,
            ConnectorError::InvalidSymbol(_)
            | ConnectorError::InsufficientBalance(_)
            | ConnectorError::InvalidQuantity(_)
            | ConnectorError::InvalidRequest(_) => ConnectorErrorKind::InvalidRequest,
            ConnectorError::Exchange { .. } | ConnectorError::RateLimited(_) => {
                ConnectorErrorKind::Exchange
            }
            ConnectorError::Transport(_) | ConnectorError::Serialization(_) => {
                ConnectorErrorKind::Transport
            }
        }
    }

    /// Machine-readable category.
    pub fn category(&self) -> &'static str {
        match self {
            ConnectorError::Authentication(_) => "auth_failed",
            ConnectorError::InvalidSignature(_) => "invalid_signature",
            ConnectorError::PermissionDenied(_) => "permission_denied",
            ConnectorError::InvalidSymbol(_) => "invalid_symbol",
            ConnectorError::InsufficientBalance(_) => "insufficient_balance",
            ConnectorError::InvalidQuantity(_) => "invalid_quantity",
            ConnectorError::InvalidRequest(_) => "invalid_request",
            ConnectorError::Exchange { .. } => "exchange_error",
            ConnectorError::RateLimited(_) => "rate_limited",
            ConnectorError::Transport(_) => "transport_error",
            ConnectorError::Serialization(_) => "serialization_error",
        }
    }
}

impl From<reqwest::Error> for ConnectorError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_decode() {
            ConnectorError::Serialization(e.to_string())
        } else {
            ConnectorError::Transport(e.to_string())
        }
    }
}

impl From<serde_json::Error> for ConnectorError {
    fn from(e: serde_json::Error) -> Self {
        ConnectorError::Serialization(e.to_string())
    }
}

/// Read access to one exchange account.
#[async_trait]
pub trait ExchangeConnector: Send + Sync {
    /// Stable lowercase exchange name ("binance").
    fn exchange_name(&self) -> &str;

    async fn fetch_balances(&self) -> ConnectorResult<Vec<RawBalance>>;

    async fn fetch_positions(&self) -> ConnectorResult<Vec<RawPosition>>;

    async fn fetch_open_orders(&self) -> ConnectorResult<Vec<RawOrder>>;

    async fn fetch_trade_history(&self, symbol: &str, range: TimeRange) -> ConnectorResult<Vec<RawTrade>>;

    /// Register a callback for private stream updates. Streaming setup
    /// failures are logged; REST access stays usable.
    async fn subscribe_realtime_updates(&self, callback: RealtimeCallback);

    /// Stop every stream and drop all callbacks.
    async fn unsubscribe_realtime_updates(&self);

    /// Verify that the credentials work.
    async fn test_connection(&self) -> ConnectorResult<()>;
}

/// Order entry on top of read access.
#[async_trait]
pub trait TradingConnector: ExchangeConnector {
    async fn place_order(&self, params: &OrderParams) -> ConnectorResult<OrderResult>;

    async fn cancel_order(&self, symbol: &str, order_id: &str, market: MarketType) -> ConnectorResult<OrderResult>;

    async fn cancel_all_orders(&self, symbol: &str, market: MarketType) -> ConnectorResult<Vec<OrderResult>>;

    async fn get_order_status(&self, symbol: &str, order_id: &str, market: MarketType) -> ConnectorResult<OrderResult>;

    async fn get_open_orders(
        &self,
        symbol: Option<&str>,
        market: Option<MarketType>,
    ) -> ConnectorResult<Vec<OrderResult>>;
}
