use super::{UnifiedBalance, UnifiedOrder, UnifiedPosition, UnifiedTrade};
use serde::{Deserialize, Serialize};

/// Kind of update published on the event bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpdateType {
    Snapshot,
    Balance,
    Position,
    Order,
    Trade,
}

/// Portfolio or trading update fanned out to realtime clients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PortfolioUpdate {
    #[serde(rename = "type")]
    pub update_type: UpdateType,
    pub exchange: Option<String>,
    pub data: serde_json::Value,
    pub timestamp: i64,
}

impl PortfolioUpdate {
    pub fn new<T: Serialize>(update_type: UpdateType, exchange: Option<&str>, data: &T) -> Self {
        Self {
            update_type,
            exchange: exchange.map(str::to_string),
            data: serde_json::to_value(data).unwrap_or(serde_json::Value::Null),
            timestamp: chrono::Utc::now().timestamp_millis(),
        }
    }
}

/// Envelope carried on a bus topic. The tenant tag drives per-tenant routing
/// at the transport fanout; untagged payloads go to everyone.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BusEnvelope<T> {
    #[serde(default)]
    pub tenant_id: Option<String>,
    pub payload: T,
}

/// Normalized message pushed by a connector's private stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "data", rename_all = "snake_case")]
pub enum RealtimeUpdate {
    Balance(UnifiedBalance),
    Position(UnifiedPosition),
    Order(UnifiedOrder),
    Trade(UnifiedTrade),
}

impl RealtimeUpdate {
    pub fn exchange(&self) -> &str {
        match self {
            RealtimeUpdate::Balance(b) => &b.exchange,
            RealtimeUpdate::Position(p) => &p.exchange,
            RealtimeUpdate::Order(o) => &o.exchange,
            RealtimeUpdate::Trade(t) => &t.exchange,
        }
    }

    pub fn update_type(&self) -> UpdateType {
        match self {
            RealtimeUpdate::Balance(_) => UpdateType::Balance,
            RealtimeUpdate::Position(_) => UpdateType::Position,
            RealtimeUpdate::Order(_) => UpdateType::Order,
            RealtimeUpdate::Trade(_) => UpdateType::Trade,
        }
    }
}
