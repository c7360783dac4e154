use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Kind of anomaly detected between snapshots.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertType {
    LargeBalanceChange,
    LargePositionOpening,
    RapidDrawdown,
}

impl std::fmt::Display for AlertType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AlertType::LargeBalanceChange => write!(f, "large_balance_change"),
            AlertType::LargePositionOpening => write!(f, "large_position_opening"),
            AlertType::RapidDrawdown => write!(f, "rapid_drawdown"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertSeverity {
    Info,
    Warning,
    Critical,
}

impl std::fmt::Display for AlertSeverity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AlertSeverity::Info => write!(f, "info"),
            AlertSeverity::Warning => write!(f, "warning"),
            AlertSeverity::Critical => write!(f, "critical"),
        }
    }
}

/// Alert emitted by the realtime monitor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AlertEvent {
    pub id: String,
    #[serde(rename = "type")]
    pub alert_type: AlertType,
    pub severity: AlertSeverity,
    pub message: String,
    pub exchange: Option<String>,
    pub timestamp: i64,
    #[serde(default)]
    pub data: serde_json::Value,
}

impl AlertEvent {
    pub fn new(
        alert_type: AlertType,
        severity: AlertSeverity,
        message: impl Into<String>,
        exchange: Option<String>,
        data: serde_json::Value,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            alert_type,
            severity,
            message: message.into(),
            exchange,
            timestamp: chrono::Utc::now().timestamp_millis(),
            data,
        }
    }
}
