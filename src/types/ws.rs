use super::{AlertEvent, PortfolioSnapshot, PortfolioUpdate};
use crate::error::AppError;
use serde::{Deserialize, Serialize};

/// Incoming WebSocket message from client.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Bind this connection to the tenant that owns the token.
    Auth { token: String },
}

/// Outgoing WebSocket message to client.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum ServerMessage {
    Snapshot(PortfolioSnapshot),
    Update(PortfolioUpdate),
    Alert(AlertEvent),
    Authenticated(AuthenticatedData),
    Error(ErrorData),
}

impl ServerMessage {
    pub fn error(err: &AppError) -> Self {
        ServerMessage::Error(ErrorData {
            message: err.to_string(),
            category: err.category().to_string(),
        })
    }

    pub fn to_json(&self) -> Option<String> {
        serde_json::to_string(self).ok()
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthenticatedData {
    pub tenant_id: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorData {
    pub message: String,
    pub category: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::UpdateType;

    // =========================================================================
    // ClientMessage Tests
    // =========================================================================

    #[test]
    fn test_client_message_auth_deserialization() {
        let json = r#"{"type":"auth","token":"tok-123"}"#;
        let msg: ClientMessage = serde_json::from_str(json).unwrap();

        let ClientMessage::Auth { token } = msg;
        assert_eq!(token, "tok-123");
    }

    #[test]
    fn test_client_message_unknown_type_rejected() {
        let json = r#"{"type":"subscribe","assets":["BTC"]}"#;
        assert!(serde_json::from_str::<ClientMessage>(json).is_err());
    }

    // =========================================================================
    // ServerMessage Tests
    // =========================================================================

    #[test]
    fn test_server_message_error_frame() {
        let err = AppError::Unauthorized("Invalid token".to_string());
        let json = ServerMessage::error(&err).to_json().unwrap();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value["type"], "error");
        assert_eq!(value["data"]["message"], "Unauthorized: Invalid token");
        assert_eq!(value["data"]["category"], "unauthorized");
    }

    #[test]
    fn test_server_message_authenticated_frame() {
        let msg = ServerMessage::Authenticated(AuthenticatedData {
            tenant_id: "tenant-1".to_string(),
        });
        let value: serde_json::Value = serde_json::from_str(&msg.to_json().unwrap()).unwrap();
        assert_eq!(value["type"], "authenticated");
        assert_eq!(value["data"]["tenantId"], "tenant-1");
    }

    #[test]
    fn test_server_message_update_frame() {
        let update = PortfolioUpdate::new(UpdateType::Order, Some("binance"), &serde_json::json!({"orderId": "1"}));
        let value: serde_json::Value =
            serde_json::from_str(&ServerMessage::Update(update).to_json().unwrap()).unwrap();
        assert_eq!(value["type"], "update");
        assert_eq!(value["data"]["type"], "order");
        assert_eq!(value["data"]["exchange"], "binance");
        assert_eq!(value["data"]["data"]["orderId"], "1");
    }
}
