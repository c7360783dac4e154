use thiserror::Error;

use crate::services::ContextError;

/// Errors reported to a WebSocket client as an error frame.
#[derive(Error, Debug)]
pub enum AppError {
    #[error("Invalid message: {0}")]
    InvalidMessage(#[from] serde_json::Error),

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error(transparent)]
    Context(#[from] ContextError),
}

impl AppError {
    /// Machine-readable error category.
    pub fn category(&self) -> &'static str {
        match self {
            AppError::InvalidMessage(_) => "bad_request",
            AppError::Unauthorized(_) => "unauthorized",
            AppError::Context(e) => e.category(),
        }
    }
}

pub type Result<T> = std::result::Result<T, AppError>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connectors::ConnectorError;

    #[test]
    fn test_invalid_message_is_bad_request() {
        let err = AppError::from(serde_json::from_str::<serde_json::Value>("{").unwrap_err());
        assert_eq!(err.category(), "bad_request");
        assert!(err.to_string().starts_with("Invalid message"));
    }

    #[test]
    fn test_context_errors_keep_connector_category() {
        let err = AppError::from(ContextError::Connector(ConnectorError::PermissionDenied(
            "futures disabled".to_string(),
        )));
        assert_eq!(err.category(), "permission_denied");

        let err = AppError::from(ContextError::ConnectionTest {
            exchange: "binance".to_string(),
            source: ConnectorError::Authentication("API-key format invalid".to_string()),
        });
        assert_eq!(err.category(), "connection_failed");
        assert!(err.to_string().contains("binance"));
    }

    #[test]
    fn test_unauthorized() {
        let err = AppError::Unauthorized("Invalid or expired token".to_string());
        assert_eq!(err.category(), "unauthorized");
        assert_eq!(err.to_string(), "Unauthorized: Invalid or expired token");
    }
}
