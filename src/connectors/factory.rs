//! Credential → connector construction.

use super::binance::{self, BinanceConnector};
use super::{ConnectorError, ConnectorResult, ExchangeConnector, RateLimiter, TradingConnector};
use crate::types::ExchangeCredentials;
use std::sync::Arc;

/// A built connector, viewed both as read access and, if supported, trading.
#[derive(Clone)]
pub struct ConnectorHandle {
    pub data: Arc<dyn ExchangeConnector>,
    pub trading: Option<Arc<dyn TradingConnector>>,
}

impl ConnectorHandle {
    /// Handle for a connector that can trade.
    pub fn trading<C>(connector: Arc<C>) -> Self
    where
        C: TradingConnector + 'static,
    {
        Self {
            data: connector.clone(),
            trading: Some(connector),
        }
    }

    /// Handle for a read-only connector.
    pub fn read_only<C>(connector: Arc<C>) -> Self
    where
        C: ExchangeConnector + 'static,
    {
        Self {
            data: connector,
            trading: None,
        }
    }

    pub fn exchange_name(&self) -> &str {
        self.data.exchange_name()
    }
}

/// Builds connectors from stored credentials.
pub trait ConnectorFactory: Send + Sync {
    fn create(&self, credentials: &ExchangeCredentials) -> ConnectorResult<ConnectorHandle>;

    fn supported_exchanges(&self) -> Vec<&'static str>;
}

/// Factory for every exchange the engine ships with.
pub struct ExchangeFactory {
    limiter: Arc<RateLimiter>,
}

impl ExchangeFactory {
    pub fn new(limiter: Arc<RateLimiter>) -> Self {
        Self { limiter }
    }
}

impl ConnectorFactory for ExchangeFactory {
    fn create(&self, credentials: &ExchangeCredentials) -> ConnectorResult<ConnectorHandle> {
        match credentials.exchange.to_lowercase().as_str() {
            binance::EXCHANGE_NAME => {
                let connector = BinanceConnector::from_credentials(credentials, self.limiter.clone());
                Ok(ConnectorHandle::trading(Arc::new(connector)))
            }
            other => Err(ConnectorError::InvalidRequest(format!(
                "Unsupported exchange '{}' (supported: {})",
                other,
                self.supported_exchanges().join(", ")
            ))),
        }
    }

    fn supported_exchanges(&self) -> Vec<&'static str> {
        vec![binance::EXCHANGE_NAME]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_create_binance_handle() {
        let factory = ExchangeFactory::new(Arc::new(RateLimiter::default()));
        let creds = ExchangeCredentials::new("Binance", "key", "secret");
        let handle = factory.create(&creds).unwrap();
        assert_eq!(handle.exchange_name(), "binance");
        assert!(handle.trading.is_some());
    }

    #[test]
    fn test_unsupported_exchange() {
        let factory = ExchangeFactory::new(Arc::new(RateLimiter::default()));
        let creds = ExchangeCredentials::new("kraken", "key", "secret");
        let err = factory.create(&creds).err().unwrap();
        assert!(err.to_string().contains("kraken"));
        assert!(err.to_string().contains("binance"));
    }
}
