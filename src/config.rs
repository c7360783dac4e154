use crate::connectors::RateLimit;
use crate::services::{ContextSettings, MonitorThresholds};
use crate::types::RiskLimits;
use std::env;
use std::str::FromStr;
use std::time::Duration;

/// Exchange request budget.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RateLimitConfig {
    /// Requests allowed per window.
    pub binance_max_requests: u32,
    /// Window length in milliseconds.
    pub binance_window_ms: u64,
}

impl RateLimitConfig {
    pub fn binance(&self) -> RateLimit {
        RateLimit::new(self.binance_max_requests, Duration::from_millis(self.binance_window_ms))
    }
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            binance_max_requests: 1200,
            binance_window_ms: 60_000,
        }
    }
}

/// Application configuration.
#[derive(Clone)]
pub struct Config {
    /// Server host address.
    pub host: String,
    /// Server port.
    pub port: u16,
    /// Redis URL for cross-node event fanout. Unset runs an in-process bus.
    pub redis_url: Option<String>,
    /// SQLite file holding orders, trades and credentials.
    pub database_path: String,
    /// Process secret for credential encryption (at least 32 characters).
    pub encryption_key: Option<String>,
    /// Snapshot history kept per tenant.
    pub max_snapshots: usize,
    /// Seconds between snapshot cycles.
    pub snapshot_interval_secs: u64,
    pub risk_limits: RiskLimits,
    pub alert_thresholds: MonitorThresholds,
    pub rate_limits: RateLimitConfig,
    /// Long-lived `(token, tenant)` pairs accepted by the WebSocket auth frame.
    pub session_tokens: Vec<(String, String)>,
}

impl std::fmt::Debug for Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Config")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("redis_url", &self.redis_url.as_ref().map(|_| "<set>"))
            .field("database_path", &self.database_path)
            .field("encryption_key", &self.encryption_key.as_ref().map(|_| "<redacted>"))
            .field("max_snapshots", &self.max_snapshots)
            .field("snapshot_interval_secs", &self.snapshot_interval_secs)
            .field("risk_limits", &self.risk_limits)
            .field("alert_thresholds", &self.alert_thresholds)
            .field("rate_limits", &self.rate_limits)
            .field("session_tokens", &self.session_tokens.len())
            .finish()
    }
}

/// Parse `token=tenant` pairs separated by commas. Malformed entries are skipped.
pub fn parse_session_tokens(raw: &str) -> Vec<(String, String)> {
    raw.split(',')
        .filter_map(|entry| {
            let (token, tenant) = entry.split_once('=')?;
            let (token, tenant) = (token.trim(), tenant.trim());
            (!token.is_empty() && !tenant.is_empty()).then(|| (token.to_string(), tenant.to_string()))
        })
        .collect()
}

fn parse_env<T: FromStr>(key: &str, default: T) -> T {
    env::var(key).ok().and_then(|v| v.trim().parse().ok()).unwrap_or(default)
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Self {
        let risk = RiskLimits::default();
        let alerts = MonitorThresholds::default();
        let rates = RateLimitConfig::default();

        Self {
            host: env::var("HOST").unwrap_or_else(|_| "0.0.0.0".to_string()),
            port: parse_env("PORT", 3001),
            redis_url: env::var("REDIS_URL").ok().filter(|v| !v.is_empty()),
            database_path: env::var("DATABASE_PATH").unwrap_or_else(|_| "meridian.db".to_string()),
            encryption_key: env::var("ENCRYPTION_KEY").ok().filter(|v| !v.is_empty()),
            max_snapshots: parse_env("MAX_SNAPSHOTS", 1000),
            snapshot_interval_secs: parse_env("SNAPSHOT_INTERVAL_SECS", 60),
            risk_limits: RiskLimits {
                max_order_size: parse_env("RISK_MAX_ORDER_SIZE", risk.max_order_size),
                max_position_size: parse_env("RISK_MAX_POSITION_SIZE", risk.max_position_size),
                max_drawdown: parse_env("RISK_MAX_DRAWDOWN", risk.max_drawdown),
                min_balance: parse_env("RISK_MIN_BALANCE", risk.min_balance),
            },
            alert_thresholds: MonitorThresholds {
                large_balance_change: parse_env("ALERT_LARGE_BALANCE_CHANGE", alerts.large_balance_change),
                large_position: parse_env("ALERT_LARGE_POSITION", alerts.large_position),
                rapid_drawdown: parse_env("ALERT_RAPID_DRAWDOWN", alerts.rapid_drawdown),
            },
            rate_limits: RateLimitConfig {
                binance_max_requests: parse_env("BINANCE_RATE_LIMIT", rates.binance_max_requests),
                binance_window_ms: parse_env("BINANCE_RATE_WINDOW_MS", rates.binance_window_ms),
            },
            session_tokens: env::var("SESSION_TOKENS")
                .map(|raw| parse_session_tokens(&raw))
                .unwrap_or_default(),
        }
    }

    /// Settings handed to every tenant context.
    pub fn context_settings(&self) -> ContextSettings {
        ContextSettings {
            max_snapshots: self.max_snapshots,
            risk_limits: self.risk_limits,
            thresholds: self.alert_thresholds,
        }
    }

    pub fn snapshot_interval(&self) -> Duration {
        Duration::from_secs(self.snapshot_interval_secs.max(1))
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::from_env()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_env_falls_back() {
        env::set_var("MERIDIAN_TEST_BAD_NUMBER", "not-a-number");
        assert_eq!(parse_env("MERIDIAN_TEST_BAD_NUMBER", 7u32), 7);
        assert_eq!(parse_env("MERIDIAN_TEST_UNSET_NUMBER", 1.5f64), 1.5);

        env::set_var("MERIDIAN_TEST_GOOD_NUMBER", " 42 ");
        assert_eq!(parse_env("MERIDIAN_TEST_GOOD_NUMBER", 0u64), 42);

        env::set_var("MERIDIAN_TEST_NEGATIVE", "-0.2");
        assert_eq!(parse_env("MERIDIAN_TEST_NEGATIVE", 0.0f64), -0.2);
    }

    #[test]
    fn test_context_settings_follow_config() {
        let mut config = Config::from_env();
        config.max_snapshots = 5;
        config.risk_limits.max_order_size = 10.0;
        config.alert_thresholds.large_position = 1.0;

        let settings = config.context_settings();
        assert_eq!(settings.max_snapshots, 5);
        assert_eq!(settings.risk_limits.max_order_size, 10.0);
        assert_eq!(settings.thresholds.large_position, 1.0);
    }

    #[test]
    fn test_rate_limit_defaults() {
        let limit = RateLimitConfig::default().binance();
        assert_eq!(limit.max_requests, 1200);
        assert_eq!(limit.window, Duration::from_secs(60));
    }

    #[test]
    fn test_parse_session_tokens() {
        let tokens = parse_session_tokens(" tok-a = alice ,broken,=bob,tok-c=,tok-d=dave");
        assert_eq!(
            tokens,
            vec![
                ("tok-a".to_string(), "alice".to_string()),
                ("tok-d".to_string(), "dave".to_string()),
            ]
        );
        assert!(parse_session_tokens("").is_empty());
    }

    #[test]
    fn test_debug_hides_secrets() {
        let mut config = Config::from_env();
        config.encryption_key = Some("an-encryption-secret-of-32-chars!".to_string());
        config.session_tokens = vec![("tok-secret".to_string(), "alice".to_string())];

        let printed = format!("{:?}", config);
        assert!(!printed.contains("an-encryption-secret"));
        assert!(!printed.contains("tok-secret"));
        assert!(printed.contains("<redacted>"));
    }

    #[test]
    fn test_snapshot_interval_never_zero() {
        let mut config = Config::from_env();
        config.snapshot_interval_secs = 0;
        assert_eq!(config.snapshot_interval(), Duration::from_secs(1));
    }
}
