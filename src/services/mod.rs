pub mod aggregator;
pub mod credential_store;
pub mod event_bus;
pub mod execution_engine;
pub mod key_manager;
pub mod normalizer;
pub mod order_store;
pub mod portfolio_manager;
pub mod realtime_monitor;
pub mod risk_manager;
pub mod user_context;

pub use credential_store::{CredentialStore, CredentialStoreError, SqliteCredentialStore};
pub use event_bus::{BusConfig, EventBus, ALERTS_TOPIC, UPDATES_TOPIC};
pub use execution_engine::{ExecutionEngine, ExecutionError};
pub use key_manager::{CredentialError, KeyManager};
pub use order_store::{OrderStore, PersistenceError, SqliteOrderStore};
pub use portfolio_manager::{PortfolioManager, DEFAULT_MAX_SNAPSHOTS};
pub use realtime_monitor::{MonitorThresholds, RealtimeMonitor};
pub use risk_manager::RiskManager;
pub use user_context::{ContextError, ContextSettings, UserContext, UserContextService};
