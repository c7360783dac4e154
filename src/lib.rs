//! Meridian - multi-exchange trading execution and portfolio aggregation engine

pub mod config;
pub mod connectors;
pub mod error;
pub mod services;
pub mod types;
pub mod websocket;

use config::Config;
use services::{EventBus, UserContextService};
use std::sync::Arc;
use websocket::{ConnectionRegistry, TokenVerifier};

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub contexts: Arc<UserContextService>,
    pub registry: Arc<ConnectionRegistry>,
    pub verifier: Arc<dyn TokenVerifier>,
    pub bus: Arc<EventBus>,
}

// Re-export commonly used types
pub use types::*;
