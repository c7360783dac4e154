//! Topic pub/sub for portfolio updates and alerts.
//!
//! Backed by Redis pub/sub across nodes, or an in-process broadcast channel
//! for single-node runs. A bus that cannot connect degrades to a silent no-op:
//! publishing and subscribing never fail.

use crate::types::{AlertEvent, BusEnvelope, PortfolioUpdate};
use futures_util::StreamExt;
use parking_lot::RwLock;
use redis::aio::ConnectionManager;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

pub const UPDATES_TOPIC: &str = "portfolio:updates";
pub const ALERTS_TOPIC: &str = "portfolio:alerts";

const LOCAL_CAPACITY: usize = 1024;
const RESUBSCRIBE_DELAY: Duration = Duration::from_secs(5);

/// Which transport the bus should use once initialized.
#[derive(Debug, Clone)]
pub enum BusConfig {
    Redis(String),
    Local,
    Disconnected,
}

#[derive(Clone)]
enum Backend {
    Redis {
        client: redis::Client,
        publisher: ConnectionManager,
    },
    Local(broadcast::Sender<(String, String)>),
    Disconnected,
}

/// Event bus shared by every tenant.
pub struct EventBus {
    config: BusConfig,
    backend: RwLock<Backend>,
}

impl EventBus {
    pub fn new(config: BusConfig) -> Self {
        Self {
            config,
            backend: RwLock::new(Backend::Disconnected),
        }
    }

    /// In-process bus, usable without `initialize`.
    pub fn local() -> Self {
        let (tx, _) = broadcast::channel(LOCAL_CAPACITY);
        Self {
            config: BusConfig::Local,
            backend: RwLock::new(Backend::Local(tx)),
        }
    }

    pub fn disconnected() -> Self {
        Self::new(BusConfig::Disconnected)
    }

    /// Open the publish handle and verify a subscribe handle can be opened.
    /// On failure the bus stays disconnected. Returns whether it is usable.
    pub async fn initialize(&self) -> bool {
        let backend = match &self.config {
            BusConfig::Redis(url) => match Self::connect(url).await {
                Ok(backend) => {
                    info!("Event bus connected to Redis");
                    backend
                }
                Err(e) => {
                    warn!("Event bus failed to connect to Redis: {}. Running without fanout.", e);
                    Backend::Disconnected
                }
            },
            BusConfig::Local => {
                if matches!(*self.backend.read(), Backend::Local(_)) {
                    return true;
                }
                let (tx, _) = broadcast::channel(LOCAL_CAPACITY);
                Backend::Local(tx)
            }
            BusConfig::Disconnected => Backend::Disconnected,
        };

        let connected = !matches!(backend, Backend::Disconnected);
        *self.backend.write() = backend;
        connected
    }

    async fn connect(url: &str) -> redis::RedisResult<Backend> {
        let client = redis::Client::open(url)?;
        let publisher = ConnectionManager::new(client.clone()).await?;
        // Subscriptions need their own connection; fail early if we cannot get one
        drop(client.get_async_connection().await?.into_pubsub());
        Ok(Backend::Redis { client, publisher })
    }

    pub fn is_connected(&self) -> bool {
        !matches!(*self.backend.read(), Backend::Disconnected)
    }

    async fn publish_raw(&self, topic: &str, payload: String) {
        let backend = self.backend.read().clone();
        match backend {
            Backend::Redis { mut publisher, .. } => {
                if let Err(e) = redis::cmd("PUBLISH")
                    .arg(topic)
                    .arg(payload)
                    .query_async::<_, i64>(&mut publisher)
                    .await
                {
                    warn!("Failed to publish to {}: {}", topic, e);
                }
            }
            Backend::Local(tx) => {
                // No receivers is not an error
                let _ = tx.send((topic.to_string(), payload));
            }
            Backend::Disconnected => {}
        }
    }

    async fn publish<T: Serialize>(&self, topic: &str, payload: &T, tenant_id: Option<&str>) {
        let envelope = BusEnvelope {
            tenant_id: tenant_id.map(str::to_string),
            payload,
        };
        match serde_json::to_string(&envelope) {
            Ok(json) => self.publish_raw(topic, json).await,
            Err(e) => error!("Failed to serialize {} message: {}", topic, e),
        }
    }

    pub async fn publish_update(&self, update: &PortfolioUpdate, tenant_id: Option<&str>) {
        self.publish(UPDATES_TOPIC, update, tenant_id).await;
    }

    pub async fn publish_alert(&self, alert: &AlertEvent, tenant_id: Option<&str>) {
        self.publish(ALERTS_TOPIC, alert, tenant_id).await;
    }

    pub fn subscribe_to_updates<F>(&self, callback: F) -> Option<JoinHandle<()>>
    where
        F: Fn(BusEnvelope<PortfolioUpdate>) + Send + Sync + 'static,
    {
        self.subscribe(UPDATES_TOPIC, callback)
    }

    pub fn subscribe_to_alerts<F>(&self, callback: F) -> Option<JoinHandle<()>>
    where
        F: Fn(BusEnvelope<AlertEvent>) + Send + Sync + 'static,
    {
        self.subscribe(ALERTS_TOPIC, callback)
    }

    /// Spawn a task delivering decoded messages on `topic`. Returns `None`
    /// when the bus is disconnected.
    fn subscribe<T, F>(&self, topic: &'static str, callback: F) -> Option<JoinHandle<()>>
    where
        T: DeserializeOwned + Send + 'static,
        F: Fn(BusEnvelope<T>) + Send + Sync + 'static,
    {
        let backend = self.backend.read().clone();
        match backend {
            Backend::Redis { client, .. } => {
                let callback = Arc::new(callback);
                Some(tokio::spawn(async move {
                    loop {
                        if let Err(e) = run_redis_subscription(&client, topic, callback.as_ref()).await {
                            error!("Redis subscription to {} failed: {}, retrying...", topic, e);
                        }
                        tokio::time::sleep(RESUBSCRIBE_DELAY).await;
                    }
                }))
            }
            Backend::Local(tx) => {
                let mut rx = tx.subscribe();
                Some(tokio::spawn(async move {
                    loop {
                        match rx.recv().await {
                            Ok((message_topic, payload)) if message_topic == topic => {
                                if let Some(envelope) = decode::<T>(topic, &payload) {
                                    callback(envelope);
                                }
                            }
                            Ok(_) => {}
                            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                                warn!("Subscriber on {} lagged, skipped {} messages", topic, skipped);
                            }
                            Err(broadcast::error::RecvError::Closed) => break,
                        }
                    }
                }))
            }
            Backend::Disconnected => {
                debug!("Event bus disconnected, ignoring subscription to {}", topic);
                None
            }
        }
    }
}

async fn run_redis_subscription<T, F>(client: &redis::Client, topic: &str, callback: &F) -> redis::RedisResult<()>
where
    T: DeserializeOwned,
    F: Fn(BusEnvelope<T>),
{
    let mut pubsub = client.get_async_connection().await?.into_pubsub();
    pubsub.subscribe(topic).await?;
    info!("Subscribed to {}", topic);

    let mut messages = pubsub.on_message();
    while let Some(msg) = messages.next().await {
        let payload: String = match msg.get_payload() {
            Ok(payload) => payload,
            Err(e) => {
                warn!("Unreadable payload on {}: {}", topic, e);
                continue;
            }
        };
        if let Some(envelope) = decode::<T>(topic, &payload) {
            callback(envelope);
        }
    }
    warn!("Redis subscription to {} ended", topic);
    Ok(())
}

fn decode<T: DeserializeOwned>(topic: &str, payload: &str) -> Option<BusEnvelope<T>> {
    match serde_json::from_str(payload) {
        Ok(envelope) => Some(envelope),
        Err(e) => {
            warn!("Dropping malformed message on {}: {}", topic, e);
            None
        }
    }
}
