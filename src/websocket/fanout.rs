use super::ConnectionRegistry;
use crate::services::EventBus;
use crate::types::ServerMessage;
use std::sync::Arc;
use tokio::task::JoinHandle;

/// Forward bus updates and alerts to WebSocket clients, routed by the
/// envelope's tenant tag.
pub fn forward_bus_to_clients(bus: &EventBus, registry: Arc<ConnectionRegistry>) -> Vec<JoinHandle<()>> {
    let mut tasks = Vec::with_capacity(2);

    let updates_registry = registry.clone();
    if let Some(task) = bus.subscribe_to_updates(move |envelope| {
        if let Some(json) = ServerMessage::Update(envelope.payload).to_json() {
            updates_registry.deliver(envelope.tenant_id.as_deref(), &json);
        }
    }) {
        tasks.push(task);
    }

    if let Some(task) = bus.subscribe_to_alerts(move |envelope| {
        if let Some(json) = ServerMessage::Alert(envelope.payload).to_json() {
            registry.deliver(envelope.tenant_id.as_deref(), &json);
        }
    }) {
        tasks.push(task);
    }

    tasks
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{AlertEvent, AlertSeverity, AlertType, PortfolioUpdate, UpdateType};
    use std::time::Duration;
    use tokio::sync::mpsc;

    async fn recv(rx: &mut mpsc::UnboundedReceiver<String>) -> Option<serde_json::Value> {
        let text = tokio::time::timeout(Duration::from_millis(500), rx.recv()).await.ok().flatten()?;
        serde_json::from_str(&text).ok()
    }

    #[tokio::test]
    async fn test_bus_frames_routed_by_tenant() {
        let bus = EventBus::local();
        let registry = ConnectionRegistry::new();
        let (alice_tx, mut alice_rx) = mpsc::unbounded_channel();
        let (bob_tx, mut bob_rx) = mpsc::unbounded_channel();
        let alice = registry.register(alice_tx);
        let bob = registry.register(bob_tx);
        registry.bind(alice, "alice");
        registry.bind(bob, "bob");

        let tasks = forward_bus_to_clients(&bus, registry.clone());
        assert_eq!(tasks.len(), 2);

        let update = PortfolioUpdate::new(UpdateType::Order, Some("binance"), &serde_json::json!({"orderId": "7"}));
        bus.publish_update(&update, Some("alice")).await;
        let frame = recv(&mut alice_rx).await.unwrap();
        assert_eq!(frame["type"], "update");
        assert_eq!(frame["data"]["data"]["orderId"], "7");

        let alert = AlertEvent::new(AlertType::RapidDrawdown, AlertSeverity::Critical, "drop", None, serde_json::Value::Null);
        bus.publish_alert(&alert, None).await;
        let frame = recv(&mut bob_rx).await.unwrap();
        assert_eq!(frame["type"], "alert");
        // Bob never saw alice's update
        assert!(recv(&mut bob_rx).await.is_none());
        assert_eq!(recv(&mut alice_rx).await.unwrap()["type"], "alert");

        for task in tasks {
            task.abort();
        }
    }

    #[tokio::test]
    async fn test_disconnected_bus_forwards_nothing() {
        let bus = EventBus::disconnected();
        assert!(forward_bus_to_clients(&bus, ConnectionRegistry::new()).is_empty());
    }
}
