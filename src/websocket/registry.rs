use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use uuid::Uuid;

/// A connected client.
pub struct ClientConnection {
    /// Tenant bound by a successful auth frame.
    pub tenant_id: Option<String>,
    /// Channel to send messages to the client.
    pub tx: mpsc::UnboundedSender<String>,
}

/// Tracks WebSocket clients and routes frames by tenant.
pub struct ConnectionRegistry {
    clients: DashMap<Uuid, ClientConnection>,
}

impl ConnectionRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Register a new, unauthenticated client.
    pub fn register(&self, tx: mpsc::UnboundedSender<String>) -> Uuid {
        let client_id = Uuid::new_v4();
        self.clients.insert(client_id, ClientConnection { tenant_id: None, tx });
        client_id
    }

    pub fn unregister(&self, client_id: Uuid) {
        self.clients.remove(&client_id);
    }

    /// Bind a client to a tenant. Returns false for unknown clients.
    pub fn bind(&self, client_id: Uuid, tenant_id: &str) -> bool {
        match self.clients.get_mut(&client_id) {
            Some(mut client) => {
                client.tenant_id = Some(tenant_id.to_string());
                true
            }
            None => false,
        }
    }

    pub fn tenant_of(&self, client_id: Uuid) -> Option<String> {
        self.clients.get(&client_id).and_then(|c| c.tenant_id.clone())
    }

    /// Send one frame to one client.
    pub fn send(&self, client_id: Uuid, message: &str) -> bool {
        self.clients
            .get(&client_id)
            .map(|c| c.tx.send(message.to_string()).is_ok())
            .unwrap_or(false)
    }

    /// Route a frame: tenant-tagged frames go only to that tenant's
    /// connections, untagged frames go to everyone. Returns recipients.
    pub fn deliver(&self, tenant_id: Option<&str>, message: &str) -> usize {
        let senders: Vec<mpsc::UnboundedSender<String>> = self
            .clients
            .iter()
            .filter(|c| match tenant_id {
                Some(tenant) => c.tenant_id.as_deref() == Some(tenant),
                None => true,
            })
            .map(|c| c.tx.clone())
            .collect();

        senders
            .iter()
            .filter(|tx| tx.send(message.to_string()).is_ok())
            .count()
    }

    pub fn client_count(&self) -> usize {
        self.clients.len()
    }

    pub fn authenticated_count(&self) -> usize {
        self.clients.iter().filter(|c| c.tenant_id.is_some()).count()
    }
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self {
            clients: DashMap::new(),
        }
    }
}
