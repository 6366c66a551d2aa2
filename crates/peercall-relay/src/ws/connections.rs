use peercall_protocol::Envelope;
use std::collections::HashMap;
use tokio::sync::{mpsc, RwLock};
use uuid::Uuid;

/// Where an inbound message went
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Delivery {
    /// `register` bound an identity to the sending connection
    Registered(String),
    /// Forwarded to the connection registered under `to`
    Direct(Uuid),
    /// Sent to every other open connection
    Broadcast(usize),
    /// Not valid JSON
    Invalid,
}

pub struct ConnectionManager {
    /// Map from connection ID to message sender channel
    senders: RwLock<HashMap<Uuid, mpsc::UnboundedSender<String>>>,
    /// Map from registered identity to its connection
    identities: RwLock<HashMap<String, Uuid>>,
}

impl ConnectionManager {
    pub fn new() -> Self {
        Self {
            senders: RwLock::new(HashMap::new()),
            identities: RwLock::new(HashMap::new()),
        }
    }

    pub async fn add_connection(&self, connection_id: Uuid, sender: mpsc::UnboundedSender<String>) {
        self.senders.write().await.insert(connection_id, sender);
        tracing::debug!("Connection {} opened", connection_id);
    }

    /// Drop the connection and any identity bound to it
    pub async fn remove_connection(&self, connection_id: Uuid) {
        self.senders.write().await.remove(&connection_id);

        let mut identities = self.identities.write().await;
        let bound: Vec<String> = identities
            .iter()
            .filter(|(_, id)| **id == connection_id)
            .map(|(identity, _)| identity.clone())
            .collect();
        for identity in bound {
            identities.remove(&identity);
            tracing::info!("Client {} disconnected", identity);
        }
        drop(identities);

        self.log_registered().await;
    }

    /// Bind `identity` to `connection_id`; a later registration of the same
    /// identity takes it over
    pub async fn register(&self, connection_id: Uuid, identity: &str) {
        let previous = self
            .identities
            .write()
            .await
            .insert(identity.to_string(), connection_id);

        match previous {
            Some(old) if old != connection_id => {
                tracing::info!("Client {} re-registered from a new connection", identity)
            }
            _ => tracing::info!("Client {} registered", identity),
        }
        self.log_registered().await;
    }

    /// Route one text frame received on `from`
    pub async fn route(&self, from: Uuid, text: &str) -> Delivery {
        let envelope = match Envelope::parse(text) {
            Ok(envelope) => envelope,
            Err(e) => {
                tracing::warn!("Invalid JSON from connection {}: {}", from, e);
                return Delivery::Invalid;
            }
        };

        // A register without an identity is routed like any other message
        if envelope.is_register() {
            if let Some(identity) = envelope.from.as_deref().filter(|f| !f.is_empty()) {
                self.register(from, identity).await;
                return Delivery::Registered(identity.to_string());
            }
        }

        if let Some(to) = envelope.recipient() {
            let target = self.identities.read().await.get(to).copied();
            if let Some(target) = target {
                tracing::debug!(
                    "Forwarding {} from {} to {}",
                    envelope.kind,
                    envelope.from.as_deref().unwrap_or("?"),
                    to
                );
                self.send_to_connection(target, text).await;
                return Delivery::Direct(target);
            }
            tracing::debug!("Client {} not found, broadcasting {}", to, envelope.kind);
        }

        Delivery::Broadcast(self.broadcast_except(from, text).await)
    }

    pub async fn send_to_connection(&self, connection_id: Uuid, text: &str) -> bool {
        match self.senders.read().await.get(&connection_id) {
            Some(sender) => sender.send(text.to_string()).is_ok(),
            None => false,
        }
    }

    /// Send to every open connection other than `except`; returns the count
    pub async fn broadcast_except(&self, except: Uuid, text: &str) -> usize {
        let senders = self.senders.read().await;
        senders
            .iter()
            .filter(|(id, _)| **id != except)
            .filter(|(_, sender)| sender.send(text.to_string()).is_ok())
            .count()
    }

    pub async fn connection_count(&self) -> usize {
        self.senders.read().await.len()
    }

    /// Registered identities, sorted
    pub async fn registered_identities(&self) -> Vec<String> {
        let mut identities: Vec<String> = self.identities.read().await.keys().cloned().collect();
        identities.sort();
        identities
    }

    async fn log_registered(&self) {
        let identities = self.registered_identities().await;
        if identities.is_empty() {
            tracing::debug!("Currently registered clients: none");
        } else {
            tracing::debug!("Currently registered clients: {}", identities.join(", "));
        }
    }
}

impl Default for ConnectionManager {
    fn default() -> Self {
        Self::new()
    }
}
