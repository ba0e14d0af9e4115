use std::collections::{HashMap, HashSet};

use tokio::sync::{RwLock, mpsc};
use uuid::Uuid;

use voxcast_protocol::{PeerId, ServerEvent, ServerMessage};

/// Registered signaling connections and their outbound senders. A peer may
/// hold more than one connection; server push goes to all of them.
#[derive(Default)]
pub struct ConnectionManager {
    senders: RwLock<HashMap<Uuid, mpsc::UnboundedSender<String>>>,
    connection_peers: RwLock<HashMap<Uuid, PeerId>>,
    peer_connections: RwLock<HashMap<PeerId, HashSet<Uuid>>>,
}

impl ConnectionManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn add_connection(
        &self,
        connection_id: Uuid,
        peer_id: PeerId,
        sender: mpsc::UnboundedSender<String>,
    ) {
        self.senders.write().await.insert(connection_id, sender);
        self.connection_peers
            .write()
            .await
            .insert(connection_id, peer_id);
        self.peer_connections
            .write()
            .await
            .entry(peer_id)
            .or_default()
            .insert(connection_id);
        tracing::debug!(%peer_id, %connection_id, "peer connected");
    }

    pub async fn remove_connection(&self, connection_id: Uuid) {
        let peer_id = self.connection_peers.write().await.remove(&connection_id);
        if let Some(peer_id) = peer_id {
            if let Some(connections) = self.peer_connections.write().await.get_mut(&peer_id) {
                connections.remove(&connection_id);
            }
            tracing::debug!(%peer_id, %connection_id, "peer disconnected");
        }
        self.senders.write().await.remove(&connection_id);
    }

    pub async fn send_to_connection(&self, connection_id: Uuid, message: &ServerMessage) {
        let json = match serde_json::to_string(message) {
            Ok(json) => json,
            Err(error) => {
                tracing::error!(%error, "failed to serialize server message");
                return;
            }
        };
        if let Some(sender) = self.senders.read().await.get(&connection_id)
            && let Err(error) = sender.send(json)
        {
            tracing::error!(%connection_id, %error, "failed to send to connection");
        }
    }

    pub async fn send_to_peer(&self, peer_id: PeerId, message: &ServerMessage) {
        let json = match serde_json::to_string(message) {
            Ok(json) => json,
            Err(error) => {
                tracing::error!(%error, "failed to serialize server message");
                return;
            }
        };
        let peer_connections = self.peer_connections.read().await;
        let senders = self.senders.read().await;
        if let Some(connections) = peer_connections.get(&peer_id) {
            for connection_id in connections {
                if let Some(sender) = senders.get(connection_id)
                    && let Err(error) = sender.send(json.clone())
                {
                    tracing::error!(%peer_id, %connection_id, %error, "failed to send to peer");
                }
            }
        }
    }

    pub async fn send_event(&self, peer_id: PeerId, event: ServerEvent) {
        self.send_to_peer(peer_id, &ServerMessage::Event(event)).await;
    }

    pub async fn is_peer_online(&self, peer_id: PeerId) -> bool {
        self.peer_connections
            .read()
            .await
            .get(&peer_id)
            .is_some_and(|connections| !connections.is_empty())
    }
}
