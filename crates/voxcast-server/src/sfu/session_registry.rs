//! Client session registry
//!
//! The authoritative per-connected-user record plus the global live-entity
//! indexes. Every manager resolves transports, producers and consumers
//! through this registry instead of holding private copies; each mutation
//! runs under one write lock so bookkeeping is never observed half-updated.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tokio::sync::RwLock;

use voxcast_protocol::{
    ChannelKey, ConsumerId, ConsumerLayers, DataConsumerId, DataProducerId, PeerId, ProducerId,
    TransportDirection, TransportId,
};

use crate::engine::{MediaConsumer, MediaDataConsumer, MediaDataProducer, MediaProducer,
    MediaTransport};

#[derive(Clone)]
pub struct TransportRecord {
    pub handle: Arc<dyn MediaTransport>,
    pub peer_id: PeerId,
    pub channel: ChannelKey,
    pub direction: TransportDirection,
}

#[derive(Clone)]
pub struct ProducerRecord {
    pub handle: Arc<dyn MediaProducer>,
    pub peer_id: PeerId,
    pub media_tag: String,
    pub channel: ChannelKey,
    pub transport_id: TransportId,
    pub paused: bool,
    pub global_mute: bool,
}

#[derive(Clone)]
pub struct DataProducerRecord {
    pub handle: Arc<dyn MediaDataProducer>,
    pub peer_id: PeerId,
    pub label: String,
    pub channel: ChannelKey,
    pub transport_id: TransportId,
}

#[derive(Clone)]
pub struct ConsumerRecord {
    pub handle: Arc<dyn MediaConsumer>,
    pub peer_id: PeerId,
    pub producer_id: ProducerId,
    pub media_peer_id: PeerId,
    pub media_tag: String,
    pub channel: ChannelKey,
    pub transport_id: TransportId,
}

#[derive(Clone)]
pub struct DataConsumerRecord {
    pub handle: Arc<dyn MediaDataConsumer>,
    pub peer_id: PeerId,
    pub data_producer_id: DataProducerId,
    pub transport_id: TransportId,
}

/// Per-client view of the same entities, keyed the way the signaling layer
/// addresses them (transport slot, media tag, data label, consumer id).
#[derive(Clone, Default)]
pub struct ClientSession {
    pub transports: HashMap<(ChannelKey, TransportDirection), TransportId>,
    pub media: HashMap<String, ProducerId>,
    pub data_producers: HashMap<String, DataProducerId>,
    pub consumers: HashSet<ConsumerId>,
    pub data_consumers: HashMap<DataProducerId, DataConsumerId>,
    pub consumer_layers: HashMap<ConsumerId, ConsumerLayers>,
}

#[derive(Default)]
struct RegistryInner {
    sessions: HashMap<PeerId, ClientSession>,
    transports: HashMap<TransportId, TransportRecord>,
    producers: HashMap<ProducerId, ProducerRecord>,
    data_producers: HashMap<DataProducerId, DataProducerRecord>,
    consumers: HashMap<ConsumerId, ConsumerRecord>,
    data_consumers: HashMap<DataConsumerId, DataConsumerRecord>,
}

#[derive(Default)]
pub struct ClientSessionRegistry {
    inner: RwLock<RegistryInner>,
}

impl ClientSessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates the session record on first signaling activity. Idempotent.
    pub async fn ensure_session(&self, peer_id: PeerId) {
        self.inner
            .write()
            .await
            .sessions
            .entry(peer_id)
            .or_default();
    }

    pub async fn remove_session(&self, peer_id: PeerId) -> Option<ClientSession> {
        self.inner.write().await.sessions.remove(&peer_id)
    }

    pub async fn session(&self, peer_id: PeerId) -> Option<ClientSession> {
        self.inner.read().await.sessions.get(&peer_id).cloned()
    }

    // ---- transports ----

    pub async fn insert_transport(&self, record: TransportRecord) {
        let id = record.handle.id();
        let mut inner = self.inner.write().await;
        let session = inner.sessions.entry(record.peer_id).or_default();
        session
            .transports
            .insert((record.channel.clone(), record.direction), id);
        inner.transports.insert(id, record);
    }

    pub async fn remove_transport(&self, id: TransportId) -> Option<TransportRecord> {
        let mut inner = self.inner.write().await;
        let record = inner.transports.remove(&id)?;
        if let Some(session) = inner.sessions.get_mut(&record.peer_id) {
            let slot = (record.channel.clone(), record.direction);
            // Replaced slots already point at the newer transport.
            if session.transports.get(&slot) == Some(&id) {
                session.transports.remove(&slot);
            }
        }
        Some(record)
    }

    pub async fn transport(&self, id: TransportId) -> Option<TransportRecord> {
        self.inner.read().await.transports.get(&id).cloned()
    }

    pub async fn transport_for_slot(
        &self,
        peer_id: PeerId,
        channel: &ChannelKey,
        direction: TransportDirection,
    ) -> Option<TransportId> {
        self.inner
            .read()
            .await
            .sessions
            .get(&peer_id)?
            .transports
            .get(&(channel.clone(), direction))
            .copied()
    }

    pub async fn transports_of_peer(&self, peer_id: PeerId) -> Vec<TransportId> {
        self.inner
            .read()
            .await
            .transports
            .iter()
            .filter(|(_, record)| record.peer_id == peer_id)
            .map(|(id, _)| *id)
            .collect()
    }

    /// Channel membership: a peer belongs to a channel while it owns at
    /// least one live transport in it.
    pub async fn peers_in_channel(&self, channel: &ChannelKey) -> Vec<PeerId> {
        let inner = self.inner.read().await;
        let mut peers: Vec<PeerId> = Vec::new();
        for record in inner.transports.values() {
            if record.channel == *channel && !peers.contains(&record.peer_id) {
                peers.push(record.peer_id);
            }
        }
        peers
    }

    // ---- producers ----

    pub async fn insert_producer(&self, record: ProducerRecord) {
        let id = record.handle.id();
        let mut inner = self.inner.write().await;
        let session = inner.sessions.entry(record.peer_id).or_default();
        session.media.insert(record.media_tag.clone(), id);
        inner.producers.insert(id, record);
    }

    pub async fn remove_producer(&self, id: ProducerId) -> Option<ProducerRecord> {
        let mut inner = self.inner.write().await;
        let record = inner.producers.remove(&id)?;
        if let Some(session) = inner.sessions.get_mut(&record.peer_id)
            && session.media.get(&record.media_tag) == Some(&id)
        {
            session.media.remove(&record.media_tag);
        }
        Some(record)
    }

    pub async fn producer(&self, id: ProducerId) -> Option<ProducerRecord> {
        self.inner.read().await.producers.get(&id).cloned()
    }

    pub async fn find_producer(
        &self,
        media_peer_id: PeerId,
        media_tag: &str,
        channel: &ChannelKey,
    ) -> Option<ProducerRecord> {
        self.inner
            .read()
            .await
            .producers
            .values()
            .find(|record| {
                record.peer_id == media_peer_id
                    && record.media_tag == media_tag
                    && record.channel == *channel
            })
            .cloned()
    }

    pub async fn producers_in_channel(&self, channel: &ChannelKey) -> Vec<ProducerRecord> {
        self.inner
            .read()
            .await
            .producers
            .values()
            .filter(|record| record.channel == *channel)
            .cloned()
            .collect()
    }

    pub async fn producers_on_transport(&self, transport_id: TransportId) -> Vec<ProducerId> {
        self.inner
            .read()
            .await
            .producers
            .iter()
            .filter(|(_, record)| record.transport_id == transport_id)
            .map(|(id, _)| *id)
            .collect()
    }

    pub async fn set_producer_paused(&self, id: ProducerId, paused: bool, global_mute: bool) {
        let mut inner = self.inner.write().await;
        if let Some(record) = inner.producers.get_mut(&id) {
            record.paused = paused;
            record.global_mute = global_mute;
        }
    }

    // ---- data producers ----

    pub async fn insert_data_producer(&self, record: DataProducerRecord) {
        let id = record.handle.id();
        let mut inner = self.inner.write().await;
        let session = inner.sessions.entry(record.peer_id).or_default();
        session.data_producers.insert(record.label.clone(), id);
        inner.data_producers.insert(id, record);
    }

    pub async fn remove_data_producer(&self, id: DataProducerId) -> Option<DataProducerRecord> {
        let mut inner = self.inner.write().await;
        let record = inner.data_producers.remove(&id)?;
        if let Some(session) = inner.sessions.get_mut(&record.peer_id)
            && session.data_producers.get(&record.label) == Some(&id)
        {
            session.data_producers.remove(&record.label);
        }
        Some(record)
    }

    pub async fn data_producer(&self, id: DataProducerId) -> Option<DataProducerRecord> {
        self.inner.read().await.data_producers.get(&id).cloned()
    }

    pub async fn data_producers_in_channel(&self, channel: &ChannelKey) -> Vec<DataProducerRecord> {
        self.inner
            .read()
            .await
            .data_producers
            .values()
            .filter(|record| record.channel == *channel)
            .cloned()
            .collect()
    }

    pub async fn data_producers_on_transport(
        &self,
        transport_id: TransportId,
    ) -> Vec<DataProducerId> {
        self.inner
            .read()
            .await
            .data_producers
            .iter()
            .filter(|(_, record)| record.transport_id == transport_id)
            .map(|(id, _)| *id)
            .collect()
    }

    // ---- consumers ----

    pub async fn insert_consumer(&self, record: ConsumerRecord) {
        let id = record.handle.id();
        let mut inner = self.inner.write().await;
        let session = inner.sessions.entry(record.peer_id).or_default();
        session.consumers.insert(id);
        session.consumer_layers.insert(id, ConsumerLayers::default());
        inner.consumers.insert(id, record);
    }

    pub async fn remove_consumer(&self, id: ConsumerId) -> Option<ConsumerRecord> {
        let mut inner = self.inner.write().await;
        let record = inner.consumers.remove(&id)?;
        if let Some(session) = inner.sessions.get_mut(&record.peer_id) {
            session.consumers.remove(&id);
            session.consumer_layers.remove(&id);
        }
        Some(record)
    }

    pub async fn consumer(&self, id: ConsumerId) -> Option<ConsumerRecord> {
        self.inner.read().await.consumers.get(&id).cloned()
    }

    pub async fn consumers_of_producer(&self, producer_id: ProducerId) -> Vec<ConsumerRecord> {
        self.inner
            .read()
            .await
            .consumers
            .values()
            .filter(|record| record.producer_id == producer_id)
            .cloned()
            .collect()
    }

    pub async fn consumers_on_transport(&self, transport_id: TransportId) -> Vec<ConsumerId> {
        self.inner
            .read()
            .await
            .consumers
            .iter()
            .filter(|(_, record)| record.transport_id == transport_id)
            .map(|(id, _)| *id)
            .collect()
    }

    pub async fn set_current_layer(&self, id: ConsumerId, layer: Option<u8>) {
        let mut inner = self.inner.write().await;
        let Some(peer_id) = inner.consumers.get(&id).map(|record| record.peer_id) else {
            return;
        };
        if let Some(session) = inner.sessions.get_mut(&peer_id)
            && let Some(layers) = session.consumer_layers.get_mut(&id)
        {
            layers.current_layer = layer;
        }
    }

    pub async fn set_selected_layer(&self, id: ConsumerId, layer: u8) {
        let mut inner = self.inner.write().await;
        let Some(peer_id) = inner.consumers.get(&id).map(|record| record.peer_id) else {
            return;
        };
        if let Some(session) = inner.sessions.get_mut(&peer_id)
            && let Some(layers) = session.consumer_layers.get_mut(&id)
        {
            layers.client_selected_layer = Some(layer);
        }
    }

    pub async fn consumer_layers(&self, peer_id: PeerId, id: ConsumerId) -> Option<ConsumerLayers> {
        self.inner
            .read()
            .await
            .sessions
            .get(&peer_id)?
            .consumer_layers
            .get(&id)
            .copied()
    }

    // ---- data consumers ----

    pub async fn insert_data_consumer(&self, record: DataConsumerRecord) {
        let id = record.handle.id();
        let mut inner = self.inner.write().await;
        let session = inner.sessions.entry(record.peer_id).or_default();
        session.data_consumers.insert(record.data_producer_id, id);
        inner.data_consumers.insert(id, record);
    }

    pub async fn remove_data_consumer(&self, id: DataConsumerId) -> Option<DataConsumerRecord> {
        let mut inner = self.inner.write().await;
        let record = inner.data_consumers.remove(&id)?;
        if let Some(session) = inner.sessions.get_mut(&record.peer_id) {
            session.data_consumers.remove(&record.data_producer_id);
        }
        Some(record)
    }

    pub async fn data_consumers_of(
        &self,
        data_producer_id: DataProducerId,
    ) -> Vec<DataConsumerRecord> {
        self.inner
            .read()
            .await
            .data_consumers
            .values()
            .filter(|record| record.data_producer_id == data_producer_id)
            .cloned()
            .collect()
    }

    pub async fn data_consumers_on_transport(
        &self,
        transport_id: TransportId,
    ) -> Vec<DataConsumerId> {
        self.inner
            .read()
            .await
            .data_consumers
            .iter()
            .filter(|(_, record)| record.transport_id == transport_id)
            .map(|(id, _)| *id)
            .collect()
    }
}
