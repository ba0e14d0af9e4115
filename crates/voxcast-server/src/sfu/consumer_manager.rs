//! Consumer manager
//!
//! Creates media/data consumers on a client's recv transport and owns
//! their lifecycle bookkeeping. Producer-side lifecycle (close, pause,
//! resume) reaches consumers through explicit calls from the producer and
//! transport managers, so the cascade order is auditable.

use std::sync::Arc;

use serde_json::Value;

use voxcast_protocol::{
    ChannelKey, ConsumerId, DataConsumerId, MediaKind, PeerId, ProducerId, ServerEvent,
    TransportDirection, TransportId,
};

use crate::engine::MediaTransport;
use crate::error::{Result, SfuError};
use crate::sfu::op_queue::{OperationQueue, PauseAction, PauseTarget};
use crate::sfu::router_registry::RouterRegistry;
use crate::sfu::session_registry::{
    ClientSessionRegistry, ConsumerRecord, DataConsumerRecord, DataProducerRecord,
};
use crate::ws::connections::ConnectionManager;

/// Everything the consuming client needs to attach to a new consumer.
#[derive(Debug)]
pub struct ConsumerDescriptor {
    pub producer_id: ProducerId,
    pub id: ConsumerId,
    pub kind: MediaKind,
    pub rtp_parameters: Value,
    pub consumer_type: String,
    pub producer_paused: bool,
}

pub struct ConsumerManager {
    registry: Arc<ClientSessionRegistry>,
    routers: Arc<RouterRegistry>,
    connections: Arc<ConnectionManager>,
    queue: Arc<OperationQueue>,
}

impl ConsumerManager {
    pub fn new(
        registry: Arc<ClientSessionRegistry>,
        routers: Arc<RouterRegistry>,
        connections: Arc<ConnectionManager>,
        queue: Arc<OperationQueue>,
    ) -> Arc<Self> {
        Arc::new(Self {
            registry,
            routers,
            connections,
            queue,
        })
    }

    pub async fn consume(
        &self,
        peer_id: PeerId,
        media_peer_id: PeerId,
        media_tag: String,
        rtp_capabilities: Value,
        channel: ChannelKey,
    ) -> Result<ConsumerDescriptor> {
        let cannot_consume = || SfuError::CannotConsume {
            media_peer_id,
            media_tag: media_tag.clone(),
        };
        let producer = self
            .registry
            .find_producer(media_peer_id, &media_tag, &channel)
            .await
            .ok_or_else(cannot_consume)?;

        let recv_missing = || SfuError::RecvTransportNotFound {
            peer_id,
            channel: channel.clone(),
        };
        let transport_id = self
            .registry
            .transport_for_slot(peer_id, &channel, TransportDirection::Recv)
            .await
            .ok_or_else(recv_missing)?;
        let transport = self
            .registry
            .transport(transport_id)
            .await
            .ok_or_else(recv_missing)?;
        if transport.handle.closed() {
            return Err(recv_missing());
        }

        // Check against the router the recv transport actually lives on;
        // the producer was piped there when it was created.
        let router = self
            .routers
            .router_in(&channel, transport.handle.router_id())
            .await
            .ok_or_else(recv_missing)?;
        let producer_id = producer.handle.id();
        if !router.can_consume(producer_id, &rtp_capabilities).await? {
            return Err(cannot_consume());
        }

        // Always start paused; the client resumes once it is ready to
        // render, avoiding a burst of undecodable frames.
        let consumer = transport
            .handle
            .consume(producer_id, rtp_capabilities, true)
            .await?;
        let consumer_id = consumer.id();

        self.registry
            .insert_consumer(ConsumerRecord {
                handle: Arc::clone(&consumer),
                peer_id,
                producer_id,
                media_peer_id,
                media_tag,
                channel,
                transport_id,
            })
            .await;

        // Track the delivered spatial layer as the engine switches it.
        let registry = Arc::clone(&self.registry);
        let mut layers_rx = consumer.layers();
        tokio::spawn(async move {
            while layers_rx.changed().await.is_ok() {
                let layer = *layers_rx.borrow();
                registry.set_current_layer(consumer_id, layer).await;
            }
        });

        tracing::info!(%peer_id, %media_peer_id, %consumer_id, "created consumer");
        Ok(ConsumerDescriptor {
            producer_id,
            id: consumer_id,
            kind: consumer.kind(),
            rtp_parameters: consumer.rtp_parameters(),
            consumer_type: consumer.consumer_type(),
            producer_paused: consumer.producer_paused(),
        })
    }

    pub async fn pause_consumer(&self, consumer_id: ConsumerId) -> Result<()> {
        let record = self
            .registry
            .consumer(consumer_id)
            .await
            .ok_or(SfuError::ConsumerNotFound(consumer_id))?;
        self.queue
            .enqueue(PauseTarget::Consumer(record.handle), PauseAction::Pause);
        Ok(())
    }

    pub async fn resume_consumer(&self, consumer_id: ConsumerId) -> Result<()> {
        let record = self
            .registry
            .consumer(consumer_id)
            .await
            .ok_or(SfuError::ConsumerNotFound(consumer_id))?;
        self.queue
            .enqueue(PauseTarget::Consumer(record.handle), PauseAction::Resume);
        Ok(())
    }

    /// Layer preference goes straight to the engine: unlike pause/resume,
    /// repeated or reordered layer updates converge to the same state.
    pub async fn set_preferred_layer(&self, consumer_id: ConsumerId, spatial_layer: u8) -> Result<()> {
        let record = self
            .registry
            .consumer(consumer_id)
            .await
            .ok_or(SfuError::ConsumerNotFound(consumer_id))?;
        record.handle.set_preferred_layers(spatial_layer).await?;
        self.registry
            .set_selected_layer(consumer_id, spatial_layer)
            .await;
        Ok(())
    }

    pub async fn close_consumer(&self, consumer_id: ConsumerId) -> Result<()> {
        let record = self
            .registry
            .remove_consumer(consumer_id)
            .await
            .ok_or(SfuError::ConsumerNotFound(consumer_id))?;
        record.handle.close().await;
        // Clients track consumers by id for presentation, so everyone in
        // the channel learns the id is gone.
        for peer in self.registry.peers_in_channel(&record.channel).await {
            self.connections
                .send_event(peer, ServerEvent::ConsumerClosed { consumer_id })
                .await;
        }
        tracing::info!(%consumer_id, "closed consumer");
        Ok(())
    }

    /// Relay a producer-side pause/resume to every consumer built on it:
    /// queue the engine call and tell the consuming client.
    pub async fn relay_producer_pause(
        &self,
        producer_id: ProducerId,
        action: PauseAction,
    ) {
        for record in self.registry.consumers_of_producer(producer_id).await {
            let consumer_id = record.handle.id();
            self.queue
                .enqueue(PauseTarget::Consumer(record.handle), action);
            let event = match action {
                PauseAction::Pause => ServerEvent::ConsumerPaused { consumer_id },
                PauseAction::Resume => ServerEvent::ConsumerResumed { consumer_id },
            };
            self.connections.send_event(record.peer_id, event).await;
        }
    }

    /// Server-initiated data consumer for one peer, on that peer's recv
    /// transport for the data producer's channel. Failures are logged and
    /// skipped; one peer's dead transport must not stop the fan-out.
    pub async fn consume_data_for_peer(&self, peer_id: PeerId, data_producer: &DataProducerRecord) {
        let Some(transport_id) = self
            .registry
            .transport_for_slot(peer_id, &data_producer.channel, TransportDirection::Recv)
            .await
        else {
            tracing::debug!(%peer_id, "no recv transport for data consumer");
            return;
        };
        let Some(transport) = self.registry.transport(transport_id).await else {
            return;
        };
        self.consume_data_on(peer_id, transport_id, &transport.handle, data_producer)
            .await;
    }

    /// Wire every existing data producer of the channel onto a freshly
    /// created recv transport.
    pub async fn wire_existing_data_producers(
        &self,
        peer_id: PeerId,
        channel: &ChannelKey,
        transport_id: TransportId,
        transport: &Arc<dyn MediaTransport>,
    ) {
        for data_producer in self.registry.data_producers_in_channel(channel).await {
            if data_producer.peer_id == peer_id {
                continue;
            }
            self.consume_data_on(peer_id, transport_id, transport, &data_producer)
                .await;
        }
    }

    async fn consume_data_on(
        &self,
        peer_id: PeerId,
        transport_id: TransportId,
        transport: &Arc<dyn MediaTransport>,
        data_producer: &DataProducerRecord,
    ) {
        let data_producer_id = data_producer.handle.id();
        match transport.consume_data(data_producer_id).await {
            Ok(data_consumer) => {
                let id = data_consumer.id();
                let event = ServerEvent::ConsumeData {
                    data_producer_id,
                    id,
                    sctp_stream_parameters: data_consumer.sctp_stream_parameters(),
                    label: data_consumer.label(),
                    protocol: data_consumer.protocol(),
                };
                self.registry
                    .insert_data_consumer(DataConsumerRecord {
                        handle: data_consumer,
                        peer_id,
                        data_producer_id,
                        transport_id,
                    })
                    .await;
                self.connections.send_event(peer_id, event).await;
                tracing::info!(%peer_id, %data_producer_id, "created data consumer");
            }
            Err(error) => {
                tracing::warn!(%peer_id, %data_producer_id, %error, "data consumer creation failed");
            }
        }
    }

    pub async fn close_data_consumer(&self, id: DataConsumerId) -> Result<()> {
        let record = self
            .registry
            .remove_data_consumer(id)
            .await
            .ok_or(SfuError::DataConsumerNotFound(id))?;
        record.handle.close().await;
        Ok(())
    }
}
