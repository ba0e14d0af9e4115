//! Producer manager
//!
//! Wraps inbound media/data tracks as producers, pipes them to every other
//! router of the channel so consumers reach them regardless of worker
//! placement, and announces them to the rest of the channel. Piping always
//! completes before the announcement goes out, so a consume request can
//! never race ahead of reachability.

use std::sync::Arc;

use futures_util::future::join_all;
use serde_json::Value;

use voxcast_protocol::{
    ChannelKey, DataProducerId, MediaKind, PeerId, ProducerId, RouterId, ServerEvent, TransportId,
};

use crate::engine::DataProducerOptions;
use crate::error::{Result, SfuError};
use crate::sfu::consumer_manager::ConsumerManager;
use crate::sfu::op_queue::{OperationQueue, PauseAction, PauseTarget};
use crate::sfu::router_registry::RouterRegistry;
use crate::sfu::session_registry::{
    ClientSessionRegistry, DataProducerRecord, ProducerRecord,
};
use crate::ws::connections::ConnectionManager;

#[derive(Clone, Copy)]
enum PipeSource {
    Media(ProducerId),
    Data(DataProducerId),
}

pub struct ProducerManager {
    registry: Arc<ClientSessionRegistry>,
    routers: Arc<RouterRegistry>,
    connections: Arc<ConnectionManager>,
    consumers: Arc<ConsumerManager>,
    queue: Arc<OperationQueue>,
}

impl ProducerManager {
    pub fn new(
        registry: Arc<ClientSessionRegistry>,
        routers: Arc<RouterRegistry>,
        connections: Arc<ConnectionManager>,
        consumers: Arc<ConsumerManager>,
        queue: Arc<OperationQueue>,
    ) -> Arc<Self> {
        Arc::new(Self {
            registry,
            routers,
            connections,
            consumers,
            queue,
        })
    }

    pub async fn produce(
        &self,
        peer_id: PeerId,
        transport_id: TransportId,
        kind: MediaKind,
        rtp_parameters: Value,
        media_tag: String,
        paused: bool,
    ) -> Result<ProducerId> {
        let transport = self
            .registry
            .transport(transport_id)
            .await
            .ok_or(SfuError::TransportNotFound(transport_id))?;
        let producer = transport
            .handle
            .produce(kind, rtp_parameters, paused)
            .await?;
        let producer_id = producer.id();

        self.pipe_to_channel_routers(
            &transport.channel,
            transport.handle.router_id(),
            PipeSource::Media(producer_id),
        )
        .await;

        self.registry
            .insert_producer(ProducerRecord {
                handle: producer,
                peer_id,
                media_tag: media_tag.clone(),
                channel: transport.channel.clone(),
                transport_id,
                paused,
                global_mute: false,
            })
            .await;

        let (channel_type, channel_id) = channel_parts(&transport.channel);
        for peer in self.registry.peers_in_channel(&transport.channel).await {
            if peer == peer_id {
                continue;
            }
            self.connections
                .send_event(
                    peer,
                    ServerEvent::NewProducer {
                        peer_id,
                        media_tag: media_tag.clone(),
                        producer_id,
                        channel_type: channel_type.clone(),
                        channel_id: channel_id.clone(),
                    },
                )
                .await;
        }

        tracing::info!(%peer_id, %producer_id, %media_tag, "created producer");
        Ok(producer_id)
    }

    pub async fn produce_data(
        &self,
        peer_id: PeerId,
        transport_id: TransportId,
        label: String,
        protocol: String,
        sctp_stream_parameters: Value,
    ) -> Result<DataProducerId> {
        if label.is_empty() {
            return Err(SfuError::InvalidRequest(
                "data producer label is required".to_owned(),
            ));
        }
        let transport = self
            .registry
            .transport(transport_id)
            .await
            .ok_or(SfuError::TransportNotFound(transport_id))?;
        let data_producer = transport
            .handle
            .produce_data(DataProducerOptions {
                label: label.clone(),
                protocol,
                sctp_stream_parameters,
            })
            .await?;
        let data_producer_id = data_producer.id();

        self.pipe_to_channel_routers(
            &transport.channel,
            transport.handle.router_id(),
            PipeSource::Data(data_producer_id),
        )
        .await;

        let record = DataProducerRecord {
            handle: data_producer,
            peer_id,
            label: label.clone(),
            channel: transport.channel.clone(),
            transport_id,
        };
        self.registry.insert_data_producer(record.clone()).await;

        let (channel_type, channel_id) = channel_parts(&transport.channel);
        for peer in self.registry.peers_in_channel(&transport.channel).await {
            if peer == peer_id {
                continue;
            }
            self.connections
                .send_event(
                    peer,
                    ServerEvent::NewDataProducer {
                        peer_id,
                        label: label.clone(),
                        data_producer_id,
                        channel_type: channel_type.clone(),
                        channel_id: channel_id.clone(),
                    },
                )
                .await;
            self.consumers.consume_data_for_peer(peer, &record).await;
        }

        tracing::info!(%peer_id, %data_producer_id, %label, "created data producer");
        Ok(data_producer_id)
    }

    /// Closes the producer, its piped copies, every consumer built on it,
    /// and all bookkeeping entries.
    pub async fn close_producer_and_pipes(&self, producer_id: ProducerId) -> Result<()> {
        let record = self
            .registry
            .remove_producer(producer_id)
            .await
            .ok_or(SfuError::ProducerNotFound(producer_id))?;
        for consumer in self.registry.consumers_of_producer(producer_id).await {
            let consumer_id = consumer.handle.id();
            if let Err(error) = self.consumers.close_consumer(consumer_id).await {
                tracing::debug!(%consumer_id, %error, "consumer already gone during cascade");
            }
        }
        // The engine drops the piped copies together with the origin.
        record.handle.close().await;
        tracing::info!(%producer_id, "closed producer and pipes");
        Ok(())
    }

    pub async fn close_data_producer(&self, data_producer_id: DataProducerId) -> Result<()> {
        let record = self
            .registry
            .remove_data_producer(data_producer_id)
            .await
            .ok_or(SfuError::DataProducerNotFound(data_producer_id))?;
        for data_consumer in self.registry.data_consumers_of(data_producer_id).await {
            let id = data_consumer.handle.id();
            if let Err(error) = self.consumers.close_data_consumer(id).await {
                tracing::debug!(data_consumer = %id, %error, "data consumer already gone");
            }
        }
        record.handle.close().await;
        tracing::info!(%data_producer_id, "closed data producer");
        Ok(())
    }

    pub async fn pause_producer(&self, producer_id: ProducerId, global_mute: bool) -> Result<()> {
        let record = self
            .registry
            .producer(producer_id)
            .await
            .ok_or(SfuError::ProducerNotFound(producer_id))?;
        self.queue.enqueue(
            PauseTarget::Producer(Arc::clone(&record.handle)),
            PauseAction::Pause,
        );
        self.registry
            .set_producer_paused(producer_id, true, global_mute)
            .await;
        self.consumers
            .relay_producer_pause(producer_id, PauseAction::Pause)
            .await;
        if global_mute {
            self.connections
                .send_event(
                    record.peer_id,
                    ServerEvent::ProducerPaused {
                        producer_id,
                        global_mute,
                    },
                )
                .await;
        }
        Ok(())
    }

    pub async fn resume_producer(&self, producer_id: ProducerId) -> Result<()> {
        let record = self
            .registry
            .producer(producer_id)
            .await
            .ok_or(SfuError::ProducerNotFound(producer_id))?;
        self.queue.enqueue(
            PauseTarget::Producer(Arc::clone(&record.handle)),
            PauseAction::Resume,
        );
        self.registry
            .set_producer_paused(producer_id, false, false)
            .await;
        self.consumers
            .relay_producer_pause(producer_id, PauseAction::Resume)
            .await;
        self.connections
            .send_event(record.peer_id, ServerEvent::ProducerResumed { producer_id })
            .await;
        Ok(())
    }

    /// Replays `new-producer` events for the channel's existing producers
    /// to one peer, optionally restricted to a set of producing peers.
    pub async fn send_current_producers(
        &self,
        peer_id: PeerId,
        user_ids: &[PeerId],
        channel: &ChannelKey,
    ) {
        let (channel_type, channel_id) = channel_parts(channel);
        for record in self.registry.producers_in_channel(channel).await {
            if record.peer_id == peer_id {
                continue;
            }
            if !user_ids.is_empty() && !user_ids.contains(&record.peer_id) {
                continue;
            }
            self.connections
                .send_event(
                    peer_id,
                    ServerEvent::NewProducer {
                        peer_id: record.peer_id,
                        media_tag: record.media_tag.clone(),
                        producer_id: record.handle.id(),
                        channel_type: channel_type.clone(),
                        channel_id: channel_id.clone(),
                    },
                )
                .await;
        }
    }

    /// Pipes a producer from its origin router to every other router of
    /// the channel, in parallel. A failed pipe to one router is logged and
    /// the rest continue: partial reachability beats none.
    async fn pipe_to_channel_routers(
        &self,
        channel: &ChannelKey,
        origin: RouterId,
        source: PipeSource,
    ) {
        let routers = self.routers.routers_for(channel).await;
        let Some(origin_router) = routers.iter().find(|router| router.id() == origin) else {
            tracing::warn!(%channel, %origin, "origin router missing from channel set");
            return;
        };
        let pipes = routers
            .iter()
            .filter(|router| router.id() != origin)
            .map(|router| {
                let target = router.id();
                let origin_router = Arc::clone(origin_router);
                async move {
                    let result = match source {
                        PipeSource::Media(id) => {
                            origin_router.pipe_producer_to(id, target).await
                        }
                        PipeSource::Data(id) => {
                            origin_router.pipe_data_producer_to(id, target).await
                        }
                    };
                    (target, result)
                }
            });
        for (target, result) in join_all(pipes).await {
            if let Err(error) = result {
                tracing::error!(%target, %error, "piping to router failed, continuing");
            }
        }
    }
}

fn channel_parts(channel: &ChannelKey) -> (String, Option<String>) {
    (
        channel.channel_type().to_owned(),
        channel.channel_id().map(str::to_owned),
    )
}
