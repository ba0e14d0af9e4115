//! Transport manager
//!
//! Creates WebRTC transports on the least-loaded router of a channel,
//! enforces the one-transport-per-(channel, direction) slot, and drives the
//! close cascade: transport, then its producers and data producers (with
//! their piped copies and consumers), then any consumers and data consumers
//! riding on it.

use std::sync::Arc;

use serde_json::Value;

use voxcast_protocol::{
    ChannelKey, PeerId, TransportDirection, TransportId, TransportOptions,
};

use crate::engine::TransportCreateOptions;
use crate::error::{Result, SfuError};
use crate::sfu::consumer_manager::ConsumerManager;
use crate::sfu::producer_manager::ProducerManager;
use crate::sfu::router_registry::RouterRegistry;
use crate::sfu::session_registry::{ClientSessionRegistry, TransportRecord};

/// Network-facing transport parameters, from config.
#[derive(Debug, Clone)]
pub struct TransportSettings {
    pub listen_ips: Vec<String>,
    pub initial_available_outgoing_bitrate: u32,
    pub max_incoming_bitrate: u32,
}

pub struct TransportManager {
    registry: Arc<ClientSessionRegistry>,
    routers: Arc<RouterRegistry>,
    producers: Arc<ProducerManager>,
    consumers: Arc<ConsumerManager>,
    settings: TransportSettings,
}

impl TransportManager {
    pub fn new(
        registry: Arc<ClientSessionRegistry>,
        routers: Arc<RouterRegistry>,
        producers: Arc<ProducerManager>,
        consumers: Arc<ConsumerManager>,
        settings: TransportSettings,
    ) -> Arc<Self> {
        Arc::new(Self {
            registry,
            routers,
            producers,
            consumers,
            settings,
        })
    }

    /// Creates a transport for the peer's (channel, direction) slot. An
    /// existing transport in the slot is closed first, so reconnecting
    /// clients never accumulate stale transports.
    pub async fn create_transport(
        self: &Arc<Self>,
        peer_id: PeerId,
        direction: TransportDirection,
        channel: ChannelKey,
        sctp_capabilities: Value,
    ) -> Result<TransportOptions> {
        self.registry.ensure_session(peer_id).await;
        self.routers.ensure_channel(&channel).await?;

        // Slot check, close, router selection, creation and registration
        // all run under the channel lock: without it two concurrent
        // creations can both observe an empty slot (or the same
        // least-loaded router) before either transport registers.
        let lock = self.routers.channel_lock(&channel).await;
        let transport = {
            let _guard = lock.lock().await;

            if let Some(existing) = self
                .registry
                .transport_for_slot(peer_id, &channel, direction)
                .await
                && let Err(error) = self.close_transport(existing).await
            {
                tracing::debug!(%existing, %error, "slot transport was already closed");
            }

            let router = self.routers.select_router(&channel).await?;
            let transport = router
                .create_transport(TransportCreateOptions {
                    listen_ips: self.settings.listen_ips.clone(),
                    initial_available_outgoing_bitrate: self
                        .settings
                        .initial_available_outgoing_bitrate,
                    sctp_capabilities,
                })
                .await?;
            transport
                .set_max_incoming_bitrate(self.settings.max_incoming_bitrate)
                .await?;
            self.registry
                .insert_transport(TransportRecord {
                    handle: Arc::clone(&transport),
                    peer_id,
                    channel: channel.clone(),
                    direction,
                })
                .await;
            transport
        };
        let transport_id = transport.id();

        // Remote DTLS teardown closes the transport server-side too.
        let manager = Arc::clone(self);
        let watched = Arc::clone(&transport);
        tokio::spawn(async move {
            watched.dtls_closed().await;
            if let Err(error) = manager.close_transport(transport_id).await {
                tracing::debug!(%transport_id, %error, "transport gone before dtls close");
            }
        });

        if direction == TransportDirection::Recv {
            self.consumers
                .wire_existing_data_producers(peer_id, &channel, transport_id, &transport)
                .await;
        }

        tracing::info!(%peer_id, %transport_id, ?direction, %channel, "created transport");
        let info = transport.connection_info();
        Ok(TransportOptions {
            id: transport_id,
            ice_parameters: info.ice_parameters,
            ice_candidates: info.ice_candidates,
            dtls_parameters: info.dtls_parameters,
            sctp_parameters: info.sctp_parameters,
        })
    }

    pub async fn connect_transport(
        &self,
        transport_id: TransportId,
        dtls_parameters: Value,
    ) -> Result<()> {
        let record = self
            .registry
            .transport(transport_id)
            .await
            .ok_or(SfuError::TransportNotFound(transport_id))?;
        record.handle.connect(dtls_parameters).await?;
        tracing::debug!(%transport_id, "transport connected");
        Ok(())
    }

    /// Closes the transport and everything built on it. Producer closes go
    /// through the producer manager so piped copies and downstream
    /// consumers are torn down with them.
    pub async fn close_transport(&self, transport_id: TransportId) -> Result<()> {
        let record = self
            .registry
            .remove_transport(transport_id)
            .await
            .ok_or(SfuError::TransportNotFound(transport_id))?;

        for producer_id in self.registry.producers_on_transport(transport_id).await {
            if let Err(error) = self.producers.close_producer_and_pipes(producer_id).await {
                tracing::debug!(%producer_id, %error, "producer already gone during cascade");
            }
        }
        for data_producer_id in self
            .registry
            .data_producers_on_transport(transport_id)
            .await
        {
            if let Err(error) = self.producers.close_data_producer(data_producer_id).await {
                tracing::debug!(%data_producer_id, %error, "data producer already gone");
            }
        }
        for consumer_id in self.registry.consumers_on_transport(transport_id).await {
            if let Err(error) = self.consumers.close_consumer(consumer_id).await {
                tracing::debug!(%consumer_id, %error, "consumer already gone during cascade");
            }
        }
        for data_consumer_id in self
            .registry
            .data_consumers_on_transport(transport_id)
            .await
        {
            if let Err(error) = self.consumers.close_data_consumer(data_consumer_id).await {
                tracing::debug!(%data_consumer_id, %error, "data consumer already gone");
            }
        }

        record.handle.close().await;
        tracing::info!(%transport_id, peer_id = %record.peer_id, "closed transport");
        Ok(())
    }

    /// Full cleanup when a peer's last signaling connection drops: close
    /// every transport the peer owns, then drop the session record.
    pub async fn close_peer(&self, peer_id: PeerId) {
        for transport_id in self.registry.transports_of_peer(peer_id).await {
            if let Err(error) = self.close_transport(transport_id).await {
                tracing::debug!(%transport_id, %error, "transport already gone during peer close");
            }
        }
        self.registry.remove_session(peer_id).await;
        tracing::info!(%peer_id, "cleaned up peer");
    }
}
