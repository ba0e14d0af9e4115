//! Media engine abstraction
//!
//! The native media engine (worker processes, routers, transports,
//! producers, consumers) is consumed as an opaque capability behind these
//! traits: spawn a worker, create a router, create a transport, produce,
//! consume, pipe, close. Codec negotiation, bandwidth estimation and DTLS
//! internals stay on the engine side; the orchestration layer only sees
//! opaque JSON parameter blobs.

pub mod inproc;

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::watch;

use voxcast_protocol::{
    ConsumerId, DataConsumerId, DataProducerId, MediaKind, ProducerId, RouterId, TransportId,
    WorkerId,
};

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("{0} is closed")]
    Closed(&'static str),

    #[error("producer {0} is not reachable on this router")]
    NotRouted(ProducerId),

    #[error("data producer {0} is not reachable on this router")]
    DataNotRouted(DataProducerId),

    #[error("unknown router {0}")]
    UnknownRouter(RouterId),

    #[error("{0}")]
    Other(String),
}

pub type EngineResult<T> = Result<T, EngineError>;

/// Per-worker process settings, from config.
#[derive(Debug, Clone)]
pub struct WorkerSettings {
    pub rtc_min_port: u16,
    pub rtc_max_port: u16,
}

/// Network parameters for a new transport.
#[derive(Debug, Clone)]
pub struct TransportCreateOptions {
    pub listen_ips: Vec<String>,
    pub initial_available_outgoing_bitrate: u32,
    pub sctp_capabilities: Value,
}

/// Engine-negotiated connection parameters, returned verbatim to the client.
#[derive(Debug, Clone)]
pub struct TransportConnectionInfo {
    pub ice_parameters: Value,
    pub ice_candidates: Value,
    pub dtls_parameters: Value,
    pub sctp_parameters: Value,
}

#[derive(Debug, Clone)]
pub struct DataProducerOptions {
    pub label: String,
    pub protocol: String,
    pub sctp_stream_parameters: Value,
}

#[async_trait]
pub trait MediaEngine: Send + Sync {
    async fn spawn_worker(&self, settings: &WorkerSettings) -> EngineResult<Arc<dyn MediaWorker>>;
}

#[async_trait]
pub trait MediaWorker: Send + Sync {
    fn id(&self) -> WorkerId;

    async fn create_router(&self) -> EngineResult<Arc<dyn MediaRouter>>;

    /// Resolves when the worker process dies, with the reported reason.
    /// Worker death is unrecoverable for the routing topology.
    async fn died(&self) -> String;
}

#[async_trait]
pub trait MediaRouter: Send + Sync {
    fn id(&self) -> RouterId;

    fn worker_id(&self) -> WorkerId;

    async fn create_transport(
        &self,
        options: TransportCreateOptions,
    ) -> EngineResult<Arc<dyn MediaTransport>>;

    /// Replicates a producer owned by this router onto `target`, so that
    /// consumers attached to `target` can consume it.
    async fn pipe_producer_to(&self, producer_id: ProducerId, target: RouterId)
        -> EngineResult<()>;

    async fn pipe_data_producer_to(
        &self,
        data_producer_id: DataProducerId,
        target: RouterId,
    ) -> EngineResult<()>;

    /// Whether a consumer with the given capabilities could consume the
    /// producer on this router.
    async fn can_consume(
        &self,
        producer_id: ProducerId,
        rtp_capabilities: &Value,
    ) -> EngineResult<bool>;

    /// Number of live transports bound to this router. The load signal
    /// behind least-loaded router selection.
    async fn live_transport_count(&self) -> EngineResult<usize>;
}

#[async_trait]
pub trait MediaTransport: Send + Sync {
    fn id(&self) -> TransportId;

    fn router_id(&self) -> RouterId;

    fn connection_info(&self) -> TransportConnectionInfo;

    fn closed(&self) -> bool;

    async fn connect(&self, dtls_parameters: Value) -> EngineResult<()>;

    async fn set_max_incoming_bitrate(&self, bitrate: u32) -> EngineResult<()>;

    async fn produce(
        &self,
        kind: MediaKind,
        rtp_parameters: Value,
        paused: bool,
    ) -> EngineResult<Arc<dyn MediaProducer>>;

    async fn produce_data(
        &self,
        options: DataProducerOptions,
    ) -> EngineResult<Arc<dyn MediaDataProducer>>;

    async fn consume(
        &self,
        producer_id: ProducerId,
        rtp_capabilities: Value,
        paused: bool,
    ) -> EngineResult<Arc<dyn MediaConsumer>>;

    async fn consume_data(
        &self,
        data_producer_id: DataProducerId,
    ) -> EngineResult<Arc<dyn MediaDataConsumer>>;

    async fn close(&self);

    /// Resolves when the remote end closes DTLS, or when the transport
    /// itself is closed.
    async fn dtls_closed(&self);
}

#[async_trait]
pub trait MediaProducer: Send + Sync {
    fn id(&self) -> ProducerId;

    fn kind(&self) -> MediaKind;

    fn paused(&self) -> bool;

    async fn pause(&self) -> EngineResult<()>;

    async fn resume(&self) -> EngineResult<()>;

    async fn close(&self);
}

#[async_trait]
pub trait MediaConsumer: Send + Sync {
    fn id(&self) -> ConsumerId;

    fn kind(&self) -> MediaKind;

    fn rtp_parameters(&self) -> Value;

    /// Engine consumer type ("simple", "simulcast", ...).
    fn consumer_type(&self) -> String;

    fn paused(&self) -> bool;

    fn producer_paused(&self) -> bool;

    async fn pause(&self) -> EngineResult<()>;

    async fn resume(&self) -> EngineResult<()>;

    /// Layer selection is idempotent and commutative, so it bypasses the
    /// pause/resume operation queue.
    async fn set_preferred_layers(&self, spatial_layer: u8) -> EngineResult<()>;

    /// Watch stream of the spatial layer currently being delivered.
    fn layers(&self) -> watch::Receiver<Option<u8>>;

    async fn close(&self);
}

#[async_trait]
pub trait MediaDataProducer: Send + Sync {
    fn id(&self) -> DataProducerId;

    fn label(&self) -> String;

    fn protocol(&self) -> String;

    fn sctp_stream_parameters(&self) -> Value;

    async fn close(&self);
}

#[async_trait]
pub trait MediaDataConsumer: Send + Sync {
    fn id(&self) -> DataConsumerId;

    fn data_producer_id(&self) -> DataProducerId;

    fn label(&self) -> String;

    fn protocol(&self) -> String;

    fn sctp_stream_parameters(&self) -> Value;

    async fn close(&self);
}
