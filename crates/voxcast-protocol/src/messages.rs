use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::types::{
    ConsumerId, DataProducerId, MediaKind, PeerId, ProducerId, TransportDirection, TransportId,
    TransportOptions,
};

/// A client request plus the correlation id its response must carry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestEnvelope {
    pub id: u64,
    #[serde(flatten)]
    pub request: ClientRequest,
}

/// Requests sent from client to server over the signaling socket.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ClientRequest {
    /// Must be the first request on a connection.
    #[serde(rename_all = "camelCase")]
    Identify { token: String },

    #[serde(rename_all = "camelCase")]
    CreateTransport {
        direction: TransportDirection,
        channel_type: String,
        #[serde(default)]
        channel_id: Option<String>,
        sctp_capabilities: Value,
    },

    #[serde(rename_all = "camelCase")]
    ConnectTransport {
        transport_id: TransportId,
        dtls_parameters: Value,
    },

    #[serde(rename_all = "camelCase")]
    Produce {
        transport_id: TransportId,
        kind: MediaKind,
        rtp_parameters: Value,
        media_tag: String,
        #[serde(default)]
        paused: bool,
        #[serde(default)]
        app_data: Value,
    },

    #[serde(rename_all = "camelCase")]
    ProduceData {
        transport_id: TransportId,
        label: String,
        #[serde(default)]
        protocol: String,
        sctp_stream_parameters: Value,
        #[serde(default)]
        app_data: Value,
    },

    #[serde(rename_all = "camelCase")]
    Consume {
        media_peer_id: PeerId,
        media_tag: String,
        rtp_capabilities: Value,
        channel_type: String,
        #[serde(default)]
        channel_id: Option<String>,
    },

    #[serde(rename_all = "camelCase")]
    PauseProducer {
        producer_id: ProducerId,
        #[serde(default)]
        global_mute: bool,
    },

    #[serde(rename_all = "camelCase")]
    ResumeProducer { producer_id: ProducerId },

    /// Stops a single track without touching the transport it rides on.
    #[serde(rename_all = "camelCase")]
    CloseProducer { producer_id: ProducerId },

    #[serde(rename_all = "camelCase")]
    PauseConsumer { consumer_id: ConsumerId },

    #[serde(rename_all = "camelCase")]
    ResumeConsumer { consumer_id: ConsumerId },

    #[serde(rename_all = "camelCase")]
    CloseConsumer { consumer_id: ConsumerId },

    #[serde(rename_all = "camelCase")]
    SetConsumerLayers {
        consumer_id: ConsumerId,
        spatial_layer: u8,
    },

    #[serde(rename_all = "camelCase")]
    CloseTransport { transport_id: TransportId },

    /// Replays one `new-producer` event per existing matching producer.
    /// `user_ids`, when non-empty, restricts the replay to those peers
    /// (the client obtains the list from its nearby-users service).
    #[serde(rename_all = "camelCase")]
    RequestCurrentProducers {
        #[serde(default)]
        user_ids: Vec<PeerId>,
        channel_type: String,
        #[serde(default)]
        channel_id: Option<String>,
    },
}

/// Messages sent from server to client over the signaling socket.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ServerMessage {
    /// Response to a client request, correlated by `id`.
    Response { id: u64, result: RequestResult },

    /// Server-push event, not tied to a request.
    Event(ServerEvent),
}

/// Outcome of a request: a typed success payload or a typed error.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestResult {
    Ok(ResponsePayload),
    Error(ErrorPayload),
}

impl RequestResult {
    pub fn is_ok(&self) -> bool {
        matches!(self, RequestResult::Ok(_))
    }
}

/// Per-request failure categories. Fatal failures terminate the process
/// and never reach the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ErrorKind {
    NotFound,
    CannotConsume,
    InvalidRequest,
    Internal,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub kind: ErrorKind,
    pub error: String,
}

/// Success payloads, one shape per request.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ResponsePayload {
    #[serde(rename_all = "camelCase")]
    Identified { peer_id: PeerId },

    #[serde(rename_all = "camelCase")]
    TransportCreated { transport_options: TransportOptions },

    Connected { connected: bool },

    // Listed before `Produced`: both carry an `id` field and this enum is
    // untagged, so the wider shape must be tried first.
    #[serde(rename_all = "camelCase")]
    ConsumerCreated {
        producer_id: ProducerId,
        id: ConsumerId,
        kind: MediaKind,
        rtp_parameters: Value,
        #[serde(rename = "type")]
        consumer_type: String,
        producer_paused: bool,
    },

    /// `produce` and `produce-data` both answer with the new entity id.
    Produced { id: uuid::Uuid },

    Paused { paused: bool },

    Resumed { resumed: bool },

    Closed { closed: bool },

    #[serde(rename_all = "camelCase")]
    LayersSet { layers_set: bool },

    Requested { requested: bool },
}

/// Server-push events.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "kebab-case")]
pub enum ServerEvent {
    /// A producer became consumable in a channel the receiving client
    /// shares. Sent only after the producer is reachable from every router
    /// of the channel.
    #[serde(rename_all = "camelCase")]
    NewProducer {
        peer_id: PeerId,
        media_tag: String,
        producer_id: ProducerId,
        channel_type: String,
        channel_id: Option<String>,
    },

    #[serde(rename_all = "camelCase")]
    NewDataProducer {
        peer_id: PeerId,
        label: String,
        data_producer_id: DataProducerId,
        channel_type: String,
        channel_id: Option<String>,
    },

    /// Server-initiated data consumer offer for an existing data producer.
    #[serde(rename_all = "camelCase")]
    ConsumeData {
        data_producer_id: DataProducerId,
        id: crate::types::DataConsumerId,
        sctp_stream_parameters: Value,
        label: String,
        protocol: String,
    },

    #[serde(rename_all = "camelCase")]
    ProducerPaused {
        producer_id: ProducerId,
        global_mute: bool,
    },

    #[serde(rename_all = "camelCase")]
    ProducerResumed { producer_id: ProducerId },

    #[serde(rename_all = "camelCase")]
    ConsumerPaused { consumer_id: ConsumerId },

    #[serde(rename_all = "camelCase")]
    ConsumerResumed { consumer_id: ConsumerId },

    #[serde(rename_all = "camelCase")]
    ConsumerClosed { consumer_id: ConsumerId },
}
