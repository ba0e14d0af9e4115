//! Voxcast signaling protocol
//!
//! Message and type definitions shared between the Voxcast server and its
//! clients. Everything on the wire is JSON; engine-negotiated parameter
//! blobs (ICE/DTLS/RTP/SCTP) are carried opaquely as `serde_json::Value`.

pub mod messages;
pub mod types;

pub use messages::{
    ClientRequest, ErrorKind, ErrorPayload, RequestEnvelope, RequestResult, ResponsePayload,
    ServerEvent, ServerMessage,
};
pub use types::{
    ChannelKey, ConsumerId, ConsumerLayers, DataConsumerId, DataProducerId, MediaKind, PeerId,
    ProducerId, RouterId, TransportDirection, TransportId, TransportOptions, WorkerId,
};
