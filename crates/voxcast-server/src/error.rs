use thiserror::Error;

use voxcast_protocol::{
    ChannelKey, ConsumerId, DataConsumerId, DataProducerId, ErrorKind, ErrorPayload, PeerId,
    ProducerId, TransportId,
};

use crate::engine::EngineError;

/// Per-request failure taxonomy. Every variant is returned to the
/// requesting client as an error payload; none of them crash the control
/// process. Worker death is the only fatal condition and never reaches
/// this type.
#[derive(Debug, Error)]
pub enum SfuError {
    #[error("invalid transport {0}")]
    TransportNotFound(TransportId),

    #[error("producer {0} not found")]
    ProducerNotFound(ProducerId),

    #[error("data producer {0} not found")]
    DataProducerNotFound(DataProducerId),

    #[error("consumer {0} not found")]
    ConsumerNotFound(ConsumerId),

    #[error("data consumer {0} not found")]
    DataConsumerNotFound(DataConsumerId),

    #[error("no live recv transport for {peer_id} in channel {channel}")]
    RecvTransportNotFound { peer_id: PeerId, channel: ChannelKey },

    #[error("client cannot consume {media_peer_id}:{media_tag}")]
    CannotConsume {
        media_peer_id: PeerId,
        media_tag: String,
    },

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error(transparent)]
    Engine(#[from] EngineError),
}

impl SfuError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            SfuError::TransportNotFound(_)
            | SfuError::ProducerNotFound(_)
            | SfuError::DataProducerNotFound(_)
            | SfuError::ConsumerNotFound(_)
            | SfuError::DataConsumerNotFound(_)
            | SfuError::RecvTransportNotFound { .. } => ErrorKind::NotFound,
            SfuError::CannotConsume { .. } => ErrorKind::CannotConsume,
            SfuError::InvalidRequest(_) => ErrorKind::InvalidRequest,
            SfuError::Engine(_) => ErrorKind::Internal,
        }
    }

    pub fn to_payload(&self) -> ErrorPayload {
        ErrorPayload {
            kind: self.kind(),
            error: self.to_string(),
        }
    }
}

pub type Result<T> = std::result::Result<T, SfuError>;
