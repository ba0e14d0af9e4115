use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

macro_rules! id_type {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        #[derive(
            Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
        )]
        #[serde(transparent)]
        pub struct $name(pub Uuid);

        impl $name {
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                self.0.fmt(f)
            }
        }
    };
}

id_type!(
    /// A connected user, as resolved by the user directory.
    PeerId
);
id_type!(WorkerId);
id_type!(RouterId);
id_type!(TransportId);
id_type!(ProducerId);
id_type!(DataProducerId);
id_type!(ConsumerId);
id_type!(DataConsumerId);

/// Media kind of a producer or consumer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Audio,
    Video,
}

impl fmt::Display for MediaKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MediaKind::Audio => f.write_str("audio"),
            MediaKind::Video => f.write_str("video"),
        }
    }
}

/// Direction of a transport from the client's point of view.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportDirection {
    Send,
    Recv,
}

impl fmt::Display for TransportDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportDirection::Send => f.write_str("send"),
            TransportDirection::Recv => f.write_str("recv"),
        }
    }
}

/// A logical media channel.
///
/// The unqualified instance channel (`channelType = "instance"`, no id) is
/// the default world channel every connected peer belongs to. Every other
/// `(channelType, channelId)` combination names an explicit secondary
/// channel (party, group, screen share, ...).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ChannelKey {
    Instance,
    Secondary {
        channel_type: String,
        channel_id: Option<String>,
    },
}

impl ChannelKey {
    pub fn from_parts(channel_type: &str, channel_id: Option<&str>) -> Self {
        if channel_type == "instance" && channel_id.is_none() {
            ChannelKey::Instance
        } else {
            ChannelKey::Secondary {
                channel_type: channel_type.to_owned(),
                channel_id: channel_id.map(str::to_owned),
            }
        }
    }

    pub fn channel_type(&self) -> &str {
        match self {
            ChannelKey::Instance => "instance",
            ChannelKey::Secondary { channel_type, .. } => channel_type,
        }
    }

    pub fn channel_id(&self) -> Option<&str> {
        match self {
            ChannelKey::Instance => None,
            ChannelKey::Secondary { channel_id, .. } => channel_id.as_deref(),
        }
    }

    pub fn is_instance(&self) -> bool {
        matches!(self, ChannelKey::Instance)
    }
}

impl fmt::Display for ChannelKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChannelKey::Instance => f.write_str("instance"),
            ChannelKey::Secondary {
                channel_type,
                channel_id,
            } => match channel_id {
                Some(id) => write!(f, "{channel_type}:{id}"),
                None => f.write_str(channel_type),
            },
        }
    }
}

/// Connection parameters handed back to the client after transport creation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransportOptions {
    pub id: TransportId,
    pub ice_parameters: Value,
    pub ice_candidates: Value,
    pub dtls_parameters: Value,
    pub sctp_parameters: Value,
}

/// Spatial-layer state tracked per consumer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsumerLayers {
    pub current_layer: Option<u8>,
    pub client_selected_layer: Option<u8>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn instance_channel_is_the_reserved_default() {
        assert_eq!(ChannelKey::from_parts("instance", None), ChannelKey::Instance);
        assert_eq!(ChannelKey::Instance.to_string(), "instance");
    }

    #[test]
    fn qualified_instance_is_a_secondary_channel() {
        let key = ChannelKey::from_parts("instance", Some("abc"));
        assert!(!key.is_instance());
        assert_eq!(key.to_string(), "instance:abc");
    }

    #[test]
    fn secondary_channel_round_trips_its_parts() {
        let key = ChannelKey::from_parts("party", Some("42"));
        assert_eq!(key.channel_type(), "party");
        assert_eq!(key.channel_id(), Some("42"));
        assert_eq!(key.to_string(), "party:42");
    }
}
