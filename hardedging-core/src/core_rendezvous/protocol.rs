//! Rendezvous wire protocol: JSON text frames, one object per message,
//! discriminated by `type`.

use serde::{Deserialize, Serialize};

use crate::core_mesh::types::PeerId;

/// Peer → relay
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum ClientMessage {
    Join {
        room_id: String,
    },
    Signal {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        room_id: Option<String>,
        target_peer_id: PeerId,
        /// Opaque to the relay
        #[serde(default)]
        payload: serde_json::Value,
    },
}

/// Relay → peer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum ServerMessage {
    PeerId { peer_id: PeerId },
    /// Other members of the room, in join order
    Peers { peers: Vec<PeerId> },
    PeerJoined { peer_id: PeerId },
    PeerLeft { peer_id: PeerId },
    Signal { from_peer_id: PeerId, payload: serde_json::Value },
}

/// Negotiation payloads peers exchange through the relay
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum SignalPayload {
    Offer { sdp: String },
    Answer { sdp: String },
    Candidate { candidate: String },
}

impl ClientMessage {
    pub fn decode(text: &str) -> Option<Self> {
        serde_json::from_str(text).ok()
    }

    pub fn encode(&self) -> String {
        // Enum of strings and JSON values; serialization cannot fail.
        serde_json::to_string(self).unwrap_or_default()
    }
}

impl ServerMessage {
    pub fn decode(text: &str) -> Option<Self> {
        serde_json::from_str(text).ok()
    }

    pub fn encode(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }
}

impl SignalPayload {
    pub fn kind(&self) -> &'static str {
        match self {
            SignalPayload::Offer { .. } => "offer",
            SignalPayload::Answer { .. } => "answer",
            SignalPayload::Candidate { .. } => "candidate",
        }
    }

    pub fn to_value(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }

    pub fn from_value(value: serde_json::Value) -> Option<Self> {
        serde_json::from_value(value).ok()
    }
}
