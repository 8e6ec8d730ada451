//! Shared mesh types: peer ids, asset records and fetch provenance.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Opaque peer identifier assigned by the rendezvous relay
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PeerId(String);

impl PeerId {
    pub fn new(id: impl Into<String>) -> Self {
        PeerId(id.into())
    }

    /// A fresh relay-style id: `peer_` followed by 12 hex characters
    pub fn generate() -> Self {
        let hex = uuid::Uuid::new_v4().simple().to_string();
        PeerId(format!("peer_{}", &hex[..12]))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PeerId {
    fn from(s: &str) -> Self {
        PeerId(s.to_string())
    }
}

/// Stable asset identifier, usually the asset's URL
pub type AssetId = String;

/// An asset this node can serve. Immutable once created.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssetRecord {
    pub id: AssetId,
    pub bytes: Vec<u8>,
    pub content_type: String,
}

impl AssetRecord {
    pub fn new(id: impl Into<AssetId>, bytes: Vec<u8>, content_type: impl Into<String>) -> Self {
        Self { id: id.into(), bytes, content_type: content_type.into() }
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

/// An asset received from a peer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerAsset {
    pub asset_id: AssetId,
    pub bytes: Vec<u8>,
    pub content_type: Option<String>,
    /// The peer that served it
    pub source: PeerId,
}

/// Where fetched bytes came from
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AssetLocation {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub peer_id: Option<PeerId>,
    pub origin_fallback: bool,
}

impl AssetLocation {
    pub fn peer(peer_id: PeerId) -> Self {
        Self { peer_id: Some(peer_id), origin_fallback: false }
    }

    pub fn origin() -> Self {
        Self { peer_id: None, origin_fallback: true }
    }
}

/// Bytes plus provenance, as returned by the asset client
#[derive(Debug, Clone)]
pub struct FetchOutcome {
    pub bytes: Vec<u8>,
    pub content_type: Option<String>,
    pub location: AssetLocation,
}
