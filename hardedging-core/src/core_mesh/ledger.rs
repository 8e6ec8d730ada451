/*
    Mesh Ledger - byte counters and per-peer credit

    Pure accounting. Three monotonic byte counters (sent to peers, received
    from peers, fetched from origin) plus one credit record per peer that has
    ever served us something. Credit is historical and survives disconnects.

    Peer count is not stored here: the snapshot takes it from whoever owns the
    sessions, so it always reflects channels open right now.

    Byte counts are exact decoded payload lengths.
*/

use serde::Serialize;
use std::collections::HashMap;
use std::time::{SystemTime, UNIX_EPOCH};

use super::types::{AssetId, PeerId};

/// What one peer has contributed to this node
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerCredit {
    pub peer_id: PeerId,
    pub bytes_received: u64,
    pub assets_received: u64,
    /// Milliseconds since the Unix epoch of the last thank-you
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_thanked_at: Option<u64>,
}

/// Read-only snapshot of mesh accounting
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MeshStats {
    pub peer_count: usize,
    #[serde(rename = "bytesSentP2P")]
    pub bytes_sent_p2p: u64,
    #[serde(rename = "bytesReceivedP2P")]
    pub bytes_received_p2p: u64,
    pub bytes_from_origin: u64,
    /// Sorted by peer id
    pub peer_credits: Vec<PeerCredit>,
}

impl MeshStats {
    /// Fraction of received bytes that came from peers rather than the origin
    ///
    /// `0.0` when nothing has been received yet.
    pub fn edge_saturation(&self) -> f64 {
        let total = self.bytes_received_p2p + self.bytes_from_origin;
        if total == 0 {
            return 0.0;
        }
        self.bytes_received_p2p as f64 / total as f64
    }

    pub fn credit_for(&self, peer_id: &PeerId) -> Option<&PeerCredit> {
        self.peer_credits.iter().find(|c| &c.peer_id == peer_id)
    }
}

#[derive(Debug, Default)]
pub struct MeshLedger {
    bytes_sent_p2p: u64,
    bytes_received_p2p: u64,
    bytes_from_origin: u64,
    credits: HashMap<PeerId, PeerCredit>,
}

impl MeshLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_sent(&mut self, bytes: u64) {
        self.bytes_sent_p2p = self.bytes_sent_p2p.saturating_add(bytes);
    }

    /// A peer delivered an asset: bump the received counter and its credit
    pub fn record_received(&mut self, from: &PeerId, bytes: u64) {
        self.bytes_received_p2p = self.bytes_received_p2p.saturating_add(bytes);

        let credit = self.credits.entry(from.clone()).or_insert_with(|| PeerCredit {
            peer_id: from.clone(),
            bytes_received: 0,
            assets_received: 0,
            last_thanked_at: None,
        });
        credit.bytes_received = credit.bytes_received.saturating_add(bytes);
        credit.assets_received += 1;
    }

    pub fn record_origin(&mut self, bytes: u64) {
        self.bytes_from_origin = self.bytes_from_origin.saturating_add(bytes);
    }

    /// Stamp a thank-you on `peer_id`'s credit record
    ///
    /// Bookkeeping only. Returns `false` when the peer never served us anything.
    pub fn send_thank_you(&mut self, peer_id: &PeerId, asset_id: &AssetId, bytes: u64) -> bool {
        match self.credits.get_mut(peer_id) {
            Some(credit) => {
                credit.last_thanked_at = Some(now_millis());
                tracing::debug!(peer_id = %peer_id, asset_id = %asset_id, bytes, "Thanked peer");
                true
            }
            None => false,
        }
    }

    pub fn credit(&self, peer_id: &PeerId) -> Option<&PeerCredit> {
        self.credits.get(peer_id)
    }

    pub fn snapshot(&self, peer_count: usize) -> MeshStats {
        let mut peer_credits: Vec<PeerCredit> = self.credits.values().cloned().collect();
        peer_credits.sort_by(|a, b| a.peer_id.cmp(&b.peer_id));

        MeshStats {
            peer_count,
            bytes_sent_p2p: self.bytes_sent_p2p,
            bytes_received_p2p: self.bytes_received_p2p,
            bytes_from_origin: self.bytes_from_origin,
            peer_credits,
        }
    }
}

fn now_millis() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_millis() as u64).unwrap_or(0)
}
