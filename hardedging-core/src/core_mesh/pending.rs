/*
    PendingRequests - locally issued asset requests awaiting an answer

    asset id -> waiters (each with its own reply channel and deadline timer),
    the peers the broadcast reached, and which of them declined.

    Resolution:
      - first usable response   -> every waiter gets the asset
      - every asked peer declined -> every waiter gets None right away
      - a waiter's deadline     -> that waiter alone gets None
    A response for an asset with no entry is a late duplicate and is dropped.
*/

use std::collections::{HashMap, HashSet};
use tokio::sync::oneshot;
use tokio::task::AbortHandle;
use tracing::trace;

use super::types::{AssetId, PeerAsset, PeerId};

pub type AssetReply = Option<PeerAsset>;

struct Waiter {
    id: u64,
    reply_tx: oneshot::Sender<AssetReply>,
    timer: Option<AbortHandle>,
}

impl Waiter {
    fn finish(self, reply: AssetReply) {
        if let Some(timer) = self.timer {
            timer.abort();
        }
        // The caller may have stopped listening; nothing to do then.
        let _ = self.reply_tx.send(reply);
    }
}

#[derive(Default)]
struct PendingEntry {
    waiters: Vec<Waiter>,
    asked: HashSet<PeerId>,
    declined: HashSet<PeerId>,
}

/// Outcome of [`PendingRequests::register`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Registration {
    pub waiter_id: u64,
    /// No broadcast is in flight for this asset yet; the caller should send one
    pub first: bool,
}

#[derive(Default)]
pub struct PendingRequests {
    entries: HashMap<AssetId, PendingEntry>,
    next_waiter_id: u64,
}

impl PendingRequests {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, asset_id: &str, reply_tx: oneshot::Sender<AssetReply>) -> Registration {
        self.next_waiter_id += 1;
        let waiter_id = self.next_waiter_id;

        let entry = self.entries.entry(asset_id.to_string()).or_default();
        let first = entry.waiters.is_empty();
        entry.waiters.push(Waiter { id: waiter_id, reply_tx, timer: None });
        Registration { waiter_id, first }
    }

    /// Attach the deadline task so it can be cancelled on resolution
    pub fn attach_timer(&mut self, asset_id: &str, waiter_id: u64, timer: AbortHandle) {
        let waiter = self
            .entries
            .get_mut(asset_id)
            .and_then(|e| e.waiters.iter_mut().find(|w| w.id == waiter_id));
        match waiter {
            Some(w) => w.timer = Some(timer),
            // Already resolved.
            None => timer.abort(),
        }
    }

    /// Record which peers the broadcast for `asset_id` went to
    pub fn mark_asked(&mut self, asset_id: &str, peers: impl IntoIterator<Item = PeerId>) {
        if let Some(entry) = self.entries.get_mut(asset_id) {
            entry.asked.extend(peers);
        }
    }

    /// Resolve every waiter for `asset.asset_id`; returns how many were waiting
    pub fn resolve(&mut self, asset: PeerAsset) -> usize {
        let Some(entry) = self.entries.remove(&asset.asset_id) else {
            trace!(asset_id = %asset.asset_id, "Response for request no longer pending");
            return 0;
        };
        let count = entry.waiters.len();
        for waiter in entry.waiters {
            waiter.finish(Some(asset.clone()));
        }
        count
    }

    /// `peer_id` answered `found=false`
    ///
    /// Returns the number of waiters resolved as not-found when this was the
    /// last asked peer to decline.
    pub fn decline(&mut self, asset_id: &str, peer_id: &PeerId) -> Option<usize> {
        let entry = self.entries.get_mut(asset_id)?;
        if !entry.asked.contains(peer_id) {
            return None;
        }
        entry.declined.insert(peer_id.clone());
        if entry.declined.len() < entry.asked.len() {
            return None;
        }

        let entry = self.entries.remove(asset_id)?;
        let count = entry.waiters.len();
        for waiter in entry.waiters {
            waiter.finish(None);
        }
        Some(count)
    }

    /// Deadline for one waiter; `true` if it was still waiting
    pub fn expire(&mut self, asset_id: &str, waiter_id: u64) -> bool {
        let Some(entry) = self.entries.get_mut(asset_id) else {
            return false;
        };
        let Some(index) = entry.waiters.iter().position(|w| w.id == waiter_id) else {
            return false;
        };
        let waiter = entry.waiters.remove(index);
        if entry.waiters.is_empty() {
            self.entries.remove(asset_id);
        }
        // The timer is the one firing; don't abort it.
        let _ = waiter.reply_tx.send(None);
        true
    }

    /// Resolve everything as not-found (shutdown)
    pub fn clear(&mut self) {
        for (_, entry) in self.entries.drain() {
            for waiter in entry.waiters {
                waiter.finish(None);
            }
        }
    }

    pub fn is_pending(&self, asset_id: &str) -> bool {
        self.entries.contains_key(asset_id)
    }

    pub fn waiter_count(&self, asset_id: &str) -> usize {
        self.entries.get(asset_id).map_or(0, |e| e.waiters.len())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
