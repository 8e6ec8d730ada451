/*
    Admission Controller - fairness and backpressure for outbound transfers

    Decides whether sending asset X to peer P may start now, must wait, or is
    declined. A popular asset is served to at most `max_concurrent_per_asset`
    peers at a time; everyone else either queues or is told `Busy` so they ask
    another peer instead.

    request_transfer(asset, peer):
      1. peer already active or queued for asset   -> Busy
      2. active < max_concurrent_per_asset         -> Granted
      3. queue_policy == Reject                    -> Busy
      4. queue full                                -> Busy
      5. otherwise                                 -> Queued

    release_transfer(asset, peer) frees the slot and hands it to the next queued
    peer (arrival order for Fifo, highest priority then arrival for Priority).

    Owned by one mesh node and mutated only from its event loop, so there is no
    interior locking here.
*/

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;
use std::str::FromStr;
use std::time::{Duration, Instant};
use tracing::{debug, trace};

use super::metrics;
use super::types::{AssetId, PeerId};

/// How requests beyond the concurrency limit are handled
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueuePolicy {
    /// Queue and serve in arrival order
    #[default]
    Fifo,
    /// Never queue; decline immediately
    Reject,
    /// Queue and serve highest priority first, ties by arrival
    Priority,
}

impl QueuePolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            QueuePolicy::Fifo => "fifo",
            QueuePolicy::Reject => "reject",
            QueuePolicy::Priority => "priority",
        }
    }
}

impl fmt::Display for QueuePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for QueuePolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "fifo" => Ok(QueuePolicy::Fifo),
            "reject" => Ok(QueuePolicy::Reject),
            "priority" => Ok(QueuePolicy::Priority),
            other => Err(format!("unknown queue policy '{}'", other)),
        }
    }
}

/// Configuration for transfer admission
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AdmissionConfig {
    /// Peers one asset may be sent to concurrently
    pub max_concurrent_per_asset: usize,
    pub queue_policy: QueuePolicy,
    /// Waiting requests per asset
    pub max_queue_size: usize,
}

impl Default for AdmissionConfig {
    fn default() -> Self {
        AdmissionConfig { max_concurrent_per_asset: 1, queue_policy: QueuePolicy::Fifo, max_queue_size: 10 }
    }
}

/// Outcome of an admission request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdmissionDecision {
    /// Start the transfer now
    Granted,
    /// Hold the response until a later release grants it
    Queued,
    /// Duplicate, rejected by policy, or queue full
    Busy,
}

impl AdmissionDecision {
    pub fn as_str(&self) -> &'static str {
        match self {
            AdmissionDecision::Granted => "granted",
            AdmissionDecision::Queued => "queued",
            AdmissionDecision::Busy => "busy",
        }
    }
}

/// Aggregate view of admission state
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AdmissionStats {
    pub active_transfers: usize,
    pub queued_requests: usize,
    pub assets_with_active_transfers: usize,
    pub assets_with_queued_requests: usize,
}

#[derive(Debug, Clone)]
struct QueuedRequest {
    peer_id: PeerId,
    priority: i32,
    /// Arrival order; breaks priority ties
    seq: u64,
    enqueued_at: Instant,
}

pub struct AdmissionController {
    config: AdmissionConfig,
    active: HashMap<AssetId, HashSet<PeerId>>,
    queues: HashMap<AssetId, VecDeque<QueuedRequest>>,
    next_seq: u64,
}

impl AdmissionController {
    /// Create a controller with the default configuration
    pub fn new() -> Self {
        Self::new_with_config(AdmissionConfig::default())
    }

    pub fn new_with_config(config: AdmissionConfig) -> Self {
        AdmissionController { config, active: HashMap::new(), queues: HashMap::new(), next_seq: 0 }
    }

    pub fn config(&self) -> &AdmissionConfig {
        &self.config
    }

    /// Ask to send `asset_id` to `peer_id` with the default priority
    pub fn request_transfer(&mut self, asset_id: &str, peer_id: &PeerId) -> AdmissionDecision {
        self.request_transfer_with_priority(asset_id, peer_id, 0)
    }

    /// Ask to send `asset_id` to `peer_id`; `priority` only matters under [`QueuePolicy::Priority`]
    pub fn request_transfer_with_priority(
        &mut self,
        asset_id: &str,
        peer_id: &PeerId,
        priority: i32,
    ) -> AdmissionDecision {
        let decision = self.decide(asset_id, peer_id, priority);
        debug!(asset_id, peer_id = %peer_id, decision = decision.as_str(), "Admission decision");
        metrics::admission_decision(decision);
        decision
    }

    fn decide(&mut self, asset_id: &str, peer_id: &PeerId, priority: i32) -> AdmissionDecision {
        let active_count = self.active.get(asset_id).map_or(0, HashSet::len);

        if self.is_active(asset_id, peer_id) || self.is_queued(asset_id, peer_id) {
            return AdmissionDecision::Busy;
        }

        if active_count < self.config.max_concurrent_per_asset {
            self.active.entry(asset_id.to_string()).or_default().insert(peer_id.clone());
            return AdmissionDecision::Granted;
        }

        if self.config.queue_policy == QueuePolicy::Reject {
            return AdmissionDecision::Busy;
        }

        let queue = self.queues.entry(asset_id.to_string()).or_default();
        if queue.len() >= self.config.max_queue_size {
            // Don't leave an empty queue behind for max_queue_size == 0.
            if queue.is_empty() {
                self.queues.remove(asset_id);
            }
            return AdmissionDecision::Busy;
        }

        let seq = self.next_seq;
        self.next_seq += 1;
        queue.push_back(QueuedRequest {
            peer_id: peer_id.clone(),
            priority,
            seq,
            enqueued_at: Instant::now(),
        });
        AdmissionDecision::Queued
    }

    /// Free `peer_id`'s slot for `asset_id` and grant the next queued peer, if any
    ///
    /// The returned peer is already in the active set; the caller should now
    /// actually perform that transfer.
    pub fn release_transfer(&mut self, asset_id: &str, peer_id: &PeerId) -> Option<PeerId> {
        if let Some(active) = self.active.get_mut(asset_id) {
            active.remove(peer_id);
            if active.is_empty() {
                self.active.remove(asset_id);
            }
        }
        trace!(asset_id, peer_id = %peer_id, "Transfer released");

        if self.active_count(asset_id) >= self.config.max_concurrent_per_asset {
            return None;
        }
        self.grant_next(asset_id)
    }

    /// Fill every free slot for `asset_id` from its queue
    ///
    /// Used after [`cleanup_peer`](Self::cleanup_peer) vacates a slot without a release.
    pub fn promote_queued(&mut self, asset_id: &str) -> Vec<PeerId> {
        let mut granted = Vec::new();
        while self.active_count(asset_id) < self.config.max_concurrent_per_asset {
            match self.grant_next(asset_id) {
                Some(peer) => granted.push(peer),
                None => break,
            }
        }
        granted
    }

    fn grant_next(&mut self, asset_id: &str) -> Option<PeerId> {
        let queue = self.queues.get_mut(asset_id)?;

        let index = match self.config.queue_policy {
            QueuePolicy::Priority => queue
                .iter()
                .enumerate()
                .max_by(|(_, a), (_, b)| a.priority.cmp(&b.priority).then(b.seq.cmp(&a.seq)))
                .map(|(i, _)| i)?,
            QueuePolicy::Fifo | QueuePolicy::Reject => 0,
        };

        let next = queue.remove(index)?;
        if queue.is_empty() {
            self.queues.remove(asset_id);
        }

        metrics::admission_queue_wait(next.enqueued_at.elapsed());
        debug!(
            asset_id,
            peer_id = %next.peer_id,
            waited_ms = next.enqueued_at.elapsed().as_millis() as u64,
            "Queued transfer granted"
        );
        self.active.entry(asset_id.to_string()).or_default().insert(next.peer_id.clone());
        Some(next.peer_id)
    }

    /// Drop `peer_id`'s queued request for `asset_id`, if it has one
    pub fn cancel_queued_request(&mut self, asset_id: &str, peer_id: &PeerId) -> bool {
        let Some(queue) = self.queues.get_mut(asset_id) else {
            return false;
        };
        let before = queue.len();
        queue.retain(|req| &req.peer_id != peer_id);
        let removed = queue.len() != before;
        if queue.is_empty() {
            self.queues.remove(asset_id);
        }
        removed
    }

    /// Remove a departed peer from every active set and queue
    ///
    /// Returns the assets on which the peer held an active slot. Nothing is
    /// promoted here; pass those assets to [`promote_queued`](Self::promote_queued).
    pub fn cleanup_peer(&mut self, peer_id: &PeerId) -> Vec<AssetId> {
        let mut vacated = Vec::new();
        self.active.retain(|asset_id, active| {
            if active.remove(peer_id) {
                vacated.push(asset_id.clone());
            }
            !active.is_empty()
        });
        self.queues.retain(|_, queue| {
            queue.retain(|req| &req.peer_id != peer_id);
            !queue.is_empty()
        });
        if !vacated.is_empty() {
            debug!(peer_id = %peer_id, assets = vacated.len(), "Departed peer held transfer slots");
        }
        vacated
    }

    pub fn is_active(&self, asset_id: &str, peer_id: &PeerId) -> bool {
        self.active.get(asset_id).is_some_and(|a| a.contains(peer_id))
    }

    pub fn is_queued(&self, asset_id: &str, peer_id: &PeerId) -> bool {
        self.queues.get(asset_id).is_some_and(|q| q.iter().any(|r| &r.peer_id == peer_id))
    }

    pub fn active_count(&self, asset_id: &str) -> usize {
        self.active.get(asset_id).map_or(0, HashSet::len)
    }

    pub fn queue_len(&self, asset_id: &str) -> usize {
        self.queues.get(asset_id).map_or(0, VecDeque::len)
    }

    /// Longest current wait among queued requests
    pub fn oldest_queued_wait(&self) -> Option<Duration> {
        self.queues.values().flatten().map(|r| r.enqueued_at.elapsed()).max()
    }

    pub fn stats(&self) -> AdmissionStats {
        AdmissionStats {
            active_transfers: self.active.values().map(HashSet::len).sum(),
            queued_requests: self.queues.values().map(VecDeque::len).sum(),
            assets_with_active_transfers: self.active.len(),
            assets_with_queued_requests: self.queues.len(),
        }
    }
}

impl Default for AdmissionController {
    fn default() -> Self {
        Self::new()
    }
}
