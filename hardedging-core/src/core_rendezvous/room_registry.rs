/*
    RoomRegistry - membership bookkeeping for the relay

    Pure state, no sockets. Each operation returns the messages the relay must
    deliver; the server only writes them out. Keeps room membership in join
    order so `peers` snapshots are stable.

    connect(p)           -> [peer-id to p]
    join(p, room)        -> [peers to p, peer-joined to others]
    relay(p, target, x)  -> signal to target, if target is connected
    disconnect(p)        -> [peer-left to remaining room members]
*/

use hashlink::LinkedHashSet;
use std::collections::{HashMap, HashSet};
use tracing::{debug, info};

use super::protocol::ServerMessage;
use crate::core_mesh::types::PeerId;

/// One message addressed to one connected peer
#[derive(Debug, Clone, PartialEq)]
pub struct Delivery {
    pub to: PeerId,
    pub message: ServerMessage,
}

impl Delivery {
    fn new(to: PeerId, message: ServerMessage) -> Self {
        Self { to, message }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RegistryStats {
    pub connected_peers: usize,
    pub rooms: usize,
}

#[derive(Debug, Default)]
pub struct RoomRegistry {
    connected: HashSet<PeerId>,
    memberships: HashMap<PeerId, String>,
    rooms: HashMap<String, LinkedHashSet<PeerId>>,
}

impl RoomRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn connect(&mut self, peer_id: PeerId) -> Vec<Delivery> {
        self.connected.insert(peer_id.clone());
        vec![Delivery::new(peer_id.clone(), ServerMessage::PeerId { peer_id })]
    }

    pub fn join(&mut self, peer_id: &PeerId, room_id: &str) -> Vec<Delivery> {
        if !self.connected.contains(peer_id) {
            return Vec::new();
        }

        let mut deliveries = Vec::new();
        let rejoin = self.memberships.get(peer_id).is_some_and(|r| r == room_id);
        if !rejoin {
            deliveries.extend(self.leave_room(peer_id));
        }

        let members = self.rooms.entry(room_id.to_string()).or_default();
        let peers: Vec<PeerId> = members.iter().filter(|p| *p != peer_id).cloned().collect();
        members.insert(peer_id.clone());
        self.memberships.insert(peer_id.clone(), room_id.to_string());

        deliveries.push(Delivery::new(peer_id.clone(), ServerMessage::Peers { peers: peers.clone() }));
        if !rejoin {
            info!(peer_id = %peer_id, room_id, members = peers.len() + 1, "Peer joined room");
            for other in peers {
                deliveries.push(Delivery::new(other, ServerMessage::PeerJoined { peer_id: peer_id.clone() }));
            }
        }
        deliveries
    }

    /// Forward an opaque payload; `None` when the target is unknown or the payload is null
    ///
    /// Sender and target need not share a room.
    pub fn relay(
        &self,
        from: &PeerId,
        target: &PeerId,
        payload: serde_json::Value,
    ) -> Option<Delivery> {
        if payload.is_null() || !self.connected.contains(from) || !self.connected.contains(target) {
            debug!(from = %from, target = %target, "Dropping undeliverable signal");
            return None;
        }
        Some(Delivery::new(
            target.clone(),
            ServerMessage::Signal { from_peer_id: from.clone(), payload },
        ))
    }

    pub fn disconnect(&mut self, peer_id: &PeerId) -> Vec<Delivery> {
        if !self.connected.remove(peer_id) {
            return Vec::new();
        }
        self.leave_room(peer_id)
    }

    fn leave_room(&mut self, peer_id: &PeerId) -> Vec<Delivery> {
        let Some(room_id) = self.memberships.remove(peer_id) else {
            return Vec::new();
        };
        let Some(members) = self.rooms.get_mut(&room_id) else {
            return Vec::new();
        };
        members.remove(peer_id);

        let deliveries = members
            .iter()
            .map(|other| Delivery::new(other.clone(), ServerMessage::PeerLeft { peer_id: peer_id.clone() }))
            .collect();
        if members.is_empty() {
            self.rooms.remove(&room_id);
        }
        info!(peer_id = %peer_id, room_id = %room_id, "Peer left room");
        deliveries
    }

    pub fn room_of(&self, peer_id: &PeerId) -> Option<&str> {
        self.memberships.get(peer_id).map(String::as_str)
    }

    /// Members of `room_id` in join order
    pub fn members(&self, room_id: &str) -> Vec<PeerId> {
        self.rooms.get(room_id).map(|m| m.iter().cloned().collect()).unwrap_or_default()
    }

    pub fn is_connected(&self, peer_id: &PeerId) -> bool {
        self.connected.contains(peer_id)
    }

    pub fn stats(&self) -> RegistryStats {
        RegistryStats { connected_peers: self.connected.len(), rooms: self.rooms.len() }
    }
}
