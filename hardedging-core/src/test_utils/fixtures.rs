//! Test fixtures
//!
//! [`NodeFixture`] runs a real [`MeshNode`] against in-memory relay and
//! transport channels, so tests can play every remote peer by hand.

use serde_json::{json, Value};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Duration;

use super::async_helpers::{recv_unbounded_timeout, DEFAULT_TEST_TIMEOUT};
use super::recording_transport::RecordingTransport;
use crate::config::Config;
use crate::core_mesh::node::{MeshHandle, MeshNode, SignalingLink};
use crate::core_mesh::protocol::AssetMessage;
use crate::core_mesh::transport::{TransportCommand, TransportError, TransportEvent};
use crate::core_mesh::types::PeerId;
use crate::core_rendezvous::{SignalingCommand, SignalingEvent};

pub type SentAck = oneshot::Sender<Result<(), TransportError>>;

pub struct NodeFixture {
    pub handle: MeshHandle,
    pub task: JoinHandle<()>,
    pub signaling_in: mpsc::Sender<SignalingEvent>,
    pub signaling_out: mpsc::UnboundedReceiver<SignalingCommand>,
    pub transport_in: mpsc::Sender<TransportEvent>,
    pub transport_out: mpsc::UnboundedReceiver<TransportCommand>,
}

impl NodeFixture {
    /// Start a node whose relay has already assigned it `local_id`
    pub async fn start(local_id: &str, config: Config) -> Self {
        let (signaling_tx, signaling_out) = mpsc::unbounded_channel();
        let (signaling_in, signaling_rx) = mpsc::channel(64);
        let (transport_in, transport_events) = mpsc::channel(64);
        let (transport, transport_out) = RecordingTransport::new();

        let link = SignalingLink { commands: signaling_tx, events: signaling_rx };
        let (handle, task) = MeshNode::spawn(&config, link, Arc::new(transport), transport_events);

        signaling_in.send(SignalingEvent::Assigned(PeerId::new(local_id))).await.unwrap();
        let fixture = NodeFixture { handle, task, signaling_in, signaling_out, transport_in, transport_out };
        for _ in 0..100 {
            if fixture.handle.local_peer_id().await.unwrap().is_some() {
                return fixture;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("Node never took its peer id");
    }

    pub async fn signal(&self, from: &str, payload: Value) {
        self.signaling_in
            .send(SignalingEvent::Signal { from: PeerId::new(from), payload })
            .await
            .unwrap();
    }

    /// Have `peer` offer to the node and open the channel
    pub async fn open_peer(&mut self, peer: &str) {
        let peer_id = PeerId::new(peer);
        self.signal(peer, json!({"type":"offer","sdp":format!("offer-from-{}", peer)})).await;
        self.wait_for_command(|c| matches!(c, TransportCommand::AcceptOffer(p, _) if p == &peer_id))
            .await
            .expect("node never accepted the offer");

        self.transport_in.send(TransportEvent::Connected(peer_id.clone())).await.unwrap();
        self.transport_in.send(TransportEvent::ChannelOpen(peer_id.clone())).await.unwrap();
        for _ in 0..100 {
            if self.handle.get_peer_ids().await.unwrap().contains(&peer_id) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("Channel to {} never opened", peer);
    }

    /// The remote side of `peer`'s link went away
    pub async fn close_peer(&self, peer: &str) {
        self.transport_in.send(TransportEvent::Closed(PeerId::new(peer))).await.unwrap();
    }

    pub async fn deliver(&self, from: &str, message: AssetMessage) {
        self.deliver_raw(from, message.encode()).await;
    }

    pub async fn deliver_raw(&self, from: &str, bytes: Vec<u8>) {
        self.transport_in.send(TransportEvent::Data(PeerId::new(from), bytes)).await.unwrap();
    }

    /// Skip commands until one matches
    pub async fn wait_for_command<F>(&mut self, mut matches: F) -> Option<TransportCommand>
    where
        F: FnMut(&TransportCommand) -> bool,
    {
        while let Ok(command) = recv_unbounded_timeout(&mut self.transport_out, DEFAULT_TEST_TIMEOUT).await {
            if matches(&command) {
                return Some(command);
            }
        }
        None
    }

    /// Next asset message the node sends, with its completion ack if it asked for one
    pub async fn next_send(&mut self) -> (PeerId, AssetMessage, Option<SentAck>) {
        self.try_next_send(DEFAULT_TEST_TIMEOUT).await.expect("no Send command from node")
    }

    pub async fn try_next_send(&mut self, within: Duration) -> Option<(PeerId, AssetMessage, Option<SentAck>)> {
        while let Ok(command) = recv_unbounded_timeout(&mut self.transport_out, within).await {
            if let TransportCommand::Send { peer_id, bytes, sent_tx } = command {
                let message = AssetMessage::decode(&bytes).expect("node sent a malformed message");
                return Some((peer_id, message, sent_tx));
            }
        }
        None
    }
}
