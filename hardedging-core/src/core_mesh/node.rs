/*
   MeshNode / MeshHandle

   One actor per mesh participant. It owns every piece of mutable mesh state
   (sessions, admission, ledger, asset store, pending requests) and processes
   one event at a time, so none of it needs a lock.

   Architecture:

    ┌──────────────────────────────────────────────────────────┐
    │  AssetClient / UI layer / binaries                       │
    └──────────────┬───────────────────────────────────────────┘
                   │ MeshHandle (clone freely)
                   │ • request_asset(id, timeout)
                   │ • seed_asset(id, bytes, content_type)
                   │ • get_stats() / get_peer_ids()
                   │ • record_origin_bytes(n) / send_thank_you(..)
                   │ • subscribe() -> MeshEvent stream
    ┌──────────────▼───────────────────────────────────────────┐
    │  MeshNode event loop (tokio::select!)                    │
    │                                                          │
    │   MeshCommand ──┐                                        │
    │   SignalingEvent├──► SessionManager ──► SessionAction    │
    │   TransportEvent┤    AdmissionController                 │
    │   timers/acks ──┘    MeshLedger, AssetStore, Pending     │
    └──────┬────────────────────────────────┬──────────────────┘
           │ SignalingCommand               │ TransportCommand
    ┌──────▼──────────┐              ┌──────▼──────────┐
    │ RendezvousClient│              │ Transport driver│
    └─────────────────┘              └─────────────────┘

   Asset protocol on an open channel:
     ASSET_REQUEST  -> unknown asset: not-found right away
                    -> admission granted: respond with the payload
                    -> queued: respond when a slot frees up
                    -> busy: not-found, try someone else
     ASSET_RESPONSE -> first usable hit resolves every local waiter
*/

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use super::admission::{AdmissionController, AdmissionDecision, AdmissionStats};
use super::asset_store::AssetStore;
use super::errors::{MeshError, MeshResult};
use super::ledger::{MeshLedger, MeshStats};
use super::metrics;
use super::pending::{AssetReply, PendingRequests};
use super::protocol::{AssetMessage, AssetRequest, AssetResponse};
use super::session_manager::{SessionAction, SessionManager};
use super::tcp_transport::TcpTransport;
use super::transport::{Transport, TransportCommand, TransportEvent};
use super::types::{AssetId, AssetRecord, PeerAsset, PeerId};
use crate::config::Config;
use crate::core_rendezvous::{RendezvousClient, SignalingCommand, SignalingEvent};

/// Commands sent to the node
#[derive(Debug)]
pub enum MeshCommand {
    RequestAsset {
        asset_id: AssetId,
        timeout: Duration,
        priority: Option<i32>,
        reply_tx: oneshot::Sender<AssetReply>,
    },
    SeedAsset {
        record: AssetRecord,
        reply_tx: oneshot::Sender<MeshResult<bool>>,
    },
    GetStats(oneshot::Sender<MeshStats>),
    GetPeerIds(oneshot::Sender<Vec<PeerId>>),
    LocalPeerId(oneshot::Sender<Option<PeerId>>),
    AdmissionStats(oneshot::Sender<AdmissionStats>),
    RecordOriginBytes(u64),
    SendThankYou {
        peer_id: PeerId,
        asset_id: AssetId,
        bytes: u64,
        reply_tx: oneshot::Sender<bool>,
    },
    Shutdown(oneshot::Sender<()>),
}

/// Events published by the node
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MeshEvent {
    PeerIdAssigned(PeerId),
    PeerConnected(PeerId),
    PeerDisconnected(PeerId),
    AssetServed { asset_id: AssetId, peer_id: PeerId, bytes: usize },
    AssetReceived { asset_id: AssetId, peer_id: PeerId, bytes: usize },
}

/// The node's side of the relay connection
pub struct SignalingLink {
    pub commands: mpsc::UnboundedSender<SignalingCommand>,
    pub events: mpsc::Receiver<SignalingEvent>,
}

impl From<RendezvousClient> for SignalingLink {
    fn from(client: RendezvousClient) -> Self {
        let (commands, events, _task) = client.into_parts();
        SignalingLink { commands, events }
    }
}

/// Timer firings and completions fed back into the loop
#[derive(Debug)]
enum Internal {
    RequestExpired { asset_id: AssetId, waiter_id: u64 },
    TransferFinished { asset_id: AssetId, peer_id: PeerId, bytes: usize, ok: bool },
    SignalFlushed(PeerId),
    NegotiationDeadline { peer_id: PeerId, generation: u64 },
}

/// Handle to a running mesh node
#[derive(Clone)]
pub struct MeshHandle {
    command_tx: mpsc::Sender<MeshCommand>,
    events_tx: broadcast::Sender<MeshEvent>,
    request_timeout: Duration,
    max_asset_size: usize,
}

impl MeshHandle {
    /// Connect to the configured relay and start a node on a [`TcpTransport`]
    pub async fn connect(config: &Config) -> MeshResult<(Self, JoinHandle<()>)> {
        let node = &config.node;
        let client = RendezvousClient::connect(
            &node.signal_url(),
            &node.room_id,
            config.transport.connect_timeout,
            node.channel_capacity,
        )
        .await?;

        let (transport_event_tx, transport_event_rx) = mpsc::channel(node.channel_capacity);
        let transport = Arc::new(TcpTransport::new(config.transport.clone(), transport_event_tx));
        Ok(MeshNode::spawn(config, client.into(), transport, transport_event_rx))
    }

    /// Ask every open peer for `asset_id`, waiting at most the configured request timeout
    pub async fn request_asset(&self, asset_id: &str) -> MeshResult<Option<PeerAsset>> {
        self.request_asset_with_timeout(asset_id, self.request_timeout).await
    }

    pub async fn request_asset_with_timeout(
        &self,
        asset_id: &str,
        timeout: Duration,
    ) -> MeshResult<Option<PeerAsset>> {
        self.request_asset_with_priority(asset_id, timeout, None).await
    }

    /// Like [`request_asset_with_timeout`](Self::request_asset_with_timeout), tagging the request with a priority
    pub async fn request_asset_with_priority(
        &self,
        asset_id: &str,
        timeout: Duration,
        priority: Option<i32>,
    ) -> MeshResult<Option<PeerAsset>> {
        self.call(|reply_tx| MeshCommand::RequestAsset {
            asset_id: asset_id.to_string(),
            timeout,
            priority,
            reply_tx,
        })
        .await
    }

    /// Make an asset available to the mesh; `Ok(false)` if the id was already seeded
    pub async fn seed_asset(
        &self,
        asset_id: &str,
        bytes: Vec<u8>,
        content_type: &str,
    ) -> MeshResult<bool> {
        let record = AssetRecord::new(asset_id, bytes, content_type);
        self.call(|reply_tx| MeshCommand::SeedAsset { record, reply_tx }).await?
    }

    pub async fn get_stats(&self) -> MeshResult<MeshStats> {
        self.call(MeshCommand::GetStats).await
    }

    /// Peers with an open channel, sorted
    pub async fn get_peer_ids(&self) -> MeshResult<Vec<PeerId>> {
        self.call(MeshCommand::GetPeerIds).await
    }

    /// Our id, once the relay has assigned one
    pub async fn local_peer_id(&self) -> MeshResult<Option<PeerId>> {
        self.call(MeshCommand::LocalPeerId).await
    }

    pub async fn admission_stats(&self) -> MeshResult<AdmissionStats> {
        self.call(MeshCommand::AdmissionStats).await
    }

    pub async fn record_origin_bytes(&self, bytes: u64) -> MeshResult<()> {
        self.command_tx
            .send(MeshCommand::RecordOriginBytes(bytes))
            .await
            .map_err(|_| MeshError::NodeStopped)
    }

    /// Mark `peer_id`'s credit as acknowledged; `Ok(false)` if it has none
    pub async fn send_thank_you(&self, peer_id: &PeerId, asset_id: &str, bytes: u64) -> MeshResult<bool> {
        self.call(|reply_tx| MeshCommand::SendThankYou {
            peer_id: peer_id.clone(),
            asset_id: asset_id.to_string(),
            bytes,
            reply_tx,
        })
        .await
    }

    pub fn subscribe(&self) -> broadcast::Receiver<MeshEvent> {
        self.events_tx.subscribe()
    }

    /// Wait until at least `count` peers have an open channel
    pub async fn wait_for_peers(&self, count: usize, timeout: Duration) -> MeshResult<Vec<PeerId>> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let peers = self.get_peer_ids().await?;
            if peers.len() >= count || tokio::time::Instant::now() >= deadline {
                return Ok(peers);
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    /// Close every session and stop the node; a stopped node is not an error
    pub async fn shutdown(&self) -> MeshResult<()> {
        let (done_tx, done_rx) = oneshot::channel();
        if self.command_tx.send(MeshCommand::Shutdown(done_tx)).await.is_err() {
            return Ok(());
        }
        let _ = done_rx.await;
        Ok(())
    }

    pub fn request_timeout(&self) -> Duration {
        self.request_timeout
    }

    pub fn max_asset_size(&self) -> usize {
        self.max_asset_size
    }

    async fn call<R>(&self, make: impl FnOnce(oneshot::Sender<R>) -> MeshCommand) -> MeshResult<R> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.command_tx.send(make(reply_tx)).await.map_err(|_| MeshError::NodeStopped)?;
        reply_rx.await.map_err(|_| MeshError::NodeStopped)
    }
}

/// The actor behind a [`MeshHandle`]
pub struct MeshNode {
    command_rx: mpsc::Receiver<MeshCommand>,
    signaling_tx: mpsc::UnboundedSender<SignalingCommand>,
    signaling_rx: mpsc::Receiver<SignalingEvent>,
    transport_tx: mpsc::UnboundedSender<TransportCommand>,
    transport_event_rx: mpsc::Receiver<TransportEvent>,
    internal_tx: mpsc::UnboundedSender<Internal>,
    internal_rx: mpsc::UnboundedReceiver<Internal>,
    events_tx: broadcast::Sender<MeshEvent>,

    sessions: SessionManager,
    admission: AdmissionController,
    ledger: MeshLedger,
    store: AssetStore,
    pending: PendingRequests,
    negotiation_timeout: Duration,
}

impl MeshNode {
    /// Start a node over an existing relay link and transport
    ///
    /// `transport_events` must be the receiving end of the channel the
    /// transport reports on.
    pub fn spawn(
        config: &Config,
        signaling: SignalingLink,
        transport: Arc<dyn Transport>,
        transport_events: mpsc::Receiver<TransportEvent>,
    ) -> (MeshHandle, JoinHandle<()>) {
        let capacity = config.node.channel_capacity.max(1);
        let (command_tx, command_rx) = mpsc::channel(capacity);
        let (events_tx, _) = broadcast::channel(capacity);
        let (internal_tx, internal_rx) = mpsc::unbounded_channel();
        let transport_tx = spawn_transport_driver(transport);

        let node = MeshNode {
            command_rx,
            signaling_tx: signaling.commands,
            signaling_rx: signaling.events,
            transport_tx,
            transport_event_rx: transport_events,
            internal_tx,
            internal_rx,
            events_tx: events_tx.clone(),
            sessions: SessionManager::new(),
            admission: AdmissionController::new_with_config(config.admission.clone()),
            ledger: MeshLedger::new(),
            store: AssetStore::new(config.node.max_asset_size_bytes),
            pending: PendingRequests::new(),
            negotiation_timeout: config.node.negotiation_timeout,
        };

        let handle = MeshHandle {
            command_tx,
            events_tx,
            request_timeout: config.node.request_timeout,
            max_asset_size: config.node.max_asset_size_bytes,
        };
        (handle, tokio::spawn(node.run()))
    }

    async fn run(mut self) {
        loop {
            tokio::select! {
                command = self.command_rx.recv() => match command {
                    Some(MeshCommand::Shutdown(done_tx)) => {
                        self.shutdown();
                        let _ = done_tx.send(());
                        break;
                    }
                    Some(command) => self.handle_command(command),
                    None => {
                        self.shutdown();
                        break;
                    }
                },

                Some(event) = self.signaling_rx.recv() => self.handle_signaling_event(event),

                Some(event) = self.transport_event_rx.recv() => self.handle_transport_event(event),

                Some(internal) = self.internal_rx.recv() => self.handle_internal(internal),
            }
        }
        debug!("Mesh node stopped");
    }

    fn handle_command(&mut self, command: MeshCommand) {
        match command {
            MeshCommand::RequestAsset { asset_id, timeout, priority, reply_tx } => {
                self.request_asset(asset_id, timeout, priority, reply_tx);
            }
            MeshCommand::SeedAsset { record, reply_tx } => {
                let _ = reply_tx.send(self.store.seed(record));
            }
            MeshCommand::GetStats(reply_tx) => {
                let _ = reply_tx.send(self.ledger.snapshot(self.sessions.open_peers().len()));
            }
            MeshCommand::GetPeerIds(reply_tx) => {
                let _ = reply_tx.send(self.sessions.open_peers());
            }
            MeshCommand::LocalPeerId(reply_tx) => {
                let _ = reply_tx.send(self.sessions.local_id().cloned());
            }
            MeshCommand::AdmissionStats(reply_tx) => {
                let _ = reply_tx.send(self.admission.stats());
            }
            MeshCommand::RecordOriginBytes(bytes) => {
                self.ledger.record_origin(bytes);
                metrics::origin_bytes(bytes);
            }
            MeshCommand::SendThankYou { peer_id, asset_id, bytes, reply_tx } => {
                let _ = reply_tx.send(self.ledger.send_thank_you(&peer_id, &asset_id, bytes));
            }
            MeshCommand::Shutdown(done_tx) => {
                // Handled in the loop; only reachable if called directly.
                self.shutdown();
                let _ = done_tx.send(());
            }
        }
    }

    fn request_asset(
        &mut self,
        asset_id: AssetId,
        timeout: Duration,
        priority: Option<i32>,
        reply_tx: oneshot::Sender<AssetReply>,
    ) {
        let registration = self.pending.register(&asset_id, reply_tx);
        let waiter_id = registration.waiter_id;

        let internal_tx = self.internal_tx.clone();
        let expired_id = asset_id.clone();
        let timer = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            let _ = internal_tx.send(Internal::RequestExpired { asset_id: expired_id, waiter_id });
        });
        self.pending.attach_timer(&asset_id, waiter_id, timer.abort_handle());

        if !registration.first {
            trace!(asset_id = %asset_id, "Joining in-flight request");
            return;
        }

        let peers = self.sessions.open_peers();
        debug!(asset_id = %asset_id, peers = peers.len(), "Broadcasting asset request");
        let bytes = AssetMessage::request(asset_id.clone(), priority).encode();
        for peer_id in &peers {
            self.send_transport(TransportCommand::Send { peer_id: peer_id.clone(), bytes: bytes.clone(), sent_tx: None });
        }
        self.pending.mark_asked(&asset_id, peers);
    }

    fn handle_signaling_event(&mut self, event: SignalingEvent) {
        let actions = match event {
            SignalingEvent::Assigned(peer_id) => {
                info!(peer_id = %peer_id, "Assigned peer id");
                self.sessions.set_local_id(peer_id.clone());
                self.emit(MeshEvent::PeerIdAssigned(peer_id));
                Vec::new()
            }
            SignalingEvent::Peers(peers) => {
                debug!(count = peers.len(), "Room snapshot");
                peers.iter().flat_map(|p| self.sessions.register_responder(p)).collect()
            }
            SignalingEvent::PeerJoined(peer_id) => {
                info!(peer_id = %peer_id, "Peer joined room");
                self.sessions.initiate(&peer_id)
            }
            SignalingEvent::PeerLeft(peer_id) => {
                info!(peer_id = %peer_id, "Peer left room");
                self.sessions.close(&peer_id)
            }
            SignalingEvent::Signal { from, payload } => self.sessions.handle_signal(&from, payload),
            SignalingEvent::Disconnected => {
                warn!("Lost connection to rendezvous relay; open sessions stay up");
                Vec::new()
            }
        };
        self.run_actions(actions);
    }

    fn handle_transport_event(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::Data(peer_id, bytes) => self.handle_data(peer_id, bytes),
            event => {
                let actions = self.sessions.handle_transport_event(event);
                self.run_actions(actions);
            }
        }
    }

    fn handle_internal(&mut self, internal: Internal) {
        match internal {
            Internal::RequestExpired { asset_id, waiter_id } => {
                if self.pending.expire(&asset_id, waiter_id) {
                    debug!(asset_id = %asset_id, "Asset request timed out");
                    metrics::request_timed_out();
                }
            }
            Internal::TransferFinished { asset_id, peer_id, bytes, ok } => {
                self.transfer_finished(asset_id, peer_id, bytes, ok);
            }
            Internal::SignalFlushed(peer_id) => {
                let actions = self.sessions.signal_flushed(&peer_id);
                self.run_actions(actions);
            }
            Internal::NegotiationDeadline { peer_id, generation } => {
                let actions = self.sessions.negotiation_expired(&peer_id, generation);
                self.run_actions(actions);
            }
        }
    }

    fn run_actions(&mut self, actions: Vec<SessionAction>) {
        for action in actions {
            match action {
                SessionAction::Signal { to, payload, track_flush } => {
                    let flushed_tx = track_flush.then(|| {
                        let (flushed_tx, flushed_rx) = oneshot::channel();
                        let internal_tx = self.internal_tx.clone();
                        let peer_id = to.clone();
                        tokio::spawn(async move {
                            if flushed_rx.await.is_ok() {
                                let _ = internal_tx.send(Internal::SignalFlushed(peer_id));
                            }
                        });
                        flushed_tx
                    });
                    if self.signaling_tx.send(SignalingCommand::Signal { target: to, payload, flushed_tx }).is_err() {
                        warn!("Relay connection gone, signal not sent");
                    }
                }
                SessionAction::Transport(command) => self.send_transport(command),
                SessionAction::Opened(peer_id) => {
                    metrics::open_sessions(self.sessions.open_peers().len());
                    self.emit(MeshEvent::PeerConnected(peer_id));
                }
                SessionAction::Closed { peer_id, was_open } => self.peer_departed(peer_id, was_open),
                SessionAction::ArmNegotiationTimer { peer_id, generation } => {
                    let internal_tx = self.internal_tx.clone();
                    let timeout = self.negotiation_timeout;
                    tokio::spawn(async move {
                        tokio::time::sleep(timeout).await;
                        let _ = internal_tx.send(Internal::NegotiationDeadline { peer_id, generation });
                    });
                }
            }
        }
    }

    /// Session gone: free its admission state and hand vacated slots to the queue
    fn peer_departed(&mut self, peer_id: PeerId, was_open: bool) {
        metrics::open_sessions(self.sessions.open_peers().len());
        for asset_id in self.admission.cleanup_peer(&peer_id) {
            for next in self.admission.promote_queued(&asset_id) {
                self.serve_granted(&asset_id, next);
            }
        }
        if was_open {
            self.emit(MeshEvent::PeerDisconnected(peer_id));
        }
    }

    fn handle_data(&mut self, from: PeerId, bytes: Vec<u8>) {
        if !self.sessions.is_open(&from) {
            trace!(peer_id = %from, "Data from peer without an open channel");
            return;
        }
        match AssetMessage::decode(&bytes) {
            Some(AssetMessage::Request(request)) => self.handle_asset_request(from, request),
            Some(AssetMessage::Response(response)) => self.handle_asset_response(from, response),
            None => {
                debug!(peer_id = %from, bytes = bytes.len(), "Dropping malformed channel message");
                metrics::data_noise();
            }
        }
    }

    fn handle_asset_request(&mut self, from: PeerId, request: AssetRequest) {
        let Some(local_id) = self.sessions.local_id().cloned() else {
            return;
        };
        if !self.store.contains(&request.id) {
            trace!(asset_id = %request.id, peer_id = %from, "Asked for an asset we don't have");
            self.send_message(&from, AssetMessage::Response(AssetResponse::not_found(&request.id, &local_id)));
            return;
        }

        let priority = request.priority.unwrap_or(0);
        match self.admission.request_transfer_with_priority(&request.id, &from, priority) {
            AdmissionDecision::Granted => self.serve_granted(&request.id, from),
            AdmissionDecision::Queued => {
                debug!(asset_id = %request.id, peer_id = %from, "Transfer queued");
            }
            AdmissionDecision::Busy => {
                self.send_message(&from, AssetMessage::Response(AssetResponse::not_found(&request.id, &local_id)));
            }
        }
    }

    /// Send `asset_id` to a peer that already holds an admission slot
    ///
    /// Falls through to the next queued peer if this one can't be served.
    fn serve_granted(&mut self, asset_id: &str, peer_id: PeerId) {
        let mut next = Some(peer_id);
        while let Some(peer_id) = next.take() {
            let record = self.store.get(asset_id);
            let local_id = self.sessions.local_id().cloned();
            match (record, local_id) {
                (Some(record), Some(local_id)) if self.sessions.is_open(&peer_id) => {
                    let bytes = AssetMessage::Response(AssetResponse::found(&record, &local_id)).encode();
                    let (sent_tx, sent_rx) = oneshot::channel();
                    self.send_transport(TransportCommand::Send {
                        peer_id: peer_id.clone(),
                        bytes,
                        sent_tx: Some(sent_tx),
                    });

                    let internal_tx = self.internal_tx.clone();
                    let asset_id = record.id.clone();
                    let size = record.len();
                    tokio::spawn(async move {
                        let ok = matches!(sent_rx.await, Ok(Ok(())));
                        let _ = internal_tx.send(Internal::TransferFinished { asset_id, peer_id, bytes: size, ok });
                    });
                }
                _ => next = self.admission.release_transfer(asset_id, &peer_id),
            }
        }
    }

    fn transfer_finished(&mut self, asset_id: AssetId, peer_id: PeerId, bytes: usize, ok: bool) {
        if ok {
            self.ledger.record_sent(bytes as u64);
            metrics::transfer_served(bytes);
            debug!(asset_id = %asset_id, peer_id = %peer_id, bytes, "Asset served");
            self.emit(MeshEvent::AssetServed { asset_id: asset_id.clone(), peer_id: peer_id.clone(), bytes });
        } else {
            warn!(asset_id = %asset_id, peer_id = %peer_id, "Asset transfer failed");
        }

        if let Some(next) = self.admission.release_transfer(&asset_id, &peer_id) {
            self.serve_granted(&asset_id, next);
        }
    }

    fn handle_asset_response(&mut self, from: PeerId, response: AssetResponse) {
        if !self.pending.is_pending(&response.id) {
            trace!(asset_id = %response.id, peer_id = %from, "Late or unsolicited response");
            return;
        }

        let Some(bytes) = response.payload(self.store.max_asset_size()) else {
            if response.found {
                debug!(asset_id = %response.id, peer_id = %from, "Unusable payload, counting as a decline");
            }
            if let Some(waiters) = self.pending.decline(&response.id, &from) {
                debug!(asset_id = %response.id, waiters, "Every asked peer declined");
                metrics::request_declined();
            }
            return;
        };

        let size = bytes.len();
        let asset = PeerAsset {
            asset_id: response.id.clone(),
            bytes,
            content_type: response.content_type,
            source: from.clone(),
        };
        self.pending.resolve(asset);
        self.ledger.record_received(&from, size as u64);
        metrics::asset_received(size);
        debug!(asset_id = %response.id, peer_id = %from, bytes = size, "Asset received from peer");
        self.emit(MeshEvent::AssetReceived { asset_id: response.id, peer_id: from, bytes: size });
    }

    fn send_message(&self, to: &PeerId, message: AssetMessage) {
        self.send_transport(TransportCommand::Send { peer_id: to.clone(), bytes: message.encode(), sent_tx: None });
    }

    fn send_transport(&self, command: TransportCommand) {
        if self.transport_tx.send(command).is_err() {
            warn!("Transport driver stopped");
        }
    }

    fn emit(&self, event: MeshEvent) {
        // No subscribers is fine.
        let _ = self.events_tx.send(event);
    }

    fn shutdown(&mut self) {
        info!(sessions = self.sessions.session_count(), "Shutting down mesh node");
        let actions = self.sessions.close_all();
        self.run_actions(actions);
        self.pending.clear();
        let _ = self.signaling_tx.send(SignalingCommand::Close);
    }
}

/// Run transport commands one at a time, in the order the node issued them
fn spawn_transport_driver(transport: Arc<dyn Transport>) -> mpsc::UnboundedSender<TransportCommand> {
    let (command_tx, mut command_rx) = mpsc::unbounded_channel::<TransportCommand>();
    tokio::spawn(async move {
        while let Some(command) = command_rx.recv().await {
            let peer_id = command.peer_id().clone();
            if let Err(e) = transport.handle_command(command).await {
                warn!(peer_id = %peer_id, "Transport command failed: {}", e);
            }
        }
    });
    command_tx
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core_mesh::admission::{AdmissionConfig, QueuePolicy};
    use crate::test_utils::*;
    use std::time::Instant;

    fn config_with(admission: AdmissionConfig) -> Config {
        let mut config = Config::default();
        config.admission = admission;
        config
    }

    #[tokio::test]
    async fn test_unknown_asset_request_declined_without_admission() {
        let mut node = NodeFixture::start("peer_a", Config::default()).await;
        node.open_peer("peer_b").await;

        node.deliver("peer_b", AssetMessage::request("/missing.png", None)).await;
        let (to, message, _) = node.next_send().await;
        assert_eq!(to, PeerId::new("peer_b"));
        assert!(matches!(message, AssetMessage::Response(r) if !r.found && r.id == "/missing.png"));
        assert_eq!(node.handle.admission_stats().await.unwrap(), AdmissionStats::default());
    }

    #[tokio::test]
    async fn test_queued_transfers_served_one_at_a_time() {
        let mut node = NodeFixture::start("peer_a", Config::default()).await;
        node.handle.seed_asset("/img.png", vec![1, 2, 3, 4], "image/png").await.unwrap();
        for peer in ["peer_b", "peer_c", "peer_d"] {
            node.open_peer(peer).await;
        }
        let mut events = node.handle.subscribe();
        for peer in ["peer_b", "peer_c", "peer_d"] {
            node.deliver(peer, AssetMessage::request("/img.png", None)).await;
        }

        for expected in ["peer_b", "peer_c", "peer_d"] {
            let (to, message, sent_tx) = node.next_send().await;
            assert_eq!(to, PeerId::new(expected));
            assert!(matches!(message, AssetMessage::Response(r) if r.found));
            // Nothing else goes out while this transfer is in flight.
            assert!(node.try_next_send(SHORT_TEST_TIMEOUT).await.is_none());
            sent_tx.expect("granted sends are acknowledged").send(Ok(())).unwrap();

            let served = assert_completes_within(DEFAULT_TEST_TIMEOUT, events.recv()).await.unwrap();
            assert!(matches!(served, MeshEvent::AssetServed { peer_id, bytes: 4, .. } if peer_id == PeerId::new(expected)));
        }

        let stats = node.handle.get_stats().await.unwrap();
        assert_eq!(stats.bytes_sent_p2p, 12);
        assert_eq!(node.handle.admission_stats().await.unwrap(), AdmissionStats::default());
    }

    #[tokio::test]
    async fn test_busy_peer_gets_not_found() {
        let config = config_with(AdmissionConfig {
            queue_policy: QueuePolicy::Reject,
            ..Default::default()
        });
        let mut node = NodeFixture::start("peer_a", config).await;
        node.handle.seed_asset("/a", vec![9], "text/plain").await.unwrap();
        node.open_peer("peer_b").await;
        node.open_peer("peer_c").await;

        node.deliver("peer_b", AssetMessage::request("/a", None)).await;
        node.deliver("peer_c", AssetMessage::request("/a", None)).await;

        let (_, first, _sent) = node.next_send().await;
        assert!(matches!(first, AssetMessage::Response(r) if r.found));
        let (to, second, _) = node.next_send().await;
        assert_eq!(to, PeerId::new("peer_c"));
        assert!(matches!(second, AssetMessage::Response(r) if !r.found));
    }

    #[tokio::test]
    async fn test_departed_receiver_frees_slot_for_queue() {
        let mut node = NodeFixture::start("peer_a", Config::default()).await;
        node.handle.seed_asset("/a", vec![1; 8], "x").await.unwrap();
        node.open_peer("peer_b").await;
        node.open_peer("peer_c").await;
        node.deliver("peer_b", AssetMessage::request("/a", None)).await;
        node.deliver("peer_c", AssetMessage::request("/a", None)).await;

        let (to, _, _held) = node.next_send().await;
        assert_eq!(to, PeerId::new("peer_b"));

        node.close_peer("peer_b").await;
        let (to, message, _) = node.next_send().await;
        assert_eq!(to, PeerId::new("peer_c"));
        assert!(matches!(message, AssetMessage::Response(r) if r.found));
    }

    #[tokio::test]
    async fn test_response_resolves_request_and_credits_peer() {
        let mut node = NodeFixture::start("peer_b", Config::default()).await;
        node.open_peer("peer_a").await;

        let handle = node.handle.clone();
        let request = tokio::spawn(async move {
            handle.request_asset_with_timeout("/img.png", Duration::from_millis(500)).await
        });

        let (to, message, _) = node.next_send().await;
        assert_eq!(to, PeerId::new("peer_a"));
        assert_eq!(message, AssetMessage::request("/img.png", None));

        let record = AssetRecord::new("/img.png", vec![1, 2, 3, 4], "image/png");
        node.deliver("peer_a", AssetMessage::Response(AssetResponse::found(&record, &PeerId::new("peer_a"))))
            .await;

        let asset = request.await.unwrap().unwrap().expect("asset from peer");
        assert_eq!(asset.bytes, vec![1, 2, 3, 4]);
        assert_eq!(asset.content_type.as_deref(), Some("image/png"));
        assert_eq!(asset.source, PeerId::new("peer_a"));

        let stats = node.handle.get_stats().await.unwrap();
        assert_eq!(stats.bytes_received_p2p, 4);
        assert_eq!(stats.credit_for(&PeerId::new("peer_a")).unwrap().assets_received, 1);
        assert!(node.handle.send_thank_you(&PeerId::new("peer_a"), "/img.png", 4).await.unwrap());
    }

    #[tokio::test]
    async fn test_all_declines_resolve_before_deadline() {
        let mut node = NodeFixture::start("peer_b", Config::default()).await;
        node.open_peer("peer_a").await;

        let handle = node.handle.clone();
        let started = Instant::now();
        let request =
            tokio::spawn(async move { handle.request_asset_with_timeout("/x", Duration::from_secs(10)).await });
        node.next_send().await;
        node.deliver("peer_a", AssetMessage::Response(AssetResponse::not_found("/x", &PeerId::new("peer_a"))))
            .await;

        let reply = assert_completes_within(DEFAULT_TEST_TIMEOUT, request).await.unwrap().unwrap();
        assert_eq!(reply, None);
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[tokio::test]
    async fn test_no_sessions_waits_out_the_timeout() {
        let node = NodeFixture::start("peer_a", Config::default()).await;
        let started = Instant::now();
        let reply = node.handle.request_asset_with_timeout("/a", Duration::from_millis(150)).await.unwrap();
        assert_eq!(reply, None);
        assert!(started.elapsed() >= Duration::from_millis(150));
    }

    #[tokio::test]
    async fn test_malformed_data_ignored() {
        let mut node = NodeFixture::start("peer_a", Config::default()).await;
        node.open_peer("peer_b").await;
        node.deliver_raw("peer_b", b"not json".to_vec()).await;
        node.deliver_raw("peer_b", br#"{"type":"ASSET_PING"}"#.to_vec()).await;
        assert!(node.try_next_send(SHORT_TEST_TIMEOUT).await.is_none());
        assert_eq!(node.handle.get_peer_ids().await.unwrap(), vec![PeerId::new("peer_b")]);
    }

    #[tokio::test]
    async fn test_oversized_seed_rejected() {
        let mut config = Config::default();
        config.node.max_asset_size_bytes = 2;
        let node = NodeFixture::start("peer_a", config).await;
        let err = node.handle.seed_asset("/big", vec![0; 3], "x").await.unwrap_err();
        assert!(matches!(err, MeshError::AssetTooLarge { .. }));
    }

    #[tokio::test]
    async fn test_shutdown_resolves_pending_and_stops() {
        let node = NodeFixture::start("peer_a", Config::default()).await;
        let handle = node.handle.clone();
        let request =
            tokio::spawn(async move { handle.request_asset_with_timeout("/a", Duration::from_secs(30)).await });
        tokio::time::sleep(Duration::from_millis(50)).await;

        node.handle.shutdown().await.unwrap();
        assert_eq!(request.await.unwrap().unwrap(), None);
        assert!(matches!(node.handle.get_stats().await, Err(MeshError::NodeStopped)));
    }

    #[tokio::test]
    async fn test_events_published() {
        let mut node = NodeFixture::start("peer_a", Config::default()).await;
        let mut events = node.handle.subscribe();
        node.open_peer("peer_b").await;
        let event = assert_completes_within(DEFAULT_TEST_TIMEOUT, events.recv()).await.unwrap();
        assert_eq!(event, MeshEvent::PeerConnected(PeerId::new("peer_b")));

        node.close_peer("peer_b").await;
        let event = assert_completes_within(DEFAULT_TEST_TIMEOUT, events.recv()).await.unwrap();
        assert_eq!(event, MeshEvent::PeerDisconnected(PeerId::new("peer_b")));
    }

    #[tokio::test]
    async fn test_negotiation_timeout_closes_stalled_session() {
        let mut config = Config::default();
        config.node.negotiation_timeout = Duration::from_millis(100);
        let mut node = NodeFixture::start("peer_a", config).await;

        node.signal("peer_b", serde_json::json!({"type":"offer","sdp":"o"})).await;
        let closed = node
            .wait_for_command(|c| matches!(c, TransportCommand::Close(p) if p == &PeerId::new("peer_b")))
            .await;
        assert!(closed.is_some());
        assert!(node.handle.get_peer_ids().await.unwrap().is_empty());
    }
}
