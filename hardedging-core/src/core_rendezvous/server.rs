/*
    RendezvousServer - room membership and signaling relay

    HTTP surface:
      GET /health   -> {"status":"ok"}
      GET /signal   -> WebSocket carrying the JSON rendezvous protocol

    Each WebSocket gets a server-assigned `peer_<hex>` id, a reader loop that
    feeds the RoomRegistry, and a writer task draining an unbounded channel.
    The relay never looks inside signaling payloads and drops anything it
    cannot parse.

    ┌──────────┐  text frame  ┌──────────────┐  Vec<Delivery>  ┌──────────────┐
    │ peer ws  │─────────────►│ RoomRegistry │────────────────►│ writer tasks │
    └──────────┘              └──────────────┘                 └──────────────┘
*/

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::Response;
use axum::routing::get;
use axum::{Json, Router};
use futures::{SinkExt, StreamExt};
use std::collections::HashMap;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use super::error::RendezvousError;
use super::protocol::{ClientMessage, ServerMessage};
use super::room_registry::{Delivery, RegistryStats, RoomRegistry};
use crate::config::RendezvousConfig;
use crate::core_mesh::metrics;
use crate::core_mesh::types::PeerId;

struct RelayState {
    registry: RoomRegistry,
    connections: HashMap<PeerId, mpsc::UnboundedSender<ServerMessage>>,
    max_connections: usize,
}

impl RelayState {
    fn deliver(&self, deliveries: Vec<Delivery>) {
        for Delivery { to, message } in deliveries {
            if let Some(tx) = self.connections.get(&to) {
                // Writer gone means the reader is about to clean up too.
                let _ = tx.send(message);
            }
        }
    }

    fn report(&self) {
        let stats = self.registry.stats();
        metrics::relay_connections(stats.connected_peers);
        metrics::relay_rooms(stats.rooms);
    }
}

#[derive(Clone)]
struct AppState {
    relay: Arc<Mutex<RelayState>>,
    shutdown_rx: watch::Receiver<bool>,
}

pub struct RendezvousServer {
    config: RendezvousConfig,
    relay: Arc<Mutex<RelayState>>,
    shutdown_tx: watch::Sender<bool>,
}

impl RendezvousServer {
    pub fn new(config: RendezvousConfig) -> Self {
        let relay = RelayState {
            registry: RoomRegistry::new(),
            connections: HashMap::new(),
            max_connections: config.max_connections,
        };
        let (shutdown_tx, _) = watch::channel(false);
        RendezvousServer { config, relay: Arc::new(Mutex::new(relay)), shutdown_tx }
    }

    /// The axum router serving `/health` and the signaling WebSocket
    pub fn router(&self) -> Router {
        let state = AppState { relay: self.relay.clone(), shutdown_rx: self.shutdown_tx.subscribe() };
        Router::new()
            .route("/health", get(health))
            .route(&self.config.signal_path, get(signal_upgrade))
            .with_state(state)
    }

    pub async fn stats(&self) -> RegistryStats {
        self.relay.lock().await.registry.stats()
    }

    pub async fn bind(&self) -> Result<TcpListener, RendezvousError> {
        let addr = self.config.bind_address;
        TcpListener::bind(addr)
            .await
            .map_err(|e| RendezvousError::Bind { addr: addr.to_string(), reason: e.to_string() })
    }

    /// Serve on `listener` until `shutdown` resolves, then close every peer socket
    pub async fn serve<F>(self, listener: TcpListener, shutdown: F) -> Result<(), RendezvousError>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let app = self.router();
        if let Ok(addr) = listener.local_addr() {
            info!(%addr, path = %self.config.signal_path, "Rendezvous relay listening");
        }

        let shutdown_tx = self.shutdown_tx;
        let result = axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                shutdown.await;
                // Upgraded sockets are not tracked by axum; tell them directly.
                let _ = shutdown_tx.send(true);
            })
            .await
            .map_err(|e| RendezvousError::Serve(e.to_string()));

        info!("Rendezvous relay stopped");
        result
    }

    /// Bind and serve in a background task
    pub async fn spawn(self) -> Result<RendezvousHandle, RendezvousError> {
        let listener = self.bind().await?;
        let local_addr = listener
            .local_addr()
            .map_err(|e| RendezvousError::Bind { addr: self.config.bind_address.to_string(), reason: e.to_string() })?;

        let relay = self.relay.clone();
        let signal_path = self.config.signal_path.clone();
        let (stop_tx, stop_rx) = tokio::sync::oneshot::channel::<()>();
        let task = tokio::spawn(self.serve(listener, async move {
            let _ = stop_rx.await;
        }));

        Ok(RendezvousHandle { local_addr, signal_path, relay, stop_tx: Some(stop_tx), task })
    }
}

/// A relay running in the background
pub struct RendezvousHandle {
    local_addr: SocketAddr,
    signal_path: String,
    relay: Arc<Mutex<RelayState>>,
    stop_tx: Option<tokio::sync::oneshot::Sender<()>>,
    task: JoinHandle<Result<(), RendezvousError>>,
}

impl RendezvousHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// WebSocket URL peers should dial
    pub fn signal_url(&self) -> String {
        format!("ws://{}{}", self.local_addr, self.signal_path)
    }

    pub async fn stats(&self) -> RegistryStats {
        self.relay.lock().await.registry.stats()
    }

    pub async fn members(&self, room_id: &str) -> Vec<PeerId> {
        self.relay.lock().await.registry.members(room_id)
    }

    pub async fn shutdown(mut self) -> Result<(), RendezvousError> {
        if let Some(tx) = self.stop_tx.take() {
            let _ = tx.send(());
        }
        self.task.await.map_err(|e| RendezvousError::Serve(e.to_string()))?
    }
}

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "ok" }))
}

async fn signal_upgrade(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: AppState) {
    let peer_id = PeerId::generate();
    let (mut sink, mut stream) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<ServerMessage>();

    {
        let mut relay = state.relay.lock().await;
        if relay.connections.len() >= relay.max_connections {
            warn!(limit = relay.max_connections, "Relay full, closing new connection");
            metrics::relay_connection_rejected();
            drop(relay);
            let _ = sink.send(Message::Close(None)).await;
            return;
        }
        relay.connections.insert(peer_id.clone(), tx);
        let deliveries = relay.registry.connect(peer_id.clone());
        relay.deliver(deliveries);
        relay.report();
    }
    debug!(peer_id = %peer_id, "Peer connected to relay");

    let writer = tokio::spawn(async move {
        while let Some(message) = rx.recv().await {
            if sink.send(Message::Text(message.encode())).await.is_err() {
                break;
            }
        }
        let _ = sink.close().await;
    });

    let mut shutdown_rx = state.shutdown_rx.clone();
    loop {
        tokio::select! {
            frame = stream.next() => match frame {
                Some(Ok(Message::Text(text))) => handle_text(&state.relay, &peer_id, &text).await,
                Some(Ok(Message::Binary(_))) => {
                    trace!(peer_id = %peer_id, "Ignoring binary frame");
                    metrics::signal_noise();
                }
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    debug!(peer_id = %peer_id, error = %e, "Relay socket error");
                    break;
                }
            },
            Ok(()) = shutdown_rx.changed() => break,
        }
    }

    {
        let mut relay = state.relay.lock().await;
        relay.connections.remove(&peer_id);
        let deliveries = relay.registry.disconnect(&peer_id);
        relay.deliver(deliveries);
        relay.report();
    }
    writer.abort();
    debug!(peer_id = %peer_id, "Peer disconnected from relay");
}

async fn handle_text(relay: &Mutex<RelayState>, peer_id: &PeerId, text: &str) {
    let Some(message) = ClientMessage::decode(text) else {
        debug!(peer_id = %peer_id, "Dropping malformed relay message");
        metrics::signal_noise();
        return;
    };

    let mut relay = relay.lock().await;
    match message {
        ClientMessage::Join { room_id } => {
            let deliveries = relay.registry.join(peer_id, &room_id);
            relay.deliver(deliveries);
            relay.report();
        }
        ClientMessage::Signal { target_peer_id, payload, .. } => {
            match relay.registry.relay(peer_id, &target_peer_id, payload) {
                Some(delivery) => {
                    metrics::signal_relayed();
                    relay.deliver(vec![delivery]);
                }
                None => metrics::signal_dropped(),
            }
        }
    }
}
