//! Shared helpers for the integration tests: a real relay on an ephemeral
//! port, raw WebSocket peers, and mesh nodes wired to both.

#![allow(dead_code)]

use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use hardedging_core::config::{Config, RendezvousConfig};
use hardedging_core::core_mesh::MeshHandle;
use hardedging_core::core_rendezvous::{ClientMessage, RendezvousHandle, RendezvousServer, ServerMessage};
use hardedging_core::PeerId;
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tokio::time::{timeout, Duration};
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

pub const TEST_TIMEOUT: Duration = Duration::from_secs(5);

type Ws = WebSocketStream<MaybeTlsStream<TcpStream>>;

pub async fn start_relay() -> RendezvousHandle {
    start_relay_with(RendezvousConfig::default()).await
}

pub async fn start_relay_with(mut config: RendezvousConfig) -> RendezvousHandle {
    config.bind_address = "127.0.0.1:0".parse().unwrap();
    RendezvousServer::new(config).spawn().await.expect("relay failed to start")
}

/// Node config pointed at `relay`, with short timeouts
pub fn node_config(relay: &RendezvousHandle, room_id: &str) -> Config {
    let mut config = Config::default();
    config.node.rendezvous_url = relay.signal_url();
    config.node.room_id = room_id.to_string();
    config.node.request_timeout = Duration::from_millis(500);
    config.node.negotiation_timeout = Duration::from_secs(5);
    config
}

pub async fn start_node(config: &Config) -> (MeshHandle, JoinHandle<()>) {
    let (handle, task) = MeshHandle::connect(config).await.expect("node failed to connect");
    for _ in 0..200 {
        if handle.local_peer_id().await.unwrap().is_some() {
            return (handle, task);
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("node never got a peer id");
}

/// A bare WebSocket client speaking the relay protocol by hand
pub struct WsPeer {
    pub peer_id: PeerId,
    sink: SplitSink<Ws, Message>,
    stream: SplitStream<Ws>,
}

impl WsPeer {
    /// Connect and read the assigned id
    pub async fn connect(relay: &RendezvousHandle) -> Self {
        let (ws, _) = connect_async(relay.signal_url()).await.expect("ws connect");
        let (sink, stream) = ws.split();
        let mut peer = WsPeer { peer_id: PeerId::new(""), sink, stream };
        match peer.recv().await {
            ServerMessage::PeerId { peer_id } => peer.peer_id = peer_id,
            other => panic!("expected peer-id first, got {:?}", other),
        }
        peer
    }

    /// Connect, join `room_id`, and return with the room snapshot
    pub async fn join(relay: &RendezvousHandle, room_id: &str) -> (Self, Vec<PeerId>) {
        let mut peer = Self::connect(relay).await;
        peer.send(&ClientMessage::Join { room_id: room_id.to_string() }).await;
        match peer.recv().await {
            ServerMessage::Peers { peers } => (peer, peers),
            other => panic!("expected peers, got {:?}", other),
        }
    }

    pub async fn send(&mut self, message: &ClientMessage) {
        self.send_text(&message.encode()).await;
    }

    pub async fn send_text(&mut self, text: &str) {
        self.sink.send(Message::Text(text.to_string().into())).await.expect("ws send");
    }

    pub async fn recv(&mut self) -> ServerMessage {
        self.try_recv(TEST_TIMEOUT).await.expect("no message from relay")
    }

    /// Next relay message within `within`, if any
    pub async fn try_recv(&mut self, within: Duration) -> Option<ServerMessage> {
        loop {
            let frame = timeout(within, self.stream.next()).await.ok()??;
            match frame {
                Ok(Message::Text(text)) => {
                    return Some(ServerMessage::decode(text.as_str()).expect("relay sent malformed JSON"))
                }
                Ok(Message::Close(_)) | Err(_) => return None,
                Ok(_) => continue,
            }
        }
    }

    /// True once the relay has closed this socket
    pub async fn closed_within(&mut self, within: Duration) -> bool {
        loop {
            match timeout(within, self.stream.next()).await {
                Err(_) => return false,
                Ok(None) | Ok(Some(Err(_))) | Ok(Some(Ok(Message::Close(_)))) => return true,
                Ok(Some(Ok(_))) => continue,
            }
        }
    }

    pub async fn close(mut self) {
        let _ = self.sink.send(Message::Close(None)).await;
    }
}
