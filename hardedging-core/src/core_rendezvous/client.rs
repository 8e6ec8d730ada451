/*
    RendezvousClient - a peer's connection to the relay

    Connects over WebSocket, joins the configured room, and from then on:
      - turns server messages into SignalingEvents for the mesh node
      - writes SignalingCommands out as `signal` envelopes, acknowledging each
        one once it has been written to the socket

    Emits SignalingEvent::Disconnected exactly once when the socket ends.
*/

use futures::{SinkExt, StreamExt};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::protocol::Message;
use tracing::{debug, info, trace, warn};

use super::error::RendezvousError;
use super::protocol::{ClientMessage, ServerMessage, SignalPayload};
use crate::core_mesh::metrics;
use crate::core_mesh::types::PeerId;

/// What the relay told us
#[derive(Debug, Clone, PartialEq)]
pub enum SignalingEvent {
    /// Our own id
    Assigned(PeerId),
    /// Room members already present when we joined
    Peers(Vec<PeerId>),
    PeerJoined(PeerId),
    PeerLeft(PeerId),
    Signal { from: PeerId, payload: serde_json::Value },
    Disconnected,
}

#[derive(Debug)]
pub enum SignalingCommand {
    Signal {
        target: PeerId,
        payload: SignalPayload,
        /// Fires once the envelope is on the wire
        flushed_tx: Option<oneshot::Sender<()>>,
    },
    Close,
}

pub struct RendezvousClient {
    commands: mpsc::UnboundedSender<SignalingCommand>,
    events: mpsc::Receiver<SignalingEvent>,
    task: JoinHandle<()>,
}

impl RendezvousClient {
    /// Connect to `url` and join `room_id`
    pub async fn connect(
        url: &str,
        room_id: &str,
        connect_timeout: Duration,
        capacity: usize,
    ) -> Result<Self, RendezvousError> {
        let connect_err = |reason: String| RendezvousError::Connect { url: url.to_string(), reason };

        let (ws, _response) = tokio::time::timeout(connect_timeout, connect_async(url))
            .await
            .map_err(|_| connect_err("timed out".to_string()))?
            .map_err(|e| connect_err(e.to_string()))?;
        let (mut sink, stream) = ws.split();

        let join = ClientMessage::Join { room_id: room_id.to_string() };
        sink.send(Message::Text(join.encode().into()))
            .await
            .map_err(|e| connect_err(e.to_string()))?;
        info!(url, room_id, "Connected to rendezvous relay");

        let (commands, command_rx) = mpsc::unbounded_channel();
        let (event_tx, events) = mpsc::channel(capacity);
        let task = tokio::spawn(run_connection(sink, stream, room_id.to_string(), command_rx, event_tx));

        Ok(RendezvousClient { commands, events, task })
    }

    /// Split into the command sender and event receiver the mesh node consumes
    pub fn into_parts(
        self,
    ) -> (mpsc::UnboundedSender<SignalingCommand>, mpsc::Receiver<SignalingEvent>, JoinHandle<()>) {
        (self.commands, self.events, self.task)
    }

    pub fn commands(&self) -> mpsc::UnboundedSender<SignalingCommand> {
        self.commands.clone()
    }

    pub async fn next_event(&mut self) -> Option<SignalingEvent> {
        self.events.recv().await
    }
}

async fn run_connection<S, R>(
    mut sink: S,
    mut stream: R,
    room_id: String,
    mut command_rx: mpsc::UnboundedReceiver<SignalingCommand>,
    event_tx: mpsc::Sender<SignalingEvent>,
) where
    S: futures::Sink<Message> + Unpin,
    R: futures::Stream<Item = Result<Message, tokio_tungstenite::tungstenite::Error>> + Unpin,
{
    loop {
        tokio::select! {
            frame = stream.next() => match frame {
                Some(Ok(Message::Text(text))) => {
                    let Some(event) = to_event(text.as_str()) else {
                        debug!("Dropping malformed relay message");
                        metrics::signal_noise();
                        continue;
                    };
                    if event_tx.send(event).await.is_err() {
                        break;
                    }
                }
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    warn!(error = %e, "Relay connection failed");
                    break;
                }
            },
            command = command_rx.recv() => match command {
                Some(SignalingCommand::Signal { target, payload, flushed_tx }) => {
                    trace!(target = %target, kind = payload.kind(), "Sending signal");
                    let envelope = ClientMessage::Signal {
                        room_id: Some(room_id.clone()),
                        target_peer_id: target,
                        payload: payload.to_value(),
                    };
                    if sink.send(Message::Text(envelope.encode().into())).await.is_err() {
                        warn!("Failed to write signal to relay");
                        break;
                    }
                    if let Some(tx) = flushed_tx {
                        let _ = tx.send(());
                    }
                }
                Some(SignalingCommand::Close) | None => {
                    let _ = sink.close().await;
                    break;
                }
            },
        }
    }

    info!("Disconnected from rendezvous relay");
    let _ = event_tx.send(SignalingEvent::Disconnected).await;
}

fn to_event(text: &str) -> Option<SignalingEvent> {
    let event = match ServerMessage::decode(text)? {
        ServerMessage::PeerId { peer_id } => SignalingEvent::Assigned(peer_id),
        ServerMessage::Peers { peers } => SignalingEvent::Peers(peers),
        ServerMessage::PeerJoined { peer_id } => SignalingEvent::PeerJoined(peer_id),
        ServerMessage::PeerLeft { peer_id } => SignalingEvent::PeerLeft(peer_id),
        ServerMessage::Signal { payload, .. } if payload.is_null() => return None,
        ServerMessage::Signal { from_peer_id, payload } => SignalingEvent::Signal { from: from_peer_id, payload },
    };
    Some(event)
}
