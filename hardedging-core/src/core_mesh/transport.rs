/*
    Transport - the connection-negotiation seam

    The session state machine never touches sockets. It issues
    TransportCommands and learns what happened through TransportEvents:

      Commands In                         Events Out
        CreateOffer(peer)         ──►       OfferCreated(peer, sdp)
        AcceptOffer(peer, sdp)    ──►       AnswerCreated(peer, sdp)
        AcceptAnswer(peer, sdp)             LocalCandidate(peer, candidate)
        AddCandidate(peer, cand)            Connected(peer)
        Send { peer, bytes }                ChannelOpen(peer)
        Close(peer)                         Data(peer, bytes)
                                            Closed(peer)

    Commands for one transport are handled in order. `Close` is local and
    produces no `Closed` event; `Closed` means the link failed or the remote
    went away.
*/

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::oneshot;

use super::types::PeerId;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("No link to peer {0}")]
    UnknownPeer(PeerId),

    #[error("Malformed negotiation payload: {0}")]
    BadDescription(String),

    #[error("I/O error: {0}")]
    Io(String),

    #[error("Frame of {size} bytes exceeds limit of {limit}")]
    FrameTooLarge { size: usize, limit: usize },
}

#[derive(Debug)]
pub enum TransportCommand {
    CreateOffer(PeerId),
    AcceptOffer(PeerId, String),
    AcceptAnswer(PeerId, String),
    AddCandidate(PeerId, String),
    Send {
        peer_id: PeerId,
        bytes: Vec<u8>,
        /// Completes once the frame has been written (or failed)
        sent_tx: Option<oneshot::Sender<Result<(), TransportError>>>,
    },
    Close(PeerId),
}

impl TransportCommand {
    pub fn peer_id(&self) -> &PeerId {
        match self {
            TransportCommand::CreateOffer(p)
            | TransportCommand::AcceptOffer(p, _)
            | TransportCommand::AcceptAnswer(p, _)
            | TransportCommand::AddCandidate(p, _)
            | TransportCommand::Close(p) => p,
            TransportCommand::Send { peer_id, .. } => peer_id,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    OfferCreated(PeerId, String),
    AnswerCreated(PeerId, String),
    LocalCandidate(PeerId, String),
    Connected(PeerId),
    ChannelOpen(PeerId),
    Data(PeerId, Vec<u8>),
    Closed(PeerId),
}

impl TransportEvent {
    pub fn peer_id(&self) -> &PeerId {
        match self {
            TransportEvent::OfferCreated(p, _)
            | TransportEvent::AnswerCreated(p, _)
            | TransportEvent::LocalCandidate(p, _)
            | TransportEvent::Connected(p)
            | TransportEvent::ChannelOpen(p)
            | TransportEvent::Data(p, _)
            | TransportEvent::Closed(p) => p,
        }
    }
}

/// A peer-link implementation driven by the mesh node
///
/// Implementations report progress on the event channel they were built with.
/// An `Err` from `handle_command` is logged by the caller; if the link can no
/// longer make progress the implementation should also emit `Closed`.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    async fn handle_command(&self, command: TransportCommand) -> Result<(), TransportError>;
}
