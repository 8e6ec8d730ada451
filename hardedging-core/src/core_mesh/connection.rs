/*
    PeerConnection - negotiation state machine for one remote peer

    A pure transition function: (state, event) -> (state', effects). No I/O;
    the SessionManager turns effects into signaling and transport commands.

    Initiator: Idle ─LocalOffer─► OfferCreated ─SignalSent─► OfferSent
               ─SignalFlushed─► AwaitingAnswer ─Connected─► Established
               ─ChannelOpen─► ChannelOpen

    Responder: Idle ─RemoteOffer─► OfferReceived ─LocalAnswer─► AnswerCreated
               ─SignalSent─► AnswerSent ─Connected─► Established
               ─ChannelOpen─► ChannelOpen

    Any state ─Closed / LocalClose─► Closed (terminal).

    Remote candidates are applied once a remote description is set and
    buffered until then. Glare (an offer arriving while ours is out) is
    settled by `polite`: the polite side drops its offer and answers.
*/

use tracing::{debug, trace};

use crate::core_rendezvous::protocol::SignalPayload;

use super::types::PeerId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    Idle,
    OfferCreated,
    OfferSent,
    AwaitingAnswer,
    OfferReceived,
    AnswerCreated,
    AnswerSent,
    /// Link up, channel-open pending
    Established,
    ChannelOpen,
    Closed,
}

impl ConnectionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionState::Idle => "idle",
            ConnectionState::OfferCreated => "offer_created",
            ConnectionState::OfferSent => "offer_sent",
            ConnectionState::AwaitingAnswer => "awaiting_answer",
            ConnectionState::OfferReceived => "offer_received",
            ConnectionState::AnswerCreated => "answer_created",
            ConnectionState::AnswerSent => "answer_sent",
            ConnectionState::Established => "established",
            ConnectionState::ChannelOpen => "channel_open",
            ConnectionState::Closed => "closed",
        }
    }

    fn has_local_offer(&self) -> bool {
        matches!(
            self,
            ConnectionState::OfferCreated | ConnectionState::OfferSent | ConnectionState::AwaitingAnswer
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Initiator,
    Responder,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    /// Start negotiating as the offering side
    Initiate,
    LocalOffer(String),
    LocalAnswer(String),
    /// Our offer or answer was handed to the relay
    SignalSent,
    /// The relay connection has written it
    SignalFlushed,
    RemoteOffer(String),
    RemoteAnswer(String),
    RemoteCandidate(String),
    LocalCandidate(String),
    Connected,
    ChannelOpen,
    /// The link failed or the remote closed it
    Closed,
    /// We are tearing the session down
    LocalClose,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEffect {
    CreateOffer,
    SendSignal(SignalPayload),
    AcceptOffer(String),
    AcceptAnswer(String),
    AddCandidate(String),
    /// Discard our own pending offer
    Rollback,
    ChannelReady,
    CloseTransport,
    Cleanup,
}

#[derive(Debug)]
pub struct PeerConnection {
    peer_id: PeerId,
    role: Role,
    state: ConnectionState,
    polite: bool,
    remote_description_set: bool,
    pending_candidates: Vec<String>,
    was_open: bool,
}

impl PeerConnection {
    /// `polite` is true when this side yields in glare
    pub fn new(peer_id: PeerId, role: Role, polite: bool) -> Self {
        PeerConnection {
            peer_id,
            role,
            state: ConnectionState::Idle,
            polite,
            remote_description_set: false,
            pending_candidates: Vec::new(),
            was_open: false,
        }
    }

    pub fn peer_id(&self) -> &PeerId {
        &self.peer_id
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn is_open(&self) -> bool {
        self.state == ConnectionState::ChannelOpen
    }

    pub fn is_closed(&self) -> bool {
        self.state == ConnectionState::Closed
    }

    /// Whether the channel ever opened
    pub fn was_open(&self) -> bool {
        self.was_open
    }

    pub fn buffered_candidates(&self) -> usize {
        self.pending_candidates.len()
    }

    pub fn apply(&mut self, event: ConnectionEvent) -> Vec<ConnectionEffect> {
        use ConnectionEffect as Fx;
        use ConnectionState as S;

        if self.state == S::Closed {
            trace!(peer_id = %self.peer_id, ?event, "Ignoring event on closed connection");
            return Vec::new();
        }

        let before = self.state;
        let effects = match (self.state, event) {
            (S::Idle, ConnectionEvent::Initiate) => {
                self.role = Role::Initiator;
                vec![Fx::CreateOffer]
            }
            (S::Idle, ConnectionEvent::LocalOffer(sdp)) if self.role == Role::Initiator => {
                self.state = S::OfferCreated;
                vec![Fx::SendSignal(SignalPayload::Offer { sdp })]
            }
            (S::OfferCreated, ConnectionEvent::SignalSent) => {
                self.state = S::OfferSent;
                Vec::new()
            }
            (S::OfferSent, ConnectionEvent::SignalFlushed) => {
                self.state = S::AwaitingAnswer;
                Vec::new()
            }

            (S::Idle, ConnectionEvent::RemoteOffer(sdp)) => {
                self.role = Role::Responder;
                self.accept_offer(sdp, Vec::new())
            }
            (state, ConnectionEvent::RemoteOffer(sdp)) if state.has_local_offer() => {
                if self.polite {
                    debug!(peer_id = %self.peer_id, "Offer collision, yielding");
                    self.role = Role::Responder;
                    self.accept_offer(sdp, vec![Fx::Rollback])
                } else {
                    debug!(peer_id = %self.peer_id, "Offer collision, keeping our offer");
                    Vec::new()
                }
            }
            (S::OfferReceived, ConnectionEvent::LocalAnswer(sdp)) => {
                self.state = S::AnswerCreated;
                vec![Fx::SendSignal(SignalPayload::Answer { sdp })]
            }
            (S::AnswerCreated, ConnectionEvent::SignalSent) => {
                self.state = S::AnswerSent;
                Vec::new()
            }

            (S::OfferSent | S::AwaitingAnswer, ConnectionEvent::RemoteAnswer(sdp)) => {
                self.state = S::AwaitingAnswer;
                self.remote_description_set = true;
                let mut effects = vec![Fx::AcceptAnswer(sdp)];
                effects.extend(self.drain_candidates());
                effects
            }

            (_, ConnectionEvent::RemoteCandidate(candidate)) => {
                if self.remote_description_set {
                    vec![Fx::AddCandidate(candidate)]
                } else {
                    trace!(peer_id = %self.peer_id, "Buffering remote candidate");
                    self.pending_candidates.push(candidate);
                    Vec::new()
                }
            }
            (_, ConnectionEvent::LocalCandidate(candidate)) => {
                vec![Fx::SendSignal(SignalPayload::Candidate { candidate })]
            }

            (S::Established | S::ChannelOpen, ConnectionEvent::Connected) => Vec::new(),
            (_, ConnectionEvent::Connected) if self.remote_description_set => {
                self.state = S::Established;
                Vec::new()
            }
            (S::ChannelOpen, ConnectionEvent::ChannelOpen) => Vec::new(),
            (_, ConnectionEvent::ChannelOpen) if self.remote_description_set => {
                self.state = S::ChannelOpen;
                self.was_open = true;
                vec![Fx::ChannelReady]
            }

            (_, ConnectionEvent::Closed) => {
                self.state = S::Closed;
                vec![Fx::Cleanup]
            }
            (_, ConnectionEvent::LocalClose) => {
                self.state = S::Closed;
                vec![Fx::CloseTransport, Fx::Cleanup]
            }

            (state, event) => {
                trace!(peer_id = %self.peer_id, state = state.as_str(), ?event, "Event not valid in state");
                Vec::new()
            }
        };

        if before != self.state {
            debug!(
                peer_id = %self.peer_id,
                from = before.as_str(),
                to = self.state.as_str(),
                "Connection state change"
            );
        }
        effects
    }

    fn accept_offer(&mut self, sdp: String, mut effects: Vec<ConnectionEffect>) -> Vec<ConnectionEffect> {
        self.state = ConnectionState::OfferReceived;
        self.remote_description_set = true;
        effects.push(ConnectionEffect::AcceptOffer(sdp));
        effects.extend(self.drain_candidates());
        effects
    }

    fn drain_candidates(&mut self) -> impl Iterator<Item = ConnectionEffect> + '_ {
        self.pending_candidates.drain(..).map(ConnectionEffect::AddCandidate)
    }
}
