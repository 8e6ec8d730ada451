/*
  SessionManager

  Owns one PeerConnection per remote peer and turns rendezvous signaling and
  transport progress into connection events, and connection effects into
  SessionActions the mesh node carries out.

  Workflow:
  1. peer-joined(p): we learned of p after it joined, so we offer (initiate).
  2. peers snapshot: those peers will offer to us; register them as responders.
  3. signal(from, offer|answer|candidate): feed the matching state machine.
  4. Transport events (offer/answer created, candidates, connected, channel
     open, closed) advance the machine for that peer.
  5. A machine reaching Closed is removed; the node runs cleanup.

  Inputs:
    - SignalingEvent-derived calls (initiate, register_responder, handle_signal, close)
    - TransportEvent (except Data, which the node routes to the asset protocol)
    - signal_flushed(p), negotiation_expired(p, generation)

  Outputs:
    - SessionAction::Signal       payload to relay to p
    - SessionAction::Transport    command for the transport
    - SessionAction::Opened       channel to p is open
    - SessionAction::Closed       session removed (was_open tells if it ever opened)
    - SessionAction::ArmNegotiationTimer
*/

use std::collections::HashMap;
use tracing::{debug, info, trace};

use super::connection::{ConnectionEffect, ConnectionEvent, ConnectionState, PeerConnection, Role};
use super::metrics;
use super::transport::{TransportCommand, TransportEvent};
use super::types::PeerId;
use crate::core_rendezvous::protocol::SignalPayload;

#[derive(Debug)]
pub enum SessionAction {
    Signal {
        to: PeerId,
        payload: SignalPayload,
        /// Report back through `signal_flushed` once written
        track_flush: bool,
    },
    Transport(TransportCommand),
    Opened(PeerId),
    Closed {
        peer_id: PeerId,
        was_open: bool,
    },
    ArmNegotiationTimer {
        peer_id: PeerId,
        generation: u64,
    },
}

struct Session {
    connection: PeerConnection,
    generation: u64,
}

pub struct SessionManager {
    local_id: Option<PeerId>,
    sessions: HashMap<PeerId, Session>,
    next_generation: u64,
}

impl SessionManager {
    pub fn new() -> Self {
        SessionManager { local_id: None, sessions: HashMap::new(), next_generation: 1 }
    }

    pub fn set_local_id(&mut self, peer_id: PeerId) {
        self.local_id = Some(peer_id);
    }

    pub fn local_id(&self) -> Option<&PeerId> {
        self.local_id.as_ref()
    }

    /// Start an offer towards `peer_id`
    pub fn initiate(&mut self, peer_id: &PeerId) -> Vec<SessionAction> {
        if self.is_self(peer_id) {
            return Vec::new();
        }
        let mut actions = Vec::new();
        if !self.sessions.contains_key(peer_id) {
            actions.push(self.create(peer_id, Role::Initiator));
        }
        let effects = match self.sessions.get_mut(peer_id) {
            Some(session) if session.connection.state() == ConnectionState::Idle => {
                session.connection.apply(ConnectionEvent::Initiate)
            }
            _ => return actions,
        };
        actions.extend(self.dispatch(peer_id, effects));
        actions
    }

    /// Expect an offer from `peer_id`
    pub fn register_responder(&mut self, peer_id: &PeerId) -> Vec<SessionAction> {
        if self.is_self(peer_id) || self.sessions.contains_key(peer_id) {
            return Vec::new();
        }
        vec![self.create(peer_id, Role::Responder)]
    }

    /// A relayed signaling payload from `from`; malformed payloads are dropped
    pub fn handle_signal(&mut self, from: &PeerId, payload: serde_json::Value) -> Vec<SessionAction> {
        let Some(payload) = SignalPayload::from_value(payload) else {
            debug!(peer_id = %from, "Dropping malformed signal payload");
            metrics::signal_noise();
            return Vec::new();
        };
        if self.is_self(from) {
            return Vec::new();
        }

        let mut actions = Vec::new();
        let event = match payload {
            SignalPayload::Offer { sdp } => {
                if !self.sessions.contains_key(from) {
                    actions.push(self.create(from, Role::Responder));
                }
                ConnectionEvent::RemoteOffer(sdp)
            }
            SignalPayload::Answer { sdp } => ConnectionEvent::RemoteAnswer(sdp),
            SignalPayload::Candidate { candidate } => ConnectionEvent::RemoteCandidate(candidate),
        };
        actions.extend(self.apply(from, event));
        actions
    }

    /// Advance a session from transport progress; `Data` is not handled here
    pub fn handle_transport_event(&mut self, event: TransportEvent) -> Vec<SessionAction> {
        let (peer_id, event) = match event {
            TransportEvent::OfferCreated(p, sdp) => (p, ConnectionEvent::LocalOffer(sdp)),
            TransportEvent::AnswerCreated(p, sdp) => (p, ConnectionEvent::LocalAnswer(sdp)),
            TransportEvent::LocalCandidate(p, c) => (p, ConnectionEvent::LocalCandidate(c)),
            TransportEvent::Connected(p) => (p, ConnectionEvent::Connected),
            TransportEvent::ChannelOpen(p) => (p, ConnectionEvent::ChannelOpen),
            TransportEvent::Closed(p) => (p, ConnectionEvent::Closed),
            TransportEvent::Data(p, _) => {
                trace!(peer_id = %p, "Data is routed by the node, not the session manager");
                return Vec::new();
            }
        };
        self.apply(&peer_id, event)
    }

    pub fn signal_flushed(&mut self, peer_id: &PeerId) -> Vec<SessionAction> {
        self.apply(peer_id, ConnectionEvent::SignalFlushed)
    }

    /// Tear down the session with `peer_id`
    pub fn close(&mut self, peer_id: &PeerId) -> Vec<SessionAction> {
        self.apply(peer_id, ConnectionEvent::LocalClose)
    }

    pub fn close_all(&mut self) -> Vec<SessionAction> {
        let peers: Vec<PeerId> = self.sessions.keys().cloned().collect();
        peers.iter().flat_map(|p| self.close(p)).collect()
    }

    /// Close the session if it is the same one the timer was armed for and it never opened
    pub fn negotiation_expired(&mut self, peer_id: &PeerId, generation: u64) -> Vec<SessionAction> {
        match self.sessions.get(peer_id) {
            Some(s) if s.generation == generation && !s.connection.is_open() => {
                info!(peer_id = %peer_id, state = s.connection.state().as_str(), "Negotiation timed out");
                self.close(peer_id)
            }
            _ => Vec::new(),
        }
    }

    pub fn state(&self, peer_id: &PeerId) -> Option<ConnectionState> {
        self.sessions.get(peer_id).map(|s| s.connection.state())
    }

    pub fn is_open(&self, peer_id: &PeerId) -> bool {
        self.sessions.get(peer_id).is_some_and(|s| s.connection.is_open())
    }

    /// Peers with an open channel, sorted
    pub fn open_peers(&self) -> Vec<PeerId> {
        let mut peers: Vec<PeerId> =
            self.sessions.values().filter(|s| s.connection.is_open()).map(|s| s.connection.peer_id().clone()).collect();
        peers.sort();
        peers
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    fn is_self(&self, peer_id: &PeerId) -> bool {
        self.local_id.as_ref() == Some(peer_id)
    }

    fn create(&mut self, peer_id: &PeerId, role: Role) -> SessionAction {
        // The side whose id sorts higher yields in glare.
        let polite = self.local_id.as_ref().is_some_and(|local| local > peer_id);
        let generation = self.next_generation;
        self.next_generation += 1;

        debug!(peer_id = %peer_id, ?role, polite, "Creating session");
        self.sessions.insert(
            peer_id.clone(),
            Session { connection: PeerConnection::new(peer_id.clone(), role, polite), generation },
        );
        SessionAction::ArmNegotiationTimer { peer_id: peer_id.clone(), generation }
    }

    fn apply(&mut self, peer_id: &PeerId, event: ConnectionEvent) -> Vec<SessionAction> {
        let Some(session) = self.sessions.get_mut(peer_id) else {
            trace!(peer_id = %peer_id, ?event, "No session for event");
            return Vec::new();
        };
        let effects = session.connection.apply(event);
        self.dispatch(peer_id, effects)
    }

    fn dispatch(&mut self, peer_id: &PeerId, effects: Vec<ConnectionEffect>) -> Vec<SessionAction> {
        let mut actions = Vec::new();
        for effect in effects {
            match effect {
                ConnectionEffect::CreateOffer => {
                    actions.push(SessionAction::Transport(TransportCommand::CreateOffer(peer_id.clone())));
                }
                ConnectionEffect::SendSignal(payload) => {
                    let negotiation = !matches!(payload, SignalPayload::Candidate { .. });
                    let track_flush = matches!(payload, SignalPayload::Offer { .. });
                    actions.push(SessionAction::Signal { to: peer_id.clone(), payload, track_flush });
                    if negotiation {
                        actions.extend(self.apply(peer_id, ConnectionEvent::SignalSent));
                    }
                }
                ConnectionEffect::AcceptOffer(sdp) => {
                    actions.push(SessionAction::Transport(TransportCommand::AcceptOffer(peer_id.clone(), sdp)));
                }
                ConnectionEffect::AcceptAnswer(sdp) => {
                    actions.push(SessionAction::Transport(TransportCommand::AcceptAnswer(peer_id.clone(), sdp)));
                }
                ConnectionEffect::AddCandidate(candidate) => {
                    actions.push(SessionAction::Transport(TransportCommand::AddCandidate(
                        peer_id.clone(),
                        candidate,
                    )));
                }
                ConnectionEffect::Rollback | ConnectionEffect::CloseTransport => {
                    actions.push(SessionAction::Transport(TransportCommand::Close(peer_id.clone())));
                }
                ConnectionEffect::ChannelReady => {
                    info!(peer_id = %peer_id, "Peer channel open");
                    actions.push(SessionAction::Opened(peer_id.clone()));
                }
                ConnectionEffect::Cleanup => {
                    if let Some(session) = self.sessions.remove(peer_id) {
                        let was_open = session.connection.was_open();
                        metrics::session_closed(was_open);
                        info!(peer_id = %peer_id, was_open, "Peer session closed");
                        actions.push(SessionAction::Closed { peer_id: peer_id.clone(), was_open });
                    }
                }
            }
        }
        actions
    }
}

impl Default for SessionManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn manager(local: &str) -> SessionManager {
        let mut m = SessionManager::new();
        m.set_local_id(PeerId::new(local));
        m
    }

    fn p(s: &str) -> PeerId {
        PeerId::new(s)
    }

    fn transport_commands(actions: &[SessionAction]) -> Vec<&TransportCommand> {
        actions
            .iter()
            .filter_map(|a| match a {
                SessionAction::Transport(cmd) => Some(cmd),
                _ => None,
            })
            .collect()
    }

    fn signals(actions: &[SessionAction]) -> Vec<(&PeerId, &SignalPayload, bool)> {
        actions
            .iter()
            .filter_map(|a| match a {
                SessionAction::Signal { to, payload, track_flush } => Some((to, payload, *track_flush)),
                _ => None,
            })
            .collect()
    }

    /// Drive an initiator and a responder against each other in memory
    #[test]
    fn test_full_negotiation_between_two_managers() {
        let mut a = manager("peer_a");
        let mut b = manager("peer_b");

        // b joined after a: a hears peer-joined(b), b gets snapshot [a].
        let actions = a.initiate(&p("peer_b"));
        assert!(matches!(actions[0], SessionAction::ArmNegotiationTimer { .. }));
        assert!(matches!(transport_commands(&actions)[..], [TransportCommand::CreateOffer(_)]));
        b.register_responder(&p("peer_a"));

        let actions = a.handle_transport_event(TransportEvent::OfferCreated(p("peer_b"), "offer".into()));
        let sent = signals(&actions);
        assert_eq!(sent.len(), 1);
        assert!(sent[0].2, "offers are flush-tracked");
        assert_eq!(a.state(&p("peer_b")), Some(ConnectionState::OfferSent));
        a.signal_flushed(&p("peer_b"));
        assert_eq!(a.state(&p("peer_b")), Some(ConnectionState::AwaitingAnswer));

        let actions = b.handle_signal(&p("peer_a"), json!({"type":"offer","sdp":"offer"}));
        assert!(matches!(
            transport_commands(&actions)[..],
            [TransportCommand::AcceptOffer(_, sdp)] if sdp == "offer"
        ));
        let actions = b.handle_transport_event(TransportEvent::AnswerCreated(p("peer_a"), "answer".into()));
        assert_eq!(signals(&actions).len(), 1);
        assert_eq!(b.state(&p("peer_a")), Some(ConnectionState::AnswerSent));

        let actions = a.handle_signal(&p("peer_b"), json!({"type":"answer","sdp":"answer"}));
        assert!(matches!(transport_commands(&actions)[..], [TransportCommand::AcceptAnswer(_, _)]));

        for (m, peer) in [(&mut a, "peer_b"), (&mut b, "peer_a")] {
            m.handle_transport_event(TransportEvent::Connected(p(peer)));
            let actions = m.handle_transport_event(TransportEvent::ChannelOpen(p(peer)));
            assert!(matches!(&actions[..], [SessionAction::Opened(id)] if id == &p(peer)));
        }
        assert_eq!(a.open_peers(), vec![p("peer_b")]);
        assert_eq!(b.open_peers(), vec![p("peer_a")]);
    }

    #[test]
    fn test_offer_from_unknown_peer_creates_responder() {
        let mut m = manager("peer_a");
        let actions = m.handle_signal(&p("peer_x"), json!({"type":"offer","sdp":"o"}));
        assert!(matches!(actions[0], SessionAction::ArmNegotiationTimer { .. }));
        assert_eq!(m.state(&p("peer_x")), Some(ConnectionState::OfferReceived));
    }

    #[test]
    fn test_answer_or_candidate_from_unknown_peer_ignored() {
        let mut m = manager("peer_a");
        assert!(m.handle_signal(&p("peer_x"), json!({"type":"answer","sdp":"a"})).is_empty());
        assert!(m.handle_signal(&p("peer_x"), json!({"type":"candidate","candidate":"c"})).is_empty());
        assert_eq!(m.session_count(), 0);
    }

    #[test]
    fn test_malformed_signal_dropped() {
        let mut m = manager("peer_a");
        assert!(m.handle_signal(&p("peer_x"), json!({"type":"bogus"})).is_empty());
        assert!(m.handle_signal(&p("peer_x"), json!("offer")).is_empty());
        assert_eq!(m.session_count(), 0);
    }

    #[test]
    fn test_never_connects_to_self() {
        let mut m = manager("peer_a");
        assert!(m.initiate(&p("peer_a")).is_empty());
        assert!(m.register_responder(&p("peer_a")).is_empty());
        assert_eq!(m.session_count(), 0);
    }

    #[test]
    fn test_glare_resolved_by_id_order() {
        // peer_b sorts higher than peer_a, so peer_b yields.
        let mut a = manager("peer_a");
        let mut b = manager("peer_b");
        a.initiate(&p("peer_b"));
        b.initiate(&p("peer_a"));
        a.handle_transport_event(TransportEvent::OfferCreated(p("peer_b"), "from_a".into()));
        b.handle_transport_event(TransportEvent::OfferCreated(p("peer_a"), "from_b".into()));

        let a_actions = a.handle_signal(&p("peer_b"), json!({"type":"offer","sdp":"from_b"}));
        assert!(transport_commands(&a_actions).is_empty());
        assert_eq!(a.state(&p("peer_b")), Some(ConnectionState::OfferSent));

        let b_actions = b.handle_signal(&p("peer_a"), json!({"type":"offer","sdp":"from_a"}));
        assert!(matches!(
            transport_commands(&b_actions)[..],
            [TransportCommand::Close(_), TransportCommand::AcceptOffer(_, sdp)] if sdp == "from_a"
        ));
        assert_eq!(b.state(&p("peer_a")), Some(ConnectionState::OfferReceived));
    }

    #[test]
    fn test_transport_close_removes_session() {
        let mut m = manager("peer_a");
        m.register_responder(&p("peer_b"));
        m.handle_signal(&p("peer_b"), json!({"type":"offer","sdp":"o"}));
        m.handle_transport_event(TransportEvent::Connected(p("peer_b")));
        m.handle_transport_event(TransportEvent::ChannelOpen(p("peer_b")));

        let actions = m.handle_transport_event(TransportEvent::Closed(p("peer_b")));
        assert!(matches!(&actions[..], [SessionAction::Closed { was_open: true, .. }]));
        assert_eq!(m.state(&p("peer_b")), None);
        assert!(m.open_peers().is_empty());
    }

    #[test]
    fn test_local_close_closes_transport_then_reports() {
        let mut m = manager("peer_a");
        m.register_responder(&p("peer_b"));
        let actions = m.close(&p("peer_b"));
        assert!(matches!(
            &actions[..],
            [SessionAction::Transport(TransportCommand::Close(_)), SessionAction::Closed { was_open: false, .. }]
        ));
    }

    #[test]
    fn test_negotiation_timeout_respects_generation() {
        let mut m = manager("peer_a");
        let generation = match &m.register_responder(&p("peer_b"))[0] {
            SessionAction::ArmNegotiationTimer { generation, .. } => *generation,
            other => panic!("unexpected {other:?}"),
        };

        assert!(m.negotiation_expired(&p("peer_b"), generation + 100).is_empty());
        let actions = m.negotiation_expired(&p("peer_b"), generation);
        assert!(actions.iter().any(|a| matches!(a, SessionAction::Closed { .. })));

        // A new session for the same peer is not hit by the old timer.
        m.register_responder(&p("peer_b"));
        assert!(m.negotiation_expired(&p("peer_b"), generation).is_empty());
        assert_eq!(m.session_count(), 1);
    }

    #[test]
    fn test_open_session_survives_timer() {
        let mut m = manager("peer_a");
        m.register_responder(&p("peer_b"));
        m.handle_signal(&p("peer_b"), json!({"type":"offer","sdp":"o"}));
        m.handle_transport_event(TransportEvent::ChannelOpen(p("peer_b")));
        assert!(m.negotiation_expired(&p("peer_b"), 1).is_empty());
        assert!(m.is_open(&p("peer_b")));
    }

    #[test]
    fn test_close_all() {
        let mut m = manager("peer_a");
        m.register_responder(&p("peer_b"));
        m.register_responder(&p("peer_c"));
        let closed = m
            .close_all()
            .into_iter()
            .filter(|a| matches!(a, SessionAction::Closed { .. }))
            .count();
        assert_eq!(closed, 2);
        assert_eq!(m.session_count(), 0);
    }
}
