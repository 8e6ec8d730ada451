/*
  TcpTransport - peer links over plain TCP

  A native stand-in for a browser data channel. Negotiation is carried over
  the relay like any other offer/answer exchange:

    offerer                                   answerer
    CreateOffer(p)
      bind 127.0.0.1:0, new session token
      ─► OfferCreated  "hardedging-tcp/1 session=<token>"
      ─► LocalCandidate "tcp <ip>:<port>"
                                              AcceptOffer(p, offer)
                                                ─► AnswerCreated (same token)
                                              AddCandidate(p, "tcp ip:port")
                                                dial, send token frame
    accept, verify token frame
    AcceptAnswer(p, answer)
    once both the answer and a verified socket are in:
      ─► Connected, ChannelOpen                 ─► Connected, ChannelOpen

  Every message is one frame: 4-byte big-endian length prefix + payload.
  Frames above `max_frame_size` close the link.

  Links are keyed by peer and stamped with a connection id, so a reader from
  a replaced link never reports `Closed` for its successor. `Close` is local
  and silent; `Closed` is only emitted when the socket dies.
*/

use async_trait::async_trait;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::AbortHandle;
use tracing::{debug, trace, warn};

use super::transport::{Transport, TransportCommand, TransportError, TransportEvent};
use super::types::PeerId;
use crate::config::TransportConfig;

const SESSION_PREFIX: &str = "hardedging-tcp/1 session=";
const CANDIDATE_PREFIX: &str = "tcp ";
/// Handshake frames only carry a session token
const MAX_HANDSHAKE_FRAME: usize = 256;

struct Outbound {
    bytes: Vec<u8>,
    sent_tx: Option<oneshot::Sender<Result<(), TransportError>>>,
}

enum Side {
    Offerer {
        answer_applied: bool,
        /// Dialed-in socket that proved the token, waiting for the answer
        verified: Option<TcpStream>,
    },
    Answerer {
        dialing: bool,
    },
}

struct Link {
    conn_id: u64,
    token: String,
    side: Side,
    outbound: Option<mpsc::UnboundedSender<Outbound>>,
    tasks: Vec<AbortHandle>,
}

impl Link {
    fn abort(self) {
        for task in self.tasks {
            task.abort();
        }
    }
}

struct Shared {
    links: Mutex<HashMap<PeerId, Link>>,
    next_conn_id: AtomicU64,
    event_tx: mpsc::Sender<TransportEvent>,
    config: TransportConfig,
}

impl Shared {
    async fn emit(&self, event: TransportEvent) {
        if let Err(e) = self.event_tx.send(event).await {
            debug!("Transport event dropped, receiver gone: {}", e);
        }
    }

    /// Drop the link if it is still `conn_id` and report it closed
    async fn fail_link(&self, peer_id: &PeerId, conn_id: u64) {
        let removed = {
            let mut links = self.links.lock().await;
            match links.get(peer_id) {
                Some(link) if link.conn_id == conn_id => links.remove(peer_id),
                _ => None,
            }
        };
        if removed.is_some() {
            self.emit(TransportEvent::Closed(peer_id.clone())).await;
        }
    }
}

pub struct TcpTransport {
    shared: Arc<Shared>,
}

impl TcpTransport {
    pub fn new(config: TransportConfig, event_tx: mpsc::Sender<TransportEvent>) -> Self {
        TcpTransport {
            shared: Arc::new(Shared {
                links: Mutex::new(HashMap::new()),
                next_conn_id: AtomicU64::new(1),
                event_tx,
                config,
            }),
        }
    }

    /// Number of peers with a link in any stage
    pub async fn link_count(&self) -> usize {
        self.shared.links.lock().await.len()
    }

    fn next_conn_id(&self) -> u64 {
        self.shared.next_conn_id.fetch_add(1, Ordering::SeqCst)
    }

    async fn handle_create_offer(&self, peer_id: PeerId) -> Result<(), TransportError> {
        let config = &self.shared.config;
        let listener = TcpListener::bind(SocketAddr::new(config.listen_host, 0))
            .await
            .map_err(|e| TransportError::Io(format!("Failed to bind offer listener: {}", e)))?;
        let port = listener.local_addr().map_err(|e| TransportError::Io(e.to_string()))?.port();
        let advertised = SocketAddr::new(config.advertise_host.unwrap_or(config.listen_host), port);

        let token = uuid::Uuid::new_v4().simple().to_string();
        let conn_id = self.next_conn_id();
        {
            let mut links = self.shared.links.lock().await;
            let accept = tokio::spawn(accept_loop(
                self.shared.clone(),
                peer_id.clone(),
                conn_id,
                listener,
                token.clone(),
            ));
            let link = Link {
                conn_id,
                token: token.clone(),
                side: Side::Offerer { answer_applied: false, verified: None },
                outbound: None,
                tasks: vec![accept.abort_handle()],
            };
            if let Some(old) = links.insert(peer_id.clone(), link) {
                old.abort();
            }
        }
        debug!(peer_id = %peer_id, %advertised, "Offer listener ready");

        self.shared.emit(TransportEvent::OfferCreated(peer_id.clone(), session_description(&token))).await;
        self.shared
            .emit(TransportEvent::LocalCandidate(peer_id, format!("{}{}", CANDIDATE_PREFIX, advertised)))
            .await;
        Ok(())
    }

    async fn handle_accept_offer(&self, peer_id: PeerId, sdp: String) -> Result<(), TransportError> {
        let token = parse_session(&sdp).ok_or_else(|| TransportError::BadDescription(sdp.clone()))?.to_string();
        let conn_id = self.next_conn_id();
        {
            let mut links = self.shared.links.lock().await;
            let link = Link {
                conn_id,
                token: token.clone(),
                side: Side::Answerer { dialing: false },
                outbound: None,
                tasks: Vec::new(),
            };
            if let Some(old) = links.insert(peer_id.clone(), link) {
                old.abort();
            }
        }
        self.shared.emit(TransportEvent::AnswerCreated(peer_id, session_description(&token))).await;
        Ok(())
    }

    async fn handle_accept_answer(&self, peer_id: PeerId, sdp: String) -> Result<(), TransportError> {
        let (conn_id, stream) = {
            let mut links = self.shared.links.lock().await;
            let link = links.get_mut(&peer_id).ok_or_else(|| TransportError::UnknownPeer(peer_id.clone()))?;
            if parse_session(&sdp) != Some(link.token.as_str()) {
                return Err(TransportError::BadDescription(format!("answer does not match offer: {}", sdp)));
            }
            let Side::Offerer { answer_applied, verified } = &mut link.side else {
                return Err(TransportError::BadDescription("answer for a link we did not offer".to_string()));
            };
            *answer_applied = true;
            (link.conn_id, verified.take())
        };

        if let Some(stream) = stream {
            open_channel(self.shared.clone(), peer_id, conn_id, stream).await;
        }
        Ok(())
    }

    async fn handle_add_candidate(&self, peer_id: PeerId, candidate: String) -> Result<(), TransportError> {
        let addr = parse_candidate(&candidate).ok_or_else(|| TransportError::BadDescription(candidate.clone()))?;

        let mut links = self.shared.links.lock().await;
        let link = links.get_mut(&peer_id).ok_or_else(|| TransportError::UnknownPeer(peer_id.clone()))?;
        match &mut link.side {
            // The offerer listens; the answerer's address is never needed.
            Side::Offerer { .. } => return Ok(()),
            Side::Answerer { dialing: true } => return Ok(()),
            Side::Answerer { dialing } => *dialing = true,
        }

        let dial = tokio::spawn(dial(self.shared.clone(), peer_id, link.conn_id, addr, link.token.clone()));
        link.tasks.push(dial.abort_handle());
        Ok(())
    }

    async fn handle_send(
        &self,
        peer_id: PeerId,
        bytes: Vec<u8>,
        sent_tx: Option<oneshot::Sender<Result<(), TransportError>>>,
    ) -> Result<(), TransportError> {
        let fail = |sent_tx: Option<oneshot::Sender<Result<(), TransportError>>>, err: TransportError| {
            if let Some(tx) = sent_tx {
                let _ = tx.send(Err(err.clone()));
            }
            Err(err)
        };

        let limit = self.shared.config.max_frame_size;
        if bytes.len() > limit {
            return fail(sent_tx, TransportError::FrameTooLarge { size: bytes.len(), limit });
        }

        let outbound = self.shared.links.lock().await.get(&peer_id).and_then(|l| l.outbound.clone());
        let Some(outbound) = outbound else {
            return fail(sent_tx, TransportError::UnknownPeer(peer_id));
        };
        outbound.send(Outbound { bytes, sent_tx }).map_err(|mpsc::error::SendError(rejected)| {
            let err = TransportError::Io("link writer stopped".to_string());
            if let Some(tx) = rejected.sent_tx {
                let _ = tx.send(Err(err.clone()));
            }
            err
        })
    }

    async fn handle_close(&self, peer_id: PeerId) -> Result<(), TransportError> {
        if let Some(link) = self.shared.links.lock().await.remove(&peer_id) {
            trace!(peer_id = %peer_id, "Closing link");
            link.abort();
        }
        Ok(())
    }
}

#[async_trait]
impl Transport for TcpTransport {
    async fn handle_command(&self, command: TransportCommand) -> Result<(), TransportError> {
        match command {
            TransportCommand::CreateOffer(peer_id) => self.handle_create_offer(peer_id).await,
            TransportCommand::AcceptOffer(peer_id, sdp) => self.handle_accept_offer(peer_id, sdp).await,
            TransportCommand::AcceptAnswer(peer_id, sdp) => self.handle_accept_answer(peer_id, sdp).await,
            TransportCommand::AddCandidate(peer_id, c) => self.handle_add_candidate(peer_id, c).await,
            TransportCommand::Send { peer_id, bytes, sent_tx } => self.handle_send(peer_id, bytes, sent_tx).await,
            TransportCommand::Close(peer_id) => self.handle_close(peer_id).await,
        }
    }
}

async fn accept_loop(shared: Arc<Shared>, peer_id: PeerId, conn_id: u64, listener: TcpListener, token: String) {
    loop {
        let (mut socket, remote) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                warn!(peer_id = %peer_id, "Failed to accept peer link: {}", e);
                continue;
            }
        };

        let proof = tokio::time::timeout(
            shared.config.connect_timeout,
            read_frame(&mut socket, MAX_HANDSHAKE_FRAME),
        )
        .await;
        match proof {
            Ok(Ok(Some(frame))) if frame == token.as_bytes() => {}
            _ => {
                debug!(peer_id = %peer_id, %remote, "Rejecting unverified link attempt");
                continue;
            }
        }

        let mut socket = Some(socket);
        {
            let mut links = shared.links.lock().await;
            let Some(link) = links.get_mut(&peer_id).filter(|l| l.conn_id == conn_id) else {
                return;
            };
            if let Side::Offerer { answer_applied: false, verified } = &mut link.side {
                *verified = socket.take();
            }
        }
        if let Some(socket) = socket {
            open_channel(shared, peer_id, conn_id, socket).await;
        }
        return;
    }
}

async fn dial(shared: Arc<Shared>, peer_id: PeerId, conn_id: u64, addr: SocketAddr, token: String) {
    let connected = tokio::time::timeout(shared.config.connect_timeout, TcpStream::connect(addr)).await;
    let mut stream = match connected {
        Ok(Ok(stream)) => stream,
        Ok(Err(e)) => {
            warn!(peer_id = %peer_id, %addr, "Failed to dial peer: {}", e);
            shared.fail_link(&peer_id, conn_id).await;
            return;
        }
        Err(_) => {
            warn!(peer_id = %peer_id, %addr, "Timed out dialing peer");
            shared.fail_link(&peer_id, conn_id).await;
            return;
        }
    };

    if let Err(e) = write_frame(&mut stream, token.as_bytes()).await {
        warn!(peer_id = %peer_id, "Failed to send link handshake: {}", e);
        shared.fail_link(&peer_id, conn_id).await;
        return;
    }
    open_channel(shared, peer_id, conn_id, stream).await;
}

async fn open_channel(shared: Arc<Shared>, peer_id: PeerId, conn_id: u64, stream: TcpStream) {
    let (read_half, write_half) = stream.into_split();
    let (out_tx, out_rx) = mpsc::unbounded_channel();
    let (ready_tx, ready_rx) = oneshot::channel();
    {
        let mut links = shared.links.lock().await;
        let Some(link) = links.get_mut(&peer_id).filter(|l| l.conn_id == conn_id) else {
            return;
        };
        let writer = tokio::spawn(write_loop(write_half, out_rx));
        let reader = tokio::spawn(read_loop(shared.clone(), peer_id.clone(), conn_id, read_half, ready_rx));
        link.outbound = Some(out_tx);
        link.tasks.push(writer.abort_handle());
        link.tasks.push(reader.abort_handle());
    }

    debug!(peer_id = %peer_id, conn_id, "Peer link open");
    shared.emit(TransportEvent::Connected(peer_id.clone())).await;
    shared.emit(TransportEvent::ChannelOpen(peer_id)).await;
    // Data only flows after ChannelOpen has been delivered.
    let _ = ready_tx.send(());
}

async fn read_loop(
    shared: Arc<Shared>,
    peer_id: PeerId,
    conn_id: u64,
    mut reader: OwnedReadHalf,
    ready_rx: oneshot::Receiver<()>,
) {
    if ready_rx.await.is_err() {
        return;
    }
    let limit = shared.config.max_frame_size;
    loop {
        match read_frame(&mut reader, limit).await {
            Ok(Some(frame)) => {
                trace!(peer_id = %peer_id, bytes = frame.len(), "Frame received");
                shared.emit(TransportEvent::Data(peer_id.clone(), frame)).await;
            }
            Ok(None) => {
                debug!(peer_id = %peer_id, "Peer closed link");
                break;
            }
            Err(e) => {
                warn!(peer_id = %peer_id, "Peer link failed: {}", e);
                break;
            }
        }
    }
    shared.fail_link(&peer_id, conn_id).await;
}

async fn write_loop(mut writer: OwnedWriteHalf, mut out_rx: mpsc::UnboundedReceiver<Outbound>) {
    while let Some(Outbound { bytes, sent_tx }) = out_rx.recv().await {
        let result = write_frame(&mut writer, &bytes).await.map_err(|e| TransportError::Io(e.to_string()));
        let failed = result.is_err();
        if let Some(tx) = sent_tx {
            let _ = tx.send(result);
        }
        if failed {
            break;
        }
    }
    let _ = writer.shutdown().await;
}

/// Write one length-prefixed frame
pub async fn write_frame<W>(writer: &mut W, bytes: &[u8]) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let len = u32::try_from(bytes.len())
        .map_err(|_| std::io::Error::new(std::io::ErrorKind::InvalidInput, "frame too large"))?;
    writer.write_all(&len.to_be_bytes()).await?;
    writer.write_all(bytes).await?;
    writer.flush().await
}

/// Read one length-prefixed frame; `Ok(None)` on clean EOF before a frame starts
pub async fn read_frame<R>(reader: &mut R, max_frame_size: usize) -> std::io::Result<Option<Vec<u8>>>
where
    R: AsyncRead + Unpin,
{
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e),
    }

    let len = u32::from_be_bytes(len_buf) as usize;
    if len > max_frame_size {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("frame of {} bytes exceeds limit of {}", len, max_frame_size),
        ));
    }

    let mut frame = vec![0u8; len];
    reader.read_exact(&mut frame).await?;
    Ok(Some(frame))
}

fn session_description(token: &str) -> String {
    format!("{}{}", SESSION_PREFIX, token)
}

fn parse_session(sdp: &str) -> Option<&str> {
    sdp.strip_prefix(SESSION_PREFIX).filter(|t| !t.is_empty())
}

fn parse_candidate(candidate: &str) -> Option<SocketAddr> {
    candidate.strip_prefix(CANDIDATE_PREFIX)?.trim().parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::time::timeout;

    async fn next(rx: &mut mpsc::Receiver<TransportEvent>) -> TransportEvent {
        timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("Timeout waiting for transport event")
            .expect("Event channel closed")
    }

    fn pair() -> (TcpTransport, mpsc::Receiver<TransportEvent>, TcpTransport, mpsc::Receiver<TransportEvent>) {
        let (a_tx, a_rx) = mpsc::channel(64);
        let (b_tx, b_rx) = mpsc::channel(64);
        (
            TcpTransport::new(TransportConfig::default(), a_tx),
            a_rx,
            TcpTransport::new(TransportConfig::default(), b_tx),
            b_rx,
        )
    }

    /// Negotiate a link between `a` (offerer) and `b` (answerer)
    async fn connect(
        a: &TcpTransport,
        a_rx: &mut mpsc::Receiver<TransportEvent>,
        b: &TcpTransport,
        b_rx: &mut mpsc::Receiver<TransportEvent>,
    ) {
        let (pa, pb) = (PeerId::new("peer_a"), PeerId::new("peer_b"));

        a.handle_command(TransportCommand::CreateOffer(pb.clone())).await.unwrap();
        let TransportEvent::OfferCreated(_, offer) = next(a_rx).await else { panic!("expected offer") };
        let TransportEvent::LocalCandidate(_, candidate) = next(a_rx).await else { panic!("expected candidate") };

        b.handle_command(TransportCommand::AcceptOffer(pa.clone(), offer)).await.unwrap();
        let TransportEvent::AnswerCreated(_, answer) = next(b_rx).await else { panic!("expected answer") };
        b.handle_command(TransportCommand::AddCandidate(pa.clone(), candidate)).await.unwrap();
        a.handle_command(TransportCommand::AcceptAnswer(pb.clone(), answer)).await.unwrap();

        assert_eq!(next(a_rx).await, TransportEvent::Connected(pb.clone()));
        assert_eq!(next(a_rx).await, TransportEvent::ChannelOpen(pb));
        assert_eq!(next(b_rx).await, TransportEvent::Connected(pa.clone()));
        assert_eq!(next(b_rx).await, TransportEvent::ChannelOpen(pa));
    }

    #[tokio::test]
    async fn test_negotiate_and_exchange_frames() {
        let (a, mut a_rx, b, mut b_rx) = pair();
        connect(&a, &mut a_rx, &b, &mut b_rx).await;

        let (sent_tx, sent_rx) = oneshot::channel();
        a.handle_command(TransportCommand::Send {
            peer_id: PeerId::new("peer_b"),
            bytes: b"hello".to_vec(),
            sent_tx: Some(sent_tx),
        })
        .await
        .unwrap();
        assert_eq!(sent_rx.await.unwrap(), Ok(()));
        assert_eq!(next(&mut b_rx).await, TransportEvent::Data(PeerId::new("peer_a"), b"hello".to_vec()));

        b.handle_command(TransportCommand::Send { peer_id: PeerId::new("peer_a"), bytes: b"back".to_vec(), sent_tx: None })
            .await
            .unwrap();
        assert_eq!(next(&mut a_rx).await, TransportEvent::Data(PeerId::new("peer_b"), b"back".to_vec()));
    }

    #[tokio::test]
    async fn test_local_close_is_silent_remote_sees_closed() {
        let (a, mut a_rx, b, mut b_rx) = pair();
        connect(&a, &mut a_rx, &b, &mut b_rx).await;

        a.handle_command(TransportCommand::Close(PeerId::new("peer_b"))).await.unwrap();
        assert_eq!(a.link_count().await, 0);
        assert_eq!(next(&mut b_rx).await, TransportEvent::Closed(PeerId::new("peer_a")));
        assert!(timeout(Duration::from_millis(200), a_rx.recv()).await.is_err());
    }

    #[tokio::test]
    async fn test_send_to_unknown_peer_fails() {
        let (a, _a_rx, _b, _b_rx) = pair();
        let (sent_tx, sent_rx) = oneshot::channel();
        let result = a
            .handle_command(TransportCommand::Send { peer_id: PeerId::new("peer_x"), bytes: vec![1], sent_tx: Some(sent_tx) })
            .await;
        assert_eq!(result, Err(TransportError::UnknownPeer(PeerId::new("peer_x"))));
        assert!(sent_rx.await.unwrap().is_err());
    }

    #[tokio::test]
    async fn test_oversized_send_rejected() {
        let (a_tx, _a_rx) = mpsc::channel(8);
        let config = TransportConfig { max_frame_size: 8, ..Default::default() };
        let a = TcpTransport::new(config, a_tx);
        let result = a
            .handle_command(TransportCommand::Send { peer_id: PeerId::new("peer_b"), bytes: vec![0; 9], sent_tx: None })
            .await;
        assert_eq!(result, Err(TransportError::FrameTooLarge { size: 9, limit: 8 }));
    }

    #[tokio::test]
    async fn test_mismatched_answer_rejected() {
        let (a, mut a_rx, _b, _b_rx) = pair();
        a.handle_command(TransportCommand::CreateOffer(PeerId::new("peer_b"))).await.unwrap();
        next(&mut a_rx).await;
        next(&mut a_rx).await;
        let result = a
            .handle_command(TransportCommand::AcceptAnswer(
                PeerId::new("peer_b"),
                session_description("not-the-token"),
            ))
            .await;
        assert!(matches!(result, Err(TransportError::BadDescription(_))));
    }

    #[tokio::test]
    async fn test_unverified_dialer_is_ignored() {
        let (a, mut a_rx, _b, _b_rx) = pair();
        a.handle_command(TransportCommand::CreateOffer(PeerId::new("peer_b"))).await.unwrap();
        next(&mut a_rx).await;
        let TransportEvent::LocalCandidate(_, candidate) = next(&mut a_rx).await else { panic!() };

        let mut intruder = TcpStream::connect(parse_candidate(&candidate).unwrap()).await.unwrap();
        write_frame(&mut intruder, b"guess").await.unwrap();
        assert!(timeout(Duration::from_millis(200), a_rx.recv()).await.is_err());
    }

    #[tokio::test]
    async fn test_dial_failure_reports_closed() {
        let (b_tx, mut b_rx) = mpsc::channel(8);
        let b = TcpTransport::new(TransportConfig::default(), b_tx);
        let pa = PeerId::new("peer_a");
        b.handle_command(TransportCommand::AcceptOffer(pa.clone(), session_description("t"))).await.unwrap();
        next(&mut b_rx).await;

        // Reserve a port, then free it so nothing listens there.
        let port = TcpListener::bind("127.0.0.1:0").await.unwrap().local_addr().unwrap().port();
        b.handle_command(TransportCommand::AddCandidate(pa.clone(), format!("tcp 127.0.0.1:{}", port)))
            .await
            .unwrap();
        assert_eq!(next(&mut b_rx).await, TransportEvent::Closed(pa));
    }

    #[tokio::test]
    async fn test_frame_helpers_enforce_limit() {
        let (mut client, mut server) = tokio::io::duplex(64);
        write_frame(&mut client, b"abc").await.unwrap();
        assert_eq!(read_frame(&mut server, 8).await.unwrap(), Some(b"abc".to_vec()));

        write_frame(&mut client, &[0; 16]).await.unwrap();
        assert!(read_frame(&mut server, 8).await.is_err());

        drop(client);
        let (_c, mut empty) = tokio::io::duplex(8);
        drop(_c);
        assert_eq!(read_frame(&mut empty, 8).await.unwrap(), None);
    }

    #[test]
    fn test_description_parsing() {
        assert_eq!(parse_session(&session_description("abc")), Some("abc"));
        assert_eq!(parse_session("hardedging-tcp/1 session="), None);
        assert_eq!(parse_session("v=0"), None);
        assert_eq!(parse_candidate("tcp 127.0.0.1:4000"), Some("127.0.0.1:4000".parse().unwrap()));
        assert_eq!(parse_candidate("udp 127.0.0.1:4000"), None);
    }
}
