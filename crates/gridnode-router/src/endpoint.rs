//! Remote endpoints.
//!
//! One endpoint per peer connection, with a single writer task draining the
//! endpoint's outbox and a single reader task dispatching received frames.
//! That pairing is what gives FIFO delivery between any two endpoints.
//!
//! Outbound node endpoints are created before their socket exists: the
//! driver dials the peer and either keeps the connection (when this node id
//! is the greater) or treats it as a poke and waits for the peer to dial
//! back, adopting the accepted stream into the waiting endpoint.

use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tokio::io::{AsyncRead, AsyncWrite, ReadHalf, WriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, watch};
use uuid::Uuid;

use gridnode_common::protocol::{
    Address, Envelope, ExecutorHeartbeat, RegistrationData,
};
use gridnode_common::transport::{read_frame, write_frame, write_registration};

use crate::router::RouterShared;
use crate::store::NodeInfo;

/// Seconds between heartbeat stats emissions per computation.
const STATS_INTERVAL_SECS: i64 = 30;

/// What a connected peer is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerKind {
    Client,
    Node,
    Computation,
    Service,
    Listener,
}

impl PeerKind {
    pub fn name(&self) -> &'static str {
        match self {
            PeerKind::Client => "Client",
            PeerKind::Node => "Node",
            PeerKind::Computation => "Computation",
            PeerKind::Service => "Service",
            PeerKind::Listener => "Listener",
        }
    }
}

/// Combined IO trait so TCP and Unix streams share one endpoint type.
pub trait PeerIo: AsyncRead + AsyncWrite + Send + Unpin {}
impl<T: AsyncRead + AsyncWrite + Send + Unpin> PeerIo for T {}

pub type BoxedPeerIo = Box<dyn PeerIo>;

enum Outgoing {
    Envelope(Envelope),
    Flush(oneshot::Sender<()>),
}

/// A peer connection: outbox, identity, and teardown state.
///
/// `id` is the node id for node peers, the computation id for computations,
/// and the session id for clients. `session_id` is `None` for a client
/// accepted transiently for an unknown session; such an endpoint sends but
/// never routes incoming traffic.
pub struct Endpoint {
    kind: PeerKind,
    id: Uuid,
    session_id: Option<Uuid>,
    outbox: mpsc::UnboundedSender<Outgoing>,
    adopt_tx: Mutex<Option<oneshot::Sender<BoxedPeerIo>>>,
    closed_tx: watch::Sender<bool>,
    closed_rx: watch::Receiver<bool>,
    destroyed: AtomicBool,
    next_stats_secs: AtomicI64,
}

impl Endpoint {
    /// Endpoint for an accepted connection whose socket already exists.
    pub fn accepted(
        kind: PeerKind,
        id: Uuid,
        session_id: Option<Uuid>,
        io: BoxedPeerIo,
        shared: Arc<RouterShared>,
    ) -> Arc<Endpoint> {
        let (endpoint, outbox_rx) = Self::build(kind, id, session_id, None);
        let (read_half, write_half) = tokio::io::split(io);
        tokio::spawn(writer_loop(
            endpoint.clone(),
            shared.clone(),
            outbox_rx,
            write_half,
        ));
        tokio::spawn(reader_loop(endpoint.clone(), shared, read_half));
        endpoint
    }

    /// Outbound endpoint to a peer node. The driver task dials the peer,
    /// registers, and resolves which socket the endpoint will finally use
    /// according to the collision rules.
    pub fn connect_node(
        peer_node_id: Uuid,
        info: NodeInfo,
        shared: Arc<RouterShared>,
    ) -> Arc<Endpoint> {
        let (adopt_tx, adopt_rx) = oneshot::channel();
        let (endpoint, outbox_rx) = Self::build(PeerKind::Node, peer_node_id, None, Some(adopt_tx));
        tokio::spawn(node_driver(endpoint.clone(), shared, info, outbox_rx, adopt_rx));
        endpoint
    }

    /// Test-only endpoint with no IO tasks; returns the outbox as a plain
    /// envelope receiver (flushes are acknowledged immediately).
    #[doc(hidden)]
    pub fn detached(
        kind: PeerKind,
        id: Uuid,
        session_id: Option<Uuid>,
    ) -> (Arc<Endpoint>, mpsc::UnboundedReceiver<Envelope>) {
        let (endpoint, mut outbox_rx) = Self::build(kind, id, session_id, None);
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            while let Some(item) = outbox_rx.recv().await {
                match item {
                    Outgoing::Envelope(env) => {
                        if tx.send(env).is_err() {
                            break;
                        }
                    }
                    Outgoing::Flush(ack) => {
                        let _ = ack.send(());
                    }
                }
            }
        });
        (endpoint, rx)
    }

    fn build(
        kind: PeerKind,
        id: Uuid,
        session_id: Option<Uuid>,
        adopt_tx: Option<oneshot::Sender<BoxedPeerIo>>,
    ) -> (Arc<Endpoint>, mpsc::UnboundedReceiver<Outgoing>) {
        let (outbox, outbox_rx) = mpsc::unbounded_channel();
        let (closed_tx, closed_rx) = watch::channel(false);
        let endpoint = Arc::new(Endpoint {
            kind,
            id,
            session_id,
            outbox,
            adopt_tx: Mutex::new(adopt_tx),
            closed_tx,
            closed_rx,
            destroyed: AtomicBool::new(false),
            next_stats_secs: AtomicI64::new(initial_stats_time(&id)),
        });
        (endpoint, outbox_rx)
    }

    pub fn kind(&self) -> PeerKind {
        self.kind
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn session_id(&self) -> Option<Uuid> {
        self.session_id
    }

    pub fn describe(&self) -> String {
        match self.kind {
            PeerKind::Client => "client".to_string(),
            PeerKind::Service => "service".to_string(),
            PeerKind::Node => format!("node({})", self.id),
            PeerKind::Computation => format!("computation({})", self.id),
            PeerKind::Listener => format!("listener({})", self.id),
        }
    }

    /// Enqueues an envelope on the single send path. Fails silently if the
    /// endpoint is closing; the message is simply not delivered.
    pub fn queue_envelope(&self, envelope: Envelope) {
        if self.outbox.send(Outgoing::Envelope(envelope)).is_err() {
            tracing::debug!("message undelivered due to endpoint shutdown");
        }
    }

    /// Enqueues a copy of the envelope with its destination list replaced.
    pub fn queue_envelope_to(&self, envelope: &Envelope, to: Vec<Address>) {
        self.queue_envelope(envelope.clone().addressed_to(to));
    }

    /// Waits until everything queued before this call has been written, or
    /// the timeout passes. Returns whether the queue drained in time.
    pub async fn drain(&self, timeout: Duration) -> bool {
        let (ack_tx, ack_rx) = oneshot::channel();
        if self.outbox.send(Outgoing::Flush(ack_tx)).is_err() {
            return true; // endpoint already gone, nothing left to drain
        }
        tokio::time::timeout(timeout, ack_rx).await.is_ok()
    }

    /// Hands an accepted socket to an outbound node endpoint waiting in
    /// negotiation.
    pub fn adopt(&self, io: BoxedPeerIo) {
        let taken = self.adopt_tx.lock().expect("adopt lock poisoned").take();
        match taken {
            Some(tx) => {
                if tx.send(io).is_err() {
                    tracing::error!("endpoint driver gone before stream adoption");
                }
            }
            None => {
                tracing::error!("unexpected stream adoption on {}", self.describe());
            }
        }
    }

    /// Signals the IO tasks to exit. Does not touch the registry; see
    /// `RouterShared::destroy_endpoint`.
    pub fn close(&self) {
        let _ = self.closed_tx.send(true);
    }

    /// Marks the endpoint destroyed; returns whether it already was.
    pub(crate) fn mark_destroyed(&self) -> bool {
        self.destroyed.swap(true, Ordering::SeqCst)
    }

    pub(crate) fn closed_watch(&self) -> watch::Receiver<bool> {
        self.closed_rx.clone()
    }

    /// Emits heartbeat stats to the structured log on the stats cadence.
    pub(crate) fn maybe_log_stats(&self, heartbeat: &ExecutorHeartbeat) {
        let next = self.next_stats_secs.load(Ordering::Relaxed);
        if heartbeat.transmit_secs < next {
            return;
        }
        self.next_stats_secs
            .store(now_secs() + STATS_INTERVAL_SECS, Ordering::Relaxed);
        tracing::info!(
            target: "gridnode::stats",
            session = %self.session_id.unwrap_or_default(),
            computation = %self.id,
            cpu_usage_5s = heartbeat.cpu_usage_5s,
            cpu_usage_60s = heartbeat.cpu_usage_60s,
            cpu_usage_total_secs = heartbeat.cpu_usage_total_secs,
            memory_usage_bytes = heartbeat.memory_usage_bytes,
            sent_messages_total = heartbeat.sent_messages_total,
            received_messages_total = heartbeat.received_messages_total,
            status = %heartbeat.status,
            "computation stats"
        );
    }
}

fn now_secs() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

/// First stats emission is spread across computations by hashing the id, so
/// a session's computations don't all report in the same second.
fn initial_stats_time(id: &Uuid) -> i64 {
    let hash = id.as_bytes().iter().fold(0u8, |acc, b| acc ^ b);
    now_secs() + i64::from(hash & 0x1f)
}

async fn writer_loop(
    endpoint: Arc<Endpoint>,
    shared: Arc<RouterShared>,
    mut outbox_rx: mpsc::UnboundedReceiver<Outgoing>,
    mut write_half: WriteHalf<BoxedPeerIo>,
) {
    let mut closed = endpoint.closed_watch();
    loop {
        tokio::select! {
            item = outbox_rx.recv() => {
                match item {
                    Some(Outgoing::Envelope(envelope)) => {
                        if let Err(err) = write_frame(&mut write_half, &envelope).await {
                            tracing::warn!(
                                "send to {} failed: {err}",
                                endpoint.describe()
                            );
                            shared.destroy_endpoint(&endpoint, true);
                            endpoint.close();
                            return;
                        }
                    }
                    Some(Outgoing::Flush(ack)) => {
                        let _ = ack.send(());
                    }
                    None => return,
                }
            }
            _ = closed.changed() => return,
        }
    }
}

async fn reader_loop(
    endpoint: Arc<Endpoint>,
    shared: Arc<RouterShared>,
    mut read_half: ReadHalf<BoxedPeerIo>,
) {
    let mut closed = endpoint.closed_watch();
    loop {
        tokio::select! {
            result = read_frame(&mut read_half) => {
                match result {
                    Ok(envelope) => shared.handle_incoming(&endpoint, envelope),
                    Err(err) => {
                        // disconnect and reset happen during normal peer
                        // shutdown, so they are not errors
                        tracing::warn!(
                            "connection to {} lost: {err}",
                            endpoint.describe()
                        );
                        shared.destroy_endpoint(&endpoint, true);
                        endpoint.close();
                        return;
                    }
                }
            }
            _ = closed.changed() => return,
        }
    }
}

/// Dials a peer node, registers, resolves the final socket per the collision
/// rules, then runs the endpoint's IO loops on it.
async fn node_driver(
    endpoint: Arc<Endpoint>,
    shared: Arc<RouterShared>,
    info: NodeInfo,
    outbox_rx: mpsc::UnboundedReceiver<Outgoing>,
    adopt_rx: oneshot::Receiver<BoxedPeerIo>,
) {
    let dialed: Option<BoxedPeerIo> =
        match TcpStream::connect((info.ip.as_str(), info.port)).await {
            Ok(mut stream) => {
                let reg = RegistrationData::node(shared.node_id());
                match write_registration(&mut stream, &reg).await {
                    Ok(()) => Some(Box::new(stream)),
                    Err(err) => {
                        tracing::error!(
                            "error registering with remote node {}: {err}",
                            info.node_id
                        );
                        None
                    }
                }
            }
            Err(err) => {
                tracing::error!("error connecting to remote node {}: {err}", info.node_id);
                None
            }
        };

    let io: BoxedPeerIo = if shared.node_id() > endpoint.id() {
        // this node is the greater, so the dialed connection is the real one
        match dialed {
            Some(io) => io,
            None => {
                shared.destroy_endpoint(&endpoint, true);
                endpoint.close();
                return;
            }
        }
    } else {
        // the dialed connection only notifies the greater node that we want
        // to connect; it dials back and the accepted stream is adopted here
        drop(dialed);
        let mut closed = endpoint.closed_watch();
        tokio::select! {
            adopted = adopt_rx => {
                match adopted {
                    Ok(io) => io,
                    Err(_) => {
                        shared.destroy_endpoint(&endpoint, true);
                        endpoint.close();
                        return;
                    }
                }
            }
            _ = closed.changed() => return,
        }
    };

    let (read_half, write_half) = tokio::io::split(io);
    tokio::spawn(reader_loop(endpoint.clone(), shared.clone(), read_half));
    writer_loop(endpoint, shared, outbox_rx, write_half).await;
}
