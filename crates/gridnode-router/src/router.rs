//! Router core: listeners, registration handshake, kind dispatch and the
//! service control channel.
//!
//! The router listens on a local-only Unix socket (computations and the
//! session manager's control channel) and an ephemeral TCP port (clients and
//! peer nodes). Every new connection must send a registration block within
//! 5 seconds; what happens next depends on the declared peer kind.

use std::path::PathBuf;
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use serde_json::Value;
use tokio::net::{TcpListener, UnixListener};
use tokio::sync::{mpsc, watch};
use tokio::time::{timeout, Duration};
use uuid::Uuid;

use gridnode_common::error::{GridError, Result};
use gridnode_common::protocol::{
    Address, ClientConnectionStatus, ComputationStatusMessage, ControlMessage, Envelope,
    ExecutorHeartbeat, MessageClass, PeerRegistration, RegistrationData, RouterInfoMessage,
    SessionRoutingAction, SessionRoutingDataMessage, SessionStatusMessage,
};
use gridnode_common::transport::read_registration;

use crate::endpoint::{BoxedPeerIo, Endpoint, PeerKind};
use crate::registry::PeerRegistry;
use crate::route::route_envelope;
use crate::store::{RoutingStore, SessionRoutingData};

/// Time a connector has to identify itself.
const NEGOTIATION_TIMEOUT: Duration = Duration::from_secs(5);

/// Time to wait for a final session status to reach the client before
/// closing its connection.
const SESSION_STATUS_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Router configuration.
pub struct RouterConfig {
    pub node_id: Uuid,
    /// Filesystem path of the IPC socket; created with owner-only
    /// permissions.
    pub ipc_path: PathBuf,
    /// TCP bind address; port 0 selects an ephemeral port, reported back to
    /// the session manager in the `RouterInfo` reply.
    pub tcp_bind: std::net::SocketAddr,
}

impl RouterConfig {
    pub fn new(node_id: Uuid, ipc_path: impl Into<PathBuf>) -> Self {
        Self {
            node_id,
            ipc_path: ipc_path.into(),
            tcp_bind: "0.0.0.0:0".parse().expect("static addr"),
        }
    }
}

/// State shared by every router task.
pub struct RouterShared {
    node_id: Uuid,
    registry: PeerRegistry,
    store: RoutingStore,
    /// Held across node-endpoint lookup and creation so exactly one
    /// connection per node pair can exist, regardless of who dials first.
    node_connection_mutex: Mutex<()>,
    service: Mutex<Option<Arc<Endpoint>>>,
    service_queue: mpsc::UnboundedSender<Envelope>,
    listen_port: AtomicU16,
}

impl RouterShared {
    pub fn node_id(&self) -> Uuid {
        self.node_id
    }

    pub fn registry(&self) -> &PeerRegistry {
        &self.registry
    }

    pub fn store(&self) -> &RoutingStore {
        &self.store
    }

    pub fn listen_port(&self) -> u16 {
        self.listen_port.load(Ordering::SeqCst)
    }

    pub(crate) fn node_connection_lock(&self) -> MutexGuard<'_, ()> {
        self.node_connection_mutex
            .lock()
            .expect("node connection lock poisoned")
    }

    fn service_endpoint(&self) -> Option<Arc<Endpoint>> {
        self.service.lock().expect("service lock poisoned").clone()
    }

    fn set_service_endpoint(&self, endpoint: Arc<Endpoint>) {
        *self.service.lock().expect("service lock poisoned") = Some(endpoint);
    }

    /// Queues a message to the session manager's control channel.
    pub(crate) fn notify_service(&self, envelope: Envelope) {
        match self.service_endpoint() {
            Some(service) => service.queue_envelope(envelope),
            None => tracing::error!("router has no service endpoint"),
        }
    }

    pub(crate) fn notify_client_connected(&self, session_id: Uuid) {
        self.notify_connection_status(session_id, "connected");
    }

    pub(crate) fn notify_client_disconnected(&self, session_id: Uuid, reason: &str) {
        self.notify_connection_status(session_id, reason);
    }

    fn notify_connection_status(&self, session_id: Uuid, reason: &str) {
        let msg = ClientConnectionStatus {
            session_id,
            reason: reason.to_string(),
            session_status: String::new(),
        };
        match Envelope::pack(&msg) {
            Ok(env) => self.notify_service(env),
            Err(err) => tracing::error!("cannot pack connection status: {err}"),
        }
    }

    fn notify_computation_ready(&self, session_id: Uuid, computation_id: Uuid) {
        let msg = ComputationStatusMessage {
            session_id,
            computation_id,
            status: "ready".to_string(),
        };
        match Envelope::pack(&msg) {
            Ok(env) => self.notify_service(env),
            Err(err) => tracing::error!("cannot pack computation status: {err}"),
        }
    }

    /// Removes a torn-down endpoint from tracking, emitting the disconnect
    /// notification that matches its kind unless `notify` is false (kicks
    /// and shutdown teardown are silent).
    pub(crate) fn destroy_endpoint(&self, endpoint: &Arc<Endpoint>, notify: bool) {
        if endpoint.mark_destroyed() {
            return;
        }

        if endpoint.kind() == PeerKind::Service {
            *self.service.lock().expect("service lock poisoned") = None;
            if notify {
                tracing::error!("service control channel disconnected");
            }
            return;
        }

        let removed = self.registry.destroy(endpoint);
        if !notify {
            return;
        }
        match removed {
            Some((PeerKind::Client, session_id)) => {
                tracing::debug!(session = %session_id, "client disconnected");
                self.notify_client_disconnected(session_id, "clientDroppedConnection");
            }
            Some((PeerKind::Node, node_id)) => {
                tracing::error!("remote node '{}' disconnected", node_id);
            }
            Some((kind, id)) => {
                tracing::trace!("disconnect notification for {} '{}'", kind.name(), id);
            }
            None => {}
        }
    }

    /// Dispatches one received envelope.
    ///
    /// Service traffic goes to the control drain task; `Control`,
    /// `ExecutorHeartbeat` and `Pong` are handled here; everything else is
    /// routed to its destinations.
    pub(crate) fn handle_incoming(self: &Arc<Self>, endpoint: &Arc<Endpoint>, envelope: Envelope) {
        if endpoint.kind() == PeerKind::Service {
            if self.service_queue.send(envelope).is_err() {
                tracing::error!("service control queue is gone");
            }
            return;
        }

        match envelope.class {
            MessageClass::Control => self.handle_control(endpoint, &envelope),
            MessageClass::ExecutorHeartbeat => self.handle_heartbeat(endpoint, envelope),
            MessageClass::Pong => {
                tracing::trace!("pong from {}", endpoint.describe());
            }
            _ => self.route_from(endpoint, envelope),
        }
    }

    fn handle_control(&self, endpoint: &Arc<Endpoint>, envelope: &Envelope) {
        if endpoint.kind() == PeerKind::Client {
            if let Ok(control) = envelope.unpack::<ControlMessage>() {
                if control.command == "disconnect" {
                    self.notify_client_disconnected(endpoint.id(), "clientShutdown");
                }
            }
        } else if envelope.to.len() == 1
            && envelope.to[0].computation.is_none()
            && envelope.to[0].node == Some(self.node_id)
        {
            tracing::error!(
                "unexpected control message from {}",
                endpoint.describe()
            );
        }
    }

    fn handle_heartbeat(self: &Arc<Self>, endpoint: &Arc<Endpoint>, envelope: Envelope) {
        // heartbeats only come from local computations; ignore anything else
        if endpoint.kind() != PeerKind::Computation {
            return;
        }
        match envelope.unpack::<ExecutorHeartbeat>() {
            Ok(heartbeat) => {
                endpoint.maybe_log_stats(&heartbeat);
                // the computation doesn't fill in a source address, so
                // synthesize one before handing it to the session manager
                let session = endpoint.session_id().unwrap_or_default();
                let from = Address::computation(session, self.node_id, endpoint.id());
                self.notify_service(envelope.from_address(from));
            }
            Err(err) => {
                tracing::warn!("undecodable heartbeat from {}: {err}", endpoint.describe());
            }
        }
    }

    fn route_from(self: &Arc<Self>, endpoint: &Arc<Endpoint>, mut envelope: Envelope) {
        match endpoint.kind() {
            PeerKind::Node => {
                // can't use per-endpoint routing state, the session differs
                // per message
                let session = envelope.to.first().and_then(|a| a.session);
                match session.and_then(|s| self.store.lookup(&s)) {
                    Some(routing) => route_envelope(&envelope, &routing, self),
                    None => {
                        tracing::warn!(
                            "received message for unknown session from {}",
                            endpoint.describe()
                        );
                    }
                }
            }
            PeerKind::Client => {
                let Some(session) = endpoint.session_id() else {
                    // transiently accepted client with no routing: incoming
                    // messages are ignored
                    tracing::debug!("ignoring message from client of unknown session");
                    return;
                };
                let Some(routing) = self.store.lookup(&session) else {
                    tracing::debug!(session = %session, "no routing data for client message");
                    return;
                };
                match routing.address_client_envelope(&mut envelope) {
                    Ok(()) => route_envelope(&envelope, &routing, self),
                    Err(err) => {
                        tracing::error!(session = %session, "cannot address client message: {err}");
                    }
                }
            }
            PeerKind::Computation => {
                let Some(session) = endpoint.session_id() else {
                    return;
                };
                match self.store.lookup(&session) {
                    Some(routing) => route_envelope(&envelope, &routing, self),
                    None => {
                        tracing::warn!(
                            session = %session,
                            "no routing data for message from {}",
                            endpoint.describe()
                        );
                    }
                }
            }
            PeerKind::Service | PeerKind::Listener => {}
        }
    }

    /// Disconnects a session's client, delivering a final status message
    /// first and draining the send queue for up to 5 seconds. With no client
    /// connected, any stashed messages are dropped instead.
    pub(crate) async fn kick_client(
        self: &Arc<Self>,
        session_id: Uuid,
        reason: &str,
        status_json: &str,
    ) {
        tracing::debug!(session = %session_id, "disconnecting client for reason: {}", reason);

        let Some(client) = self.registry.find_client(&session_id) else {
            tracing::debug!(session = %session_id, "there was no client to disconnect");
            self.registry.clear_stash(&session_id);
            return;
        };

        let status = SessionStatusMessage {
            status_json: status_json.to_string(),
        };
        match Envelope::pack(&status) {
            Ok(env) => client.queue_envelope(env),
            Err(err) => tracing::error!("cannot pack session status: {err}"),
        }

        if !client.drain(SESSION_STATUS_DRAIN_TIMEOUT).await {
            tracing::warn!(session = %session_id, "client send queue did not drain before kick");
        }
        self.destroy_endpoint(&client, false);
        client.close();
        tracing::debug!(session = %session_id, "disconnected client");
    }
}

/// The router: accepts connections, routes messages, answers the control
/// channel.
pub struct Router {
    shared: Arc<RouterShared>,
    shutdown: watch::Sender<bool>,
    ipc_path: PathBuf,
}

impl Router {
    /// Binds the listeners and starts the accept and control drain tasks.
    pub async fn start(config: RouterConfig) -> Result<Router> {
        let tcp = TcpListener::bind(config.tcp_bind)
            .await
            .map_err(|e| GridError::Transport(format!("failed to bind router TCP socket: {e}")))?;
        let port = tcp
            .local_addr()
            .map_err(|e| GridError::Transport(format!("failed to get router port: {e}")))?
            .port();

        // a stale socket file from a previous run would fail the bind
        let _ = std::fs::remove_file(&config.ipc_path);
        let ipc = UnixListener::bind(&config.ipc_path).map_err(|e| {
            GridError::Transport(format!(
                "failed to bind IPC socket {}: {e}",
                config.ipc_path.display()
            ))
        })?;
        set_owner_only(&config.ipc_path)?;

        let (service_tx, service_rx) = mpsc::unbounded_channel();
        let shared = Arc::new(RouterShared {
            node_id: config.node_id,
            registry: PeerRegistry::new(),
            store: RoutingStore::new(),
            node_connection_mutex: Mutex::new(()),
            service: Mutex::new(None),
            service_queue: service_tx,
            listen_port: AtomicU16::new(port),
        });

        let (shutdown, shutdown_rx) = watch::channel(false);
        tokio::spawn(accept_loop(shared.clone(), tcp, ipc, shutdown_rx.clone()));
        tokio::spawn(service_drain(shared.clone(), service_rx, shutdown_rx));

        tracing::info!(
            "router listening on TCP port {} and IPC socket {}",
            port,
            config.ipc_path.display()
        );

        Ok(Router {
            shared,
            shutdown,
            ipc_path: config.ipc_path,
        })
    }

    pub fn shared(&self) -> Arc<RouterShared> {
        self.shared.clone()
    }

    /// TCP port peers connect to; reported to the session manager in the
    /// `RouterInfo` reply.
    pub fn listen_port(&self) -> u16 {
        self.shared.listen_port()
    }

    /// Stops accepting, closes every endpoint, and removes the IPC socket
    /// file.
    pub fn shutdown(&self) {
        let _ = self.shutdown.send(true);
        for endpoint in self.shared.registry.drain_all() {
            self.shared.destroy_endpoint(&endpoint, false);
            endpoint.close();
        }
        if let Some(service) = self.shared.service_endpoint() {
            self.shared.destroy_endpoint(&service, false);
            service.close();
        }
        let _ = std::fs::remove_file(&self.ipc_path);
    }
}

#[cfg(unix)]
fn set_owner_only(path: &std::path::Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o700))
        .map_err(GridError::Io)
}

async fn accept_loop(
    shared: Arc<RouterShared>,
    tcp: TcpListener,
    ipc: UnixListener,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            accepted = tcp.accept() => match accepted {
                Ok((stream, addr)) => {
                    tracing::trace!("new TCP connection from {}", addr);
                    tokio::spawn(negotiate(shared.clone(), Box::new(stream) as BoxedPeerIo));
                }
                Err(err) => tracing::error!("TCP accept failed: {err}"),
            },
            accepted = ipc.accept() => match accepted {
                Ok((stream, _)) => {
                    tracing::trace!("new IPC connection");
                    tokio::spawn(negotiate(shared.clone(), Box::new(stream) as BoxedPeerIo));
                }
                Err(err) => tracing::error!("IPC accept failed: {err}"),
            },
            _ = shutdown.changed() => return,
        }
    }
}

/// Reads the registration block and dispatches on the declared peer kind.
/// Dropping `io` without creating an endpoint rejects the connection.
async fn negotiate(shared: Arc<RouterShared>, mut io: BoxedPeerIo) {
    let registration = match timeout(NEGOTIATION_TIMEOUT, read_registration(&mut io)).await {
        Ok(Ok(reg)) => reg,
        Ok(Err(err)) => {
            tracing::error!(
                "invalid registration block received from socket: {err} \
                 (someone may be attempting an unsupported connection type)"
            );
            return;
        }
        Err(_) => {
            tracing::error!("peer did not identify itself within the negotiation timeout");
            return;
        }
    };

    match registration.kind {
        PeerRegistration::Control => accept_control(shared, io, registration),
        PeerRegistration::Client => accept_client(shared, io, registration),
        PeerRegistration::Executor => accept_executor(shared, io, registration),
        PeerRegistration::Node => accept_node(shared, io, registration),
    }
}

fn accept_control(shared: Arc<RouterShared>, io: BoxedPeerIo, reg: RegistrationData) {
    if shared.service_endpoint().is_some() {
        tracing::error!("refusing service connection because one already exists");
        return;
    }

    let endpoint = Endpoint::accepted(PeerKind::Service, reg.node_id, None, io, shared.clone());

    // the session manager can't register the node until it knows the
    // router's message port, so reply with it immediately
    let info = RouterInfoMessage {
        message_port: shared.listen_port(),
    };
    match Envelope::pack(&info) {
        Ok(env) => endpoint.queue_envelope(env),
        Err(err) => tracing::error!("cannot pack router info: {err}"),
    }

    shared.set_service_endpoint(endpoint);
    tracing::debug!("basic handshake succeeded for node service");
}

fn accept_client(shared: Arc<RouterShared>, io: BoxedPeerIo, reg: RegistrationData) {
    if shared.registry.find_client(&reg.session_id).is_some() {
        tracing::error!(
            session = %reg.session_id,
            "refusing client connection because one already exists for the session"
        );
        return;
    }

    let session = if shared.store.lookup(&reg.session_id).is_some() {
        tracing::debug!(session = %reg.session_id, "basic handshake succeeded for client");
        Some(reg.session_id)
    } else {
        // almost certainly a client connecting after the session shut down.
        // accept anyway so the final status can be sent back; with no
        // routing attached, incoming messages are ignored.
        tracing::debug!(
            session = %reg.session_id,
            "client for invalid session accepted temporarily"
        );
        None
    };

    let endpoint = Endpoint::accepted(PeerKind::Client, reg.session_id, session, io, shared.clone());
    shared.registry.track_client(reg.session_id, endpoint);
    shared.notify_client_connected(reg.session_id);
}

fn accept_executor(shared: Arc<RouterShared>, io: BoxedPeerIo, reg: RegistrationData) {
    tracing::debug!(
        session = %reg.session_id,
        "registration received from computation '{}'",
        reg.computation_id
    );
    shared.notify_computation_ready(reg.session_id, reg.computation_id);
    let endpoint = Endpoint::accepted(
        PeerKind::Computation,
        reg.computation_id,
        Some(reg.session_id),
        io,
        shared.clone(),
    );
    shared.registry.track_computation(reg.computation_id, endpoint);
}

/// Node-to-node connections can race when two nodes dial each other
/// simultaneously. The rule that untangles every case: the final connection
/// is always directed from the greater node id to the lesser node id.
///
/// - no endpoint yet, peer is lesser: drop the inbound connection (the peer
///   expects this) and open the reciprocal connection ourselves
/// - no endpoint yet, peer is greater: accept normally
/// - outbound pending, peer is lesser: drop the inbound; ours will complete
/// - outbound pending, peer is greater: adopt the accepted socket into the
///   pending endpoint and wake its sender
fn accept_node(shared: Arc<RouterShared>, io: BoxedPeerIo, reg: RegistrationData) {
    tracing::debug!("registration received from node peer '{}'", reg.node_id);

    let _guard = shared.node_connection_lock();
    match shared.registry.find_node(&reg.node_id) {
        None => {
            if reg.node_id < shared.node_id {
                match shared.store.find_node_info(&reg.node_id) {
                    Some(info) => {
                        tracing::debug!(
                            "rejecting node connection from lesser node id; \
                             reciprocal connection will be created"
                        );
                        let endpoint =
                            Endpoint::connect_node(reg.node_id, info, shared.clone());
                        shared.registry.track_node(reg.node_id, endpoint);
                        // dropping io closes the inbound connection, which
                        // the lesser node is waiting for
                    }
                    None => {
                        tracing::error!(
                            "unexpected node connection from node id {}",
                            reg.node_id
                        );
                    }
                }
            } else {
                tracing::debug!("accepting node connection from greater node id");
                let endpoint =
                    Endpoint::accepted(PeerKind::Node, reg.node_id, None, io, shared.clone());
                shared.registry.track_node(reg.node_id, endpoint);
            }
        }
        Some(endpoint) => {
            if reg.node_id < shared.node_id {
                tracing::debug!(
                    "rejecting node connection from lesser node id; \
                     reciprocal connection is already in progress"
                );
            } else {
                tracing::debug!(
                    "accepting node connection from greater node id into existing endpoint"
                );
                endpoint.adopt(io);
            }
        }
    }
}

/// Drains the control channel from the session manager: routing-data
/// lifecycle, client kicks, and pre-addressed control/engine-ready traffic.
async fn service_drain(
    shared: Arc<RouterShared>,
    mut rx: mpsc::UnboundedReceiver<Envelope>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        let envelope = tokio::select! {
            env = rx.recv() => match env {
                Some(env) => env,
                None => return,
            },
            _ = shutdown.changed() => return,
        };

        match envelope.class {
            MessageClass::ClientConnectionStatus => {
                let Ok(status) = envelope.unpack::<ClientConnectionStatus>() else {
                    continue;
                };
                tracing::debug!(
                    session = %status.session_id,
                    "received client status notification [reason {}]",
                    status.reason
                );
                // "connected" never comes from the session manager, but
                // check anyway; everything else is a kick request
                if status.reason != "connected" {
                    shared
                        .kick_client(status.session_id, &status.reason, &status.session_status)
                        .await;
                }
            }
            MessageClass::SessionRoutingData => {
                let Ok(msg) = envelope.unpack::<SessionRoutingDataMessage>() else {
                    continue;
                };
                handle_routing_data(&shared, msg);
            }
            MessageClass::Control | MessageClass::EngineReady => {
                // pre-addressed by the session manager; just route
                let session = envelope.to.first().and_then(|a| a.session);
                if let Some(routing) = session.and_then(|s| shared.store.lookup(&s)) {
                    route_envelope(&envelope, &routing, &shared);
                }
            }
            other => {
                tracing::warn!("unexpected {:?} message on service control channel", other);
            }
        }
    }
}

fn handle_routing_data(shared: &Arc<RouterShared>, msg: SessionRoutingDataMessage) {
    match msg.action {
        // initialize is idempotent per session: a re-sent routing document
        // for a known session is only acknowledged again
        SessionRoutingAction::Initialize => {
            let doc: Value = match serde_json::from_str(&msg.routing_data) {
                Ok(doc) => doc,
                Err(err) => {
                    tracing::error!(
                        session = %msg.session_id,
                        "undecodable session routing data: {err}"
                    );
                    return;
                }
            };
            if shared.store.lookup(&msg.session_id).is_none() {
                match SessionRoutingData::new(msg.session_id, shared.node_id, &doc) {
                    Ok(data) => {
                        shared.store.add(msg.session_id, Arc::new(data));
                    }
                    Err(err) => {
                        tracing::error!(
                            session = %msg.session_id,
                            "invalid session routing data: {err}"
                        );
                        return;
                    }
                }
            }
            // acknowledge so the manager can start spawning computations
            let ack = SessionRoutingDataMessage::new(
                SessionRoutingAction::Acknowledge,
                msg.session_id,
            );
            match Envelope::pack(&ack) {
                Ok(env) => shared.notify_service(env),
                Err(err) => tracing::error!("cannot pack routing acknowledge: {err}"),
            }
        }
        SessionRoutingAction::Update => {
            let doc: Value = match serde_json::from_str(&msg.routing_data) {
                Ok(doc) => doc,
                Err(err) => {
                    tracing::error!(
                        session = %msg.session_id,
                        "undecodable routing update: {err}"
                    );
                    return;
                }
            };
            if let Some(routing) = shared.store.lookup(&msg.session_id) {
                routing.update_client_addresser(&doc);
            }
        }
        SessionRoutingAction::Delete => {
            shared.store.delete(&msg.session_id);
            shared.registry.clear_stash(&msg.session_id);
        }
        SessionRoutingAction::Acknowledge => {
            tracing::error!(
                "expected Initialize, Update or Delete routing action, got Acknowledge"
            );
        }
    }
}
