//! Control channel to the router.
//!
//! The session manager talks to the router over the same IPC socket and
//! framed protocol as any other peer, registering as the CONTROL connection.
//! Through this channel it installs and retires per-session routing data
//! (with an acknowledge handshake), sends control messages to computations,
//! kicks clients, and receives computation-ready, client-connection and
//! heartbeat notifications back.

use std::collections::HashSet;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU16, Ordering};
use std::sync::{Arc, Mutex, OnceLock, Weak};
use std::time::Duration;

use serde_json::{json, Value};
use tokio::net::UnixStream;
use tokio::sync::{mpsc, Notify};
use tokio::time::Instant;
use uuid::Uuid;

use gridnode_common::error::{GridError, Result};
use gridnode_common::protocol::{
    Address, ClientConnectionStatus, ComputationStatusMessage, ControlMessage, EngineReadyMessage,
    Envelope, ExecutorHeartbeat, MessageClass, RegistrationData, RouterInfoMessage,
    SessionRoutingAction, SessionRoutingDataMessage,
};
use gridnode_common::transport::{read_frame, write_frame, write_registration};

use crate::events::EventSender;
use crate::session::manager::SessionManager;

/// How long to wait for the router to acknowledge routing data.
const ROUTING_ACK_TIMEOUT: Duration = Duration::from_secs(10);

/// Total time to wait for the router to report its message port.
const ROUTER_PORT_TIMEOUT: Duration = Duration::from_secs(10);

/// Retry cadence for the initial control-channel connect.
const CONNECT_ATTEMPTS: u32 = 10;
const CONNECT_RETRY_INTERVAL: Duration = Duration::from_secs(1);

pub struct RouterLink {
    node_id: Uuid,
    outbox: mpsc::UnboundedSender<Envelope>,
    router_port: AtomicU16,
    port_notify: Notify,
    acks: Mutex<HashSet<Uuid>>,
    ack_notify: Notify,
    manager: OnceLock<Weak<SessionManager>>,
    events: OnceLock<EventSender>,
    exiting: AtomicBool,
    lost: AtomicBool,
}

impl RouterLink {
    /// Connects to the router's IPC socket and registers as the control
    /// channel.
    pub async fn connect(node_id: Uuid, ipc_path: &Path) -> Result<Arc<RouterLink>> {
        let mut stream = UnixStream::connect(ipc_path).await.map_err(|err| {
            GridError::Connection(format!(
                "cannot connect to router IPC socket {}: {err}",
                ipc_path.display()
            ))
        })?;
        write_registration(&mut stream, &RegistrationData::control(node_id)).await?;

        let (outbox, outbox_rx) = mpsc::unbounded_channel();
        let link = Arc::new(RouterLink {
            node_id,
            outbox,
            router_port: AtomicU16::new(0),
            port_notify: Notify::new(),
            acks: Mutex::new(HashSet::new()),
            ack_notify: Notify::new(),
            manager: OnceLock::new(),
            events: OnceLock::new(),
            exiting: AtomicBool::new(false),
            lost: AtomicBool::new(false),
        });

        let (read_half, write_half) = stream.into_split();
        tokio::spawn(writer_task(link.clone(), outbox_rx, write_half));
        tokio::spawn(reader_task(link.clone(), read_half));

        Ok(link)
    }

    /// Connect with bounded retries, for startup while the router's socket
    /// is still appearing.
    pub async fn connect_with_retries(node_id: Uuid, ipc_path: &Path) -> Result<Arc<RouterLink>> {
        let mut last_err = None;
        for attempt in 0..CONNECT_ATTEMPTS {
            if attempt > 0 {
                tracing::debug!("retrying router connect ({attempt})");
                tokio::time::sleep(CONNECT_RETRY_INTERVAL).await;
            }
            match Self::connect(node_id, ipc_path).await {
                Ok(link) => return Ok(link),
                Err(err) => last_err = Some(err),
            }
        }
        Err(last_err.unwrap_or_else(|| {
            GridError::Connection("cannot connect to node router".to_string())
        }))
    }

    /// Test-only link with no socket; returns the outbox receiver so tests
    /// can observe what would have been sent.
    #[doc(hidden)]
    pub fn disconnected(node_id: Uuid) -> (Arc<RouterLink>, mpsc::UnboundedReceiver<Envelope>) {
        let (outbox, outbox_rx) = mpsc::unbounded_channel();
        (
            Arc::new(RouterLink {
                node_id,
                outbox,
                router_port: AtomicU16::new(0),
                port_notify: Notify::new(),
                acks: Mutex::new(HashSet::new()),
                ack_notify: Notify::new(),
                manager: OnceLock::new(),
                events: OnceLock::new(),
                exiting: AtomicBool::new(false),
                lost: AtomicBool::new(false),
            }),
            outbox_rx,
        )
    }

    pub fn node_id(&self) -> Uuid {
        self.node_id
    }

    /// Wires in the session manager and event sender once they exist; the
    /// link only holds a weak back-reference to the manager.
    pub fn attach(&self, manager: &Arc<SessionManager>, events: EventSender) {
        let _ = self.manager.set(Arc::downgrade(manager));
        let _ = self.events.set(events);
    }

    /// Suppresses the lost-router shutdown event during orderly exit.
    pub fn set_exiting(&self) {
        self.exiting.store(true, Ordering::SeqCst);
    }

    /// Waits for the `RouterInfo` reply carrying the router's TCP message
    /// port, needed to register the node.
    pub async fn wait_for_router_port(&self) -> Result<u16> {
        let deadline = Instant::now() + ROUTER_PORT_TIMEOUT;
        loop {
            let port = self.router_port.load(Ordering::SeqCst);
            if port != 0 {
                return Ok(port);
            }
            let notified = self.port_notify.notified();
            let port = self.router_port.load(Ordering::SeqCst);
            if port != 0 {
                return Ok(port);
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Err(GridError::Timeout(ROUTER_PORT_TIMEOUT.as_millis() as u64));
            }
        }
    }

    /// Installs a session's routing data with the router and waits for the
    /// acknowledge, which must happen before any computation spawns.
    pub async fn initialize_session(&self, session_id: Uuid, routing: &Value) -> Result<()> {
        let msg = SessionRoutingDataMessage::with_routing(
            SessionRoutingAction::Initialize,
            session_id,
            serde_json::to_string(routing)?,
        );
        self.send(Envelope::pack(&msg)?);

        let deadline = Instant::now() + ROUTING_ACK_TIMEOUT;
        loop {
            if self.take_ack(&session_id) {
                return Ok(());
            }
            let notified = self.ack_notify.notified();
            if self.take_ack(&session_id) {
                return Ok(());
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Err(GridError::Timeout(ROUTING_ACK_TIMEOUT.as_millis() as u64));
            }
        }
    }

    fn take_ack(&self, session_id: &Uuid) -> bool {
        self.acks
            .lock()
            .expect("ack set lock poisoned")
            .remove(session_id)
    }

    /// Updates a running session's routing with the router; currently this
    /// refreshes the client addresser.
    pub fn update_session(&self, session_id: Uuid, signal_data: &Value) {
        let routing = &signal_data["routing"];
        let routing_str = match serde_json::to_string(routing) {
            Ok(s) => s,
            Err(err) => {
                tracing::error!(session = %session_id, "cannot encode routing update: {err}");
                return;
            }
        };
        let msg = SessionRoutingDataMessage::with_routing(
            SessionRoutingAction::Update,
            session_id,
            routing_str,
        );
        self.pack_and_send(&msg);
    }

    /// Tells the router to disconnect a session's client.
    ///
    /// Used both when a session is deleted and when a connection arrives for
    /// a defunct session; the two races are arranged to look the same to the
    /// client, distinguishable only by `disconnectReason`.
    pub fn kick_client(&self, session_id: Uuid, disconnect_reason: &str, stopped_reason: &str) {
        let status = json!({
            "disconnectReason": disconnect_reason,
            "execStatus": "stopped",
            "execStoppedReason": stopped_reason,
        });
        let msg = ClientConnectionStatus {
            session_id,
            reason: disconnect_reason.to_string(),
            session_status: status.to_string(),
        };
        self.pack_and_send(&msg);
    }

    /// Shuts a session down with the router: kick the client, then release
    /// the routing data.
    pub fn shutdown_session(&self, session_id: Uuid, reason: &str) {
        self.kick_client(session_id, reason, reason);
        let msg = SessionRoutingDataMessage::new(SessionRoutingAction::Delete, session_id);
        self.pack_and_send(&msg);
    }

    /// Sends a control command to a computation via the router.
    pub fn send_control(
        &self,
        computation_id: Uuid,
        session_id: Uuid,
        command: &str,
        data: Option<&Value>,
    ) {
        tracing::debug!(
            session = %session_id,
            "sending control '{}' to {}",
            command,
            computation_id
        );
        let data_str = data.map(|d| d.to_string()).unwrap_or_default();
        let msg = ControlMessage::new(command, data_str);
        match Envelope::pack(&msg) {
            Ok(env) => {
                let to = vec![Address::computation(session_id, self.node_id, computation_id)];
                self.send(env.addressed_to(to));
            }
            Err(err) => tracing::error!("cannot pack control message: {err}"),
        }
    }

    /// Polite stop request for a computation.
    pub fn send_stop(&self, computation_id: Uuid, session_id: Uuid) {
        self.send_control(computation_id, session_id, "stop", None);
    }

    /// Tells the session's client the engine is ready. An empty node and
    /// computation in the destination means "deliver to the client".
    pub fn signal_engine_ready(&self, session_id: Uuid) {
        match Envelope::pack(&EngineReadyMessage {}) {
            Ok(env) => self.send(env.addressed_to(vec![Address::client(session_id)])),
            Err(err) => tracing::error!("cannot pack engine ready: {err}"),
        }
    }

    fn pack_and_send<T: gridnode_common::protocol::WireMessage>(&self, msg: &T) {
        match Envelope::pack(msg) {
            Ok(env) => self.send(env),
            Err(err) => tracing::error!("cannot pack message for router: {err}"),
        }
    }

    fn send(&self, envelope: Envelope) {
        if self.outbox.send(envelope).is_err() {
            tracing::debug!("router link is down; message dropped");
        }
    }

    fn manager(&self) -> Option<Arc<SessionManager>> {
        self.manager.get().and_then(Weak::upgrade)
    }

    fn events(&self) -> Option<&EventSender> {
        self.events.get()
    }

    /// Handles one message from the router.
    fn handle_message(&self, envelope: Envelope) {
        match envelope.class {
            MessageClass::RouterInfo => {
                // the router decides its message port and reports it here
                if let Ok(info) = envelope.unpack::<RouterInfoMessage>() {
                    self.router_port.store(info.message_port, Ordering::SeqCst);
                    self.port_notify.notify_waiters();
                }
            }
            MessageClass::SessionRoutingData => {
                let Ok(msg) = envelope.unpack::<SessionRoutingDataMessage>() else {
                    return;
                };
                if msg.action == SessionRoutingAction::Acknowledge {
                    self.acks
                        .lock()
                        .expect("ack set lock poisoned")
                        .insert(msg.session_id);
                    self.ack_notify.notify_waiters();
                } else {
                    tracing::error!(
                        "expected routing data message with Acknowledge action, got {:?}",
                        msg.action
                    );
                }
            }
            MessageClass::ComputationStatus => {
                // always "computation ready", sent when the subprocess
                // registers on the router's IPC socket
                let Ok(msg) = envelope.unpack::<ComputationStatusMessage>() else {
                    return;
                };
                if let Some(events) = self.events() {
                    events.send(
                        Some(msg.session_id),
                        Some(msg.computation_id),
                        json!({ "eventType": "computationReady" }),
                    );
                }
            }
            MessageClass::ClientConnectionStatus => {
                let Ok(msg) = envelope.unpack::<ClientConnectionStatus>() else {
                    return;
                };
                if msg.reason == "connected" {
                    if let Some(manager) = self.manager() {
                        manager.on_client_connected(msg.session_id);
                    }
                } else {
                    // disconnect generally causes the Coordinator to delete
                    // the session
                    if let Some(events) = self.events() {
                        events.send(
                            Some(msg.session_id),
                            None,
                            json!({
                                "eventType": "sessionClientDisconnected",
                                "reason": msg.reason,
                            }),
                        );
                    }
                }
            }
            MessageClass::ExecutorHeartbeat => {
                let Ok(heartbeat) = envelope.unpack::<ExecutorHeartbeat>() else {
                    return;
                };
                let Some(from) = envelope.from else {
                    tracing::error!("heartbeat message without a source address");
                    return;
                };
                let (Some(session), Some(comp)) = (from.session, from.computation) else {
                    tracing::error!("heartbeat message with incomplete source address");
                    return;
                };
                if let Some(manager) = self.manager() {
                    if let Some(computation) = manager.computation(&session, &comp) {
                        computation.on_heartbeat(heartbeat);
                    }
                }
            }
            other => {
                tracing::debug!("unhandled {:?} message from router", other);
            }
        }
    }

    fn on_router_lost(&self) {
        if self.lost.swap(true, Ordering::SeqCst) {
            return;
        }
        if self.exiting.load(Ordering::SeqCst) {
            return;
        }
        tracing::error!("lost router connection");
        if let Some(events) = self.events() {
            events.send(
                None,
                None,
                json!({
                    "eventType": "shutdownWithError",
                    "reason": "Lost router connection",
                    "nodeId": self.node_id.to_string(),
                }),
            );
        }
    }
}

async fn writer_task(
    link: Arc<RouterLink>,
    mut outbox_rx: mpsc::UnboundedReceiver<Envelope>,
    mut write_half: tokio::net::unix::OwnedWriteHalf,
) {
    while let Some(envelope) = outbox_rx.recv().await {
        if let Err(err) = write_frame(&mut write_half, &envelope).await {
            tracing::error!("send to router failed: {err}");
            link.on_router_lost();
            return;
        }
    }
}

async fn reader_task(link: Arc<RouterLink>, mut read_half: tokio::net::unix::OwnedReadHalf) {
    loop {
        match read_frame(&mut read_half).await {
            Ok(envelope) => link.handle_message(envelope),
            Err(err) => {
                tracing::debug!("router read ended: {err}");
                link.on_router_lost();
                return;
            }
        }
    }
}
