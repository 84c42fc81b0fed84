//! The session manager.
//!
//! Owns the index of every session this node has ever hosted. Defunct
//! sessions are retained so late routing and kick requests can be answered
//! deterministically; only the Coordinator decides what exists.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde_json::{json, Value};
use tokio::time::Instant;
use uuid::Uuid;

use gridnode_common::error::{GridError, Result};

use crate::defaults::ComputationDefaults;
use crate::events::EventSender;
use crate::router_link::RouterLink;
use crate::session::computation::Computation;
use crate::session::config::SessionConfig;
use crate::session::session::Session;

pub struct SessionManager {
    node_id: Uuid,
    defaults: ComputationDefaults,
    link: Arc<RouterLink>,
    events: EventSender,
    sessions: Mutex<BTreeMap<Uuid, Arc<Session>>>,
    closed: AtomicBool,
    start_time_secs: i64,
}

impl SessionManager {
    pub fn new(
        node_id: Uuid,
        defaults: ComputationDefaults,
        link: Arc<RouterLink>,
        events: EventSender,
    ) -> Arc<Self> {
        Arc::new(Self {
            node_id,
            defaults,
            link,
            events,
            sessions: Mutex::new(BTreeMap::new()),
            closed: AtomicBool::new(false),
            start_time_secs: now_secs(),
        })
    }

    pub fn node_id(&self) -> Uuid {
        self.node_id
    }

    pub fn session(&self, id: &Uuid) -> Option<Arc<Session>> {
        self.sessions
            .lock()
            .expect("sessions lock poisoned")
            .get(id)
            .cloned()
    }

    pub fn computation(&self, session_id: &Uuid, id: &Uuid) -> Option<Arc<Computation>> {
        self.session(session_id).and_then(|s| s.computation(id))
    }

    /// Ids of sessions that have not gone defunct.
    pub fn active_session_ids(&self) -> Vec<Uuid> {
        self.sessions
            .lock()
            .expect("sessions lock poisoned")
            .values()
            .filter(|s| s.is_active())
            .map(|s| s.id())
            .collect()
    }

    pub fn status(&self, id: &Uuid) -> Result<Value> {
        self.session(id)
            .map(|s| s.status())
            .ok_or_else(|| GridError::NotFound("Session does not exist".to_string()))
    }

    pub fn performance(&self, id: &Uuid) -> Result<Value> {
        self.session(id)
            .map(|s| s.performance_stats())
            .ok_or_else(|| GridError::NotFound("Session does not exist".to_string()))
    }

    /// Applies a `run`/`engineReady` signal to a session.
    pub fn signal_session(&self, id: &Uuid, signal_data: &Value) -> Result<()> {
        match self.session(id) {
            Some(session) => session.signal(signal_data),
            None => Err(GridError::NotFound("Session does not exist".to_string())),
        }
    }

    /// Creates a session from a Coordinator definition document.
    ///
    /// Routing is installed with the router synchronously (acknowledged
    /// before any computation spawns); the computations themselves launch
    /// asynchronously. Returns the per-computation response map.
    pub async fn create_session(self: &Arc<Self>, definition: &Value) -> Result<Value> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(GridError::Conflict(
                "Node is closed : cannot accept new sessions".to_string(),
            ));
        }

        let config = Arc::new(SessionConfig::parse(definition, self.node_id)?);
        let id = config.session_id();
        tracing::debug!(session = %id, "creating session");

        let session = {
            let mut sessions = self.sessions.lock().expect("sessions lock poisoned");
            if sessions.contains_key(&id) {
                return Err(GridError::Conflict("Session already exists".to_string()));
            }
            let session = Session::new(
                id,
                self.node_id,
                self.defaults.clone(),
                self.link.clone(),
                self.events.clone(),
            );
            sessions.insert(id, session.clone());
            session
        };

        if let Err(err) = self.link.initialize_session(id, config.routing()).await {
            self.remove_session(&id);
            tracing::error!(session = %id, "routing install failed: {err}");
            return Err(GridError::Internal(
                "Failed to initialize session with node router".to_string(),
            ));
        }

        if config.is_entry_node() {
            tracing::debug!(session = %id, "this node is session entry node");
            // entry-node sessions expire unless the client connects in time
            let deadline = Instant::now()
                + Duration::from_secs(self.defaults.client_connection_timeout_secs);
            session.set_expiration(deadline, "Client failed to connect");
        }

        tracing::debug!(session = %id, "about to spawn computations");
        if let Err(err) = session.async_update_config(config.clone()) {
            self.remove_session(&id);
            return Err(err);
        }
        Ok(config.response().clone())
    }

    /// Modifies an existing session to match a new definition document.
    pub fn modify_session(&self, definition: &Value) -> Result<Value> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(GridError::Conflict(
                "Node is closed : cannot modify sessions".to_string(),
            ));
        }

        let config = Arc::new(SessionConfig::parse(definition, self.node_id)?);
        let id = config.session_id();
        tracing::debug!(session = %id, "modifying session");

        let session = self
            .session(&id)
            .ok_or_else(|| GridError::NotFound("Session doesn't exist".to_string()))?;
        session.async_update_config(config.clone())?;
        Ok(config.response().clone())
    }

    /// Starts asynchronous deletion; the session stays in the index as
    /// `Defunct` once the operation completes.
    pub fn delete_session(&self, id: &Uuid, reason: &str) -> Result<()> {
        let session = self
            .session(id)
            .ok_or_else(|| GridError::NotFound("Session doesn't exist".to_string()))?;
        tracing::debug!(session = %id, "deleting session, reason: {}", reason);
        session.async_delete(reason.to_string())
    }

    fn remove_session(&self, id: &Uuid) {
        self.sessions
            .lock()
            .expect("sessions lock poisoned")
            .remove(id);
    }

    /// Router notification that a client connected to a session.
    ///
    /// For an active session this cancels the expiration deadline. A client
    /// of a defunct or unknown session was accepted transiently and is
    /// kicked with the final status.
    pub fn on_client_connected(&self, session_id: Uuid) {
        match self.session(&session_id) {
            Some(session) if session.is_active() => {
                tracing::debug!(session = %session_id, "client has connected to session");
                session.stop_expiration();
            }
            Some(session) => {
                // connection to a defunct session is part of a race with
                // delete; arrange that it looks like deletion after connect
                self.link
                    .kick_client(session_id, "sessionDeleted", &session.delete_reason());
            }
            None => {
                self.link
                    .kick_client(session_id, "unknownSession", "unknownSession");
            }
        }
    }

    /// Per-session idle seconds plus the node-wide idle time.
    pub fn idle_status(&self) -> Value {
        let now = now_secs();
        let mut most_recent = self.start_time_secs;
        let mut sessions = Vec::new();
        for session in self.sessions.lock().expect("sessions lock poisoned").values() {
            let last = session.last_activity_secs(true);
            most_recent = most_recent.max(last);
            sessions.push(json!({
                "id": session.id().to_string(),
                "idletime": now - last,
            }));
        }
        json!({ "sessions": sessions, "idletime": now - most_recent })
    }

    pub fn last_activity_secs(&self, include_computations: bool) -> i64 {
        self.sessions
            .lock()
            .expect("sessions lock poisoned")
            .values()
            .map(|s| s.last_activity_secs(include_computations))
            .max()
            .unwrap_or(0)
    }

    /// Stops accepting new sessions; existing ones continue to be served.
    pub fn set_closed(&self, closed: bool) {
        self.closed.store(closed, Ordering::SeqCst);
    }

    /// Sequential, synchronous shutdown of every session. Serialization
    /// bounds how many terminations run at once.
    pub async fn shutdown_all(&self, reason: &str) {
        tracing::debug!("shutting down all sessions");
        self.set_closed(true);
        let sessions: Vec<Arc<Session>> = self
            .sessions
            .lock()
            .expect("sessions lock poisoned")
            .values()
            .cloned()
            .collect();
        for session in sessions {
            if let Err(err) = session.sync_shutdown(reason).await {
                tracing::warn!(
                    session = %session.id(),
                    "failed to shutdown session: {err}"
                );
            }
        }
        tracing::debug!("have shut down all sessions");
    }
}

fn now_secs() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}
