//! The per-session state machine.
//!
//! A session moves `Free -> Busy -> Free` for create/modify and
//! `Free -> Busy -> Defunct` for delete. Only one asynchronous operation can
//! run at a time; attempting another while busy is a conflict, which the
//! HTTP surface reports as 409. Requests are never queued: the Coordinator
//! correlates each operation with the asynchronous events it produces, and
//! queueing would break that correlation.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde_json::{json, Value};
use tokio::sync::{watch, Notify};
use tokio::time::Instant;
use uuid::Uuid;

use gridnode_common::error::{GridError, Result};
use gridnode_common::object;

use crate::defaults::ComputationDefaults;
use crate::events::EventSender;
use crate::router_link::RouterLink;
use crate::session::computation::Computation;
use crate::session::config::SessionConfig;
use crate::session::spawn::prepare_spawn;


#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Free,
    Busy,
    Defunct,
}

impl SessionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionState::Free => "Free",
            SessionState::Busy => "Busy",
            SessionState::Defunct => "Defunct",
        }
    }
}

struct StateInner {
    state: SessionState,
    shutting_down: bool,
    delete_reason: String,
}

/// One session: its state machine, computations and expiration timer.
pub struct Session {
    id: Uuid,
    node_id: Uuid,
    defaults: ComputationDefaults,
    link: Arc<RouterLink>,
    events: EventSender,
    state: Mutex<StateInner>,
    op_complete: Notify,
    computations: Mutex<BTreeMap<Uuid, Arc<Computation>>>,
    last_activity_secs: AtomicI64,
    log_level: AtomicI64,
    expiration: Mutex<Option<watch::Sender<bool>>>,
}

impl Session {
    pub fn new(
        id: Uuid,
        node_id: Uuid,
        defaults: ComputationDefaults,
        link: Arc<RouterLink>,
        events: EventSender,
    ) -> Arc<Self> {
        let log_level = defaults.log_level;
        Arc::new(Self {
            id,
            node_id,
            defaults,
            link,
            events,
            state: Mutex::new(StateInner {
                state: SessionState::Free,
                shutting_down: false,
                delete_reason: "Not Deleted".to_string(),
            }),
            op_complete: Notify::new(),
            computations: Mutex::new(BTreeMap::new()),
            last_activity_secs: AtomicI64::new(now_secs()),
            log_level: AtomicI64::new(log_level),
            expiration: Mutex::new(None),
        })
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn state(&self) -> SessionState {
        self.state.lock().expect("state lock poisoned").state
    }

    pub fn delete_reason(&self) -> String {
        self.state
            .lock()
            .expect("state lock poisoned")
            .delete_reason
            .clone()
    }

    /// A session that reached `Defunct` stays in the index to absorb late
    /// references, but is no longer active.
    pub fn is_active(&self) -> bool {
        self.state() != SessionState::Defunct
    }

    pub fn computation(&self, id: &Uuid) -> Option<Arc<Computation>> {
        self.computations
            .lock()
            .expect("computations lock poisoned")
            .get(id)
            .cloned()
    }

    pub fn status(&self) -> Value {
        let mut comps = json!({});
        for comp in self
            .computations
            .lock()
            .expect("computations lock poisoned")
            .values()
        {
            comps[comp.name()] = comp.status();
        }
        json!({ "state": self.state().as_str(), "computations": comps })
    }

    pub fn performance_stats(&self) -> Value {
        let mut comps = json!({});
        for comp in self
            .computations
            .lock()
            .expect("computations lock poisoned")
            .values()
        {
            comps[comp.name()] = comp.performance_stats();
        }
        json!({ "computations": comps })
    }

    pub fn last_activity_secs(&self, include_computations: bool) -> i64 {
        let mut latest = self.last_activity_secs.load(Ordering::Relaxed);
        if include_computations {
            for comp in self
                .computations
                .lock()
                .expect("computations lock poisoned")
                .values()
            {
                latest = latest.max(comp.last_activity_secs());
            }
        }
        latest
    }

    fn touch_activity(&self) {
        // last activity is monotonic
        let now = now_secs();
        self.last_activity_secs.fetch_max(now, Ordering::Relaxed);
    }

    fn shutdown_wait(&self) -> Duration {
        Duration::from_secs(self.defaults.wait_for_shutdown_secs)
    }

    fn check_is_free(&self) -> Result<()> {
        let inner = self.state.lock().expect("state lock poisoned");
        match inner.state {
            SessionState::Busy => Err(GridError::Conflict("Session is busy".to_string())),
            SessionState::Defunct => Err(GridError::Conflict("Session is defunct".to_string())),
            SessionState::Free => Ok(()),
        }
    }

    /// Guarded entry into `Busy`; the one-op-at-a-time rule lives here.
    fn begin_operation(&self, verb: &str) -> Result<()> {
        let mut inner = self.state.lock().expect("state lock poisoned");
        if inner.shutting_down {
            return Err(GridError::Conflict("Session is shutting down".to_string()));
        }
        match inner.state {
            SessionState::Busy => Err(GridError::Conflict(format!(
                "Session is busy and cannot be {verb}"
            ))),
            SessionState::Defunct => Err(GridError::Conflict(format!(
                "Session is defunct and cannot be {verb}"
            ))),
            SessionState::Free => {
                inner.state = SessionState::Busy;
                Ok(())
            }
        }
    }

    fn end_operation(&self, next: SessionState, delete_reason: Option<String>) {
        {
            let mut inner = self.state.lock().expect("state lock poisoned");
            if next == SessionState::Defunct {
                inner.state = SessionState::Defunct;
                if let Some(reason) = delete_reason {
                    inner.delete_reason = reason;
                }
            } else if inner.state == SessionState::Busy {
                inner.state = SessionState::Free;
            }
        }
        // continue shutdown if it was waiting on us
        self.op_complete.notify_waiters();
    }

    /// Applies a signal to the session.
    ///
    /// `run` fans out to every local computation and, when the signal
    /// carries new routing, also updates the router's client addresser.
    /// `engineReady` is forwarded to the session's client via the router.
    pub fn signal(&self, signal_data: &Value) -> Result<()> {
        self.check_is_free()?;

        let status = object::get_str(signal_data, "status", "");
        if !status.is_empty() {
            tracing::debug!(session = %self.id, "session signal {}", status);
        }

        match status.as_str() {
            "run" => {
                self.signal_all(signal_data);
                if !object::member(signal_data, "routing").is_null() {
                    self.link.update_session(self.id, signal_data);
                }
            }
            "engineReady" => {
                self.link.signal_engine_ready(self.id);
            }
            _ => {
                tracing::warn!(
                    session = %self.id,
                    "unknown signal received: {}",
                    signal_data
                );
            }
        }
        self.touch_activity();
        Ok(())
    }

    fn signal_all(&self, signal_data: &Value) {
        for comp in self
            .computations
            .lock()
            .expect("computations lock poisoned")
            .values()
        {
            comp.signal(signal_data);
        }
    }

    /// Starts the asynchronous create/modify worker for a new configuration.
    pub fn async_update_config(self: &Arc<Self>, config: Arc<SessionConfig>) -> Result<()> {
        if self.id != config.session_id() {
            return Err(GridError::Internal(
                "config session id did not match session object".to_string(),
            ));
        }
        if self.node_id != config.node_id() {
            return Err(GridError::Internal(
                "config node id did not match session object".to_string(),
            ));
        }

        self.begin_operation("modified")?;

        let this = Arc::clone(self);
        tokio::spawn(async move {
            if let Err(err) = this.apply_new_config(&config).await {
                this.events.operation_failed(this.id, "create/modify", &err.to_string());
            }
            this.end_operation(SessionState::Free, None);
        });

        self.touch_activity();
        Ok(())
    }

    /// Starts the asynchronous delete worker.
    pub fn async_delete(self: &Arc<Self>, reason: String) -> Result<()> {
        self.begin_operation("deleted")?;

        let this = Arc::clone(self);
        let deadline = Instant::now() + self.shutdown_wait();
        tokio::spawn(async move {
            this.delete_proc(reason, deadline).await;
        });

        self.touch_activity();
        Ok(())
    }

    /// Synchronous shutdown, used when the node itself is going down. Waits
    /// for any in-flight operation, then stops all computations, each step
    /// with its own full deadline. Sessions are shut down sequentially so
    /// terminations don't pile up.
    pub async fn sync_shutdown(&self, reason: &str) -> Result<()> {
        tracing::debug!(session = %self.id, "shutting down session");
        let op_deadline = Instant::now() + self.shutdown_wait();

        {
            let mut inner = self.state.lock().expect("state lock poisoned");
            // prevent new operations from starting
            inner.shutting_down = true;
        }

        // wait for any running operation to complete
        loop {
            if self.state() != SessionState::Busy {
                break;
            }
            let notified = self.op_complete.notified();
            if self.state() != SessionState::Busy {
                break;
            }
            if tokio::time::timeout_at(op_deadline, notified).await.is_err() {
                return Err(GridError::Internal(
                    "Session shutdown took too long".to_string(),
                ));
            }
        }

        // computation teardown gets a fresh window, not the remainder of
        // the operation wait
        let delete_deadline = Instant::now() + self.shutdown_wait();
        self.delete_proc(reason.to_string(), delete_deadline).await;
        tracing::debug!(session = %self.id, "have shut down session");
        Ok(())
    }

    async fn delete_proc(&self, reason: String, deadline: Instant) {
        let comps: Vec<Arc<Computation>> = self
            .computations
            .lock()
            .expect("computations lock poisoned")
            .values()
            .cloned()
            .collect();

        for comp in &comps {
            comp.shutdown();
        }
        for comp in &comps {
            if !comp.wait_until_exit(deadline).await {
                tracing::error!(
                    session = %self.id,
                    "cannot stop computation {} [{}]",
                    comp.name(),
                    comp.id()
                );
                comp.force_kill();
            }
        }

        self.link.shutdown_session(self.id, &reason);
        self.stop_expiration();
        self.end_operation(SessionState::Defunct, Some(reason));
    }

    /// The create/modify worker: shut down removed computations, wait for
    /// their resources to free, then spawn added ones.
    async fn apply_new_config(self: &Arc<Self>, config: &SessionConfig) -> Result<()> {
        if let Some(level) = config.log_level() {
            self.log_level.store(level, Ordering::Relaxed);
        }

        let (defunct, added) = self.config_delta(config);

        for comp in &defunct {
            comp.shutdown();
        }

        // wait for removed computations to exit, so their resources are
        // released before the new ones spawn
        let deadline = Instant::now() + self.shutdown_wait();
        for comp in &defunct {
            if !comp.wait_until_exit(deadline).await {
                tracing::error!(
                    session = %self.id,
                    "cannot stop computation {} [{}]",
                    comp.name(),
                    comp.id()
                );
                return Err(GridError::Internal(
                    "Computations did not shutdown within timeout".to_string(),
                ));
            }
        }

        for (comp_id, name) in added {
            self.start_new_computation(comp_id, &name, config)?;
        }
        Ok(())
    }

    /// Existing computations absent from the new config, and configured
    /// computations that don't exist yet.
    fn config_delta(&self, config: &SessionConfig) -> (Vec<Arc<Computation>>, Vec<(Uuid, String)>) {
        let comps = self
            .computations
            .lock()
            .expect("computations lock poisoned");
        let defunct = comps
            .iter()
            .filter(|(id, _)| !config.computations().contains_key(id))
            .map(|(_, c)| c.clone())
            .collect();
        let added = config
            .computations()
            .iter()
            .filter(|(id, _)| !comps.contains_key(id))
            .map(|(id, name)| (*id, name.clone()))
            .collect();
        (defunct, added)
    }

    fn start_new_computation(
        self: &Arc<Self>,
        comp_id: Uuid,
        name: &str,
        config: &SessionConfig,
    ) -> Result<()> {
        tracing::debug!(session = %self.id, "launching computation {} [{}]", name, comp_id);

        let log_level = self.log_level.load(Ordering::Relaxed);
        let (spec, exec_config_path) =
            prepare_spawn(comp_id, name, config, &self.defaults, log_level)?;

        let comp = Computation::new(
            comp_id,
            name,
            self.id,
            self.link.clone(),
            self.events.clone(),
            self.defaults.auto_suspend,
            Some(exec_config_path),
        );
        comp.start(spec)?;

        self.computations
            .lock()
            .expect("computations lock poisoned")
            .insert(comp_id, comp);
        Ok(())
    }

    /// Arms the expiration timer: unless cancelled, the session reports
    /// itself expired at the deadline and the Coordinator deletes it.
    pub fn set_expiration(self: &Arc<Self>, deadline: Instant, message: &str) {
        self.stop_expiration();

        let (cancel_tx, mut cancel_rx) = watch::channel(false);
        *self.expiration.lock().expect("expiration lock poisoned") = Some(cancel_tx);

        let this = Arc::clone(self);
        let message = message.to_string();
        tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep_until(deadline) => {
                    if !*cancel_rx.borrow() {
                        tracing::warn!(session = %this.id, "session expired: {}", message);
                        this.events.send(
                            Some(this.id),
                            None,
                            json!({ "eventType": "sessionExpired", "reason": message }),
                        );
                    }
                }
                _ = cancel_rx.changed() => {}
            }
        });
    }

    /// Cancels any pending expiration; called on client connect and delete.
    pub fn stop_expiration(&self) {
        if let Some(cancel) = self
            .expiration
            .lock()
            .expect("expiration lock poisoned")
            .take()
        {
            let _ = cancel.send(true);
        }
    }
}

fn now_secs() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    // state machine guards are unit-tested through the private guard
    // methods; full operation flows are covered by integration tests with a
    // live router

    fn test_session() -> Arc<Session> {
        let (link, _rx) = RouterLink::disconnected(Uuid::new_v4());
        let (events, _erx) = EventSender::null();
        Session::new(
            Uuid::new_v4(),
            Uuid::new_v4(),
            ComputationDefaults::default(),
            link,
            events,
        )
    }

    #[tokio::test]
    async fn test_busy_rejects_second_operation() {
        let session = test_session();
        session.begin_operation("modified").unwrap();
        let err = session.begin_operation("modified").unwrap_err();
        assert_eq!(err.http_status(), 409);
        assert_eq!(session.state(), SessionState::Busy);
    }

    #[tokio::test]
    async fn test_defunct_is_terminal() {
        let session = test_session();
        session.begin_operation("deleted").unwrap();
        session.end_operation(SessionState::Defunct, Some("test over".to_string()));

        assert_eq!(session.state(), SessionState::Defunct);
        assert_eq!(session.delete_reason(), "test over");
        assert!(!session.is_active());

        // no operation can leave Defunct
        assert!(session.begin_operation("modified").is_err());
        session.end_operation(SessionState::Free, None);
        assert_eq!(session.state(), SessionState::Defunct);
    }

    #[tokio::test]
    async fn test_end_operation_returns_to_free() {
        let session = test_session();
        session.begin_operation("modified").unwrap();
        session.end_operation(SessionState::Free, None);
        assert_eq!(session.state(), SessionState::Free);
        assert!(session.begin_operation("modified").is_ok());
    }

    #[tokio::test]
    async fn test_shutting_down_blocks_new_operations() {
        let session = test_session();
        session
            .state
            .lock()
            .unwrap()
            .shutting_down = true;
        let err = session.begin_operation("modified").unwrap_err();
        assert!(err.to_string().contains("shutting down"));
    }

    #[tokio::test]
    async fn test_signal_on_busy_session_conflicts() {
        let session = test_session();
        session.begin_operation("modified").unwrap();
        let err = session.signal(&json!({"status": "run"})).unwrap_err();
        assert_eq!(err.http_status(), 409);
    }

    #[tokio::test]
    async fn test_last_activity_is_monotonic() {
        let session = test_session();
        let before = session.last_activity_secs(false);
        session.touch_activity();
        assert!(session.last_activity_secs(false) >= before);
    }

    #[tokio::test]
    async fn test_status_shape() {
        let session = test_session();
        let status = session.status();
        assert_eq!(status["state"], json!("Free"));
        assert!(status["computations"].is_object());
    }

    #[tokio::test]
    async fn test_expiration_fires_event() {
        let (events, mut erx) = EventSender::null();
        let (link, _rx) = RouterLink::disconnected(Uuid::new_v4());
        let session = Session::new(
            Uuid::new_v4(),
            Uuid::new_v4(),
            ComputationDefaults::default(),
            link,
            events,
        );

        session.set_expiration(
            Instant::now() + Duration::from_millis(20),
            "Client failed to connect",
        );
        let event = tokio::time::timeout(Duration::from_secs(2), erx.recv())
            .await
            .expect("expiration event")
            .expect("sender alive");
        assert_eq!(event.data["eventType"], json!("sessionExpired"));
    }

    #[tokio::test]
    async fn test_expiration_cancelled_by_stop() {
        let session = test_session();
        session.set_expiration(Instant::now() + Duration::from_millis(50), "expiry");
        session.stop_expiration();
        tokio::time::sleep(Duration::from_millis(100)).await;
        // nothing observable to assert directly; covered by the event-based
        // test above plus absence of panics here
    }
}
