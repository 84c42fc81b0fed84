//! Event pipeline.
//!
//! Lifecycle events (computation ready/terminated, client disconnect,
//! session expiry, operation failures) are queued so callers never wait on
//! an HTTP round trip; a single worker drains the queue and dispatches each
//! event to the Coordinator. The Coordinator is the source of truth, so a
//! failed delivery is logged and dropped, never retried.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use tokio::sync::{mpsc, watch};
use uuid::Uuid;

use gridnode_common::error::{GridError, Result};
use gridnode_common::object;

/// Queue capacity; events beyond this are dropped with a warning.
const EVENT_QUEUE_CAPACITY: usize = 256;

/// It isn't safe to DELETE a session immediately after it was created, so
/// deletes are delayed slightly.
const PRE_DELETE_DELAY: Duration = Duration::from_millis(50);

const USER_AGENT: &str = "gridnode-agent";

/// One lifecycle event headed for the Coordinator.
#[derive(Debug, Clone)]
pub struct Event {
    pub session_id: Option<Uuid>,
    pub computation_id: Option<Uuid>,
    pub data: Value,
}

/// Cloneable handle for queueing events.
#[derive(Clone)]
pub struct EventSender {
    tx: mpsc::Sender<Event>,
    pending: Arc<AtomicUsize>,
}

impl EventSender {
    /// Queues an event; never blocks. A full queue drops the event.
    pub fn send(&self, session_id: Option<Uuid>, computation_id: Option<Uuid>, data: Value) {
        let event = Event {
            session_id,
            computation_id,
            data,
        };
        match self.tx.try_send(event) {
            Ok(()) => {
                self.pending.fetch_add(1, Ordering::SeqCst);
            }
            Err(err) => {
                tracing::warn!("event queue full, dropping event: {err}");
            }
        }
    }

    /// Records a failed session operation; the Coordinator is expected to
    /// delete the session in response.
    pub fn operation_failed(&self, session_id: Uuid, opname: &str, message: &str) {
        tracing::error!(
            session = %session_id,
            "session operation '{}' failed: {}",
            opname,
            message
        );
        self.send(
            Some(session_id),
            None,
            json!({ "eventType": "sessionOperationFailed", "reason": message }),
        );
    }

    /// Waits until the queue has drained, up to the timeout.
    pub async fn drain(&self, timeout: Duration) {
        let deadline = tokio::time::Instant::now() + timeout;
        while self.pending.load(Ordering::SeqCst) > 0 {
            if tokio::time::Instant::now() >= deadline {
                tracing::warn!("event queue did not drain before timeout");
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    /// Test-only sender whose queue is observable and never dispatched.
    #[doc(hidden)]
    pub fn null() -> (EventSender, mpsc::Receiver<Event>) {
        let (tx, rx) = mpsc::channel(EVENT_QUEUE_CAPACITY);
        (
            EventSender {
                tx,
                pending: Arc::new(AtomicUsize::new(0)),
            },
            rx,
        )
    }
}

/// The queue worker plus its Coordinator HTTP client.
pub struct EventPipeline {
    rx: mpsc::Receiver<Event>,
    pending: Arc<AtomicUsize>,
    coordinator: CoordinatorClient,
    stop: watch::Sender<bool>,
}

impl EventPipeline {
    /// Creates the pipeline; `stop` is signalled when a `shutdownWithError`
    /// event asks for orderly shutdown.
    pub fn new(coordinator: CoordinatorClient, stop: watch::Sender<bool>) -> (EventSender, Self) {
        let (tx, rx) = mpsc::channel(EVENT_QUEUE_CAPACITY);
        let pending = Arc::new(AtomicUsize::new(0));
        (
            EventSender {
                tx,
                pending: pending.clone(),
            },
            EventPipeline {
                rx,
                pending,
                coordinator,
                stop,
            },
        )
    }

    /// Starts the single drain worker.
    pub fn spawn(mut self) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            while let Some(event) = self.rx.recv().await {
                self.dispatch(event).await;
                self.pending.fetch_sub(1, Ordering::SeqCst);
            }
        })
    }

    async fn dispatch(&self, event: Event) {
        let event_type = object::get_str(&event.data, "eventType", "");
        if event_type.is_empty() {
            tracing::error!("missing 'eventType' string in event data: {}", event.data);
            return;
        }
        tracing::debug!(
            "sending event {} for session {:?}",
            event_type,
            event.session_id
        );

        match event_type.as_str() {
            "computationTerminated" => {
                if let (Some(session), Some(comp)) = (event.session_id, event.computation_id) {
                    self.coordinator
                        .notify_terminated(session, comp, &event.data)
                        .await;
                }
            }
            "computationReady" => {
                if let (Some(session), Some(comp)) = (event.session_id, event.computation_id) {
                    self.coordinator.notify_ready(session, comp).await;
                }
            }
            "sessionClientDisconnected" | "sessionOperationFailed" | "sessionExpired" => {
                if let Some(session) = event.session_id {
                    self.coordinator
                        .notify_terminate_session(session, &event.data)
                        .await;
                }
            }
            "shutdownWithError" => {
                tracing::error!("shutdownWithError event: {}", event.data);
                tracing::error!("orderly shutdown of node");
                self.stop.send_replace(true);
            }
            other => {
                tracing::warn!("unknown 'eventType': {}", other);
            }
        }
    }
}

/// HTTP client for the Coordinator's REST API.
pub struct CoordinatorClient {
    base_url: String,
    http: reqwest::Client,
}

impl CoordinatorClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            http: reqwest::Client::builder()
                .user_agent(USER_AGENT)
                .build()
                .expect("reqwest client construction"),
        }
    }

    /// `computationTerminated` maps to
    /// `DELETE /sessions/<s>/computations/<c>` with the reason in a header.
    pub async fn notify_terminated(&self, session_id: Uuid, computation_id: Uuid, data: &Value) {
        tokio::time::sleep(PRE_DELETE_DELAY).await;

        let url = format!(
            "{}/sessions/{}/computations/{}",
            self.base_url, session_id, computation_id
        );
        let mut req = self.http.delete(&url);
        if let Some(reason) = data["reason"].as_str() {
            req = req.header("X-Host-Delete-Reason", escape_newlines(reason));
        }
        self.submit(req, &url, session_id).await;
    }

    /// `computationReady` maps to `PUT /sessions/<s>/hosts/<c>` with body
    /// `{"status": "ready"}`.
    pub async fn notify_ready(&self, session_id: Uuid, computation_id: Uuid) {
        let url = format!(
            "{}/sessions/{}/hosts/{}",
            self.base_url, session_id, computation_id
        );
        let req = self.http.put(&url).json(&json!({ "status": "ready" }));
        self.submit(req, &url, session_id).await;
    }

    /// Session-terminating events map to `DELETE /sessions/<s>` with the
    /// event type and reason in headers.
    pub async fn notify_terminate_session(&self, session_id: Uuid, data: &Value) {
        tokio::time::sleep(PRE_DELETE_DELAY).await;

        let url = format!("{}/sessions/{}", self.base_url, session_id);
        let event_type = object::get_str(data, "eventType", "");
        let reason = data["reason"]
            .as_str()
            .map(ToOwned::to_owned)
            .unwrap_or_else(|| event_type.clone());
        let req = self
            .http
            .delete(&url)
            .header("X-Grid-Event-Type", escape_newlines(&event_type))
            .header("X-Session-Delete-Reason", escape_newlines(&reason));
        self.submit(req, &url, session_id).await;
    }

    async fn submit(&self, req: reqwest::RequestBuilder, url: &str, session_id: Uuid) {
        match req.send().await {
            Ok(resp) => {
                let status = resp.status().as_u16();
                if status >= 400 {
                    let body = resp.text().await.unwrap_or_else(|_| "[NO DATA]".to_string());
                    tracing::warn!(
                        session = %session_id,
                        "Coordinator returned unexpected response to {}: code {} text {}",
                        url,
                        status,
                        body
                    );
                }
            }
            Err(err) => {
                tracing::warn!(session = %session_id, "event delivery to {} failed: {err}", url);
            }
        }
    }

    /// Registers this node's info document with the Coordinator.
    pub async fn register_node(&self, node_info: &Value) -> Result<()> {
        let url = format!("{}/nodes", self.base_url);
        let id = object::get_str(node_info, "id", "[UNKNOWN]");
        tracing::info!("registering node id {} with Coordinator", id);

        let resp = self
            .http
            .post(&url)
            .json(node_info)
            .send()
            .await
            .map_err(|err| GridError::Transport(format!("node registration failed: {err}")))?;
        let status = resp.status().as_u16();
        if status >= 400 {
            let body = resp.text().await.unwrap_or_else(|_| "[NO DATA]".to_string());
            return Err(GridError::Transport(format!(
                "node registration ('POST {url}') returned unacceptable status code {status} \
                 (response body: '{body}')"
            )));
        }
        Ok(())
    }

    /// Removes this node's registration.
    pub async fn deregister_node(&self, node_id: Uuid) -> Result<()> {
        let url = format!("{}/nodes/{}", self.base_url, node_id);
        tracing::info!("deregistering node id {} from Coordinator", node_id);

        let resp = self
            .http
            .delete(&url)
            .send()
            .await
            .map_err(|err| GridError::Transport(format!("node deregistration failed: {err}")))?;
        let status = resp.status().as_u16();
        if status >= 400 {
            return Err(GridError::Transport(format!(
                "node deregistration ('DELETE {url}') returned unacceptable status code {status}"
            )));
        }
        Ok(())
    }
}

/// Header values cannot contain newlines.
fn escape_newlines(s: &str) -> String {
    s.replace('\n', "\\n")
}
