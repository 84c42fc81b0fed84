//! Peer registry.
//!
//! Thread-safe tables of live endpoints keyed by what they are: the client
//! of a session, a peer node, a local computation, or passive listeners on a
//! session. Also owns the per-session stash of envelopes destined for a
//! client that has not connected yet.
//!
//! The registry holds strong references only while a peer is live; endpoint
//! teardown goes through [`destroy`](PeerRegistry::destroy), which reports
//! the peer's kind and id so the caller can emit the right notification.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use uuid::Uuid;

use gridnode_common::protocol::Envelope;

use crate::endpoint::{Endpoint, PeerKind};

#[derive(Default)]
struct RegistryInner {
    clients: HashMap<Uuid, Arc<Endpoint>>,
    nodes: HashMap<Uuid, Arc<Endpoint>>,
    computations: HashMap<Uuid, Arc<Endpoint>>,
    listeners: HashMap<Uuid, Vec<Arc<Endpoint>>>,
    stash: HashMap<Uuid, Vec<Envelope>>,
}

/// Tables of live endpoints plus the pending-envelope stash.
#[derive(Default)]
pub struct PeerRegistry {
    inner: Mutex<RegistryInner>,
}

impl PeerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers the client endpoint for a session and delivers any stashed
    /// envelopes, in arrival order, before the endpoint becomes findable by
    /// anyone else.
    pub fn track_client(&self, session_id: Uuid, endpoint: Arc<Endpoint>) {
        let mut inner = self.inner.lock().expect("peer registry lock poisoned");
        if let Some(stashed) = inner.stash.remove(&session_id) {
            for envelope in stashed {
                endpoint.queue_envelope(envelope);
            }
        }
        inner.clients.insert(session_id, endpoint);
    }

    pub fn track_node(&self, node_id: Uuid, endpoint: Arc<Endpoint>) {
        let mut inner = self.inner.lock().expect("peer registry lock poisoned");
        inner.nodes.insert(node_id, endpoint);
    }

    pub fn track_computation(&self, computation_id: Uuid, endpoint: Arc<Endpoint>) {
        let mut inner = self.inner.lock().expect("peer registry lock poisoned");
        inner.computations.insert(computation_id, endpoint);
    }

    pub fn track_listener(&self, session_id: Uuid, endpoint: Arc<Endpoint>) {
        let mut inner = self.inner.lock().expect("peer registry lock poisoned");
        inner.listeners.entry(session_id).or_default().push(endpoint);
    }

    pub fn find_client(&self, session_id: &Uuid) -> Option<Arc<Endpoint>> {
        let inner = self.inner.lock().expect("peer registry lock poisoned");
        inner.clients.get(session_id).cloned()
    }

    pub fn find_node(&self, node_id: &Uuid) -> Option<Arc<Endpoint>> {
        let inner = self.inner.lock().expect("peer registry lock poisoned");
        inner.nodes.get(node_id).cloned()
    }

    pub fn find_computation(&self, computation_id: &Uuid) -> Option<Arc<Endpoint>> {
        let inner = self.inner.lock().expect("peer registry lock poisoned");
        inner.computations.get(computation_id).cloned()
    }

    /// Returns a copy of the listener list to avoid holding the lock during
    /// delivery.
    pub fn listeners(&self, session_id: &Uuid) -> Vec<Arc<Endpoint>> {
        let inner = self.inner.lock().expect("peer registry lock poisoned");
        inner.listeners.get(session_id).cloned().unwrap_or_default()
    }

    /// Delivers to the session's client if one is registered, otherwise
    /// stashes the envelope. The re-check happens under the registry lock so
    /// a concurrently registering client cannot miss it.
    pub fn queue_to_client_or_stash(&self, session_id: Uuid, envelope: Envelope) -> bool {
        let mut inner = self.inner.lock().expect("peer registry lock poisoned");
        if let Some(client) = inner.clients.get(&session_id) {
            client.queue_envelope(envelope);
            true
        } else {
            inner.stash.entry(session_id).or_default().push(envelope);
            false
        }
    }

    /// Drops any stashed envelopes for a session.
    pub fn clear_stash(&self, session_id: &Uuid) {
        let mut inner = self.inner.lock().expect("peer registry lock poisoned");
        inner.stash.remove(session_id);
    }

    /// Removes the endpoint from whichever table holds it, returning its
    /// kind and id so the caller can emit the matching notification.
    pub fn destroy(&self, endpoint: &Arc<Endpoint>) -> Option<(PeerKind, Uuid)> {
        let mut inner = self.inner.lock().expect("peer registry lock poisoned");

        if let Some(id) = remove_matching(&mut inner.clients, endpoint) {
            return Some((PeerKind::Client, id));
        }
        if let Some(id) = remove_matching(&mut inner.nodes, endpoint) {
            return Some((PeerKind::Node, id));
        }
        if let Some(id) = remove_matching(&mut inner.computations, endpoint) {
            return Some((PeerKind::Computation, id));
        }
        let mut found = None;
        for (id, list) in inner.listeners.iter_mut() {
            if let Some(pos) = list.iter().position(|e| Arc::ptr_eq(e, endpoint)) {
                list.remove(pos);
                found = Some(*id);
                break;
            }
        }
        if let Some(id) = found {
            if inner.listeners.get(&id).is_some_and(Vec::is_empty) {
                inner.listeners.remove(&id);
            }
            return Some((PeerKind::Listener, id));
        }
        None
    }

    /// Removes and returns every tracked endpoint; used at router shutdown.
    pub fn drain_all(&self) -> Vec<Arc<Endpoint>> {
        let mut inner = self.inner.lock().expect("peer registry lock poisoned");
        let mut all: Vec<Arc<Endpoint>> = Vec::new();
        all.extend(inner.clients.drain().map(|(_, e)| e));
        all.extend(inner.nodes.drain().map(|(_, e)| e));
        all.extend(inner.computations.drain().map(|(_, e)| e));
        all.extend(inner.listeners.drain().flat_map(|(_, l)| l));
        inner.stash.clear();
        all
    }
}

fn remove_matching(table: &mut HashMap<Uuid, Arc<Endpoint>>, needle: &Arc<Endpoint>) -> Option<Uuid> {
    let id = table
        .iter()
        .find(|(_, e)| Arc::ptr_eq(e, needle))
        .map(|(id, _)| *id)?;
    table.remove(&id);
    Some(id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use gridnode_common::protocol::{Envelope, MessageClass};

    fn app_envelope(tag: u32) -> Envelope {
        Envelope {
            class: MessageClass::Application(tag),
            routing_name: "TestMessage".to_string(),
            from: None,
            to: Vec::new(),
            payload: tag.to_be_bytes().to_vec(),
        }
    }

    #[tokio::test]
    async fn test_stash_then_drain_in_order() {
        let registry = PeerRegistry::new();
        let session = Uuid::new_v4();

        assert!(!registry.queue_to_client_or_stash(session, app_envelope(1)));
        assert!(!registry.queue_to_client_or_stash(session, app_envelope(2)));

        let (endpoint, mut rx) = Endpoint::detached(PeerKind::Client, session, Some(session));
        registry.track_client(session, endpoint);

        // stashed envelopes drained first, then live traffic
        assert!(registry.queue_to_client_or_stash(session, app_envelope(3)));

        for expected in 1..=3u32 {
            let env = rx.recv().await.expect("stashed envelope delivered");
            assert_eq!(env.payload, expected.to_be_bytes().to_vec());
        }
    }

    #[tokio::test]
    async fn test_clear_stash_drops_pending() {
        let registry = PeerRegistry::new();
        let session = Uuid::new_v4();

        registry.queue_to_client_or_stash(session, app_envelope(1));
        registry.clear_stash(&session);

        let (endpoint, mut rx) = Endpoint::detached(PeerKind::Client, session, Some(session));
        registry.track_client(session, endpoint);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_destroy_reports_kind_and_id() {
        let registry = PeerRegistry::new();
        let node_id = Uuid::new_v4();

        let (endpoint, _rx) = Endpoint::detached(PeerKind::Node, node_id, None);
        registry.track_node(node_id, endpoint.clone());

        let (kind, id) = registry.destroy(&endpoint).expect("endpoint was tracked");
        assert_eq!(kind, PeerKind::Node);
        assert_eq!(id, node_id);
        assert!(registry.find_node(&node_id).is_none());
        // second destroy is a no-op
        assert!(registry.destroy(&endpoint).is_none());
    }

    #[tokio::test]
    async fn test_find_returns_tracked_endpoint() {
        let registry = PeerRegistry::new();
        let comp = Uuid::new_v4();
        let session = Uuid::new_v4();

        let (endpoint, _rx) = Endpoint::detached(PeerKind::Computation, comp, Some(session));
        registry.track_computation(comp, endpoint.clone());

        let found = registry.find_computation(&comp).expect("tracked");
        assert!(Arc::ptr_eq(&found, &endpoint));
        assert!(registry.find_computation(&Uuid::new_v4()).is_none());
    }
}
