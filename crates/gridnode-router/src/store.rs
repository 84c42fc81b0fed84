//! Per-session routing data and the routing store.
//!
//! The store keeps two parallel tables keyed by session id: a strong table
//! that pins routing data alive during session setup, and a weak table that
//! long-lived consumer tasks upgrade per message. The manager releases the
//! strong entry once install completes; an explicit delete drops both.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};

use serde_json::Value;
use uuid::Uuid;

use gridnode_common::error::{GridError, Result};
use gridnode_common::object;
use gridnode_common::protocol::Envelope;

use crate::addresser::ClientAddresser;

/// Connection details for one node in a session's routing table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeInfo {
    pub node_id: Uuid,
    pub hostname: String,
    pub ip: String,
    pub port: u16,
}

/// Session-wide map from node id to connection details, plus the entry node.
///
/// Updates are additive only: node ids name fixed machines, and existing
/// connections cannot be re-pointed anyway.
pub struct NodeMap {
    entry_node_id: Uuid,
    map: Mutex<HashMap<Uuid, NodeInfo>>,
}

impl NodeMap {
    /// Builds the map from the `nodes` object of a session routing document:
    /// `{<nodeId>: {host, ip, tcp, entry?}}`.
    pub fn from_session_routing(session_routing: &Value) -> Result<Self> {
        let nodes = object::object(session_routing, "nodes");
        let Some(node_objs) = nodes.as_object() else {
            return Err(GridError::BadRequest(
                "session routing data has no nodes object".to_string(),
            ));
        };

        let mut map = HashMap::new();
        let mut entry_node_id = Uuid::nil();
        for (key, info) in node_objs {
            let node_id = Uuid::parse_str(key).map_err(|_| {
                GridError::BadRequest(format!("invalid node id '{key}' in routing data"))
            })?;
            map.insert(node_id, Self::parse_node_info(node_id, info));
            if object::get_bool(info, "entry", false) {
                entry_node_id = node_id;
            }
        }
        tracing::info!("session node map has {} node(s)", map.len());

        Ok(Self {
            entry_node_id,
            map: Mutex::new(map),
        })
    }

    fn parse_node_info(node_id: Uuid, info: &Value) -> NodeInfo {
        NodeInfo {
            node_id,
            hostname: object::get_str(info, "host", ""),
            ip: object::get_str(info, "ip", ""),
            port: object::get_u64(info, "tcp", 0) as u16,
        }
    }

    /// Adds nodes from an updated routing document. Existing entries are
    /// never modified or removed.
    pub fn update(&self, session_routing: &Value) {
        let nodes = object::object(session_routing, "nodes");
        let Some(node_objs) = nodes.as_object() else {
            return;
        };
        let mut map = self.map.lock().expect("node map lock poisoned");
        for (key, info) in node_objs {
            let Ok(node_id) = Uuid::parse_str(key) else {
                tracing::warn!("ignoring invalid node id '{}' in routing update", key);
                continue;
            };
            map.entry(node_id)
                .or_insert_with(|| Self::parse_node_info(node_id, info));
        }
    }

    /// The entry node id is fixed at session creation.
    pub fn entry_node_id(&self) -> Uuid {
        self.entry_node_id
    }

    pub fn node_info(&self, node_id: &Uuid) -> Option<NodeInfo> {
        self.map
            .lock()
            .expect("node map lock poisoned")
            .get(node_id)
            .cloned()
    }
}

/// Routing data for one session.
///
/// Holds the session node map and, on the entry node only, the client
/// addresser that rewrites destinations for client-originated messages.
pub struct SessionRoutingData {
    session_id: Uuid,
    node_id: Uuid,
    node_map: NodeMap,
    client_addresser: Option<Mutex<ClientAddresser>>,
}

impl SessionRoutingData {
    /// Parses the routing document sent by the session manager:
    /// `{<sessionId>: {nodes: ..., computations: ...}, messageFilter?: ...}`.
    pub fn new(session_id: Uuid, node_id: Uuid, routing: &Value) -> Result<Self> {
        let session_routing = object::member(routing, &session_id.to_string());
        let node_map = NodeMap::from_session_routing(session_routing)?;

        let client_addresser = if node_id == node_map.entry_node_id() {
            Some(Mutex::new(ClientAddresser::from_routing(
                session_id, routing,
            )?))
        } else {
            None
        };

        Ok(Self {
            session_id,
            node_id,
            node_map,
            client_addresser,
        })
    }

    pub fn session_id(&self) -> Uuid {
        self.session_id
    }

    pub fn node_id(&self) -> Uuid {
        self.node_id
    }

    pub fn node_map(&self) -> &NodeMap {
        &self.node_map
    }

    pub fn is_entry_node(&self) -> bool {
        self.client_addresser.is_some()
    }

    /// Replaces the client addresser contents from an updated routing
    /// document. A no-op on non-entry nodes.
    pub fn update_client_addresser(&self, routing: &Value) {
        let Some(addresser) = &self.client_addresser else {
            return;
        };
        match ClientAddresser::from_routing(self.session_id, routing) {
            Ok(updated) => {
                *addresser.lock().expect("addresser lock poisoned") = updated;
            }
            Err(err) => {
                tracing::error!(
                    session = %self.session_id,
                    "cannot update client addresser: {err}"
                );
            }
        }
    }

    /// Rewrites the destination list of a client-originated envelope.
    ///
    /// # Errors
    ///
    /// Fails if this node has no client addresser: client messages can only
    /// arrive on the entry node, so a missing addresser is an internal error.
    pub fn address_client_envelope(&self, envelope: &mut Envelope) -> Result<()> {
        let Some(addresser) = &self.client_addresser else {
            return Err(GridError::Internal(
                "no client addresser for client-originated message".to_string(),
            ));
        };
        addresser
            .lock()
            .expect("addresser lock poisoned")
            .address(envelope);
        Ok(())
    }
}

#[derive(Default)]
struct StoreInner {
    strong: HashMap<Uuid, Arc<SessionRoutingData>>,
    weak: HashMap<Uuid, Weak<SessionRoutingData>>,
}

/// The routing-data store.
///
/// Both tables are kept behind one mutex; consumers never hold the lock
/// while sending.
#[derive(Default)]
pub struct RoutingStore {
    inner: Mutex<StoreInner>,
}

impl RoutingStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts routing data in both tables. The strong entry keeps the data
    /// alive until [`release`](Self::release).
    pub fn add(&self, session_id: Uuid, data: Arc<SessionRoutingData>) {
        let mut inner = self.inner.lock().expect("routing store lock poisoned");
        inner.weak.insert(session_id, Arc::downgrade(&data));
        inner.strong.insert(session_id, data);
    }

    /// Drops the strong entry; the weak one remains for live consumers.
    pub fn release(&self, session_id: &Uuid) {
        let mut inner = self.inner.lock().expect("routing store lock poisoned");
        inner.strong.remove(session_id);
    }

    /// Drops both entries. Warns if a consumer still holds the data.
    pub fn delete(&self, session_id: &Uuid) {
        let mut inner = self.inner.lock().expect("routing store lock poisoned");
        inner.strong.remove(session_id);
        if let Some(weak) = inner.weak.remove(session_id) {
            if weak.strong_count() > 0 {
                tracing::warn!(
                    session = %session_id,
                    "deleting session routing data while still in use"
                );
            }
        }
    }

    /// Upgrades the weak entry; `None` once the data expired or was deleted.
    pub fn lookup(&self, session_id: &Uuid) -> Option<Arc<SessionRoutingData>> {
        let inner = self.inner.lock().expect("routing store lock poisoned");
        inner.weak.get(session_id).and_then(Weak::upgrade)
    }

    /// Scans every live session's node map for connection details of a node.
    pub fn find_node_info(&self, node_id: &Uuid) -> Option<NodeInfo> {
        let inner = self.inner.lock().expect("routing store lock poisoned");
        for weak in inner.weak.values() {
            if let Some(data) = weak.upgrade() {
                if let Some(info) = data.node_map().node_info(node_id) {
                    return Some(info);
                }
            }
        }
        None
    }
}
