//! The forwarding algorithm.
//!
//! A received envelope's destination list is split into three buckets:
//! client-bound (no node id), local computations (this node + computation),
//! and remote nodes. Each bucket has its own delivery path; missing node
//! endpoints are created on demand under the node-connection mutex.

use std::collections::HashMap;
use std::sync::Arc;

use uuid::Uuid;

use gridnode_common::protocol::{Address, Envelope};

use crate::endpoint::Endpoint;
use crate::router::RouterShared;
use crate::store::SessionRoutingData;

/// Splits destinations into (to-client, per-computation, per-node) buckets.
pub(crate) fn parse_destinations(
    local_node: Uuid,
    to: &[Address],
) -> (
    bool,
    HashMap<Uuid, Vec<Address>>,
    HashMap<Uuid, Vec<Address>>,
) {
    let mut to_client = false;
    let mut ipc_lists: HashMap<Uuid, Vec<Address>> = HashMap::new();
    let mut node_lists: HashMap<Uuid, Vec<Address>> = HashMap::new();

    for addr in to {
        match addr.node {
            // no node id means the session's client
            None => to_client = true,
            Some(node) if node == local_node => {
                if let Some(comp) = addr.computation {
                    ipc_lists.entry(comp).or_default().push(*addr);
                }
            }
            Some(node) => {
                node_lists.entry(node).or_default().push(*addr);
            }
        }
    }

    (to_client, ipc_lists, node_lists)
}

/// Sends to the local client, stashing if it has not connected yet. Only
/// valid on the session's entry node.
fn send_to_local_client(session_id: Uuid, envelope: &Envelope, shared: &Arc<RouterShared>) {
    let delivered = shared
        .registry()
        .queue_to_client_or_stash(session_id, envelope.clone());
    if !delivered {
        tracing::trace!(session = %session_id, "stashed envelope for unconnected client");
    }
}

/// Sends to a local computation. The computation was placed here by the
/// Coordinator, so a missing endpoint is an internal error.
fn send_to_local_computation(
    session_id: Uuid,
    computation_id: Uuid,
    envelope: &Envelope,
    shared: &Arc<RouterShared>,
) {
    match shared.registry().find_computation(&computation_id) {
        Some(endpoint) => endpoint.queue_envelope(envelope.clone()),
        None => {
            tracing::error!(
                session = %session_id,
                "could not find IPC endpoint for local computation {}",
                computation_id
            );
        }
    }
}

/// Routes one envelope to all of its destinations.
pub fn route_envelope(
    envelope: &Envelope,
    routing: &Arc<SessionRoutingData>,
    shared: &Arc<RouterShared>,
) {
    let session_id = routing.session_id();
    let local_node = routing.node_id();

    let (to_client, ipc_lists, mut node_lists) = parse_destinations(local_node, &envelope.to);

    if to_client {
        if routing.is_entry_node() {
            send_to_local_client(session_id, envelope, shared);
        } else {
            // the client lives on the entry node; forward there
            let entry = routing.node_map().entry_node_id();
            node_lists
                .entry(entry)
                .or_default()
                .push(Address::client(session_id));
        }
    }

    for computation_id in ipc_lists.keys() {
        send_to_local_computation(session_id, *computation_id, envelope, shared);
    }

    for (node_id, addresses) in node_lists {
        let endpoint = find_or_connect_node(node_id, routing, shared);
        match endpoint {
            Some(endpoint) => endpoint.queue_envelope_to(envelope, addresses),
            None => {
                tracing::error!(
                    session = %session_id,
                    "could not find destination node for message, node id {}",
                    node_id
                );
            }
        }
    }
}

/// Looks up the node endpoint, creating an outbound one under the
/// node-connection mutex if none exists. The double check under the lock
/// keeps the no-contention path cheap while guaranteeing a single endpoint
/// per peer.
fn find_or_connect_node(
    node_id: Uuid,
    routing: &Arc<SessionRoutingData>,
    shared: &Arc<RouterShared>,
) -> Option<Arc<Endpoint>> {
    if let Some(endpoint) = shared.registry().find_node(&node_id) {
        return Some(endpoint);
    }

    let _guard = shared.node_connection_lock();
    if let Some(endpoint) = shared.registry().find_node(&node_id) {
        return Some(endpoint);
    }

    let info = routing.node_map().node_info(&node_id)?;
    tracing::debug!(
        "connecting from node '{}' to node '{}'",
        routing.node_id(),
        node_id
    );
    let endpoint = Endpoint::connect_node(node_id, info, shared.clone());
    shared.registry().track_node(node_id, endpoint.clone());
    Some(endpoint)
}
