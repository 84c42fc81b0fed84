//! Client addresser.
//!
//! Messages received from a session's client carry an empty destination
//! list; the addresser fills it in from the session's computation map and
//! message routing filter. Ping messages are broadcast to every computation
//! regardless of filters.

use std::collections::BTreeMap;

use serde_json::Value;
use uuid::Uuid;

use gridnode_common::error::{GridError, Result};
use gridnode_common::object;
use gridnode_common::protocol::{Address, Envelope};

/// Routing name of application ping messages, which bypass the filter.
pub const PING_ROUTING_NAME: &str = "PingMessage";

#[derive(Debug, Clone, PartialEq, Eq)]
struct CompTarget {
    computation_id: Uuid,
    node_id: Uuid,
}

/// Resolves destination lists for client-originated envelopes.
///
/// The message filter has the shape `{<computationName>: {"accept":
/// [routingName...]}}`: a computation without a filter entry receives every
/// message; an `accept` list restricts delivery to the named routing names,
/// with `"*"` matching all.
pub struct ClientAddresser {
    session_id: Uuid,
    computations: BTreeMap<String, CompTarget>,
    filter: Value,
}

impl ClientAddresser {
    /// Builds the addresser from a session routing document:
    /// `{<sessionId>: {computations: {name: {compId, nodeId}}},
    /// messageFilter?}`.
    pub fn from_routing(session_id: Uuid, routing: &Value) -> Result<Self> {
        let session_routing = object::member(routing, &session_id.to_string());
        let comps = object::object(session_routing, "computations");
        let Some(comp_objs) = comps.as_object() else {
            return Err(GridError::BadRequest(
                "session routing data has no computations object".to_string(),
            ));
        };

        let mut computations = BTreeMap::new();
        for (name, info) in comp_objs {
            let comp_id = object::get_str(info, "compId", "");
            let node_id = object::get_str(info, "nodeId", "");
            let (Ok(computation_id), Ok(node_id)) =
                (Uuid::parse_str(&comp_id), Uuid::parse_str(&node_id))
            else {
                return Err(GridError::BadRequest(format!(
                    "invalid computation entry '{name}' in routing data"
                )));
            };
            computations.insert(
                name.clone(),
                CompTarget {
                    computation_id,
                    node_id,
                },
            );
        }

        Ok(Self {
            session_id,
            computations,
            filter: object::member(routing, "messageFilter").clone(),
        })
    }

    /// Rewrites the envelope's destinations according to the message filter.
    /// Pings go to everyone.
    pub fn address(&self, envelope: &mut Envelope) {
        if envelope.routing_name == PING_ROUTING_NAME {
            self.address_to_all(envelope);
            return;
        }
        let to = self
            .computations
            .iter()
            .filter(|(name, _)| self.filter_accepts(name, &envelope.routing_name))
            .map(|(_, t)| Address::computation(self.session_id, t.node_id, t.computation_id))
            .collect();
        envelope.to = to;
    }

    /// Addresses the envelope to every computation in the session.
    pub fn address_to_all(&self, envelope: &mut Envelope) {
        envelope.to = self
            .computations
            .values()
            .map(|t| Address::computation(self.session_id, t.node_id, t.computation_id))
            .collect();
    }

    fn filter_accepts(&self, comp_name: &str, routing_name: &str) -> bool {
        let entry = object::member(&self.filter, comp_name);
        if entry.is_null() {
            return true;
        }
        let Some(accept) = object::member(entry, "accept").as_array() else {
            return true;
        };
        accept
            .iter()
            .filter_map(Value::as_str)
            .any(|n| n == "*" || n == routing_name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gridnode_common::protocol::MessageClass;
    use serde_json::json;

    fn app_envelope(routing_name: &str) -> Envelope {
        Envelope {
            class: MessageClass::Application(1),
            routing_name: routing_name.to_string(),
            from: None,
            to: Vec::new(),
            payload: Vec::new(),
        }
    }

    fn addresser(filter: Value) -> (ClientAddresser, Uuid, Uuid) {
        let session = Uuid::new_v4();
        let node = Uuid::new_v4();
        let mut routing = json!({
            session.to_string(): {
                "computations": {
                    "render": {"compId": Uuid::new_v4().to_string(), "nodeId": node.to_string()},
                    "sim": {"compId": Uuid::new_v4().to_string(), "nodeId": node.to_string()},
                },
            },
        });
        if !filter.is_null() {
            routing["messageFilter"] = filter;
        }
        (
            ClientAddresser::from_routing(session, &routing).unwrap(),
            session,
            node,
        )
    }

    #[test]
    fn test_no_filter_addresses_all() {
        let (addresser, session, _) = addresser(Value::Null);
        let mut env = app_envelope("FrameMessage");
        addresser.address(&mut env);
        assert_eq!(env.to.len(), 2);
        assert!(env.to.iter().all(|a| a.session == Some(session)));
    }

    #[test]
    fn test_filter_restricts_delivery() {
        let (addresser, _, _) = addresser(json!({
            "sim": {"accept": ["SimControl"]},
        }));

        let mut env = app_envelope("FrameMessage");
        addresser.address(&mut env);
        // only "render" (no filter entry) accepts FrameMessage
        assert_eq!(env.to.len(), 1);

        let mut env = app_envelope("SimControl");
        addresser.address(&mut env);
        assert_eq!(env.to.len(), 2);
    }

    #[test]
    fn test_wildcard_accept() {
        let (addresser, _, _) = addresser(json!({
            "sim": {"accept": ["*"]},
        }));
        let mut env = app_envelope("Anything");
        addresser.address(&mut env);
        assert_eq!(env.to.len(), 2);
    }

    #[test]
    fn test_ping_bypasses_filter() {
        let (addresser, _, _) = addresser(json!({
            "render": {"accept": []},
            "sim": {"accept": []},
        }));

        let mut env = app_envelope("FrameMessage");
        addresser.address(&mut env);
        assert!(env.to.is_empty());

        let mut ping = app_envelope(PING_ROUTING_NAME);
        addresser.address(&mut ping);
        assert_eq!(ping.to.len(), 2);
    }
}
