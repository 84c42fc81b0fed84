//! Session configuration documents.
//!
//! The Coordinator sends each node a JSON document describing the session
//! as that node should realize it:
//!
//! ```text
//! <nodeId>:
//!     "config":
//!         "computations":     # definitions, may list only those needed here
//!             <name_1>: definition...
//!         "sessionId": <sessionId>
//!         "logLevel": int (optional)
//! "routing":
//!     <sessionId>:
//!         "nodes": { <nodeId>: {host, ip, tcp, entry?} }
//!         "computations":     # always lists all computations
//!             <name_1>: { "compId": ..., "nodeId": ... }
//! "messageFilter": ... (optional)
//! ```
//!
//! Only computations whose `nodeId` matches this node are installed locally;
//! the rest of the routing table is kept for forwarding only.

use std::collections::BTreeMap;

use serde_json::{json, Value};
use uuid::Uuid;

use gridnode_common::error::{GridError, Result};
use gridnode_common::object;

/// Parsed view over one session definition document.
#[derive(Debug)]
pub struct SessionConfig {
    session_id: Uuid,
    node_id: Uuid,
    log_level: Option<i64>,
    definitions: Value,
    routing: Value,
    /// Computations resident on this node, by id.
    computations: BTreeMap<Uuid, String>,
    /// Per-computation reply map sent back to the Coordinator.
    response: Value,
    this_is_entry_node: bool,
}

impl SessionConfig {
    pub fn parse(desc: &Value, node_id: Uuid) -> Result<Self> {
        let node_config = object::member(object::member(desc, &node_id.to_string()), "config");

        let definitions = object::member(node_config, "computations");
        if !definitions.is_object() {
            return Err(GridError::BadRequest(
                "session definition has no config object for this node".to_string(),
            ));
        }

        let session_id = match object::member(node_config, "sessionId").as_str() {
            Some(s) => Uuid::parse_str(s).map_err(|_| {
                GridError::BadRequest("session definition has invalid session id".to_string())
            })?,
            None => {
                return Err(GridError::BadRequest(
                    "session definition has no session id".to_string(),
                ))
            }
        };

        let log_level = match object::member(node_config, "logLevel") {
            Value::Number(n) => n.as_i64(),
            _ => None,
        };

        let routing = object::member(desc, "routing");
        if !routing.is_object() {
            return Err(GridError::BadRequest(
                "session definition has no routing object".to_string(),
            ));
        }

        let comps = object::member(
            object::member(routing, &session_id.to_string()),
            "computations",
        );
        let Some(comp_objs) = comps.as_object() else {
            return Err(GridError::BadRequest(
                "session definition has no computation list".to_string(),
            ));
        };

        let mut computations = BTreeMap::new();
        let mut response = json!({});
        for (name, info) in comp_objs {
            let (Some(comp_id), Some(comp_node)) = (
                object::member(info, "compId").as_str(),
                object::member(info, "nodeId").as_str(),
            ) else {
                return Err(GridError::BadRequest(
                    "session definition has invalid computation list".to_string(),
                ));
            };
            let comp_node = Uuid::parse_str(comp_node).map_err(|_| {
                GridError::BadRequest(format!(
                    "session definition has invalid node id for computation '{name}'"
                ))
            })?;
            if comp_node == node_id {
                let comp_id = Uuid::parse_str(comp_id).map_err(|_| {
                    GridError::BadRequest(format!(
                        "session definition has invalid entry in computation list: '{name}'"
                    ))
                })?;
                if comp_id.is_nil() {
                    return Err(GridError::BadRequest(format!(
                        "session definition has nil computation id for '{name}'"
                    )));
                }
                computations.insert(comp_id, name.clone());
                response[name] = json!({
                    "compId": comp_id.to_string(),
                    "nodeId": node_id.to_string(),
                });
            }
        }

        let this_node = object::member(
            object::member(object::member(routing, &session_id.to_string()), "nodes"),
            &node_id.to_string(),
        );
        let this_is_entry_node = object::get_bool(this_node, "entry", false);

        Ok(Self {
            session_id,
            node_id,
            log_level,
            definitions: definitions.clone(),
            routing: routing.clone(),
            computations,
            response,
            this_is_entry_node,
        })
    }

    pub fn session_id(&self) -> Uuid {
        self.session_id
    }

    pub fn node_id(&self) -> Uuid {
        self.node_id
    }

    /// Session-level log level; `None` means "not set".
    pub fn log_level(&self) -> Option<i64> {
        self.log_level
    }

    /// Computations resident on this node, id -> name.
    pub fn computations(&self) -> &BTreeMap<Uuid, String> {
        &self.computations
    }

    /// Definition document for a computation by name; `Null` if absent.
    pub fn definition(&self, name: &str) -> &Value {
        object::member(&self.definitions, name)
    }

    /// The session's full routing table, handed to the router verbatim.
    pub fn routing(&self) -> &Value {
        &self.routing
    }

    /// Per-computation reply `{name: {compId, nodeId}}` for the Coordinator.
    pub fn response(&self) -> &Value {
        &self.response
    }

    pub fn is_entry_node(&self) -> bool {
        self.this_is_entry_node
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) fn definition_doc(
        session: Uuid,
        node: Uuid,
        comps: &[(&str, Uuid, Uuid)],
        entry: bool,
    ) -> Value {
        let mut definitions = json!({});
        let mut routing_comps = json!({});
        for (name, comp_id, comp_node) in comps {
            definitions[*name] = json!({"requirements": {"resources": {"cores": 1}}});
            routing_comps[*name] = json!({
                "compId": comp_id.to_string(),
                "nodeId": comp_node.to_string(),
            });
        }
        json!({
            node.to_string(): {
                "config": {
                    "computations": definitions,
                    "sessionId": session.to_string(),
                },
            },
            "routing": {
                session.to_string(): {
                    "nodes": {
                        node.to_string(): {
                            "host": "host-a", "ip": "127.0.0.1", "tcp": 7100, "entry": entry,
                        },
                    },
                    "computations": routing_comps,
                },
            },
        })
    }

    #[test]
    fn test_parse_local_computations_only() {
        let session = Uuid::new_v4();
        let node = Uuid::new_v4();
        let other = Uuid::new_v4();
        let local_comp = Uuid::new_v4();
        let remote_comp = Uuid::new_v4();

        let doc = definition_doc(
            session,
            node,
            &[("render", local_comp, node), ("sim", remote_comp, other)],
            true,
        );
        let config = SessionConfig::parse(&doc, node).unwrap();

        assert_eq!(config.session_id(), session);
        assert!(config.is_entry_node());
        assert_eq!(config.computations().len(), 1);
        assert_eq!(config.computations()[&local_comp], "render");

        // the response map only covers local computations
        let response = config.response();
        assert_eq!(
            response["render"]["compId"],
            json!(local_comp.to_string())
        );
        assert!(response.get("sim").is_none());
    }

    #[test]
    fn test_missing_config_rejected() {
        let node = Uuid::new_v4();
        let doc = json!({"routing": {}});
        let err = SessionConfig::parse(&doc, node).unwrap_err();
        assert_eq!(err.http_status(), 400);
    }

    #[test]
    fn test_missing_session_id_rejected() {
        let node = Uuid::new_v4();
        let doc = json!({
            node.to_string(): {"config": {"computations": {}}},
            "routing": {},
        });
        let err = SessionConfig::parse(&doc, node).unwrap_err();
        assert!(err.to_string().contains("no session id"));
    }

    #[test]
    fn test_not_entry_node() {
        let session = Uuid::new_v4();
        let node = Uuid::new_v4();
        let comp = Uuid::new_v4();
        let doc = definition_doc(session, node, &[("render", comp, node)], false);
        let config = SessionConfig::parse(&doc, node).unwrap();
        assert!(!config.is_entry_node());
    }

    #[test]
    fn test_definition_lookup() {
        let session = Uuid::new_v4();
        let node = Uuid::new_v4();
        let comp = Uuid::new_v4();
        let doc = definition_doc(session, node, &[("render", comp, node)], true);
        let config = SessionConfig::parse(&doc, node).unwrap();
        assert!(config.definition("render").is_object());
        assert!(config.definition("nope").is_null());
    }
}
