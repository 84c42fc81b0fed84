use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// One destination (or source) of an envelope.
///
/// A `None` node means "the session's client". A destination with this node's
/// id and a computation id names a local computation; any other node id names
/// a peer node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Address {
    pub session: Option<Uuid>,
    pub node: Option<Uuid>,
    pub computation: Option<Uuid>,
}

impl Address {
    /// Address of a computation within a session.
    pub fn computation(session: Uuid, node: Uuid, computation: Uuid) -> Self {
        Self {
            session: Some(session),
            node: Some(node),
            computation: Some(computation),
        }
    }

    /// Address of the session's client (empty node and computation).
    pub fn client(session: Uuid) -> Self {
        Self {
            session: Some(session),
            node: None,
            computation: None,
        }
    }

    /// Address of a peer node, without naming a computation.
    pub fn node(session: Uuid, node: Uuid) -> Self {
        Self {
            session: Some(session),
            node: Some(node),
            computation: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_address_has_no_node() {
        let addr = Address::client(Uuid::new_v4());
        assert!(addr.node.is_none());
        assert!(addr.computation.is_none());
        assert!(addr.session.is_some());
    }

    #[test]
    fn test_computation_address() {
        let (s, n, c) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());
        let addr = Address::computation(s, n, c);
        assert_eq!(addr.session, Some(s));
        assert_eq!(addr.node, Some(n));
        assert_eq!(addr.computation, Some(c));
    }
}
