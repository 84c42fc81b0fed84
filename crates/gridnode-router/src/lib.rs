//! Gridnode Message Router
//!
//! The router owns every peer connection on a node: the session clients, the
//! local computation subprocesses (over a Unix IPC socket), the peer nodes'
//! routers, and the session manager's control channel. It negotiates the
//! registration handshake on each new connection, then forwards framed
//! envelopes between endpoints according to per-session routing data.
//!
//! # Structure
//!
//! - [`store`] - per-session routing data with a strong/weak two-phase
//!   lifetime, plus the session node map
//! - [`registry`] - thread-safe tables of live endpoints and the per-session
//!   stash of messages for not-yet-connected clients
//! - [`addresser`] - destination rewriting for client-originated messages
//! - [`endpoint`] - one send task + one receive task per peer
//! - [`route`] - the forwarding algorithm
//! - [`router`] - listeners, handshake dispatch and the service control
//!   channel
//!
//! # Node-to-node connections
//!
//! Two nodes may dial each other simultaneously. The final connection is
//! always directed from the greater node id to the lesser node id; see
//! [`router`] for the collision rules.

pub mod addresser;
pub mod endpoint;
pub mod registry;
pub mod route;
pub mod router;
pub mod store;

pub use router::{Router, RouterConfig};
pub use store::{NodeInfo, NodeMap, RoutingStore, SessionRoutingData};
