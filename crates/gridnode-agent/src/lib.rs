//! Gridnode Agent
//!
//! The per-host agent of the compute farm: accepts session create, modify
//! and delete requests from the Coordinator over HTTP, launches and
//! supervises computation subprocesses, and reports lifecycle events back.
//! Message routing between computations, the session client and peer nodes
//! is delegated to the in-process router, reached over its IPC socket with
//! the same framed protocol every other peer uses.
//!
//! # Components
//!
//! - [`session`] - the per-session state machine, computation supervisor and
//!   session manager
//! - [`router_link`] - the control channel to the router
//! - [`events`] - queue-backed notifier delivering lifecycle events to the
//!   Coordinator
//! - [`http`] - the REST surface
//! - [`node`] - node-level state: registration info, tags, health

pub mod defaults;
pub mod events;
pub mod http;
pub mod node;
pub mod router_link;
pub mod session;

pub use defaults::ComputationDefaults;
pub use events::{Event, EventPipeline, EventSender};
pub use node::Agent;
pub use router_link::RouterLink;
pub use session::SessionManager;
