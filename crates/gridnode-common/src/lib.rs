//! Gridnode Common Types and Transport
//!
//! This crate provides the shared protocol definitions and framed transport
//! layer for the gridnode compute farm agent.
//!
//! # Overview
//!
//! Gridnode is a per-host compute node agent in a distributed render/compute
//! farm. A central Coordinator decides which computations belong to which
//! sessions and on which nodes; the agent realizes those decisions on one
//! host. This crate contains the pieces shared by every component:
//!
//! - **Protocol Layer**: message envelope, addresses, typed wire messages and
//!   the fixed-size connection registration block
//! - **Transport Layer**: length-prefixed framing over TCP and Unix sockets
//! - **Utilities**: opaque config-document accessors, the request ban list
//!   and the shared error type
//!
//! # Wire format
//!
//! Every peer connection (client, peer node, computation subprocess, service
//! control channel) speaks the same envelope format, negotiated at connect
//! time by a magic number and messaging API version carried in the
//! registration block. Frames are a 4-byte big-endian length prefix followed
//! by the postcard-encoded envelope.

pub mod ban;
pub mod error;
pub mod object;
pub mod protocol;
pub mod transport;

pub use error::{GridError, Result};
pub use protocol::*;
