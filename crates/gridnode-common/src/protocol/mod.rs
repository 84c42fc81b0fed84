//! Gridnode Wire Protocol
//!
//! Core protocol types shared by the agent, the router and computation
//! subprocesses: destination addresses, the message envelope, the typed
//! wire messages and the connection registration block.

pub mod address;
pub mod envelope;
pub mod messages;
pub mod registration;

pub use address::Address;
pub use envelope::{Envelope, MessageClass, WireMessage};
pub use messages::*;
pub use registration::{
    PeerRegistration, RegistrationData, API_VERSION_MAJOR, API_VERSION_MINOR, API_VERSION_PATCH,
    REGISTRATION_LEN, REGISTRATION_MAGIC,
};
