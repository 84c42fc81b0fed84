//! Framed transport over TCP and Unix sockets.

pub mod framing;

pub use framing::{read_frame, read_registration, write_frame, write_registration, MAX_FRAME_SIZE};
