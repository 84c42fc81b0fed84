//! Connection registration block.
//!
//! Every new peer connection sends this fixed-size block before anything
//! else. A mismatched magic number or major version rejects the connection.
//! The block is hand-encoded (big-endian, fixed offsets) so both sides agree
//! on its exact size regardless of serializer framing.

use uuid::Uuid;

use crate::error::{GridError, Result};

pub const REGISTRATION_MAGIC: u64 = 0x4752_4944_4c4e_4b31; // "GRIDLNK1"

pub const API_VERSION_MAJOR: u16 = 4;
pub const API_VERSION_MINOR: u16 = 1;
pub const API_VERSION_PATCH: u16 = 0;

/// Size in bytes of the encoded registration block.
pub const REGISTRATION_LEN: usize = 63;

/// What kind of peer is registering.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerRegistration {
    /// The session's remote client.
    Client = 1,
    /// A peer node's router.
    Node = 2,
    /// A local computation subprocess.
    Executor = 3,
    /// The session manager's control channel.
    Control = 4,
}

impl PeerRegistration {
    fn from_u8(v: u8) -> Result<Self> {
        match v {
            1 => Ok(PeerRegistration::Client),
            2 => Ok(PeerRegistration::Node),
            3 => Ok(PeerRegistration::Executor),
            4 => Ok(PeerRegistration::Control),
            other => Err(GridError::Handshake(format!(
                "unknown peer registration kind {other}"
            ))),
        }
    }
}

/// The registration block itself.
///
/// `session_id` is meaningful for clients and executors, `computation_id`
/// only for executors, `node_id` for nodes and the control channel. Absent
/// ids are the nil UUID on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegistrationData {
    pub major: u16,
    pub minor: u16,
    pub patch: u16,
    pub kind: PeerRegistration,
    pub session_id: Uuid,
    pub computation_id: Uuid,
    pub node_id: Uuid,
}

impl RegistrationData {
    pub fn client(session_id: Uuid) -> Self {
        Self::new(PeerRegistration::Client, session_id, Uuid::nil(), Uuid::nil())
    }

    pub fn node(node_id: Uuid) -> Self {
        Self::new(PeerRegistration::Node, Uuid::nil(), Uuid::nil(), node_id)
    }

    pub fn executor(session_id: Uuid, computation_id: Uuid, node_id: Uuid) -> Self {
        Self::new(PeerRegistration::Executor, session_id, computation_id, node_id)
    }

    pub fn control(node_id: Uuid) -> Self {
        Self::new(PeerRegistration::Control, Uuid::nil(), Uuid::nil(), node_id)
    }

    fn new(
        kind: PeerRegistration,
        session_id: Uuid,
        computation_id: Uuid,
        node_id: Uuid,
    ) -> Self {
        Self {
            major: API_VERSION_MAJOR,
            minor: API_VERSION_MINOR,
            patch: API_VERSION_PATCH,
            kind,
            session_id,
            computation_id,
            node_id,
        }
    }

    /// Encodes the block at fixed offsets.
    ///
    /// Layout: magic u64 | major u16 | minor u16 | patch u16 | kind u8 |
    /// session 16B | computation 16B | node 16B, all big-endian.
    pub fn to_bytes(&self) -> [u8; REGISTRATION_LEN] {
        let mut buf = [0u8; REGISTRATION_LEN];
        buf[0..8].copy_from_slice(&REGISTRATION_MAGIC.to_be_bytes());
        buf[8..10].copy_from_slice(&self.major.to_be_bytes());
        buf[10..12].copy_from_slice(&self.minor.to_be_bytes());
        buf[12..14].copy_from_slice(&self.patch.to_be_bytes());
        buf[14] = self.kind as u8;
        buf[15..31].copy_from_slice(self.session_id.as_bytes());
        buf[31..47].copy_from_slice(self.computation_id.as_bytes());
        buf[47..63].copy_from_slice(self.node_id.as_bytes());
        buf
    }

    /// Decodes and validates a registration block.
    ///
    /// # Errors
    ///
    /// Returns a handshake error on short input, wrong magic, unsupported
    /// major version, or an unknown peer kind.
    pub fn from_bytes(buf: &[u8]) -> Result<Self> {
        if buf.len() < REGISTRATION_LEN {
            return Err(GridError::Handshake(format!(
                "registration block too short: {} bytes",
                buf.len()
            )));
        }
        let magic = u64::from_be_bytes(buf[0..8].try_into().unwrap());
        if magic != REGISTRATION_MAGIC {
            return Err(GridError::Handshake(
                "invalid registration block: bad magic number".to_string(),
            ));
        }
        let major = u16::from_be_bytes(buf[8..10].try_into().unwrap());
        if major != API_VERSION_MAJOR {
            return Err(GridError::Handshake(format!(
                "messaging API version mismatch: found major version {major}, require {API_VERSION_MAJOR}"
            )));
        }
        let minor = u16::from_be_bytes(buf[10..12].try_into().unwrap());
        let patch = u16::from_be_bytes(buf[12..14].try_into().unwrap());
        let kind = PeerRegistration::from_u8(buf[14])?;
        let session_id = Uuid::from_bytes(buf[15..31].try_into().unwrap());
        let computation_id = Uuid::from_bytes(buf[31..47].try_into().unwrap());
        let node_id = Uuid::from_bytes(buf[47..63].try_into().unwrap());
        Ok(Self {
            major,
            minor,
            patch,
            kind,
            session_id,
            computation_id,
            node_id,
        })
    }
}
