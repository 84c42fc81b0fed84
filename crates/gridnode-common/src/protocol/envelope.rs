use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::{GridError, Result};
use crate::protocol::address::Address;

/// Class of the content carried by an envelope.
///
/// The router forwards most classes opaquely; `Control`, `ExecutorHeartbeat`
/// and `Pong` bypass the forwarding path and are handled where they arrive.
/// `Application` carries client/computation payloads the agent never
/// interprets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MessageClass {
    Control,
    ExecutorHeartbeat,
    Pong,
    SessionStatus,
    EngineReady,
    ClientConnectionStatus,
    ComputationStatus,
    RouterInfo,
    SessionRoutingData,
    Application(u32),
}

/// A typed message that can be packed into an [`Envelope`].
pub trait WireMessage: Serialize + DeserializeOwned {
    const CLASS: MessageClass;
    const ROUTING_NAME: &'static str;
}

/// The unit of transfer on every peer connection.
///
/// Content is kept as opaque postcard bytes so the router can forward without
/// paying deserialization cost; the classes it must handle locally are
/// unpacked eagerly on receipt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    pub class: MessageClass,
    pub routing_name: String,
    pub from: Option<Address>,
    pub to: Vec<Address>,
    pub payload: Vec<u8>,
}

impl Envelope {
    /// Packs a typed message into an envelope with an empty destination list.
    pub fn pack<T: WireMessage>(msg: &T) -> Result<Envelope> {
        Ok(Envelope {
            class: T::CLASS,
            routing_name: T::ROUTING_NAME.to_string(),
            from: None,
            to: Vec::new(),
            payload: postcard::to_stdvec(msg)?,
        })
    }

    /// Unpacks the content as the given type.
    ///
    /// Fails if the envelope's class does not match the type's class.
    pub fn unpack<T: WireMessage>(&self) -> Result<T> {
        if self.class != T::CLASS {
            return Err(GridError::Internal(format!(
                "envelope class mismatch: expected {:?}, got {:?}",
                T::CLASS,
                self.class
            )));
        }
        Ok(postcard::from_bytes(&self.payload)?)
    }

    /// Returns the envelope with its destination list replaced.
    pub fn addressed_to(mut self, to: Vec<Address>) -> Self {
        self.to = to;
        self
    }

    /// Returns the envelope with its source address set.
    pub fn from_address(mut self, from: Address) -> Self {
        self.from = Some(from);
        self
    }

    /// Short human-readable summary for log lines.
    pub fn describe(&self) -> String {
        format!(
            "{:?}[{}] -> {} destination(s)",
            self.class,
            self.routing_name,
            self.to.len()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::messages::{ControlMessage, RouterInfoMessage};
    use uuid::Uuid;

    #[test]
    fn test_pack_unpack_round_trip() {
        let msg = ControlMessage {
            command: "go".to_string(),
            data: String::new(),
        };
        let env = Envelope::pack(&msg).unwrap();
        assert_eq!(env.class, MessageClass::Control);
        assert_eq!(env.routing_name, "ControlMessage");

        let back: ControlMessage = env.unpack().unwrap();
        assert_eq!(back.command, "go");
    }

    #[test]
    fn test_unpack_class_mismatch() {
        let msg = RouterInfoMessage { message_port: 9001 };
        let env = Envelope::pack(&msg).unwrap();
        let err = env.unpack::<ControlMessage>();
        assert!(err.is_err());
    }

    #[test]
    fn test_addressed_to_replaces_destinations() {
        let msg = ControlMessage {
            command: "stop".to_string(),
            data: String::new(),
        };
        let session = Uuid::new_v4();
        let env = Envelope::pack(&msg)
            .unwrap()
            .addressed_to(vec![Address::client(session)]);
        assert_eq!(env.to.len(), 1);
        assert_eq!(env.to[0].session, Some(session));
    }
}
