//! Messages exchanged between room participants
//!
//! Every message is a [`WireMessage`]: a typed payload plus optional sender
//! id and send timestamp. The message kind is derived from the payload, so a
//! message can never claim one kind and carry another's body.

use crate::diff::Patch;
use crate::value::Value;
use bincode::{deserialize, serialize};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MessageKind {
    StateSync,
    Action,
    Event,
    Heartbeat,
    HostMigration,
    HostQuery,
    HostAnnounce,
}

/// Body of a `state_sync` message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum StateSync {
    /// Replaces the receiver's mirror wholesale
    Full { full_state: Value },
    /// Ordered edits against the receiver's current mirror
    Patches { patches: Vec<Patch> },
}

/// Who invoked an action, as transmitted; the random source is rebuilt from
/// the seed on receipt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireContext {
    pub player_id: String,
    pub target_id: String,
    pub is_host: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionMessage {
    pub action_name: String,
    pub input: Value,
    pub context: WireContext,
    pub action_seed: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Payload {
    StateSync(StateSync),
    Action(ActionMessage),
    Event { event_name: String, payload: Value },
    Heartbeat { heartbeat: bool },
    HostMigration { new_host_id: String },
    HostQuery,
    HostAnnounce { host_id: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireMessage {
    pub payload: Payload,
    pub sender_id: Option<String>,
    pub timestamp: Option<u64>,
}

impl WireMessage {
    pub fn new(payload: Payload) -> Self {
        Self {
            payload,
            sender_id: None,
            timestamp: None,
        }
    }

    pub fn full_state(state: Value) -> Self {
        Self::new(Payload::StateSync(StateSync::Full { full_state: state }))
    }

    pub fn patches(patches: Vec<Patch>) -> Self {
        Self::new(Payload::StateSync(StateSync::Patches { patches }))
    }

    pub fn heartbeat() -> Self {
        Self::new(Payload::Heartbeat { heartbeat: true })
    }

    pub fn event(name: impl Into<String>, payload: Value) -> Self {
        Self::new(Payload::Event {
            event_name: name.into(),
            payload,
        })
    }

    pub fn action(action: ActionMessage) -> Self {
        Self::new(Payload::Action(action))
    }

    pub fn from_sender(mut self, sender_id: impl Into<String>) -> Self {
        self.sender_id = Some(sender_id.into());
        self
    }

    pub fn at(mut self, timestamp: u64) -> Self {
        self.timestamp = Some(timestamp);
        self
    }

    pub fn kind(&self) -> MessageKind {
        match self.payload {
            Payload::StateSync(_) => MessageKind::StateSync,
            Payload::Action(_) => MessageKind::Action,
            Payload::Event { .. } => MessageKind::Event,
            Payload::Heartbeat { .. } => MessageKind::Heartbeat,
            Payload::HostMigration { .. } => MessageKind::HostMigration,
            Payload::HostQuery => MessageKind::HostQuery,
            Payload::HostAnnounce { .. } => MessageKind::HostAnnounce,
        }
    }
}

#[derive(Debug, Error)]
#[error("wire codec failure: {0}")]
pub struct CodecError(#[from] bincode::Error);

/// Serializes a message for the transport
pub fn encode(message: &WireMessage) -> Result<Vec<u8>, CodecError> {
    Ok(serialize(message)?)
}

pub fn decode(bytes: &[u8]) -> Result<WireMessage, CodecError> {
    Ok(deserialize(bytes)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diff::PathSegment;

    #[test]
    fn test_kind_follows_payload() {
        assert_eq!(WireMessage::heartbeat().kind(), MessageKind::Heartbeat);
        assert_eq!(
            WireMessage::full_state(Value::map()).kind(),
            MessageKind::StateSync
        );
        assert_eq!(
            WireMessage::new(Payload::HostQuery).kind(),
            MessageKind::HostQuery
        );
    }

    #[test]
    fn test_action_serialization() {
        let message = WireMessage::action(ActionMessage {
            action_name: "roll".to_string(),
            input: Value::from(vec![Value::Int(1), Value::Timestamp(5)]),
            context: WireContext {
                player_id: "p2".to_string(),
                target_id: "p1".to_string(),
                is_host: false,
            },
            action_seed: 100_001,
        })
        .from_sender("p2")
        .at(123456789);

        let bytes = encode(&message).unwrap();
        let decoded = decode(&bytes).unwrap();

        match decoded.payload {
            Payload::Action(ref action) => {
                assert_eq!(action.action_name, "roll");
                assert_eq!(action.action_seed, 100_001);
                assert_eq!(action.context.target_id, "p1");
            }
            _ => panic!("Wrong payload type after deserialization"),
        }
        assert_eq!(decoded.sender_id.as_deref(), Some("p2"));
        assert_eq!(decoded.timestamp, Some(123456789));
    }

    #[test]
    fn test_patch_serialization() {
        let mut tree = Value::map();
        tree.insert("hp", 3.5);
        let message = WireMessage::patches(vec![
            Patch::replace(vec![PathSegment::from("a"), PathSegment::Index(2)], tree),
            Patch::remove(vec![PathSegment::from("b")]),
        ]);

        let decoded = decode(&encode(&message).unwrap()).unwrap();
        assert_eq!(decoded, message);
    }

    #[test]
    fn test_decode_garbage_fails() {
        assert!(decode(&[0xff, 0xff, 0xff, 0xff, 0xff]).is_err());
    }
}
