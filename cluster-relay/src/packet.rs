use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Relay envelope: who published and the ordered payloads.
///
/// Wire form: `{"sender": "<instance id>" | null, "messages": [...]}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Packet {
    #[serde(default)]
    pub sender: Option<String>,
    #[serde(default)]
    pub messages: Vec<Value>,
}

impl Packet {
    pub fn new(sender: Option<String>, messages: Vec<Value>) -> Self {
        Self { sender, messages }
    }

    pub fn single(sender: Option<String>, message: Value) -> Self {
        Self::new(sender, vec![message])
    }

    /// True when this packet was published by `instance_id`.
    pub fn is_from(&self, instance_id: &str) -> bool {
        self.sender.as_deref() == Some(instance_id)
    }
}

/// A packet received on one site's subscription for `channel`.
#[derive(Debug, Clone)]
pub struct InboundPacket {
    pub site: String,
    pub channel: String,
    pub packet: Packet,
}
