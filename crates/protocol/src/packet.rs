//! Packet envelope carried in WebSocket text frames.
//!
//! Wire format (one JSON object per frame):
//!
//! ```text
//! {"type":"event","event":"<name>","data":{...}}             fire-and-forget
//! {"type":"event","event":"<name>","data":{...},"id":<u64>}  ack requested
//! {"type":"ack","id":<u64>,"data":{...}}                     acknowledgement
//! ```

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{ProtocolError, Result};

/// Maximum encoded packet size (1 MiB).
pub const MAX_PACKET_SIZE: usize = 1024 * 1024;

/// A single frame on the channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Packet {
    /// A named event, optionally asking the peer for an acknowledgement.
    Event {
        /// Event name.
        event: String,
        /// Event payload.
        #[serde(default)]
        data: Value,
        /// Correlation id; present only when an ack is requested.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id: Option<u64>,
    },
    /// Acknowledgement of an earlier event.
    Ack {
        /// Correlation id of the acknowledged event.
        id: u64,
        /// Ack payload.
        #[serde(default)]
        data: Value,
    },
}

impl Packet {
    /// Build an ack packet from any serializable payload.
    pub fn ack<T: Serialize>(id: u64, payload: &T) -> Result<Self> {
        let data =
            serde_json::to_value(payload).map_err(|e| ProtocolError::Serialization(e.to_string()))?;
        Ok(Packet::Ack { id, data })
    }

    /// Correlation id, if any.
    pub fn id(&self) -> Option<u64> {
        match self {
            Packet::Event { id, .. } => *id,
            Packet::Ack { id, .. } => Some(*id),
        }
    }

    /// Serialize to a JSON text frame.
    pub fn encode(&self) -> Result<String> {
        let text =
            serde_json::to_string(self).map_err(|e| ProtocolError::Serialization(e.to_string()))?;
        if text.len() > MAX_PACKET_SIZE {
            return Err(ProtocolError::PacketTooLarge {
                size: text.len(),
                max: MAX_PACKET_SIZE,
            });
        }
        Ok(text)
    }

    /// Parse a JSON text frame.
    pub fn decode(text: &str) -> Result<Self> {
        if text.len() > MAX_PACKET_SIZE {
            return Err(ProtocolError::PacketTooLarge {
                size: text.len(),
                max: MAX_PACKET_SIZE,
            });
        }
        serde_json::from_str(text).map_err(|e| ProtocolError::Deserialization(e.to_string()))
    }
}
