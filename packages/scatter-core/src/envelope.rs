//! Relay message envelope.
//!
//! Blobs that transit the relay toward an agent are JSON envelopes:
//!
//! ```json
//! {"type": "STORE", "payload": "<base64 bytes>"}
//! ```
//!
//! `STORE` carries raw chunk bytes; `RETRIEVE` and `DELETE` carry the ASCII
//! chunk id. The payload is base64 on the wire so the envelope stays valid
//! JSON regardless of content. The relay itself never inspects envelopes;
//! they are opaque blobs until an agent decodes them.

use serde::{Deserialize, Serialize};

/// Command kinds an agent understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RelayCommand {
    #[serde(rename = "STORE")]
    Store,
    #[serde(rename = "RETRIEVE")]
    Retrieve,
    #[serde(rename = "DELETE")]
    Delete,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayMessage {
    #[serde(rename = "type")]
    pub command: RelayCommand,
    #[serde(with = "base64_bytes")]
    pub payload: Vec<u8>,
}

impl RelayMessage {
    /// Envelope asking the agent to store these chunk bytes.
    pub fn store(data: Vec<u8>) -> Self {
        Self {
            command: RelayCommand::Store,
            payload: data,
        }
    }

    /// Envelope asking the agent to send a chunk back to the server.
    pub fn retrieve(chunk_id: &str) -> Self {
        Self {
            command: RelayCommand::Retrieve,
            payload: chunk_id.as_bytes().to_vec(),
        }
    }

    /// Envelope asking the agent to delete a chunk.
    pub fn delete(chunk_id: &str) -> Self {
        Self {
            command: RelayCommand::Delete,
            payload: chunk_id.as_bytes().to_vec(),
        }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        // A struct of an enum and a byte vec cannot fail to serialize.
        serde_json::to_vec(self).unwrap_or_default()
    }

    pub fn from_bytes(data: &[u8]) -> crate::Result<Self> {
        serde_json::from_slice(data)
            .map_err(|e| crate::Error::invalid(format!("bad relay envelope: {e}")))
    }
}

mod base64_bytes {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], ser: S) -> Result<S::Ok, S::Error> {
        ser.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(de: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(de)?;
        STANDARD.decode(s).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_store_round_trip() {
        let msg = RelayMessage::store(vec![0, 1, 2, 255]);
        let bytes = msg.to_bytes();
        let back = RelayMessage::from_bytes(&bytes).unwrap();
        assert_eq!(back.command, RelayCommand::Store);
        assert_eq!(back.payload, vec![0, 1, 2, 255]);
    }

    #[test]
    fn test_wire_shape() {
        let msg = RelayMessage::retrieve("abc123");
        let json: serde_json::Value = serde_json::from_slice(&msg.to_bytes()).unwrap();
        assert_eq!(json["type"], "RETRIEVE");
        // payload is base64("abc123")
        assert_eq!(json["payload"], "YWJjMTIz");
    }

    #[test]
    fn test_delete_payload_is_ascii_chunk_id() {
        let msg = RelayMessage::delete("deadbeef");
        let back = RelayMessage::from_bytes(&msg.to_bytes()).unwrap();
        assert_eq!(back.command, RelayCommand::Delete);
        assert_eq!(String::from_utf8(back.payload).unwrap(), "deadbeef");
    }

    #[test]
    fn test_garbage_rejected() {
        assert!(RelayMessage::from_bytes(b"not json").is_err());
        assert!(RelayMessage::from_bytes(br#"{"type":"STORE","payload":"!!!"}"#).is_err());
    }
}
