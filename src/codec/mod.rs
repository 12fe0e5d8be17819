//! Message codec.
//!
//! Every structured payload that crosses the channel (process descriptors,
//! event messages, mute rules, interest verdicts, converter configuration) is
//! encoded as JSON. The codec is a plain value built from a [`CodecConfig`] and
//! handed to whoever needs it; there is no process-wide encoder.

mod rules;

pub use rules::*;

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::config::CodecConfig;
use crate::ipc::ClientError;

/// JSON codec for structured payloads.
#[derive(Debug, Clone, Default)]
pub struct Codec {
    config: CodecConfig,
}

impl Codec {
    #[must_use]
    pub fn new(config: CodecConfig) -> Self {
        Self { config }
    }

    #[must_use]
    pub fn config(&self) -> &CodecConfig {
        &self.config
    }

    /// Encodes a value to bytes.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::EncodeFailure`] if serialization fails or the
    /// result exceeds the configured payload limit.
    pub fn encode<T: Serialize + ?Sized>(&self, value: &T) -> Result<Vec<u8>, ClientError> {
        let bytes =
            serde_json::to_vec(value).map_err(|e| ClientError::EncodeFailure(e.to_string()))?;
        if bytes.len() > self.config.max_payload_bytes {
            return Err(ClientError::EncodeFailure(format!(
                "payload of {} bytes exceeds limit of {}",
                bytes.len(),
                self.config.max_payload_bytes
            )));
        }
        Ok(bytes)
    }

    /// Decodes bytes into a value.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::DecodeFailure`] if the payload is oversized or
    /// malformed.
    pub fn decode<T: DeserializeOwned>(&self, bytes: &[u8]) -> Result<T, ClientError> {
        if bytes.len() > self.config.max_payload_bytes {
            return Err(ClientError::DecodeFailure(format!(
                "payload of {} bytes exceeds limit of {}",
                bytes.len(),
                self.config.max_payload_bytes
            )));
        }
        serde_json::from_slice(bytes).map_err(|e| ClientError::DecodeFailure(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{EventMessage, EventType, ProcessDescriptor};

    #[test]
    fn encodes_event_messages() {
        let codec = Codec::default();
        let message = EventMessage::notify(
            EventType::NOTIFY_EXEC,
            ProcessDescriptor::new(12, "/bin/zsh"),
        )
        .with_payload(serde_json::json!({"target": "/bin/ls"}));

        let bytes = codec.encode(&message).unwrap();
        let decoded: EventMessage = codec.decode(&bytes).unwrap();
        assert_eq!(decoded, message);
    }

    #[test]
    fn malformed_payload_is_a_decode_failure() {
        let codec = Codec::default();
        let result: Result<ProcessDescriptor, _> = codec.decode(b"{not json");
        assert!(matches!(result, Err(ClientError::DecodeFailure(_))));
    }

    #[test]
    fn payload_limit_applies_both_ways() {
        let codec = Codec::new(CodecConfig {
            max_payload_bytes: 8,
        });
        let encoded = codec.encode(&"a string longer than eight bytes");
        assert!(matches!(encoded, Err(ClientError::EncodeFailure(_))));

        let decoded: Result<String, _> = codec.decode(b"\"0123456789\"");
        match decoded {
            Err(ClientError::DecodeFailure(reason)) => assert!(reason.contains("exceeds limit")),
            other => panic!("Expected DecodeFailure, got {other:?}"),
        }
    }
}
