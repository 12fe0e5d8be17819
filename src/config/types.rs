//! Configuration types.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Knobs for how the service converts raw events before sending them.
///
/// Sent with every session creation, so a reconnect restores it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ConverterConfig {
    /// Message format version the client understands.
    pub version: u32,
}

impl Default for ConverterConfig {
    fn default() -> Self {
        Self { version: 1 }
    }
}

/// Limits applied by the message codec.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct CodecConfig {
    /// Largest payload accepted in either direction.
    pub max_payload_bytes: usize,
}

impl Default for CodecConfig {
    fn default() -> Self {
        Self {
            max_payload_bytes: default_max_payload_bytes(),
        }
    }
}

fn default_max_payload_bytes() -> usize {
    4 * 1024 * 1024
}

fn default_timeout_ms() -> u64 {
    5000
}

fn default_reconnect_delay_ms() -> u64 {
    3000
}

/// Configuration for the client.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ClientConfig {
    /// Deadline for blocking control calls, in milliseconds.
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    /// Delay before each automatic reconnect, in milliseconds.
    #[serde(default = "default_reconnect_delay_ms")]
    pub reconnect_delay_ms: u64,
    #[serde(default)]
    pub converter: ConverterConfig,
    #[serde(default)]
    pub codec: CodecConfig,
}

impl ClientConfig {
    #[must_use]
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    #[must_use]
    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            timeout_ms: default_timeout_ms(),
            reconnect_delay_ms: default_reconnect_delay_ms(),
            converter: ConverterConfig::default(),
            codec: CodecConfig::default(),
        }
    }
}
