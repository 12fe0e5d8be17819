//! IPC message types.
//!
//! This module defines the remote-call surface the client uses to control the
//! privileged service, the replies it gets back, and the error type shared by
//! every layer of the bridge.

use serde::{Deserialize, Serialize};

use crate::codec::{InvertMutingType, MutePathType};

/// Control request sent from the client to the privileged service.
///
/// Structured arguments travel as codec-encoded bytes, event lists as numeric
/// id arrays.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum ServiceRequest {
    /// Open a session; sent on every (re)connect.
    CreateSession { converter: Vec<u8> },
    ClearPathInterestCache,
    MuteProcess { rule: Vec<u8>, events: Vec<u32> },
    UnmuteProcess { rule: Vec<u8>, events: Vec<u32> },
    MutePath {
        path: String,
        path_type: MutePathType,
        events: Vec<u32>,
    },
    UnmutePath {
        path: String,
        path_type: MutePathType,
        events: Vec<u32>,
    },
    UnmuteAllProcesses,
    UnmuteAllPaths,
    UnmuteAllTargetPaths,
    Subscribe { events: Vec<u32> },
    Unsubscribe { events: Vec<u32> },
    UnsubscribeAll,
    ClearCache,
    InvertMuting {
        mute_type: InvertMutingType,
        invert: bool,
    },
    MutingInverted { mute_type: InvertMutingType },
}

impl ServiceRequest {
    /// Short operation name for logging.
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::CreateSession { .. } => "create_session",
            Self::ClearPathInterestCache => "clear_path_interest_cache",
            Self::MuteProcess { .. } => "mute_process",
            Self::UnmuteProcess { .. } => "unmute_process",
            Self::MutePath { .. } => "mute_path",
            Self::UnmutePath { .. } => "unmute_path",
            Self::UnmuteAllProcesses => "unmute_all_processes",
            Self::UnmuteAllPaths => "unmute_all_paths",
            Self::UnmuteAllTargetPaths => "unmute_all_target_paths",
            Self::Subscribe { .. } => "subscribe",
            Self::Unsubscribe { .. } => "unsubscribe",
            Self::UnsubscribeAll => "unsubscribe_all",
            Self::ClearCache => "clear_cache",
            Self::InvertMuting { .. } => "invert_muting",
            Self::MutingInverted { .. } => "muting_inverted",
        }
    }
}

/// Successful reply from the privileged service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "reply", content = "value", rename_all = "snake_case")]
pub enum ServiceReply {
    /// Operation completed with no result value.
    Done,
    Flag(bool),
    Data(Vec<u8>),
}

/// Reply to a remote call: a value or the service's error message.
pub type RemoteResult = Result<ServiceReply, String>;

/// Errors surfaced by the client.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ClientError {
    /// No valid channel to the service.
    #[error("Not connected to the security service")]
    NotConnected,

    /// A blocking call exceeded its deadline.
    #[error("IPC timeout after {0}ms")]
    Timeout(u64),

    /// An inbound or reply payload could not be decoded.
    #[error("Failed to decode payload: {0}")]
    DecodeFailure(String),

    /// An outbound payload could not be encoded.
    #[error("Failed to encode payload: {0}")]
    EncodeFailure(String),

    /// The service rejected the call.
    #[error("Service error: {0}")]
    Remote(String),

    /// The channel was interrupted; a reconnect is scheduled.
    #[error("Connection to the security service interrupted")]
    Interrupted,

    /// The connection was invalidated and will not reconnect.
    #[error("Connection invalidated")]
    ChannelInvalidated,

    /// No handler is installed for the inbound message.
    #[error("Handler not set")]
    HandlerNotSet,

    /// Invariant violation.
    #[error("Unexpected: {0}")]
    Unexpected(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_serialization_is_tagged() {
        let request = ServiceRequest::Subscribe { events: vec![9, 15] };
        let json = serde_json::to_string(&request).unwrap();
        assert_eq!(json, r#"{"op":"subscribe","events":[9,15]}"#);

        let parsed: ServiceRequest = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, request);
    }

    #[test]
    fn mute_path_request_carries_typed_scalars() {
        let request = ServiceRequest::MutePath {
            path: "/usr/libexec".to_string(),
            path_type: MutePathType::Prefix,
            events: vec![1],
        };
        let json = serde_json::to_string(&request).unwrap();
        assert!(json.contains(r#""op":"mute_path""#));
        assert!(json.contains(r#""path_type":"prefix""#));
    }

    #[test]
    fn reply_serialization() {
        let json = serde_json::to_string(&ServiceReply::Flag(true)).unwrap();
        assert_eq!(json, r#"{"reply":"flag","value":true}"#);
        let json = serde_json::to_string(&ServiceReply::Done).unwrap();
        assert_eq!(json, r#"{"reply":"done"}"#);
    }

    #[test]
    fn request_names() {
        assert_eq!(ServiceRequest::ClearCache.name(), "clear_cache");
        assert_eq!(
            ServiceRequest::MutingInverted {
                mute_type: InvertMutingType::Process
            }
            .name(),
            "muting_inverted"
        );
    }

    #[test]
    fn client_error_display() {
        assert_eq!(
            ClientError::NotConnected.to_string(),
            "Not connected to the security service"
        );
        assert_eq!(ClientError::Timeout(4000).to_string(), "IPC timeout after 4000ms");
        assert_eq!(ClientError::HandlerNotSet.to_string(), "Handler not set");
    }
}
