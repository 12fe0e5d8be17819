//! Mute and interest rule encoding.

use serde::{Deserialize, Serialize};

use super::Codec;
use crate::ipc::ClientError;
use crate::model::{AuditToken, EventSet, EventType, ProcessDescriptor};

/// Selects processes whose events should be muted.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum MuteProcessRule {
    Token(AuditToken),
    Pid(u32),
    Euid(u32),
    Name(String),
    PathPrefix(String),
    PathLiteral(String),
    TeamIdentifier(String),
    SigningId(String),
}

impl MuteProcessRule {
    /// Whether the rule selects `process`.
    #[must_use]
    pub fn matches(&self, process: &ProcessDescriptor) -> bool {
        match self {
            Self::Token(token) => *token == process.audit_token,
            Self::Pid(pid) => *pid == process.pid,
            Self::Euid(euid) => *euid == process.euid,
            Self::Name(name) => name == process.name(),
            Self::PathPrefix(prefix) => process.path.starts_with(prefix.as_str()),
            Self::PathLiteral(path) => *path == process.path,
            Self::TeamIdentifier(team) => process.team_id.as_deref() == Some(team.as_str()),
            Self::SigningId(id) => process.signing_id.as_deref() == Some(id.as_str()),
        }
    }
}

/// How a muted path is compared against event paths.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MutePathType {
    /// Prefix of the acting process path.
    Prefix,
    /// Exact acting process path.
    Literal,
    /// Prefix of the event target path.
    TargetPrefix,
    /// Exact event target path.
    TargetLiteral,
}

impl MutePathType {
    #[must_use]
    pub fn is_target(self) -> bool {
        matches!(self, Self::TargetPrefix | Self::TargetLiteral)
    }

    /// Whether `candidate` matches the muted `path` under this type.
    #[must_use]
    pub fn matches(self, path: &str, candidate: &str) -> bool {
        match self {
            Self::Prefix | Self::TargetPrefix => candidate.starts_with(path),
            Self::Literal | Self::TargetLiteral => candidate == path,
        }
    }
}

/// Which mute table an inversion applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InvertMutingType {
    Process,
    Path,
    TargetPath,
}

impl Codec {
    /// Encodes a process mute rule for the wire.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::EncodeFailure`] if the rule cannot be serialized.
    pub fn encode_process_rule(&self, rule: &MuteProcessRule) -> Result<Vec<u8>, ClientError> {
        self.encode(rule)
    }

    /// Decodes a process mute rule, as the service does.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::DecodeFailure`] on a malformed rule.
    pub fn decode_process_rule(&self, bytes: &[u8]) -> Result<MuteProcessRule, ClientError> {
        self.decode(bytes)
    }
}

/// Numeric id array for an event set.
#[must_use]
pub fn encode_events(events: &EventSet) -> Vec<u32> {
    events.iter().map(EventType::id).collect()
}

/// Event set from a numeric id array. Duplicates collapse.
///
/// # Errors
///
/// Returns [`ClientError::DecodeFailure`] for ids above [`EventSet::MAX_ID`].
pub fn decode_events(ids: &[u32]) -> Result<EventSet, ClientError> {
    EventSet::try_from_ids(ids).map_err(|e| ClientError::DecodeFailure(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn signed_process() -> ProcessDescriptor {
        ProcessDescriptor {
            team_id: Some("ABCDE12345".to_string()),
            signing_id: Some("com.example.agent".to_string()),
            euid: 501,
            ..ProcessDescriptor::new(300, "/Applications/Agent.app/Contents/MacOS/agent")
        }
    }

    #[test]
    fn process_rule_round_trip_preserves_selector_and_events() {
        let codec = Codec::default();
        let rules = [
            MuteProcessRule::Token(AuditToken([1, 2, 3, 4, 5, 6, 7, 8])),
            MuteProcessRule::PathPrefix("/System/".to_string()),
            MuteProcessRule::TeamIdentifier("ABCDE12345".to_string()),
        ];
        let events = EventSet::from([EventType::AUTH_OPEN, EventType(77), EventType(130)]);

        for rule in rules {
            let bytes = codec.encode_process_rule(&rule).unwrap();
            let ids = encode_events(&events);
            assert_eq!(codec.decode_process_rule(&bytes).unwrap(), rule);
            assert_eq!(decode_events(&ids).unwrap().bitmask(), events.bitmask());
        }
    }

    #[test]
    fn process_rule_matching() {
        let process = signed_process();
        assert!(MuteProcessRule::Pid(300).matches(&process));
        assert!(MuteProcessRule::Euid(501).matches(&process));
        assert!(MuteProcessRule::Name("agent".to_string()).matches(&process));
        assert!(MuteProcessRule::PathPrefix("/Applications/".to_string()).matches(&process));
        assert!(!MuteProcessRule::PathLiteral("/Applications/".to_string()).matches(&process));
        assert!(MuteProcessRule::TeamIdentifier("ABCDE12345".to_string()).matches(&process));
        assert!(MuteProcessRule::SigningId("com.example.agent".to_string()).matches(&process));
        assert!(!MuteProcessRule::SigningId("com.other".to_string()).matches(&process));
        assert!(MuteProcessRule::Token(process.audit_token).matches(&process));
    }

    #[test]
    fn path_type_matching() {
        assert!(MutePathType::Prefix.matches("/usr/", "/usr/bin/ls"));
        assert!(!MutePathType::Literal.matches("/usr/", "/usr/bin/ls"));
        assert!(MutePathType::TargetLiteral.matches("/etc/hosts", "/etc/hosts"));
        assert!(MutePathType::TargetPrefix.is_target());
        assert!(!MutePathType::Prefix.is_target());
    }

    #[test]
    fn duplicate_ids_collapse() {
        let set = decode_events(&[15, 9, 15]).unwrap();
        assert_eq!(encode_events(&set), vec![9, 15]);
    }

    #[test]
    fn out_of_range_ids_fail_to_decode() {
        let err = decode_events(&[9, u32::MAX]).unwrap_err();
        assert!(matches!(err, ClientError::DecodeFailure(_)));
    }
}
