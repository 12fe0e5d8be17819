//! Process descriptors.

use serde::{Deserialize, Serialize};

/// Opaque kernel audit token identifying a process instance.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AuditToken(pub [u32; 8]);

impl AuditToken {
    /// Process id stored in the token.
    #[must_use]
    pub fn pid(&self) -> u32 {
        self.0[5]
    }

    /// Effective user id stored in the token.
    #[must_use]
    pub fn euid(&self) -> u32 {
        self.0[1]
    }
}

/// Description of the process that triggered an event.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessDescriptor {
    pub audit_token: AuditToken,
    pub pid: u32,
    pub euid: u32,
    /// Absolute path of the executable.
    pub path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub team_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signing_id: Option<String>,
    #[serde(default)]
    pub is_platform_binary: bool,
}

impl ProcessDescriptor {
    /// Creates a descriptor for `path` with the given pid.
    #[must_use]
    pub fn new(pid: u32, path: impl Into<String>) -> Self {
        let mut token = [0u32; 8];
        token[5] = pid;
        Self {
            audit_token: AuditToken(token),
            pid,
            path: path.into(),
            ..Default::default()
        }
    }

    /// Executable file name (last path component).
    #[must_use]
    pub fn name(&self) -> &str {
        self.path.rsplit('/').next().unwrap_or(&self.path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_stores_pid_in_token() {
        let process = ProcessDescriptor::new(42, "/usr/bin/true");
        assert_eq!(process.audit_token.pid(), 42);
        assert_eq!(process.pid, 42);
    }

    #[test]
    fn name_is_last_component() {
        assert_eq!(ProcessDescriptor::new(1, "/bin/ls").name(), "ls");
        assert_eq!(ProcessDescriptor::new(1, "launchd").name(), "launchd");
    }

    #[test]
    fn optional_identifiers_are_omitted() {
        let json = serde_json::to_string(&ProcessDescriptor::new(7, "/bin/sh")).unwrap();
        assert!(!json.contains("team_id"));
        assert!(!json.contains("signing_id"));
    }
}
