//! Authorization resolutions and interest verdicts.

use serde::{Deserialize, Serialize};

use super::EventSet;

/// Decision part of a [`Resolution`].
///
/// The wire carries a single 32-bit code, so `Flags(0)` and `Auth(false)`
/// share code `0`, and `Flags(u32::MAX)` and `Auth(true)` share `u32::MAX`.
/// [`from_code`](Self::from_code) decodes those two codes as `Auth`; compare
/// decisions by [`code`](Self::code) when the variant does not matter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthResult {
    /// Plain allow or deny.
    Auth(bool),
    /// Allowed access flags; `0` denies everything.
    Flags(u32),
}

impl AuthResult {
    /// 32-bit decision code used on the wire.
    #[must_use]
    pub fn code(self) -> u32 {
        match self {
            Self::Auth(true) => u32::MAX,
            Self::Auth(false) => 0,
            Self::Flags(flags) => flags,
        }
    }

    #[must_use]
    pub fn from_code(code: u32) -> Self {
        match code {
            u32::MAX => Self::Auth(true),
            0 => Self::Auth(false),
            flags => Self::Flags(flags),
        }
    }
}

/// Outcome of an authorization request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resolution {
    pub result: AuthResult,
    /// The service may reuse the decision for matching events.
    pub cache: bool,
}

impl Resolution {
    /// Allow once, do not cache.
    pub const ALLOW_ONCE: Self = Self {
        result: AuthResult::Auth(true),
        cache: false,
    };

    #[must_use]
    pub fn allow(cache: bool) -> Self {
        Self {
            result: AuthResult::Auth(true),
            cache,
        }
    }

    #[must_use]
    pub fn deny(cache: bool) -> Self {
        Self {
            result: AuthResult::Auth(false),
            cache,
        }
    }

    /// Wire representation: decision code plus cache flag.
    #[must_use]
    pub fn to_wire(self) -> (u32, bool) {
        (self.result.code(), self.cache)
    }

    #[must_use]
    pub fn from_wire(code: u32, cache: bool) -> Self {
        Self {
            result: AuthResult::from_code(code),
            cache,
        }
    }
}

impl Default for Resolution {
    fn default() -> Self {
        Self::ALLOW_ONCE
    }
}

/// A handler's opinion on whether a process's events should be delivered.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InterestVerdict {
    /// Event kinds the client does not want for this process.
    pub ignored: EventSet,
    /// Ask the service to mute the process natively instead of filtering.
    #[serde(default)]
    pub native_muting: bool,
}

impl InterestVerdict {
    /// Deliver every event of the process.
    #[must_use]
    pub fn listen() -> Self {
        Self::default()
    }

    /// Suppress the given events for the process.
    #[must_use]
    pub fn ignore(events: EventSet) -> Self {
        Self {
            ignored: events,
            native_muting: false,
        }
    }

    #[must_use]
    pub fn with_native_muting(mut self) -> Self {
        self.native_muting = true;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::EventType;

    #[test]
    fn default_resolution_allows_once_without_cache() {
        let resolution = Resolution::default();
        assert_eq!(resolution.result, AuthResult::Auth(true));
        assert!(!resolution.cache);
        assert_eq!(resolution.to_wire(), (u32::MAX, false));
    }

    #[test]
    fn decision_codes() {
        assert_eq!(AuthResult::from_code(0), AuthResult::Auth(false));
        assert_eq!(AuthResult::from_code(u32::MAX), AuthResult::Auth(true));
        assert_eq!(AuthResult::from_code(0b101), AuthResult::Flags(0b101));
        assert_eq!(Resolution::from_wire(0, true), Resolution::deny(true));
    }

    #[test]
    fn boundary_flags_decode_as_plain_decisions() {
        for flags in [0, u32::MAX] {
            let decoded = AuthResult::from_code(AuthResult::Flags(flags).code());
            assert_ne!(decoded, AuthResult::Flags(flags));
            assert_eq!(decoded.code(), flags);
        }
    }

    #[test]
    fn verdict_builders() {
        let verdict =
            InterestVerdict::ignore(EventSet::from([EventType::NOTIFY_OPEN])).with_native_muting();
        assert!(verdict.ignored.contains(EventType::NOTIFY_OPEN));
        assert!(verdict.native_muting);
        assert!(InterestVerdict::listen().ignored.is_empty());
    }
}
