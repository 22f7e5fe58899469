//! Session identity: the per-pair GUID, the version string, and the naming
//! scheme for every shared OS object.
//!
//! The GUID is generated by the client, passed to the server on its command
//! line, and woven into all shared-memory and semaphore names so several
//! client/server pairs can coexist on one machine.

use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

/// Version string compared verbatim at handshake. A mismatch is fatal.
pub const BRIDGE_VERSION: &str = "pontoon-0.1.0";

/// Prefix for every shared object name.
const NAME_PREFIX: &str = "pontoon";

/// Unique per client/server pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionGuid {
    hi: u64,
    lo: u64,
}

impl SessionGuid {
    /// Generate a fresh GUID from wall-clock nanoseconds and the pid. Not
    /// cryptographic; it only has to be unique across concurrent sessions
    /// on one machine.
    pub fn generate() -> Self {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_nanos();
        Self {
            hi: (nanos >> 64) as u64 ^ u64::from(std::process::id()).rotate_left(32),
            lo: nanos as u64,
        }
    }

    /// Parse the hex form produced by `Display` (what the server receives
    /// on its command line).
    pub fn parse(text: &str) -> Option<Self> {
        let (hi, lo) = text.split_once('-')?;
        Some(Self {
            hi: u64::from_str_radix(hi, 16).ok()?,
            lo: u64::from_str_radix(lo, 16).ok()?,
        })
    }
}

impl fmt::Display for SessionGuid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}-{:016x}", self.hi, self.lo)
    }
}

/// Which kind of shared object a name refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObjectRole {
    Command,
    Data,
    Heap,
    Semaphore,
}

impl ObjectRole {
    fn as_str(self) -> &'static str {
        match self {
            ObjectRole::Command => "cmd",
            ObjectRole::Data => "data",
            ObjectRole::Heap => "heap",
            ObjectRole::Semaphore => "sem",
        }
    }
}

/// Build the canonical `"<prefix>_<guid>_<role>_<purpose>"` object name.
/// These names must be legal on both sides of the 32/64-bit boundary, so
/// they stay plain ASCII with no path separators.
pub fn object_name(guid: SessionGuid, role: ObjectRole, purpose: &str) -> String {
    debug_assert!(purpose.chars().all(|c| c.is_ascii_alphanumeric() || c == '_'));
    format!("{NAME_PREFIX}_{guid}_{}_{purpose}", role.as_str())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn guid_display_parse_roundtrip() {
        let guid = SessionGuid::generate();
        let parsed = SessionGuid::parse(&guid.to_string()).unwrap();
        assert_eq!(guid, parsed);
    }

    #[test]
    fn guid_parse_rejects_garbage() {
        assert!(SessionGuid::parse("not-a-guid").is_none());
        assert!(SessionGuid::parse("deadbeef").is_none());
    }

    #[test]
    fn guids_differ_across_calls() {
        // Nanosecond clock + pid makes collisions in-process implausible.
        let a = SessionGuid::generate();
        let b = SessionGuid::generate();
        assert_ne!(a, b);
    }

    #[test]
    fn object_names_are_scoped_and_flat() {
        let guid = SessionGuid::parse("0000000000000001-0000000000000002").unwrap();
        let name = object_name(guid, ObjectRole::Command, "device");
        assert_eq!(
            name,
            "pontoon_0000000000000001-0000000000000002_cmd_device"
        );
        assert!(!name.contains('/'));
        assert!(!name.contains('\\'));
    }
}
