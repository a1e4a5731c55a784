//! Protocol version negotiation.
//!
//! The server announces the major of [`PROTOCOL_VERSION`] in its
//! `connected` frame and the full version on `/health`. A client may name
//! the major it speaks with `?version=<major>` on the WebSocket upgrade;
//! the upgrade is refused when the majors differ.
//! Minor bumps only add optional fields and events, which older clients
//! ignore.

use serde::{Deserialize, Serialize};

/// The version this build speaks.
pub const PROTOCOL_VERSION: Version = Version { major: 1, minor: 0 };

/// Wire protocol version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Version {
    pub major: u8,
    pub minor: u8,
}

impl Version {
    /// Whether a client requesting `major` can be served.
    #[must_use]
    pub fn accepts_major(&self, major: u8) -> bool {
        self.major == major
    }
}

impl std::fmt::Display for Version {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_matching_major_is_accepted() {
        assert!(PROTOCOL_VERSION.accepts_major(1));
        assert!(!PROTOCOL_VERSION.accepts_major(0));
        assert!(!PROTOCOL_VERSION.accepts_major(2));
    }

    #[test]
    fn test_display() {
        assert_eq!(PROTOCOL_VERSION.to_string(), "1.0");
    }
}
