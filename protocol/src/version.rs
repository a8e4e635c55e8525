//! Server version compatibility
//!
//! Versions are compared as plain strings, the way deployed servers and
//! clients have always compared them. Servers in the wild use single-digit
//! components, where string order and numeric order agree.

use crate::constants::{CLIENT_VERSION, LAST_VALID_SERVER_VERSION};

/// Result of comparing a server version with this client
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VersionCheck {
    /// Same version as the client
    Identical,
    /// Different, but at least the last valid server version
    Compatible,
    /// Older than the last valid server version
    TooOld,
}

impl VersionCheck {
    pub fn is_compatible(self) -> bool {
        !matches!(self, Self::TooOld)
    }
}

/// A login payload carrying a version string instead of a test list
pub fn is_version_string(payload: &str) -> bool {
    payload.contains('v')
}

pub fn check_server_version(server: &str) -> VersionCheck {
    check_against(server, LAST_VALID_SERVER_VERSION, CLIENT_VERSION)
}

pub fn check_against(server: &str, last_valid: &str, client: &str) -> VersionCheck {
    if server < last_valid {
        VersionCheck::TooOld
    } else if server == client {
        VersionCheck::Identical
    } else {
        VersionCheck::Compatible
    }
}
