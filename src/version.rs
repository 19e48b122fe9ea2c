//! Module versioning.
//!
//! Versions travel on the wire as `major * 10000 + minor * 100 + patch`,
//! the same integer form stamped into metadata entries (`encoding_version`,
//! `min_version`) and RDB section headers.

use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SemanticVersion {
    pub major: u16,
    pub minor: u16,
    pub patch: u16,
}

impl SemanticVersion {
    pub const fn new(major: u16, minor: u16, patch: u16) -> Self {
        Self {
            major,
            minor,
            patch,
        }
    }

    pub const fn to_int(self) -> u32 {
        self.major as u32 * 10_000 + self.minor as u32 * 100 + self.patch as u32
    }

    pub const fn from_int(value: u32) -> Self {
        Self {
            major: (value / 10_000) as u16,
            minor: (value / 100 % 100) as u16,
            patch: (value % 100) as u16,
        }
    }
}

impl fmt::Display for SemanticVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

/// The running module's version.
pub const MODULE_VERSION: SemanticVersion = SemanticVersion::new(1, 1, 0);
