//! Protocol versions spoken by QuickChat.
//!
//! A client names only the major version in its `connect` frame; the
//! server answers with the full version it will speak, or rejects the
//! connection.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::RangeInclusive;
use std::str::FromStr;

use crate::codec::ProtocolError;

/// Version this build speaks.
pub const PROTOCOL_VERSION: Version = Version::new(1, 0);

/// Major versions a client may request.
pub const SUPPORTED_MAJORS: RangeInclusive<u8> = 1..=1;

/// A `major.minor` protocol version.
///
/// Minor bumps only add optional fields, so peers agree whenever majors match.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Version {
    pub major: u8,
    pub minor: u8,
}

impl Version {
    #[must_use]
    pub const fn new(major: u8, minor: u8) -> Self {
        Self { major, minor }
    }

    /// Same major version.
    #[must_use]
    pub fn is_compatible_with(&self, other: &Version) -> bool {
        self.major == other.major
    }
}

/// Pick the version to speak with a client requesting `major`.
///
/// Returns `None` if `major` is outside [`SUPPORTED_MAJORS`].
#[must_use]
pub fn negotiate(major: u8) -> Option<Version> {
    SUPPORTED_MAJORS
        .contains(&major)
        .then_some(PROTOCOL_VERSION)
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

impl FromStr for Version {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || ProtocolError::Invalid(format!("bad version {s:?}"));
        let (major, minor) = s.split_once('.').ok_or_else(invalid)?;
        Ok(Self::new(
            major.parse().map_err(|_| invalid())?,
            minor.parse().map_err(|_| invalid())?,
        ))
    }
}

impl Default for Version {
    fn default() -> Self {
        PROTOCOL_VERSION
    }
}
