// dbstream/src/utils/version.rs
use std::fmt;
use std::sync::OnceLock;

use regex::Regex;

use crate::errors::{PipelineError, Result};

/// Largest major-version distance between server and tool that is still accepted.
const MAX_MAJOR_DISTANCE: u32 = 1;

/// `minor` is absent for pre-release builds such as `17beta1` or `17devel`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Version {
    pub major: u32,
    pub minor: Option<u32>,
}

impl Version {
    /// The leading number of a vendor banner such as `pg_dump (PostgreSQL) 13.2`.
    ///
    /// Only the first run of digits is read, so a compiler version later in
    /// the banner never stands in for a pre-release product version.
    pub fn extract(raw: &str) -> Option<Version> {
        static PATTERN: OnceLock<Regex> = OnceLock::new();
        let pattern = PATTERN.get_or_init(|| Regex::new(r"^\D*(\d+)(?:\.(\d+))?").expect("static regex"));

        let captures = pattern.captures(raw)?;
        Some(Version {
            major: captures[1].parse().ok()?,
            minor: match captures.get(2) {
                Some(minor) => Some(minor.as_str().parse().ok()?),
                None => None,
            },
        })
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.minor {
            Some(minor) => write!(f, "{}.{}", self.major, minor),
            None => write!(f, "{}", self.major),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VersionPair {
    pub server: Version,
    pub tool: Version,
}

/// Decides whether the local dump/restore tool may be used against the server.
///
/// Compatible iff the major versions differ by at most one. A banner without a
/// recognisable version is rejected outright.
pub fn check_compatibility(server_raw: &str, tool_raw: &str) -> Result<VersionPair> {
    let server = Version::extract(server_raw)
        .ok_or_else(|| PipelineError::UnparsableVersion(server_raw.trim().to_string()))?;
    let tool = Version::extract(tool_raw)
        .ok_or_else(|| PipelineError::UnparsableVersion(tool_raw.trim().to_string()))?;

    if server.major.abs_diff(tool.major) > MAX_MAJOR_DISTANCE {
        return Err(PipelineError::VersionMismatch {
            server: server.to_string(),
            tool: tool.to_string(),
        });
    }

    Ok(VersionPair { server, tool })
}
