//! Server version parsing and per-feature version gating.
//!
//! Servers report their version as a dotted string of one to three numeric
//! components. Features that only newer servers understand are guarded by a
//! minimum version, checked against the version the session negotiated at
//! handshake time.

use std::fmt;
use std::str::FromStr;

use crate::error::{Error, Result};

/// Minimum server version for streaming large scoping id arrays.
pub const MIN_STREAMED_SCOPING_IDS: &str = "2.1";
/// Minimum server version for server-emitted progress events.
pub const MIN_PROGRESS_BAR: &str = "3.0";
/// Minimum server version for applying a licensing context after startup.
pub const MIN_APPLY_CONTEXT: &str = "4.0";
/// Minimum server version exposing runtime configuration trees.
pub const MIN_RUNTIME_CONFIG: &str = "4.0";
/// Minimum server version for multi-file folder transfers.
pub const MIN_FOLDER_TRANSFER: &str = "2.0";
/// Minimum server version for the chunked serialization stream type.
pub const MIN_CHUNKED_SERIALIZATION: &str = "8.0";

/// Payload size above which `set_ids` on a scoping streams its ids and is
/// therefore subject to the version gate.
pub const SET_IDS_STREAMING_THRESHOLD_BYTES: usize = 8 * 1024 * 1024;

/// Semantic version triple with lexicographic ordering.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct VersionTuple {
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
}

impl VersionTuple {
    pub const fn new(major: u32, minor: u32, patch: u32) -> Self {
        Self {
            major,
            minor,
            patch,
        }
    }

    /// Parses `M`, `M.N` or `M.N.P`, padding missing components with zero.
    pub fn parse(s: &str) -> Result<Self> {
        let s = s.trim();
        if s.is_empty() {
            return Err(Error::ParseError("empty version string".to_string()));
        }
        let parts = s.split('.').collect::<Vec<&str>>();
        if parts.len() > 3 {
            return Err(Error::ParseError(format!(
                "version string has more than three components: {}",
                s
            )));
        }
        let mut nums = [0u32; 3];
        for (n, part) in parts.iter().enumerate() {
            nums[n] = part.trim().parse().map_err(|_| {
                Error::ParseError(format!("invalid version component `{}` in: {}", part, s))
            })?;
        }
        Ok(Self::new(nums[0], nums[1], nums[2]))
    }

    /// Returns true if `self` is at least `required`.
    pub fn meets(&self, required: &VersionTuple) -> bool {
        meets(self, required)
    }

    /// Checks the version against a semver requirement expression such as
    /// `>=4.0, <9`.
    pub fn matches_req(&self, req: &str) -> Result<bool> {
        let req = semver::VersionReq::parse(req)
            .map_err(|e| Error::ParseError(format!("invalid version requirement: {}", e)))?;
        Ok(req.matches(&semver::Version::from(*self)))
    }
}

impl fmt::Display for VersionTuple {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

impl FromStr for VersionTuple {
    type Err = Error;
    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl From<VersionTuple> for semver::Version {
    fn from(v: VersionTuple) -> Self {
        semver::Version::new(v.major as u64, v.minor as u64, v.patch as u64)
    }
}

/// Parses a version string.
pub fn parse(s: &str) -> Result<VersionTuple> {
    VersionTuple::parse(s)
}

/// Lexicographic `actual >= required`.
pub fn meets(actual: &VersionTuple, required: &VersionTuple) -> bool {
    actual >= required
}

/// Version gate: fails with `VersionUnsupported` if `actual` is lower than
/// `required`.
pub fn require(actual: &VersionTuple, required: &str) -> Result<()> {
    let required_v = VersionTuple::parse(required)?;
    if actual.matches_req(&format!(">={}", required_v))? {
        Ok(())
    } else {
        Err(Error::VersionUnsupported {
            required: required.to_string(),
            actual: actual.to_string(),
        })
    }
}

/// Decides whether a scoping `set_ids` call with `count` elements of
/// `elem_size` bytes each goes through the version gate.
///
/// Small payloads are sent inline, which every server understands.
pub fn set_ids_requires_gate(count: usize, elem_size: usize) -> bool {
    let elem_size = elem_size.max(1);
    count > SET_IDS_STREAMING_THRESHOLD_BYTES / elem_size
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_pads_missing_components() {
        assert_eq!(parse("3").unwrap(), VersionTuple::new(3, 0, 0));
        assert_eq!(parse("3.1").unwrap(), VersionTuple::new(3, 1, 0));
        assert_eq!(parse("3.1.4").unwrap(), VersionTuple::new(3, 1, 4));
        assert_eq!(parse(" 8.0 ").unwrap(), VersionTuple::new(8, 0, 0));
    }

    #[test]
    fn parse_rejects_four_components() {
        assert!(matches!(parse("1.2.3.4"), Err(Error::ParseError(_))));
    }

    #[test]
    fn parse_rejects_garbage() {
        assert!(parse("").is_err());
        assert!(parse("a.b").is_err());
        assert!(parse("1..2").is_err());
    }

    #[test]
    fn display_round_trips() {
        for v in &[
            VersionTuple::new(0, 0, 0),
            VersionTuple::new(2, 99, 9),
            VersionTuple::new(8, 0, 12),
        ] {
            assert_eq!(parse(&v.to_string()).unwrap(), *v);
        }
    }

    #[test]
    fn ordering_is_lexicographic() {
        assert!(meets(&parse("3.0.0").unwrap(), &parse("3.0").unwrap()));
        assert!(!meets(&parse("2.99.9").unwrap(), &parse("3.0").unwrap()));
        assert!(meets(&parse("10.0").unwrap(), &parse("9.9.9").unwrap()));
        assert!(meets(&parse("4.1").unwrap(), &parse("4.0.7").unwrap()));
    }

    #[test]
    fn meets_is_transitive() {
        let versions = ["1", "1.0.1", "1.2", "2.0", "2.99.9", "3.0.0", "8.0"]
            .iter()
            .map(|s| parse(s).unwrap())
            .collect::<Vec<_>>();
        for a in &versions {
            for b in &versions {
                for c in &versions {
                    if meets(a, b) && meets(b, c) {
                        assert!(meets(a, c), "{} {} {}", a, b, c);
                    }
                }
            }
        }
    }

    #[test]
    fn require_gate() {
        assert!(require(&parse("3.0.0").unwrap(), "3.0").is_ok());
        assert!(require(&parse("10.0").unwrap(), "9.1").is_ok());
        assert!(require(&parse("4.0").unwrap(), "4.0.1").is_err());
        assert!(matches!(
            require(&parse("4.0").unwrap(), "x.y"),
            Err(Error::ParseError(_))
        ));
        match require(&parse("2.99.9").unwrap(), "3.0") {
            Err(Error::VersionUnsupported { required, actual }) => {
                assert_eq!(required, "3.0");
                assert_eq!(actual, "2.99.9");
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn semver_requirements() {
        let v = parse("4.2").unwrap();
        assert!(v.matches_req(">=4.0, <5").unwrap());
        assert!(!v.matches_req(">=5").unwrap());
    }

    #[test]
    fn set_ids_threshold() {
        assert!(!set_ids_requires_gate(1000, 4));
        assert!(!set_ids_requires_gate(SET_IDS_STREAMING_THRESHOLD_BYTES / 4, 4));
        assert!(set_ids_requires_gate(SET_IDS_STREAMING_THRESHOLD_BYTES / 4 + 1, 4));
    }
}
