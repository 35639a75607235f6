//! ---
//! shem_section: "05-update-security"
//! shem_subsection: "module"
//! shem_type: "source"
//! shem_scope: "code"
//! shem_description: "Version and tag model for signed artifact references."
//! shem_version: "v0.1.0"
//! shem_owner: "tbd"
//! ---
use std::fmt;
use std::str::FromStr;

use thiserror::Error;

/// Error produced when a version or tag string does not parse.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum VersionError {
    #[error("invalid version format: {0:?}")]
    InvalidFormat(String),
    #[error("invalid version component: {0:?}")]
    InvalidComponent(String),
    #[error("no dash in tag {0:?}")]
    MissingArchitecture(String),
}

/// A dotted `major.minor.patch` triple of non-negative integers.
///
/// Ordering is lexicographic on `(major, minor, patch)`. Contexts that must
/// tolerate malformed input use [`Version::lenient`], which maps anything
/// unparseable to `0.0.0` so it sorts below every released version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Version {
    pub major: u64,
    pub minor: u64,
    pub patch: u64,
}

impl Version {
    pub const ZERO: Version = Version {
        major: 0,
        minor: 0,
        patch: 0,
    };

    pub fn new(major: u64, minor: u64, patch: u64) -> Self {
        Self {
            major,
            minor,
            patch,
        }
    }

    /// Parse a version string, treating malformed input as `0.0.0`.
    pub fn lenient(s: &str) -> Self {
        s.parse().unwrap_or(Self::ZERO)
    }
}

impl FromStr for Version {
    type Err = VersionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.split('.');
        let (major, minor, patch) = match (parts.next(), parts.next(), parts.next(), parts.next()) {
            (Some(major), Some(minor), Some(patch), None) => (major, minor, patch),
            _ => return Err(VersionError::InvalidFormat(s.to_owned())),
        };
        let component = |part: &str| {
            part.parse::<u64>()
                .map_err(|_| VersionError::InvalidComponent(part.to_owned()))
        };
        Ok(Self {
            major: component(major)?,
            minor: component(minor)?,
            patch: component(patch)?,
        })
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

/// An artifact tag of the form `version-architecture`.
///
/// The separator is the first `-`; everything after it is the architecture
/// string, so multi-dash architectures survive the split.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tag {
    pub version: Version,
    pub arch: String,
}

impl Tag {
    pub fn new(version: Version, arch: impl Into<String>) -> Self {
        Self {
            version,
            arch: arch.into(),
        }
    }

    /// Tag for the given version on the host architecture.
    pub fn for_host(version: Version) -> Self {
        Self::new(version, host_arch())
    }
}

impl FromStr for Tag {
    type Err = VersionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (version, arch) = s
            .split_once('-')
            .ok_or_else(|| VersionError::MissingArchitecture(s.to_owned()))?;
        Ok(Self {
            version: version.parse()?,
            arch: arch.to_owned(),
        })
    }
}

impl fmt::Display for Tag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.version, self.arch)
    }
}

/// OCI-style architecture string for the host, matching the suffix used in
/// published artifact tags.
pub fn host_arch() -> &'static str {
    match std::env::consts::ARCH {
        "x86_64" => "amd64",
        "aarch64" => "arm64",
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_dotted_triple() {
        let v: Version = "1.2.10".parse().unwrap();
        assert_eq!(v, Version::new(1, 2, 10));
    }

    #[test]
    fn rejects_malformed_versions() {
        for s in ["", "1", "1.2", "1.2.3.4", "1.2.x", "a.b.c", "1.2.-3"] {
            assert!(s.parse::<Version>().is_err(), "{s:?} should not parse");
        }
    }

    #[test]
    fn lenient_maps_garbage_to_zero() {
        assert_eq!(Version::lenient("not-a-version"), Version::ZERO);
        assert_eq!(Version::lenient("1.2.3"), Version::new(1, 2, 3));
    }

    #[test]
    fn ordering_is_numeric_per_component() {
        let v = |s: &str| s.parse::<Version>().unwrap();
        assert!(v("1.2.2") < v("1.2.10"));
        assert!(v("1.10.0") > v("1.9.9"));
        assert!(v("2.0.0") > v("1.99.99"));
        assert_eq!(v("0.5.0"), v("0.5.0"));
    }

    #[test]
    fn zero_sorts_below_everything() {
        assert!(Version::lenient("garbage") < "0.0.1".parse().unwrap());
    }

    #[test]
    fn tag_splits_on_first_dash() {
        let tag: Tag = "1.2.3-amd64".parse().unwrap();
        assert_eq!(tag.version, Version::new(1, 2, 3));
        assert_eq!(tag.arch, "amd64");

        let exotic: Tag = "0.1.0-linux-arm-v7".parse().unwrap();
        assert_eq!(exotic.arch, "linux-arm-v7");
    }

    #[test]
    fn tag_requires_dash_and_valid_version() {
        assert!("1.2.3".parse::<Tag>().is_err());
        assert!("latest-amd64".parse::<Tag>().is_err());
    }

    #[test]
    fn tag_round_trips_through_display() {
        let tag = Tag::new(Version::new(0, 5, 0), "arm64");
        assert_eq!(tag.to_string(), "0.5.0-arm64");
        assert_eq!(tag.to_string().parse::<Tag>().unwrap(), tag);
    }
}
