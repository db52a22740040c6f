//! Module version ordinal
//!
//! Repository manifests publish a module version as a plain JSON number
//! (`1.0`, `2.15`). Versions compare numerically, so `1.10` equals `1.1`.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Errors that can occur while reading a version
#[derive(Debug, Error)]
pub enum VersionError {
    /// Not a number at all
    #[error("Invalid version format: {0}")]
    InvalidVersion(String),

    /// NaN, infinite or negative
    #[error("Version out of range: {0}")]
    OutOfRange(String),
}

/// Comparable module version
///
/// Wraps a finite, non-negative number. Equality and ordering are total, so a
/// `Version` can be used as a map key and in `max()`/`sort()`.
#[derive(Debug, Clone, Copy)]
pub struct Version(f64);

impl Version {
    /// Create a version from a number
    pub fn new(value: f64) -> Result<Self, VersionError> {
        if !value.is_finite() || value < 0.0 {
            return Err(VersionError::OutOfRange(value.to_string()));
        }
        // Normalise -0.0 so it compares equal to 0.0 under total_cmp.
        Ok(Version(value + 0.0))
    }

    /// Parse a version string such as `"1.5"` or `"v2"`
    pub fn parse(s: &str) -> Result<Self, VersionError> {
        let s = s.trim();
        let s = s.strip_prefix('v').unwrap_or(s);
        let value: f64 = s
            .parse()
            .map_err(|_| VersionError::InvalidVersion(s.to_string()))?;
        Self::new(value)
    }

    /// The numeric value
    pub fn value(&self) -> f64 {
        self.0
    }

    /// Whether `self` is strictly newer than `other`
    pub fn is_newer_than(&self, other: &Version) -> bool {
        self > other
    }
}

impl Default for Version {
    fn default() -> Self {
        Version(0.0)
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0.fract() == 0.0 {
            write!(f, "{:.1}", self.0)
        } else {
            write!(f, "{}", self.0)
        }
    }
}

impl FromStr for Version {
    type Err = VersionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Version::parse(s)
    }
}

impl PartialEq for Version {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Version {}

impl PartialOrd for Version {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Version {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0.total_cmp(&other.0)
    }
}

impl Serialize for Version {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_f64(self.0)
    }
}

impl<'de> Deserialize<'de> for Version {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = f64::deserialize(deserializer)?;
        Version::new(value).map_err(serde::de::Error::custom)
    }
}
