//! Protocol schema versions.

use std::fmt;
use std::str::FromStr;

/// A `major.minor.patch` UDMI schema version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SchemaVersion {
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
}

impl SchemaVersion {
    pub const CURRENT: SchemaVersion = SchemaVersion {
        major: 1,
        minor: 5,
        patch: 2,
    };

    pub fn key(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for SchemaVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseVersionError(pub String);

impl fmt::Display for ParseVersionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid schema version '{}'", self.0)
    }
}

impl std::error::Error for ParseVersionError {}

impl FromStr for SchemaVersion {
    type Err = ParseVersionError;

    /// Accepts `1.4`, `1.4.1`; a missing patch is zero.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let err = || ParseVersionError(s.to_owned());
        let mut parts = s.trim().split('.');
        let major = parts.next().ok_or_else(err)?.parse().map_err(|_| err())?;
        let minor = parts.next().ok_or_else(err)?.parse().map_err(|_| err())?;
        let patch = match parts.next() {
            Some(p) => p.parse().map_err(|_| err())?,
            None => 0,
        };
        if parts.next().is_some() {
            return Err(err());
        }
        Ok(SchemaVersion {
            major,
            minor,
            patch,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_short_and_full_keys() {
        let short: SchemaVersion = "1.4".parse().unwrap();
        assert_eq!(short.key(), "1.4.0");
        let full: SchemaVersion = "1.3.14".parse().unwrap();
        assert!(full < short);
        assert!(short < SchemaVersion::CURRENT);
    }

    #[test]
    fn trailing_dot_is_not_a_version() {
        assert!("1.4.".parse::<SchemaVersion>().is_err());
    }
}
