//! Dotted versions.
//!
//! Used for the runtime version stored in recording headers and for the
//! version-qualified sections of patch configuration, which may name any
//! number of components (`"1.60"`, `"3.11.2"`).

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

/// Dotted numeric version. Missing trailing components compare as zero.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Version {
    components: Vec<u64>,
}

impl Version {
    /// Create a three-component version
    #[must_use]
    pub fn new(major: u64, minor: u64, patch: u64) -> Self {
        Self {
            components: vec![major, minor, patch],
        }
    }

    /// Parse from string. Each component takes its leading digits, so
    /// `"2.0rc1"` parses as `2.0`.
    ///
    /// # Errors
    ///
    /// Returns error if format is invalid
    pub fn parse(s: &str) -> Result<Self, VersionError> {
        let s = s.trim();
        if s.is_empty() {
            return Err(VersionError::InvalidFormat(s.to_string()));
        }
        let components = s
            .split('.')
            .map(|part| {
                let digits: String = part.chars().take_while(char::is_ascii_digit).collect();
                digits
                    .parse()
                    .map_err(|_| VersionError::InvalidComponent(part.to_string()))
            })
            .collect::<Result<Vec<u64>, _>>()?;
        Ok(Self { components })
    }

    /// Version components
    #[must_use]
    pub fn components(&self) -> &[u64] {
        &self.components
    }

    fn component(&self, i: usize) -> u64 {
        self.components.get(i).copied().unwrap_or(0)
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
        let len = self.components.len().max(other.components.len());
        (0..len)
            .map(|i| self.component(i).cmp(&other.component(i)))
            .find(|o| *o != Ordering::Equal)
            .unwrap_or(Ordering::Equal)
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, c) in self.components.iter().enumerate() {
            if i > 0 {
                f.write_str(".")?;
            }
            write!(f, "{}", c)?;
        }
        Ok(())
    }
}

impl FromStr for Version {
    type Err = VersionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

/// Version-related errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum VersionError {
    /// Invalid format
    #[error("Invalid version format: {0}")]
    InvalidFormat(String),
    /// Invalid component
    #[error("Invalid version component: {0}")]
    InvalidComponent(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_version_parse() {
        let v = Version::parse("1.2.3").unwrap();
        assert_eq!(v.components(), &[1, 2, 3]);
        assert_eq!(Version::parse("1.60").unwrap().components(), &[1, 60]);
        assert_eq!(Version::parse("2.0rc1").unwrap(), Version::parse("2.0").unwrap());
    }

    #[test]
    fn test_version_parse_invalid() {
        assert!(Version::parse("").is_err());
        assert!(Version::parse("a.b").is_err());
        assert!(Version::parse("1..2").is_err());
    }

    #[test]
    fn test_version_ordering() {
        let v = |s: &str| Version::parse(s).unwrap();
        assert!(v("1.10") > v("1.9"));
        assert!(v("2") > v("1.99.99"));
        assert_eq!(v("1.60"), v("1.60.0"));
        assert!(v("1.60.1") > v("1.60"));
    }

    #[test]
    fn test_version_display() {
        assert_eq!(Version::new(0, 1, 0).to_string(), "0.1.0");
        assert_eq!(Version::parse("3.11").unwrap().to_string(), "3.11");
    }

    proptest! {
        #[test]
        fn prop_trailing_zeros_compare_equal(parts in proptest::collection::vec(0u64..1000, 1..5), zeros in 0usize..3) {
            let short = Version::parse(&parts.iter().map(ToString::to_string).collect::<Vec<_>>().join(".")).unwrap();
            let mut padded = parts.clone();
            padded.extend(std::iter::repeat_n(0, zeros));
            let long = Version::parse(&padded.iter().map(ToString::to_string).collect::<Vec<_>>().join(".")).unwrap();
            prop_assert_eq!(short.cmp(&long), Ordering::Equal);
            let reparsed = Version::parse(&short.to_string()).unwrap();
            prop_assert_eq!(reparsed.components(), short.components());
        }
    }
}
