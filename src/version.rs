//! Semantic version value type.
//!
//! Ordering follows semver precedence: the numeric core first, then the
//! pre-release identifiers field by field. Build metadata never changes
//! precedence; it only breaks ties so that `Ord` stays consistent with `Eq`.

use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

/// Maximum accepted length of a version string.
const MAX_VERSION_LEN: usize = 256;

/// Errors produced while parsing a version string.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum VersionError {
    /// The input does not follow `major[.minor[.patch]][-pre][+build]`.
    #[error("invalid version '{input}': {reason}")]
    InvalidFormat {
        /// The rejected input.
        input: String,
        /// What was wrong with it.
        reason: &'static str,
    },
}

impl VersionError {
    fn invalid(input: &str, reason: &'static str) -> Self {
        Self::InvalidFormat {
            input: input.to_string(),
            reason,
        }
    }
}

/// A single dot-separated pre-release identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Identifier {
    /// All-digit identifier, compared numerically.
    Numeric(u64),
    /// Identifier containing letters or hyphens, compared case-insensitively.
    Alphanumeric(String),
}

impl Identifier {
    fn parse(segment: &str, input: &str) -> Result<Self, VersionError> {
        if segment.is_empty() {
            return Err(VersionError::invalid(input, "empty pre-release identifier"));
        }
        if !segment
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-')
        {
            return Err(VersionError::invalid(
                input,
                "pre-release identifiers may only contain [0-9A-Za-z-]",
            ));
        }
        if segment.chars().all(|c| c.is_ascii_digit()) {
            segment
                .parse::<u64>()
                .map(Identifier::Numeric)
                .map_err(|_| VersionError::invalid(input, "numeric identifier overflow"))
        } else {
            Ok(Identifier::Alphanumeric(segment.to_string()))
        }
    }

    /// Precedence comparison: numeric < alphanumeric, letters ignore case.
    fn precedence(&self, other: &Self) -> Ordering {
        match (self, other) {
            (Identifier::Numeric(a), Identifier::Numeric(b)) => a.cmp(b),
            (Identifier::Numeric(_), Identifier::Alphanumeric(_)) => Ordering::Less,
            (Identifier::Alphanumeric(_), Identifier::Numeric(_)) => Ordering::Greater,
            (Identifier::Alphanumeric(a), Identifier::Alphanumeric(b)) => a
                .bytes()
                .map(|b| b.to_ascii_lowercase())
                .cmp(b.bytes().map(|b| b.to_ascii_lowercase())),
        }
    }
}

impl fmt::Display for Identifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Identifier::Numeric(n) => write!(f, "{}", n),
            Identifier::Alphanumeric(s) => f.write_str(s),
        }
    }
}

/// An immutable semantic version.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Version {
    /// Major component.
    pub major: u64,
    /// Minor component.
    pub minor: u64,
    /// Patch component.
    pub patch: u64,
    /// Ordered pre-release identifiers (empty for a release).
    pub pre: Vec<Identifier>,
    /// Build metadata, without the leading `+`.
    pub build: Option<String>,
}

impl Version {
    /// Creates a release version with no pre-release or build tag.
    #[must_use]
    pub const fn new(major: u64, minor: u64, patch: u64) -> Self {
        Self {
            major,
            minor,
            patch,
            pre: Vec::new(),
            build: None,
        }
    }

    /// Parses a version string.
    ///
    /// Accepts one to three numeric core components (missing ones default
    /// to zero), an optional `-` pre-release and an optional `+` build tag.
    pub fn parse(text: &str) -> Result<Self, VersionError> {
        let input = text.trim();
        if input.is_empty() {
            return Err(VersionError::invalid(text, "empty version"));
        }
        if input.len() > MAX_VERSION_LEN {
            return Err(VersionError::invalid(text, "version too long"));
        }

        let (rest, build) = match input.split_once('+') {
            Some((rest, build)) => (rest, Some(build)),
            None => (input, None),
        };
        let (core, pre) = match rest.split_once('-') {
            Some((core, pre)) => (core, Some(pre)),
            None => (rest, None),
        };

        let mut numbers = [0u64; 3];
        let mut count = 0;
        for part in core.split('.') {
            if count == numbers.len() {
                return Err(VersionError::invalid(text, "too many core components"));
            }
            if part.is_empty() || !part.chars().all(|c| c.is_ascii_digit()) {
                return Err(VersionError::invalid(text, "core components must be numeric"));
            }
            numbers[count] = part
                .parse()
                .map_err(|_| VersionError::invalid(text, "core component overflow"))?;
            count += 1;
        }

        let pre = match pre {
            Some(pre) => pre
                .split('.')
                .map(|segment| Identifier::parse(segment, text))
                .collect::<Result<Vec<_>, _>>()?,
            None => Vec::new(),
        };

        let build = match build {
            Some(build) => {
                if build
                    .split('.')
                    .any(|s| s.is_empty() || !s.chars().all(|c| c.is_ascii_alphanumeric() || c == '-'))
                {
                    return Err(VersionError::invalid(text, "malformed build metadata"));
                }
                Some(build.to_string())
            }
            None => None,
        };

        Ok(Self {
            major: numbers[0],
            minor: numbers[1],
            patch: numbers[2],
            pre,
            build,
        })
    }

    /// Returns true if this is a pre-release version.
    #[must_use]
    pub fn is_prerelease(&self) -> bool {
        !self.pre.is_empty()
    }

    /// Compares by semver precedence, ignoring build metadata.
    #[must_use]
    pub fn cmp_precedence(&self, other: &Self) -> Ordering {
        self.major
            .cmp(&other.major)
            .then(self.minor.cmp(&other.minor))
            .then(self.patch.cmp(&other.patch))
            .then_with(|| match (self.pre.is_empty(), other.pre.is_empty()) {
                (true, true) => Ordering::Equal,
                // A release ranks above any pre-release of the same core.
                (true, false) => Ordering::Greater,
                (false, true) => Ordering::Less,
                (false, false) => {
                    for (a, b) in self.pre.iter().zip(&other.pre) {
                        let ord = a.precedence(b);
                        if ord != Ordering::Equal {
                            return ord;
                        }
                    }
                    self.pre.len().cmp(&other.pre.len())
                }
            })
    }

    /// Returns true if this version satisfies `>= minimum` by precedence.
    #[must_use]
    pub fn satisfies_min(&self, minimum: &Version) -> bool {
        self.cmp_precedence(minimum) != Ordering::Less
    }
}

impl Ord for Version {
    fn cmp(&self, other: &Self) -> Ordering {
        self.cmp_precedence(other)
            // Tie-breaks only: case variants of equal-precedence identifiers,
            // then build metadata (absent ranks first).
            .then_with(|| self.pre_text().cmp(&other.pre_text()))
            .then_with(|| self.build.cmp(&other.build))
    }
}

impl PartialOrd for Version {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Version {
    fn pre_text(&self) -> String {
        self.pre
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join(".")
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)?;
        if !self.pre.is_empty() {
            write!(f, "-{}", self.pre_text())?;
        }
        if let Some(build) = &self.build {
            write!(f, "+{}", build)?;
        }
        Ok(())
    }
}

impl FromStr for Version {
    type Err = VersionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Version::parse(s)
    }
}

impl Serialize for Version {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Version {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let text = String::deserialize(deserializer)?;
        Version::parse(&text).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
#[allow(clippy::expect_used)]
mod tests {
    use super::*;

    fn v(text: &str) -> Version {
        Version::parse(text).expect("valid version")
    }

    #[test]
    fn test_parse_full_version() {
        let version = v("1.2.3-beta.4+sha.abc");
        assert_eq!(version.major, 1);
        assert_eq!(version.minor, 2);
        assert_eq!(version.patch, 3);
        assert_eq!(
            version.pre,
            vec![
                Identifier::Alphanumeric("beta".to_string()),
                Identifier::Numeric(4)
            ]
        );
        assert_eq!(version.build.as_deref(), Some("sha.abc"));
    }

    #[test]
    fn test_parse_short_core_normalizes() {
        assert_eq!(v("2").to_string(), "2.0.0");
        assert_eq!(v("2.1").to_string(), "2.1.0");
        assert_eq!(v("1.0.0-rc.01").to_string(), "1.0.0-rc.1");
    }

    #[test]
    fn test_parse_rejects_malformed() {
        for bad in ["", "   ", "1..0", "1.0.0.0", "a.b.c", "1.0.0-", "1.0.0-alpha..1", "1.0.0+", "1.0.0+a..b", "1.0.0-al_pha"] {
            assert!(Version::parse(bad).is_err(), "expected '{}' to be rejected", bad);
        }
    }

    #[test]
    fn test_precedence_chain() {
        let chain = ["1.0.0-alpha", "1.0.0-alpha.1", "1.0.0-beta", "1.0.0", "1.0.0+build"];
        for pair in chain.windows(2) {
            assert!(v(pair[0]) < v(pair[1]), "{} < {}", pair[0], pair[1]);
        }
    }

    #[test]
    fn test_numeric_identifiers_compare_numerically() {
        assert!(v("1.0.0-rc.2") < v("1.0.0-rc.10"));
        assert!(v("1.0.0-1") < v("1.0.0-alpha"));
    }

    #[test]
    fn test_alphanumeric_case_insensitive_precedence() {
        assert_eq!(v("1.0.0-ALPHA").cmp_precedence(&v("1.0.0-alpha")), Ordering::Equal);
        assert_ne!(v("1.0.0-ALPHA"), v("1.0.0-alpha"));
    }

    #[test]
    fn test_build_metadata_ignored_by_precedence() {
        assert_eq!(v("1.0.0+a").cmp_precedence(&v("1.0.0+b")), Ordering::Equal);
        assert_ne!(v("1.0.0+a"), v("1.0.0+b"));
        assert!(v("1.0.0+a").satisfies_min(&v("1.0.0")));
    }

    #[test]
    fn test_satisfies_min() {
        assert!(v("1.5.0").satisfies_min(&v("1.0.0")));
        assert!(!v("1.5.0").satisfies_min(&v("2.0.0")));
        assert!(!v("2.0.0-rc.1").satisfies_min(&v("2.0.0")));
    }

    #[test]
    fn test_serde_as_string() {
        let json = serde_json::to_string(&v("1.2.3-rc.1")).expect("serialize");
        assert_eq!(json, "\"1.2.3-rc.1\"");
        let back: Version = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(back, v("1.2.3-rc.1"));
    }
}
