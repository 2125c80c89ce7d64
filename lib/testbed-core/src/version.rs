//! Dotted version strings and their ordering.

use std::{cmp::Ordering, fmt};

use testbed_error::ProvisionError;

/// Stack version used when none is requested.
pub const DEFAULT_STACK_VERSION: &str = "8.0";

/// Short stack versions mapped to the concrete release they provision.
const STACK_VERSION_ALIASES: &[(&str, &str)] = &[
    ("6.0", "6.0.1"),
    ("6.1", "6.1.4"),
    ("6.2", "6.2.4"),
    ("6.3", "6.3.2"),
    ("6.4", "6.4.3"),
    ("6.5", "6.5.4"),
    ("6.6", "6.6.2"),
    ("6.7", "6.7.2"),
    ("6.8", "6.8.6"),
    ("7.0", "7.0.1"),
    ("7.1", "7.1.1"),
    ("7.2", "7.2.1"),
    ("7.3", "7.3.2"),
    ("7.4", "7.4.3"),
    ("7.5", "7.5.2"),
    ("7.6", "7.6.2"),
    ("7.7", "7.7.0"),
    ("master", "8.0.0"),
];

/// Resolves a user-supplied stack version through the alias table.
///
/// Anything that is not an alias is returned verbatim, which allows pinning a specific release such as `6.2.3`.
pub fn resolve_stack_version(requested: &str) -> String {
    STACK_VERSION_ALIASES
        .iter()
        .find(|(alias, _)| *alias == requested)
        .map(|(_, resolved)| (*resolved).to_string())
        .unwrap_or_else(|| requested.to_string())
}

/// A parsed dotted version.
///
/// Each dot-separated component contributes its leading integer, so a prerelease suffix such as `-SNAPSHOT` or `-rc1`
/// is ignored for comparison while the original string is kept for display. Parsing stops at the first component
/// without a leading integer.
///
/// Ordering is lexicographic over the integer components, with missing trailing components treated as zero: `7.0`
/// and `7.0.0` compare equal.
#[derive(Clone, Debug)]
pub struct VersionVector {
    raw: String,
    components: Vec<u64>,
}

impl VersionVector {
    /// Parses a version string.
    ///
    /// # Errors
    ///
    /// If the string contains no numeric component at all, `MalformedVersion` is returned.
    pub fn parse(input: &str) -> Result<Self, ProvisionError> {
        let version = Self::parse_lenient(input);
        if version.components.is_empty() {
            return Err(ProvisionError::MalformedVersion {
                input: input.to_string(),
            });
        }
        Ok(version)
    }

    /// Parses a version string, yielding an empty vector (the lowest possible version) when nothing numeric is found.
    pub fn parse_lenient(input: &str) -> Self {
        let mut components = Vec::new();
        for part in input.trim().split('.') {
            let digits = part.bytes().take_while(u8::is_ascii_digit).count();
            match part[..digits].parse::<u64>() {
                Ok(value) => components.push(value),
                Err(_) => break,
            }
        }

        Self {
            raw: input.to_string(),
            components,
        }
    }

    /// Returns the original string this version was parsed from.
    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// Returns the numeric components.
    pub fn components(&self) -> &[u64] {
        &self.components
    }

    /// Returns `<major>.<minor>`, as used by the build candidate index.
    pub fn major_minor(&self) -> String {
        let major = self.components.first().copied().unwrap_or(0);
        let minor = self.components.get(1).copied().unwrap_or(0);
        format!("{}.{}", major, minor)
    }

    /// Returns `true` if this version is greater than or equal to `target`.
    pub fn at_least(&self, target: &str) -> bool {
        *self >= Self::parse_lenient(target)
    }

    /// Returns `true` if this version is strictly lower than `target`.
    pub fn lower_than(&self, target: &str) -> bool {
        !self.at_least(target)
    }

    /// Compares two versions, returning `-1`, `0` or `1`.
    pub fn compare(&self, other: &Self) -> i8 {
        match self.cmp(other) {
            Ordering::Less => -1,
            Ordering::Equal => 0,
            Ordering::Greater => 1,
        }
    }
}

impl Ord for VersionVector {
    fn cmp(&self, other: &Self) -> Ordering {
        let len = self.components.len().max(other.components.len());
        (0..len)
            .map(|i| {
                let a = self.components.get(i).copied().unwrap_or(0);
                let b = other.components.get(i).copied().unwrap_or(0);
                a.cmp(&b)
            })
            .find(|ordering| ordering.is_ne())
            .unwrap_or(Ordering::Equal)
    }
}

impl PartialOrd for VersionVector {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for VersionVector {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other).is_eq()
    }
}

impl Eq for VersionVector {}

impl fmt::Display for VersionVector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}
