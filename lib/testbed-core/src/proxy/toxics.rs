//! Toxic codes and slider normalization.
//!
//! A slider UI drives every toxic with a value in `0..=100`. Each toxic code maps that value into a calibrated
//! `[low, high]` domain range: when `low < high` the toxic value falls as the slider rises, otherwise it climbs with
//! it. The range table is calibration data and carries no other meaning.

use std::{collections::BTreeMap, path::Path};

use serde::{Deserialize, Serialize};
use testbed_error::{ErrorContext as _, GenericError, ProvisionError};

/// A short code naming one attribute of one toxic type.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct ToxicCode {
    pub code: &'static str,

    /// Toxiproxy toxic type.
    pub kind: &'static str,

    /// Attribute of the toxic the slider drives.
    pub attribute: &'static str,
}

static CODES: &[ToxicCode] = &[
    ToxicCode { code: "L", kind: "latency", attribute: "latency" },
    ToxicCode { code: "J", kind: "latency", attribute: "jitter" },
    ToxicCode { code: "B", kind: "bandwidth", attribute: "rate" },
    ToxicCode { code: "SC", kind: "slow_close", attribute: "delay" },
    ToxicCode { code: "T", kind: "timeout", attribute: "timeout" },
    ToxicCode { code: "Sas", kind: "slicer", attribute: "average_size" },
    ToxicCode { code: "Ssv", kind: "slicer", attribute: "size_variation" },
    ToxicCode { code: "Sd", kind: "slicer", attribute: "delay" },
    ToxicCode { code: "Ld", kind: "limit_data", attribute: "bytes" },
];

/// Looks up a toxic code.
///
/// # Errors
///
/// If the code is unknown, `InvalidOption` is returned.
pub fn decode(code: &str) -> Result<&'static ToxicCode, ProvisionError> {
    CODES
        .iter()
        .find(|entry| entry.code == code)
        .ok_or_else(|| ProvisionError::InvalidOption {
            option: "tox-code".to_string(),
            reason: format!("unknown toxic code '{}'.", code),
        })
}

/// Finds the code for a toxic type and attribute.
pub fn encode(kind: &str, attribute: &str) -> Option<&'static str> {
    CODES
        .iter()
        .find(|entry| entry.kind == kind && entry.attribute == attribute)
        .map(|entry| entry.code)
}

/// Iterates over every known toxic code.
pub fn codes() -> impl Iterator<Item = &'static ToxicCode> {
    CODES.iter()
}

/// Calibrated `[low, high]` domain ranges, keyed by toxic code.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[serde(transparent)]
pub struct RangeTable {
    ranges: BTreeMap<String, (i64, i64)>,
}

impl Default for RangeTable {
    fn default() -> Self {
        let ranges = [
            ("L", (1000, 1)),
            ("J", (1000, 1)),
            ("B", (1, 10000)),
            ("SC", (1000, 1)),
            ("T", (1000, 1)),
            ("Sas", (1, 1000)),
            ("Ssv", (1, 100)),
            ("Sd", (1000, 1)),
            ("Ld", (1, 100000)),
        ];
        Self {
            ranges: ranges.into_iter().map(|(code, range)| (code.to_string(), range)).collect(),
        }
    }
}

impl RangeTable {
    /// Parses a table from YAML of the form `code: [low, high]`.
    ///
    /// # Errors
    ///
    /// If the document is not such a mapping, an error is returned.
    pub fn from_yaml(yaml: &str) -> Result<Self, GenericError> {
        serde_yaml::from_str(yaml).error_context("Failed to parse toxic range table.")
    }

    /// Reads a table from a YAML file.
    ///
    /// # Errors
    ///
    /// If the file cannot be read or parsed, an error is returned.
    pub async fn load(path: &Path) -> Result<Self, GenericError> {
        let contents = tokio::fs::read_to_string(path)
            .await
            .with_error_context(|| format!("Failed to read '{}'.", path.display()))?;
        Self::from_yaml(&contents)
    }

    /// Overrides the range of `code`.
    pub fn set(&mut self, code: &str, low: i64, high: i64) {
        self.ranges.insert(code.to_string(), (low, high));
    }

    /// Returns `(low, high)` for `code`.
    ///
    /// # Errors
    ///
    /// If the table has no range for `code`, `InvalidOption` is returned.
    pub fn range(&self, code: &str) -> Result<(i64, i64), ProvisionError> {
        self.ranges
            .get(code)
            .copied()
            .ok_or_else(|| ProvisionError::InvalidOption {
                option: "tox-code".to_string(),
                reason: format!("no calibrated range for toxic code '{}'.", code),
            })
    }

    /// Maps a slider value in `0..=100` into the domain range of `code`. The result is never below 1.
    ///
    /// # Errors
    ///
    /// If the slider value is out of bounds or `code` has no range, `InvalidOption` is returned.
    pub fn normalize(&self, code: &str, slider: i64) -> Result<i64, ProvisionError> {
        if !(0..=100).contains(&slider) {
            return Err(ProvisionError::InvalidOption {
                option: "val".to_string(),
                reason: format!("slider value {} is outside 0..=100.", slider),
            });
        }

        let (low, high) = self.range(code)?;
        let width = (high - low).abs() + 1;
        let scaled = width * slider / 100;
        let value = if low < high { (high - scaled).abs() } else { scaled };
        Ok(value.max(1))
    }

    /// Maps a toxic value back to a slider value, truncating towards zero.
    ///
    /// # Errors
    ///
    /// If `code` has no range, `InvalidOption` is returned.
    pub fn denormalize(&self, code: &str, value: i64) -> Result<i64, ProvisionError> {
        let (low, high) = self.range(code)?;
        let width = (high - low).abs() + 1;
        if low < high {
            Ok((100 * width - 100 * value) / width)
        } else {
            Ok(100 * value / width)
        }
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    #[test]
    fn codes_round_trip_through_the_lookup() {
        for entry in codes() {
            assert_eq!(decode(entry.code).unwrap(), entry);
            assert_eq!(encode(entry.kind, entry.attribute), Some(entry.code));
        }
        assert_eq!(encode("latency", "toxicity"), None);
        assert!(matches!(decode("Q"), Err(ProvisionError::InvalidOption { .. })));
    }

    #[test]
    fn default_table_covers_every_code() {
        let table = RangeTable::default();
        for entry in codes() {
            assert!(table.range(entry.code).is_ok(), "{} has no range", entry.code);
        }
    }

    #[test]
    fn direction_follows_the_range() {
        let table = RangeTable::default();
        assert_eq!(table.normalize("L", 50).unwrap(), 500);
        assert_eq!(table.normalize("L", 100).unwrap(), 1000);
        assert_eq!(table.normalize("B", 10).unwrap(), 9000);
        assert_eq!(table.normalize("B", 100).unwrap(), 1);
        assert_eq!(table.normalize("L", 0).unwrap(), 1);
    }

    #[test]
    fn slider_bounds_are_enforced() {
        let table = RangeTable::default();
        assert!(matches!(table.normalize("L", 101), Err(ProvisionError::InvalidOption { .. })));
        assert!(matches!(table.normalize("L", -1), Err(ProvisionError::InvalidOption { .. })));
    }

    #[test]
    fn yaml_tables_replace_the_defaults() {
        let table = RangeTable::from_yaml("L: [10, 1]\nB: [1, 10]\n").unwrap();
        assert_eq!(table.range("L").unwrap(), (10, 1));
        assert!(table.range("J").is_err());
        assert!(RangeTable::from_yaml("L: fast").is_err());
    }

    #[tokio::test]
    async fn tables_load_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("range.yml");
        tokio::fs::write(&path, "Ssv: [1, 100]\n").await.unwrap();

        let table = RangeTable::load(&path).await.unwrap();
        assert_eq!(table.normalize("Ssv", 25).unwrap(), 75);
    }

    // Widths dividing 100 evenly map every domain value to a distinct slider step.
    fn small_range() -> impl Strategy<Value = (i64, i64)> {
        prop::sample::select(vec![1i64, 2, 4, 5, 10, 20, 25, 50, 100])
            .prop_flat_map(|width| prop_oneof![Just((1, width)), Just((width, 1))])
    }

    // Widths that are multiples of 100 give every slider step a distinct domain value.
    fn wide_range() -> impl Strategy<Value = (i64, i64)> {
        (1i64..=1000)
            .prop_map(|n| n * 100)
            .prop_flat_map(|width| prop_oneof![Just((1, width)), Just((width, 1))])
    }

    proptest! {
        #[test]
        fn normalize_inverts_denormalize((low, high) in small_range(), pick in 0usize..100) {
            let mut table = RangeTable::default();
            table.set("X", low, high);

            let (min, max) = (low.min(high), low.max(high));
            let value = min + (pick as i64 % (max - min + 1));
            let slider = table.denormalize("X", value).unwrap();
            prop_assert_eq!(table.normalize("X", slider).unwrap(), value);
        }

        #[test]
        fn denormalize_inverts_normalize((low, high) in wide_range(), slider in 1i64..100) {
            let mut table = RangeTable::default();
            table.set("X", low, high);

            let value = table.normalize("X", slider).unwrap();
            prop_assert_eq!(table.denormalize("X", value).unwrap(), slider);
        }
    }
}
