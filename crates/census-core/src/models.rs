use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::CensusError;

/// The cipher announced by a Cipher Mode Command.
///
/// Derived from the raw algorithm identifier with [`CipherCategory::classify`],
/// which is total: identifiers outside the known set land in `Unknown` and are
/// still counted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum CipherCategory {
    #[serde(rename = "A5/1")]
    A51,
    #[serde(rename = "A5/3")]
    A53,
    #[serde(rename = "A5/4")]
    A54,
    #[serde(rename = "unknown")]
    Unknown,
}

impl CipherCategory {
    /// Every category, in export column order.
    pub const ALL: [CipherCategory; 4] = [
        CipherCategory::A51,
        CipherCategory::A53,
        CipherCategory::A54,
        CipherCategory::Unknown,
    ];

    /// Map a raw `gsm_a.rr.algorithm_identifier` value to its category.
    pub fn classify(algorithm_id: i64) -> Self {
        match algorithm_id {
            0 => CipherCategory::A51,
            2 => CipherCategory::A53,
            3 => CipherCategory::A54,
            _ => CipherCategory::Unknown,
        }
    }

    /// Human-readable label, e.g. `"A5/1"`.
    pub fn label(self) -> &'static str {
        match self {
            CipherCategory::A51 => "A5/1",
            CipherCategory::A53 => "A5/3",
            CipherCategory::A54 => "A5/4",
            CipherCategory::Unknown => "unknown",
        }
    }

    /// Column-safe identifier used in exported tables, e.g. `"a5_1"`.
    pub fn column(self) -> &'static str {
        match self {
            CipherCategory::A51 => "a5_1",
            CipherCategory::A53 => "a5_3",
            CipherCategory::A54 => "a5_4",
            CipherCategory::Unknown => "unknown",
        }
    }
}

impl fmt::Display for CipherCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Identity of an originating base station.
///
/// Components are opaque and compared by exact value. No unit normalisation
/// is applied to `frequency`, so `944.2M` and `944200k` are different keys.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EntityKey {
    pub frequency: String,
    pub provider: String,
    pub lac: String,
}

impl EntityKey {
    pub fn new(
        frequency: impl Into<String>,
        provider: impl Into<String>,
        lac: impl Into<String>,
    ) -> Self {
        Self {
            frequency: frequency.into(),
            provider: provider.into(),
            lac: lac.into(),
        }
    }

    /// Operator name for the provider code, or the raw code when unknown.
    pub fn provider_name(&self) -> &str {
        match self.provider.as_str() {
            "1" => "Telekom",
            "2" => "O2",
            "3" => "Vodafone",
            other => other,
        }
    }
}

impl fmt::Display for EntityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}_{}_{}", self.frequency, self.provider, self.lac)
    }
}

/// Something skipped or set aside during an analysis run.
///
/// Issues accumulate instead of aborting the run and are reported together in
/// the run summary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunIssue {
    /// Capture source the issue belongs to.
    pub source: String,
    /// 1-based line within the source, when the issue concerns one record.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub line: Option<usize>,
    /// Error label, see [`CensusError::kind`].
    pub kind: String,
    pub detail: String,
}

impl RunIssue {
    pub fn from_error(source: impl Into<String>, line: Option<usize>, err: &CensusError) -> Self {
        Self {
            source: source.into(),
            line,
            kind: err.kind().to_string(),
            detail: err.to_string(),
        }
    }
}

/// One record as emitted by the frame extractor, before normalisation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawRecord {
    /// 1-based line in the capture file.
    pub line: usize,
    pub algorithm_id: i64,
    pub frame_number: u64,
    /// Zone-qualified text such as `"Jun  4, 2024 16:26:53.123456789 CEST"`.
    pub timestamp: String,
}

/// One classified Cipher Mode Command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CaptureEvent {
    /// Canonical UTC instant.
    pub timestamp: DateTime<Utc>,
    /// Monotonic within one capture session; resets between sessions.
    pub frame_number: u64,
    pub algorithm_id: i64,
    pub category: CipherCategory,
    /// `None` for events from sources whose key could not be resolved.
    pub entity_key: Option<EntityKey>,
    /// Position of the originating record set in the merge input.
    pub source_index: usize,
}

/// Event counts per [`CipherCategory`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CategoryCounts {
    pub a5_1: u64,
    pub a5_3: u64,
    pub a5_4: u64,
    pub unknown: u64,
}

impl CategoryCounts {
    /// Count one more event of `category`.
    pub fn add(&mut self, category: CipherCategory) {
        *self.slot_mut(category) += 1;
    }

    pub fn get(&self, category: CipherCategory) -> u64 {
        match category {
            CipherCategory::A51 => self.a5_1,
            CipherCategory::A53 => self.a5_3,
            CipherCategory::A54 => self.a5_4,
            CipherCategory::Unknown => self.unknown,
        }
    }

    /// Sum over all categories, `Unknown` included.
    pub fn total(&self) -> u64 {
        self.a5_1 + self.a5_3 + self.a5_4 + self.unknown
    }

    /// Share of `category` in the total.
    ///
    /// Returns `NaN` when the total is zero so "no data" stays distinguishable
    /// from "no occurrences of this category".
    pub fn share(&self, category: CipherCategory) -> f64 {
        let total = self.total();
        if total == 0 {
            return f64::NAN;
        }
        self.get(category) as f64 / total as f64
    }

    /// Element-wise sum.
    pub fn merge(&mut self, other: &CategoryCounts) {
        self.a5_1 += other.a5_1;
        self.a5_3 += other.a5_3;
        self.a5_4 += other.a5_4;
        self.unknown += other.unknown;
    }

    fn slot_mut(&mut self, category: CipherCategory) -> &mut u64 {
        match category {
            CipherCategory::A51 => &mut self.a5_1,
            CipherCategory::A53 => &mut self.a5_3,
            CipherCategory::A54 => &mut self.a5_4,
            CipherCategory::Unknown => &mut self.unknown,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // ── CipherCategory ────────────────────────────────────────────────────────

    #[test]
    fn test_classify_known_ids() {
        assert_eq!(CipherCategory::classify(0), CipherCategory::A51);
        assert_eq!(CipherCategory::classify(2), CipherCategory::A53);
        assert_eq!(CipherCategory::classify(3), CipherCategory::A54);
    }

    #[test]
    fn test_classify_is_total() {
        for id in [-1, 1, 4, 5, 7, 255, i64::MIN, i64::MAX] {
            assert_eq!(CipherCategory::classify(id), CipherCategory::Unknown);
        }
    }

    #[test]
    fn test_classify_is_deterministic() {
        for id in -10..10 {
            assert_eq!(CipherCategory::classify(id), CipherCategory::classify(id));
        }
    }

    #[test]
    fn test_category_labels_and_columns() {
        assert_eq!(CipherCategory::A51.to_string(), "A5/1");
        assert_eq!(CipherCategory::A54.column(), "a5_4");
        assert_eq!(CipherCategory::Unknown.column(), "unknown");
    }

    #[test]
    fn test_category_serializes_as_label() {
        let json = serde_json::to_string(&CipherCategory::A53).unwrap();
        assert_eq!(json, "\"A5/3\"");
    }

    // ── EntityKey ─────────────────────────────────────────────────────────────

    #[test]
    fn test_entity_key_display() {
        let key = EntityKey::new("944.2M", "2", "0x10c3");
        assert_eq!(key.to_string(), "944.2M_2_0x10c3");
    }

    #[test]
    fn test_entity_key_exact_comparison() {
        let a = EntityKey::new("944.2M", "2", "0x10c3");
        let b = EntityKey::new("944200k", "2", "0x10c3");
        assert_ne!(a, b);
        assert_eq!(a, a.clone());
    }

    #[test]
    fn test_provider_name_lookup() {
        assert_eq!(EntityKey::new("f", "1", "l").provider_name(), "Telekom");
        assert_eq!(EntityKey::new("f", "2", "l").provider_name(), "O2");
        assert_eq!(EntityKey::new("f", "3", "l").provider_name(), "Vodafone");
        assert_eq!(EntityKey::new("f", "7", "l").provider_name(), "7");
    }

    // ── RunIssue ──────────────────────────────────────────────────────────────

    #[test]
    fn test_run_issue_from_error() {
        let err = CensusError::UnparseableTimestamp("garbage".to_string());
        let issue = RunIssue::from_error("tshark_a.csv", Some(4), &err);
        assert_eq!(issue.source, "tshark_a.csv");
        assert_eq!(issue.line, Some(4));
        assert_eq!(issue.kind, "unparseable_timestamp");
        assert_eq!(issue.detail, "Unparseable timestamp: garbage");
    }

    #[test]
    fn test_run_issue_omits_missing_line() {
        let err = CensusError::Config("x".to_string());
        let json = serde_json::to_value(RunIssue::from_error("s", None, &err)).unwrap();
        assert!(json.get("line").is_none());
    }

    // ── CategoryCounts ────────────────────────────────────────────────────────

    #[test]
    fn test_counts_add_and_total() {
        let mut counts = CategoryCounts::default();
        counts.add(CipherCategory::A51);
        counts.add(CipherCategory::A51);
        counts.add(CipherCategory::Unknown);
        assert_eq!(counts.get(CipherCategory::A51), 2);
        assert_eq!(counts.get(CipherCategory::Unknown), 1);
        assert_eq!(counts.total(), 3);
    }

    #[test]
    fn test_share_nan_when_empty() {
        let counts = CategoryCounts::default();
        for category in CipherCategory::ALL {
            assert!(counts.share(category).is_nan());
        }
    }

    #[test]
    fn test_shares_sum_to_one() {
        let mut counts = CategoryCounts::default();
        counts.add(CipherCategory::A51);
        counts.add(CipherCategory::A53);
        counts.add(CipherCategory::A53);
        counts.add(CipherCategory::Unknown);
        let sum: f64 = CipherCategory::ALL.iter().map(|c| counts.share(*c)).sum();
        assert!((sum - 1.0).abs() < 1e-12);
        assert_eq!(counts.share(CipherCategory::A54), 0.0);
    }

    #[test]
    fn test_counts_merge() {
        let mut a = CategoryCounts {
            a5_1: 1,
            a5_3: 2,
            a5_4: 0,
            unknown: 1,
        };
        let b = CategoryCounts {
            a5_1: 3,
            a5_3: 0,
            a5_4: 4,
            unknown: 0,
        };
        a.merge(&b);
        assert_eq!(a.total(), 11);
        assert_eq!(a.a5_4, 4);
    }
}
