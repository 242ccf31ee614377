//! Per-base-station merging of partial capture files.
//!
//! A base station is usually recorded across several capture sessions, each
//! producing its own file. [`tag_record_set`] resolves a file's
//! [`EntityKey`] and turns its raw records into classified events;
//! [`merge`] then groups tagged sets by key into one time-ordered
//! [`EventSet`] per base station. Sets whose key cannot be resolved are kept
//! in a separate unresolved group.

use std::collections::btree_map::Entry;
use std::collections::BTreeMap;

use census_core::entity::NamingScheme;
use census_core::models::{CaptureEvent, CipherCategory, EntityKey, RunIssue};
use census_core::time_utils::TimestampNormalizer;
use tracing::{debug, warn};

use crate::reader::RawRecordSet;

// ── TaggedRecordSet ───────────────────────────────────────────────────────────

/// A record set after key resolution, timestamp normalisation and
/// classification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaggedRecordSet {
    pub source_name: String,
    pub source_index: usize,
    /// `None` when the source name did not follow the naming scheme.
    pub key: Option<EntityKey>,
    pub events: Vec<CaptureEvent>,
}

/// Resolve the key of `set` and convert its records into events.
///
/// Records whose timestamp cannot be parsed are left out and reported; a
/// malformed source name is reported and the set is tagged as unresolved.
pub fn tag_record_set(
    set: RawRecordSet,
    source_index: usize,
    scheme: NamingScheme,
    normalizer: &TimestampNormalizer,
) -> (TaggedRecordSet, Vec<RunIssue>) {
    let mut issues = Vec::new();

    let key = match scheme.resolve(&set.source_name) {
        Ok(key) => Some(key),
        Err(e) => {
            warn!("{}; placing {} in the unresolved group", e, set.source_name);
            issues.push(RunIssue::from_error(&set.source_name, None, &e));
            None
        }
    };

    let mut events = Vec::with_capacity(set.records.len());
    for record in &set.records {
        match normalizer.normalize(&record.timestamp) {
            Ok(timestamp) => events.push(CaptureEvent {
                timestamp,
                frame_number: record.frame_number,
                algorithm_id: record.algorithm_id,
                category: CipherCategory::classify(record.algorithm_id),
                entity_key: key.clone(),
                source_index,
            }),
            Err(e) => issues.push(RunIssue::from_error(&set.source_name, Some(record.line), &e)),
        }
    }

    debug!(
        "Tagged {} as {}: {} events, {} skipped",
        set.source_name,
        key.as_ref()
            .map(|k| k.to_string())
            .unwrap_or_else(|| "unresolved".to_string()),
        events.len(),
        set.records.len() - events.len()
    );

    let tagged = TaggedRecordSet {
        source_name: set.source_name,
        source_index,
        key,
        events,
    };
    (tagged, issues)
}

// ── EventSet ──────────────────────────────────────────────────────────────────

/// Time-ordered events of one base station (or of the unresolved group).
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct EventSet {
    /// `None` for the unresolved group.
    pub key: Option<EntityKey>,
    /// Source names that contributed, in input order.
    pub sources: Vec<String>,
    pub events: Vec<CaptureEvent>,
}

impl EventSet {
    fn new(key: Option<EntityKey>) -> Self {
        Self {
            key,
            sources: Vec::new(),
            events: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    fn absorb(&mut self, source_name: String, events: Vec<CaptureEvent>) {
        self.sources.push(source_name);
        self.events.extend(events);
    }

    fn absorb_set(&mut self, other: EventSet) {
        self.sources.extend(other.sources);
        self.events.extend(other.events);
    }

    fn shift_sources(&mut self, offset: usize) {
        for event in &mut self.events {
            event.source_index += offset;
        }
    }

    /// Stable ascending sort by timestamp, then source order, then frame
    /// number.
    fn sort(&mut self) {
        self.events.sort_by(|a, b| {
            a.timestamp
                .cmp(&b.timestamp)
                .then(a.source_index.cmp(&b.source_index))
                .then(a.frame_number.cmp(&b.frame_number))
        });
    }
}

// ── MergeResult ───────────────────────────────────────────────────────────────

/// Output of [`merge`]: one [`EventSet`] per distinct key plus the
/// unresolved group.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct MergeResult {
    /// Ordered by key.
    pub entities: Vec<EventSet>,
    /// Events from sources whose key could not be resolved.
    pub unresolved: EventSet,
    /// Number of tagged sets that went into this result.
    pub source_count: usize,
}

impl MergeResult {
    /// Merge `other` into `self` as if its sources had followed `self`'s in
    /// a single [`merge`] call.
    pub fn combine(self, other: MergeResult) -> MergeResult {
        let offset = self.source_count;
        let mut groups: BTreeMap<EntityKey, EventSet> = self
            .entities
            .into_iter()
            .filter_map(|set| set.key.clone().map(|key| (key, set)))
            .collect();
        let mut unresolved = self.unresolved;

        for mut set in other.entities {
            set.shift_sources(offset);
            let Some(key) = set.key.clone() else {
                continue;
            };
            match groups.entry(key) {
                Entry::Occupied(mut existing) => existing.get_mut().absorb_set(set),
                Entry::Vacant(slot) => {
                    slot.insert(set);
                }
            }
        }

        let mut other_unresolved = other.unresolved;
        other_unresolved.shift_sources(offset);
        unresolved.absorb_set(other_unresolved);

        finish(groups, unresolved, offset + other.source_count)
    }

    /// Total number of events, unresolved ones included.
    pub fn event_count(&self) -> usize {
        self.entities.iter().map(EventSet::len).sum::<usize>() + self.unresolved.len()
    }

    /// Look up the event set of `key`.
    pub fn get(&self, key: &EntityKey) -> Option<&EventSet> {
        self.entities.iter().find(|set| set.key.as_ref() == Some(key))
    }
}

/// Group tagged sets by key, concatenate and order their events.
///
/// Every set lands in exactly one group; empty input yields an empty result.
pub fn merge(tagged: Vec<TaggedRecordSet>) -> MergeResult {
    let source_count = tagged.len();
    let mut groups: BTreeMap<EntityKey, EventSet> = BTreeMap::new();
    let mut unresolved = EventSet::new(None);

    for set in tagged {
        let target = match &set.key {
            Some(key) => groups
                .entry(key.clone())
                .or_insert_with(|| EventSet::new(Some(key.clone()))),
            None => &mut unresolved,
        };
        target.absorb(set.source_name, set.events);
    }

    finish(groups, unresolved, source_count)
}

fn finish(
    mut groups: BTreeMap<EntityKey, EventSet>,
    mut unresolved: EventSet,
    source_count: usize,
) -> MergeResult {
    for set in groups.values_mut() {
        set.sort();
    }
    unresolved.sort();

    MergeResult {
        entities: groups.into_values().collect(),
        unresolved,
        source_count,
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use census_core::models::RawRecord;

    const BTS_A1: &str = "tshark_944.2M_262_2_0x10c3_0x23a1_1717511213.csv";
    const BTS_A2: &str = "tshark_944.2M_262_2_0x10c3_0x23a1_1717599999.csv";
    const BTS_B: &str = "tshark_935.8M_262_1_0x0042_0x0001_1717511213.csv";

    fn record(line: usize, algorithm_id: i64, frame: u64, time: &str) -> RawRecord {
        RawRecord {
            line,
            algorithm_id,
            frame_number: frame,
            timestamp: format!("Jun 4, 2024 {time} CEST"),
        }
    }

    fn tag_all(sets: Vec<RawRecordSet>) -> (Vec<TaggedRecordSet>, Vec<RunIssue>) {
        let normalizer = TimestampNormalizer::default();
        let mut tagged = Vec::new();
        let mut issues = Vec::new();
        for (idx, set) in sets.into_iter().enumerate() {
            let (t, i) = tag_record_set(set, idx, NamingScheme::V1, &normalizer);
            tagged.push(t);
            issues.extend(i);
        }
        (tagged, issues)
    }

    fn sample_sets() -> Vec<RawRecordSet> {
        vec![
            RawRecordSet::new(
                BTS_A1,
                vec![record(2, 0, 10, "10:00:00"), record(3, 2, 11, "10:05:00")],
            ),
            RawRecordSet::new(BTS_B, vec![record(2, 3, 1, "10:01:00")]),
            RawRecordSet::new(
                BTS_A2,
                vec![record(2, 0, 1, "10:02:00"), record(3, 0, 2, "10:05:00")],
            ),
            RawRecordSet::new("capture.csv", vec![record(2, 0, 1, "10:03:00")]),
        ]
    }

    // ── tag_record_set ────────────────────────────────────────────────────────

    #[test]
    fn test_tag_resolves_key_and_classifies() {
        let (tagged, issues) = tag_all(vec![RawRecordSet::new(
            BTS_A1,
            vec![record(2, 2, 10, "10:00:00"), record(3, 9, 11, "10:00:01")],
        )]);
        assert!(issues.is_empty());
        let set = &tagged[0];
        assert_eq!(set.key, Some(EntityKey::new("944.2M", "2", "0x10c3")));
        assert_eq!(set.events[0].category, CipherCategory::A53);
        assert_eq!(set.events[1].category, CipherCategory::Unknown);
        assert_eq!(set.events[0].entity_key, set.key);
    }

    #[test]
    fn test_tag_drops_unparseable_timestamps_with_issue() {
        let mut bad = record(3, 0, 11, "10:00:00");
        bad.timestamp = "sometime".to_string();
        let (tagged, issues) = tag_all(vec![RawRecordSet::new(
            BTS_A1,
            vec![record(2, 0, 10, "10:00:00"), bad],
        )]);
        assert_eq!(tagged[0].events.len(), 1);
        assert_eq!(issues.len(), 1);
        assert_eq!(issues[0].kind, "unparseable_timestamp");
        assert_eq!(issues[0].line, Some(3));
    }

    #[test]
    fn test_tag_malformed_name_is_unresolved() {
        let (tagged, issues) = tag_all(vec![RawRecordSet::new(
            "capture.csv",
            vec![record(2, 0, 1, "10:00:00")],
        )]);
        assert!(tagged[0].key.is_none());
        assert_eq!(tagged[0].events.len(), 1);
        assert_eq!(issues[0].kind, "malformed_source_name");
    }

    // ── merge ─────────────────────────────────────────────────────────────────

    #[test]
    fn test_merge_groups_by_key() {
        let (tagged, _) = tag_all(sample_sets());
        let result = merge(tagged);

        assert_eq!(result.entities.len(), 2);
        let a = result
            .get(&EntityKey::new("944.2M", "2", "0x10c3"))
            .unwrap();
        assert_eq!(a.len(), 4);
        assert_eq!(a.sources, vec![BTS_A1, BTS_A2]);
        assert!(a
            .events
            .iter()
            .all(|e| e.entity_key.as_ref() == a.key.as_ref()));

        assert_eq!(result.unresolved.len(), 1);
        assert_eq!(result.unresolved.sources, vec!["capture.csv"]);
        assert_eq!(result.event_count(), 6);
    }

    #[test]
    fn test_merge_sorted_with_tie_breaks() {
        let (tagged, _) = tag_all(sample_sets());
        let result = merge(tagged);
        let a = result
            .get(&EntityKey::new("944.2M", "2", "0x10c3"))
            .unwrap();

        let order: Vec<(usize, u64)> = a
            .events
            .iter()
            .map(|e| (e.source_index, e.frame_number))
            .collect();
        // 10:00 (A1), 10:02 (A2), then the 10:05 tie: A1 before A2.
        assert_eq!(order, vec![(0, 10), (2, 1), (0, 11), (2, 2)]);
        assert!(a.events.windows(2).all(|w| w[0].timestamp <= w[1].timestamp));
    }

    #[test]
    fn test_merge_entities_ordered_by_key() {
        let (tagged, _) = tag_all(sample_sets());
        let result = merge(tagged);
        let keys: Vec<String> = result
            .entities
            .iter()
            .map(|s| s.key.as_ref().unwrap().to_string())
            .collect();
        assert_eq!(keys, vec!["935.8M_1_0x0042", "944.2M_2_0x10c3"]);
    }

    #[test]
    fn test_merge_keeps_duplicates() {
        let dup = vec![record(2, 0, 5, "10:00:00")];
        let (tagged, _) = tag_all(vec![
            RawRecordSet::new(BTS_A1, dup.clone()),
            RawRecordSet::new(BTS_A2, dup),
        ]);
        let result = merge(tagged);
        assert_eq!(result.entities[0].len(), 2);
    }

    #[test]
    fn test_merge_empty_input() {
        let result = merge(Vec::new());
        assert!(result.entities.is_empty());
        assert!(result.unresolved.is_empty());
        assert_eq!(result.event_count(), 0);
    }

    #[test]
    fn test_merge_empty_record_set_still_grouped() {
        let (tagged, _) = tag_all(vec![RawRecordSet::new(BTS_A1, Vec::new())]);
        let result = merge(tagged);
        assert_eq!(result.entities.len(), 1);
        assert!(result.entities[0].is_empty());
        assert_eq!(result.entities[0].sources, vec![BTS_A1]);
    }

    // ── combine ───────────────────────────────────────────────────────────────

    #[test]
    fn test_combine_equals_single_merge() {
        let sets = sample_sets();
        let (all, _) = tag_all(sets.clone());
        let direct = merge(all);

        let (first, _) = tag_all(sets[..2].to_vec());
        let (second, _) = tag_all(sets[2..].to_vec());
        let combined = merge(first).combine(merge(second));

        assert_eq!(combined, direct);
    }

    #[test]
    fn test_combine_grouping_is_order_independent() {
        let sets = sample_sets();
        let (forward, _) = tag_all(sets.clone());
        let mut reversed_sets = sets;
        reversed_sets.reverse();
        let (backward, _) = tag_all(reversed_sets);

        let a = merge(forward);
        let b = merge(backward);
        assert_eq!(a.entities.len(), b.entities.len());
        for (x, y) in a.entities.iter().zip(&b.entities) {
            assert_eq!(x.key, y.key);
            let times_x: Vec<_> = x.events.iter().map(|e| (e.timestamp, e.frame_number)).collect();
            let mut times_y: Vec<_> = y.events.iter().map(|e| (e.timestamp, e.frame_number)).collect();
            let mut sorted_x = times_x.clone();
            sorted_x.sort();
            times_y.sort();
            assert_eq!(sorted_x, times_y);
        }
    }

    #[test]
    fn test_combine_with_empty() {
        let (tagged, _) = tag_all(sample_sets());
        let direct = merge(tagged);
        let combined = direct.clone().combine(MergeResult::default());
        assert_eq!(combined, direct);
    }
}
